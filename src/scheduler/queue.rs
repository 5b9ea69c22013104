use std::collections::VecDeque;
use std::num::NonZeroU64;
use std::sync::Arc;

use crate::config::NO_PRIORITIES;
use crate::scheduler::CoreId;
use crate::scheduler::pcb::{Pcb, PcbState, Pid, Priority};

/// Returns the most significant bit.
///
/// `msb(0)` is `None`, `msb(1)` is `Some(0)`, `msb(u64::MAX)` is `Some(63)`.
#[inline]
fn msb(n: u64) -> Option<u32> {
	NonZeroU64::new(n).map(|n| u64::BITS - 1 - n.leading_zeros())
}

/// The ready queues of one core: a FIFO per priority level plus a bitmap of
/// non-empty levels.
///
/// The owner dispatcher removes at the head; thieves remove at the tail, so
/// the FIFO order the owner observes is never disturbed by a steal. Every
/// link and unlink goes through the PCB's queue tag, which is how the
/// "one queue at a time" invariant is enforced without exposing the links.
pub(crate) struct PriorityPcbQueue {
	queues: [VecDeque<Arc<Pcb>>; NO_PRIORITIES],
	prio_bitmap: u64,
	len: usize,
	core_id: CoreId,
}

impl PriorityPcbQueue {
	pub fn new(core_id: CoreId) -> Self {
		Self {
			queues: [const { VecDeque::new() }; NO_PRIORITIES],
			prio_bitmap: 0,
			len: 0,
			core_id,
		}
	}

	/// Appends a ready process at the tail of its priority level.
	pub fn push(&mut self, pcb: Arc<Pcb>) {
		debug_assert_eq!(pcb.state(), PcbState::Ready);
		let i = pcb.priority().into() as usize;

		pcb.link(self.core_id);
		self.prio_bitmap |= 1 << i;
		self.queues[i].push_back(pcb);
		self.len += 1;
	}

	fn pop_from_queue(&mut self, queue_index: usize) -> Option<Arc<Pcb>> {
		let pcb = self.queues[queue_index].pop_front();
		if self.queues[queue_index].is_empty() {
			self.prio_bitmap &= !(1 << queue_index as u64);
		}

		if let Some(pcb) = &pcb {
			pcb.unlink(self.core_id);
			self.len -= 1;
		}

		pcb
	}

	/// Removes the head of the highest non-empty priority level.
	pub fn pop(&mut self) -> Option<Arc<Pcb>> {
		if let Some(i) = msb(self.prio_bitmap) {
			return self.pop_from_queue(i as usize);
		}

		None
	}

	/// Removes the head of one specific priority level.
	pub fn pop_prio(&mut self, prio: Priority) -> Option<Arc<Pcb>> {
		let i = prio.into() as usize;
		if self.prio_bitmap & (1 << i) != 0 {
			return self.pop_from_queue(i);
		}

		None
	}

	/// Removes the *tail* of the highest non-empty priority level - the
	/// thieves' end.
	pub fn steal_tail(&mut self) -> Option<Arc<Pcb>> {
		let i = msb(self.prio_bitmap)? as usize;
		let pcb = self.queues[i].pop_back();
		if self.queues[i].is_empty() {
			self.prio_bitmap &= !(1 << i as u64);
		}

		if let Some(pcb) = &pcb {
			pcb.unlink(self.core_id);
			self.len -= 1;
		}

		pcb
	}

	/// Removes one specific process, wherever it is linked.
	pub fn remove(&mut self, pid: Pid) -> Option<Arc<Pcb>> {
		for i in 0..NO_PRIORITIES {
			if let Some(pos) = self.queues[i].iter().position(|pcb| pcb.pid() == pid) {
				let pcb = self.queues[i].remove(pos).unwrap();
				if self.queues[i].is_empty() {
					self.prio_bitmap &= !(1 << i as u64);
				}
				pcb.unlink(self.core_id);
				self.len -= 1;
				return Some(pcb);
			}
		}

		None
	}

	/// Changes the priority of a queued process as an atomic
	/// dequeue + enqueue, preserving FIFO order at the new level.
	pub fn set_priority(&mut self, pid: Pid, prio: Priority) -> bool {
		let Some(pcb) = self.remove(pid) else {
			return false;
		};
		pcb.set_priority_raw(prio);
		self.push(pcb);
		true
	}

	pub fn is_empty(&self) -> bool {
		self.prio_bitmap == 0
	}

	pub fn len(&self) -> usize {
		self.len
	}

	#[allow(dead_code)]
	pub fn len_of(&self, prio: Priority) -> usize {
		self.queues[prio.into() as usize].len()
	}

	/// Checks that the count agrees with the chains and the bitmap with
	/// the queues. A mismatch is corruption; abort.
	pub fn verify(&self) {
		let chained: usize = self.queues.iter().map(VecDeque::len).sum();
		assert_eq!(
			chained, self.len,
			"queue count {} disagrees with link chains {chained} on core {}",
			self.len, self.core_id
		);

		for i in 0..NO_PRIORITIES {
			let bit = self.prio_bitmap & (1 << i) != 0;
			assert_eq!(
				bit,
				!self.queues[i].is_empty(),
				"priority bitmap disagrees with queue {i} on core {}",
				self.core_id
			);
		}
	}
}
