//! The PCB store: the single owner of every process control block.
//!
//! All other components hold `Arc` references resolved through the pid map;
//! mailbox entries and timer entries carry bare pids and re-resolve on use,
//! which is what lets the store drop a terminated process without chasing
//! cyclic references.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;
use hermit_sync::SpinMutex;

use crate::error::Error;
use crate::scheduler::pcb::{Pcb, Pid};

pub(crate) struct PcbStore {
	/// Constant-time pid -> PCB map.
	map: SpinMutex<HashMap<Pid, Arc<Pcb>, RandomState>>,
	next_pid: AtomicU64,
	/// Live processes, readable without the map lock.
	live: AtomicU64,
	max_processes: usize,
}

impl PcbStore {
	pub fn new(max_processes: usize) -> Self {
		Self {
			map: SpinMutex::new(HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0))),
			// Pid 0 is reserved for runtime-generated messages.
			next_pid: AtomicU64::new(1),
			live: AtomicU64::new(0),
			max_processes,
		}
	}

	/// Issues the next pid. Pids are monotonic and never reused.
	pub fn issue_pid(&self) -> Pid {
		Pid::from(self.next_pid.fetch_add(1, Ordering::SeqCst))
	}

	/// Registers a freshly allocated PCB.
	pub fn insert(&self, pcb: Arc<Pcb>) -> Result<(), Error> {
		let mut map = self.map.lock();
		if map.len() >= self.max_processes {
			return Err(Error::OutOfMemory);
		}

		let previous = map.insert(pcb.pid(), pcb);
		assert!(previous.is_none(), "pid issued twice");
		self.live.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	pub fn get(&self, pid: Pid) -> Option<Arc<Pcb>> {
		self.map.lock().get(&pid).cloned()
	}

	/// Unregisters a terminated process; its memory is reclaimed when the
	/// last transient reference drops.
	pub fn remove(&self, pid: Pid) -> Option<Arc<Pcb>> {
		let removed = self.map.lock().remove(&pid);
		if removed.is_some() {
			self.live.fetch_sub(1, Ordering::SeqCst);
		}
		removed
	}

	pub fn process_count(&self) -> u64 {
		self.live.load(Ordering::SeqCst)
	}
}
