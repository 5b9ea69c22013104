use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicU64, Ordering};

use hermit_sync::SpinMutex;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::affinity::CoreMask;
use crate::error::Error;
use crate::fabric::Mailbox;
use crate::scheduler::{BifContext, CoreId};
use crate::time::Ticks;
use crate::timer::TimerToken;

/// Unique identifier for a process. Issued monotonically, never reused.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
pub struct Pid(u64);

impl Pid {
	/// Sender pid carried by runtime-generated messages (timer signals).
	pub const SYSTEM: Pid = Pid(0);

	pub const fn into(self) -> u64 {
		self.0
	}

	pub const fn from(x: u64) -> Self {
		Pid(x)
	}
}

impl fmt::Display for Pid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Priority of a process. Higher value, higher urgency.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub struct Priority(u8);

impl Priority {
	pub const fn into(self) -> u8 {
		self.0
	}

	pub const fn from(x: u8) -> Self {
		Priority(x)
	}

	/// Checked conversion for priorities coming across the API.
	pub fn checked_from(x: u8) -> Result<Self, Error> {
		if (x as usize) < crate::config::NO_PRIORITIES {
			Ok(Priority(x))
		} else {
			Err(Error::InvalidPriority(x))
		}
	}
}

impl fmt::Display for Priority {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

pub const LOW_PRIO: Priority = Priority::from(0);
pub const NORMAL_PRIO: Priority = Priority::from(1);
pub const HIGH_PRIO: Priority = Priority::from(2);
pub const MAX_PRIO: Priority = Priority::from(3);

/// The state of a process - used for scheduling.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PcbState {
	/// Allocated but not yet enqueued anywhere.
	Created,
	/// Linked into exactly one priority queue.
	Ready,
	/// Selected by exactly one dispatcher; in no queue.
	Running,
	/// Blocked on a wake source; in no queue.
	Waiting,
	/// Parked by `suspend`; in no queue, woken only by `resume`.
	Suspended,
	/// Exited; memory is reclaimed by the store.
	Terminated,
}

/// What a waiting process is blocked on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum BlockedOn {
	/// An empty mailbox, with an optional timeout timer installed.
	Receive { timer: Option<TimerToken> },
	/// A sleep deadline.
	Timer(TimerToken),
	/// A host-side IO completion, identified by the host's handle.
	#[allow(dead_code)]
	Io(u64),
}

/// Saved CPU state of a descheduled process.
///
/// The dispatcher copies this register file out on selection and back in at
/// every suspension point; a restore resumes exactly where the matching save
/// left off. In this hosted rendition the registers carry whatever the
/// embedding runtime keeps in them - the scheduler only guarantees the
/// save/restore pairing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Context {
	pub gpr: [u64; 31],
	pub sp: u64,
	pub pc: u64,
	pub flags: u64,
}

impl Context {
	pub(crate) fn new(entry: u64, stack_top: u64) -> Self {
		Self {
			gpr: [0; 31],
			sp: stack_top,
			pc: entry,
			flags: 0,
		}
	}
}

/// Where control returns to the dispatcher at a suspension point.
///
/// A process body runs until it hands one of these back; the dispatcher then
/// saves the context and acts on it. Compiled process code is expected to
/// return [`Trap::Preempted`] as soon as its reduction budget is exhausted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trap {
	/// Budget exhausted; requeue at the tail of the same priority.
	Preempted,
	/// Unconditional voluntary yield; budget is reset before requeueing.
	Yield,
	/// Yield only if other ready work exists on this core.
	YieldIfContended,
	/// Block until a message arrives, or `Some(ticks)` elapse.
	Receive(Option<Ticks>),
	/// Block for the given number of ticks.
	Sleep(Ticks),
	/// Block until the given process exits. A no-op (the body runs again
	/// immediately) if it already has.
	Join(Pid),
	/// Terminate with the given exit code.
	Exit(i32),
}


/// A cooperative process body.
///
/// Invoked every time the process is scheduled; consumes reductions through
/// the [`BifContext`] and returns a [`Trap`] at every suspension point.
pub type ProcessBody = Box<dyn FnMut(&mut BifContext<'_>) -> Trap + Send + 'static>;

/// Owned memory region of a process (stack or heap).
pub(crate) struct Region {
	mem: Box<[u8]>,
}

impl Region {
	pub fn new(size: usize) -> Self {
		Self {
			mem: vec![0; size].into_boxed_slice(),
		}
	}

	pub fn base(&self) -> usize {
		self.mem.as_ptr() as usize
	}

	pub fn size(&self) -> usize {
		self.mem.len()
	}

	/// Top of the region; initial stack pointer for a descending stack.
	pub fn top(&self) -> usize {
		self.base() + self.size()
	}

	/// Frees the backing memory early, before the last `Arc` drops.
	pub fn release(&mut self) {
		self.mem = Box::new([]);
	}
}

/// Mutable process state guarded by the PCB's own lock.
///
/// Lock ordering: the mailbox lock may be held while taking this one, never
/// the other way around. Nothing else is acquired while this lock is held.
pub(crate) struct PcbInner {
	pub context: Context,
	/// True between a context save and the matching restore.
	pub context_saved: bool,
	pub blocked_on: Option<BlockedOn>,
	pub body: Option<ProcessBody>,
	pub stack: Region,
	pub heap: Region,
}

/// A process control block.
///
/// Shared as `Arc<Pcb>`; the store owns the authoritative reference, queues
/// and input channels hold transient ones. The scheduling-relevant fields are
/// atomics so that cross-core paths (send wake-ups, stealing, kill) can
/// inspect them without the inner lock.
pub(crate) struct Pcb {
	pid: Pid,
	state: AtomicU8,
	priority: AtomicU8,
	owner_core: AtomicU32,
	/// Times this process has been stolen to another core.
	pub migration_count: AtomicU32,
	/// Tick of the last migration, for the optional cooldown.
	pub last_migration_time: AtomicU64,
	/// Owning queue tag (`core + 1`), 0 when in no queue. The tag is what
	/// enforces "one queue at a time": linking is a CAS from 0.
	queue_tag: AtomicU32,
	/// Remaining reductions when last descheduled.
	reduction_budget: AtomicI32,
	/// Set by a timer firing a receive timeout, consumed by `receive`.
	timed_out: AtomicBool,
	/// Set by `kill`; honored at the next dispatch boundary.
	kill_requested: AtomicBool,
	/// Set by `suspend`; diverts the next requeue to `Suspended`.
	suspend_requested: AtomicBool,
	affinity: SpinMutex<CoreMask>,
	pub mailbox: Mailbox,
	inner: SpinMutex<PcbInner>,
}

impl Pcb {
	pub fn new(
		pid: Pid,
		priority: Priority,
		affinity: CoreMask,
		owner_core: CoreId,
		body: ProcessBody,
		stack_size: usize,
		heap_size: usize,
	) -> Self {
		let stack = Region::new(stack_size);
		let heap = Region::new(heap_size);
		// The boxed body stands in for the entry point of compiled
		// process code.
		let entry = core::ptr::from_ref(&*body).cast::<()>() as usize as u64;
		let context = Context::new(entry, stack.top() as u64);

		Self {
			pid,
			state: AtomicU8::new(PcbState::Created.into()),
			priority: AtomicU8::new(priority.into()),
			owner_core: AtomicU32::new(owner_core),
			migration_count: AtomicU32::new(0),
			last_migration_time: AtomicU64::new(0),
			queue_tag: AtomicU32::new(0),
			reduction_budget: AtomicI32::new(0),
			timed_out: AtomicBool::new(false),
			kill_requested: AtomicBool::new(false),
			suspend_requested: AtomicBool::new(false),
			affinity: SpinMutex::new(affinity),
			mailbox: Mailbox::new(),
			inner: SpinMutex::new(PcbInner {
				context,
				context_saved: true,
				blocked_on: None,
				body: Some(body),
				stack,
				heap,
			}),
		}
	}

	pub fn pid(&self) -> Pid {
		self.pid
	}

	/// The state cell is sequentially consistent, not merely
	/// acquire/release: `kill` stores its flag and then loads the state,
	/// the dispatcher stores the state and then loads the flag, and that
	/// store-load pairing only settles under a total order.
	pub fn state(&self) -> PcbState {
		PcbState::try_from(self.state.load(Ordering::SeqCst)).unwrap()
	}

	pub fn set_state(&self, state: PcbState) {
		self.state.store(state.into(), Ordering::SeqCst);
	}

	/// Single-winner state transition; the linearization point for every
	/// wake-up race.
	pub fn try_transition(&self, from: PcbState, to: PcbState) -> bool {
		self.state
			.compare_exchange(from.into(), to.into(), Ordering::SeqCst, Ordering::SeqCst)
			.is_ok()
	}

	pub fn priority(&self) -> Priority {
		Priority::from(self.priority.load(Ordering::Acquire))
	}

	/// Only the queue-level `set_priority` may call this; a priority
	/// change outside an atomic dequeue + enqueue would desync the queue
	/// index.
	pub(crate) fn set_priority_raw(&self, prio: Priority) {
		self.priority.store(prio.into(), Ordering::Release);
	}

	pub fn owner_core(&self) -> CoreId {
		self.owner_core.load(Ordering::Acquire)
	}

	pub fn set_owner_core(&self, core: CoreId) {
		self.owner_core.store(core, Ordering::Release);
	}

	pub fn affinity(&self) -> CoreMask {
		*self.affinity.lock()
	}

	pub fn set_affinity(&self, mask: CoreMask) {
		*self.affinity.lock() = mask;
	}

	/// Links this PCB to the queue tagged `core`. Aborts if it is already
	/// linked somewhere: a PCB in two queues is unrecoverable corruption.
	pub fn link(&self, core: CoreId) {
		let prev = self.queue_tag.swap(core + 1, Ordering::AcqRel);
		assert_eq!(
			prev, 0,
			"process {} enqueued on core {core} while still linked to queue {prev}",
			self.pid
		);
	}

	/// Unlinks from the queue tagged `core`; same corruption rules.
	pub fn unlink(&self, core: CoreId) {
		let prev = self.queue_tag.swap(0, Ordering::AcqRel);
		assert_eq!(
			prev,
			core + 1,
			"process {} left queue {prev} but was dequeued from core {core}",
			self.pid
		);
	}

	pub fn queued_on(&self) -> Option<CoreId> {
		match self.queue_tag.load(Ordering::Acquire) {
			0 => None,
			tag => Some(tag - 1),
		}
	}

	pub fn reduction_budget(&self) -> i32 {
		self.reduction_budget.load(Ordering::Relaxed)
	}

	pub fn set_reduction_budget(&self, n: i32) {
		self.reduction_budget.store(n, Ordering::Relaxed);
	}

	pub fn take_timed_out(&self) -> bool {
		self.timed_out.swap(false, Ordering::AcqRel)
	}

	pub fn request_kill(&self) {
		self.kill_requested.store(true, Ordering::SeqCst);
	}

	pub fn kill_requested(&self) -> bool {
		self.kill_requested.load(Ordering::SeqCst)
	}

	pub fn request_suspend(&self) {
		self.suspend_requested.store(true, Ordering::Release);
	}

	pub fn clear_suspend(&self) {
		self.suspend_requested.store(false, Ordering::Release);
	}

	pub fn suspend_requested(&self) -> bool {
		self.suspend_requested.load(Ordering::Acquire)
	}

	/// Message-side wake: if this process is waiting on its mailbox, move
	/// it to `Ready` and hand any armed timeout back for cancellation.
	///
	/// The check and the state transition happen in one inner-lock
	/// critical section, so a concurrent timer fire cannot observe a
	/// half-taken wake.
	pub fn try_wake_receive(&self) -> Option<Option<TimerToken>> {
		let mut inner = self.inner.lock();
		if let Some(BlockedOn::Receive { timer }) = inner.blocked_on
			&& self.try_transition(PcbState::Waiting, PcbState::Ready)
		{
			inner.blocked_on = None;
			return Some(timer);
		}

		None
	}

	/// Timer-side wake for `token`. Returns `true` if this call won and
	/// the process must be enqueued.
	///
	/// Timer entries are only placed in the wheel after their owner has
	/// fully parked (see the wheel's reserve/arm split), and every path
	/// that wakes a parked process clears `blocked_on` in the same
	/// critical section that wins the state race. A mismatch here
	/// therefore means the entry is stale - its owner was already woken
	/// by a message, a kill, or a resume - and the fire is a no-op.
	pub fn try_wake_timer(&self, token: TimerToken) -> bool {
		let mut inner = self.inner.lock();
		match inner.blocked_on {
			Some(BlockedOn::Receive { timer: Some(t) }) if t == token => {
				let woken = self.try_transition(PcbState::Waiting, PcbState::Ready);
				assert!(woken, "receive timeout fired against a half-parked process");
				inner.blocked_on = None;
				self.timed_out.store(true, Ordering::Release);
				true
			}
			Some(BlockedOn::Timer(t)) if t == token => {
				let woken = self.try_transition(PcbState::Waiting, PcbState::Ready);
				assert!(woken, "sleep timer fired against a half-parked process");
				inner.blocked_on = None;
				true
			}
			_ => false,
		}
	}

	/// Unconditional wake (kill, IO completion, join release): move out
	/// of `Waiting` whatever the wait reason. On success the stale wake
	/// source, if any, is returned for cancellation.
	pub fn try_wake_any(&self) -> Option<Option<TimerToken>> {
		let mut inner = self.inner.lock();
		if self.try_transition(PcbState::Waiting, PcbState::Ready) {
			let token = match inner.blocked_on.take() {
				Some(BlockedOn::Receive { timer }) => timer,
				Some(BlockedOn::Timer(token)) => Some(token),
				Some(BlockedOn::Io(_)) | None => None,
			};
			Some(token)
		} else {
			None
		}
	}

	/// Copies the register file out for the dispatcher. Panics if the
	/// last save was already consumed: a double restore means two cores
	/// believe they own this process.
	pub fn restore_context(&self) -> Context {
		let mut inner = self.inner.lock();
		assert!(
			inner.context_saved,
			"restoring process {} twice without an intervening save",
			self.pid
		);
		inner.context_saved = false;
		inner.context
	}

	/// Saves the register file at a suspension point.
	pub fn save_context(&self, context: Context) {
		let mut inner = self.inner.lock();
		assert!(
			!inner.context_saved,
			"saving process {} twice without an intervening restore",
			self.pid
		);
		inner.context = context;
		inner.context_saved = true;
	}

	pub fn take_body(&self) -> Option<ProcessBody> {
		self.inner.lock().body.take()
	}

	pub fn put_body(&self, body: ProcessBody) {
		let prev = self.inner.lock().body.replace(body);
		debug_assert!(prev.is_none());
	}

	#[allow(dead_code)]
	pub fn blocked_on(&self) -> Option<BlockedOn> {
		self.inner.lock().blocked_on
	}

	pub fn set_blocked_on(&self, blocked: BlockedOn) {
		self.inner.lock().blocked_on = Some(blocked);
	}

	/// Releases body and memory regions at termination, without waiting
	/// for the last external `Arc` to drop.
	pub fn reclaim(&self) {
		let mut inner = self.inner.lock();
		inner.body = None;
		inner.stack.release();
		inner.heap.release();
	}

	pub fn stack_info(&self) -> (usize, usize) {
		let inner = self.inner.lock();
		(inner.stack.base(), inner.stack.size())
	}

	pub fn heap_info(&self) -> (usize, usize) {
		let inner = self.inner.lock();
		(inner.heap.base(), inner.heap.size())
	}
}

impl fmt::Debug for Pcb {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Pcb")
			.field("pid", &self.pid)
			.field("state", &self.state())
			.field("priority", &self.priority())
			.field("owner_core", &self.owner_core())
			.field("queued_on", &self.queued_on())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pcb(pid: u64) -> Pcb {
		Pcb::new(
			Pid::from(pid),
			NORMAL_PRIO,
			CoreMask::all(4),
			0,
			Box::new(|_| Trap::Exit(0)),
			0x1000,
			0x800,
		)
	}

	#[test]
	fn new_pcb_starts_created_with_entry_context() {
		let pcb = pcb(1);
		assert_eq!(pcb.state(), PcbState::Created);
		assert_eq!(pcb.priority(), NORMAL_PRIO);
		assert_eq!(pcb.queued_on(), None);

		let (stack_base, stack_size) = pcb.stack_info();
		let context = pcb.restore_context();
		assert_eq!(context.sp as usize, stack_base + stack_size);
		assert_ne!(context.pc, 0);
	}

	#[test]
	fn context_save_restore_pairs_up() {
		let pcb = pcb(2);
		let mut context = pcb.restore_context();
		context.gpr[0] = 0xdead;
		pcb.save_context(context);
		assert_eq!(pcb.restore_context().gpr[0], 0xdead);
	}

	#[test]
	#[should_panic(expected = "twice without an intervening save")]
	fn double_restore_aborts() {
		let pcb = pcb(3);
		let _ = pcb.restore_context();
		let _ = pcb.restore_context();
	}

	#[test]
	#[should_panic(expected = "still linked")]
	fn double_link_aborts() {
		let pcb = pcb(4);
		pcb.link(0);
		pcb.link(1);
	}

	#[test]
	fn wake_race_has_a_single_winner() {
		let pcb = pcb(5);
		pcb.set_state(PcbState::Waiting);
		assert!(pcb.try_transition(PcbState::Waiting, PcbState::Ready));
		assert!(!pcb.try_transition(PcbState::Waiting, PcbState::Ready));
		assert_eq!(pcb.state(), PcbState::Ready);
	}

	#[test]
	fn reclaim_drops_the_memory_regions() {
		let pcb = pcb(6);
		assert_ne!(pcb.stack_info().1, 0);
		pcb.reclaim();
		assert_eq!(pcb.stack_info().1, 0);
		assert_eq!(pcb.heap_info().1, 0);
		assert!(pcb.take_body().is_none());
	}

	#[test]
	fn checked_priority_rejects_out_of_range_levels() {
		assert!(Priority::checked_from(3).is_ok());
		assert!(Priority::checked_from(4).is_err());
	}
}
