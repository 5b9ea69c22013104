//! Per-core scheduling: the dispatcher loop, the trap handlers, and the
//! reduction bookkeeping.
//!
//! One `PerCoreScheduler` exists per online core, owned by its dispatcher
//! thread. Everything another core wants to hand over - a freshly spawned
//! process, a woken receiver, a stolen PCB pushed back - arrives through the
//! core's [`SchedulerInput`] channel and is drained at the top of every
//! dispatch iteration; the channel's lock is the happens-before edge that
//! makes a cross-core enqueue visible to the owner's next `schedule()`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crossbeam_utils::Backoff;
use crossbeam_utils::sync::Parker;
use rand_chacha::ChaCha8Rng;
use rand_chacha::rand_core::SeedableRng;

use crate::balancer;
use crate::config::{BIF_EXIT_COST, BIF_SPAWN_COST, MAX_REDUCTIONS, MIN_REDUCTIONS};
use crate::error::{Error, Result};
use crate::fabric::{self, RecvStatus};
use crate::runtime::{CoreSlot, RuntimeInner, SpawnOptions};
use crate::scheduler::pcb::{BlockedOn, Context, Pcb, PcbState, Pid, Priority, ProcessBody, Trap};
use crate::stats::CoreState;
use crate::timer::TimerKind;

pub mod pcb;
pub(crate) mod queue;

/// Unique identifier for a core.
pub type CoreId = u32;

/// The core whose dispatcher drives the timer wheel.
pub(crate) const TIMER_CORE: CoreId = 0;

/// How long a non-timer dispatcher stays parked without an event.
const IDLE_PARK: Duration = Duration::from_millis(10);

/// Cross-core hand-over channel of one core.
///
/// Spawns, wake-ups and give-backs from other cores land here; only the
/// owning dispatcher moves them on into its ready queues.
pub(crate) struct SchedulerInput {
	inbound: VecDeque<Arc<Pcb>>,
}

impl SchedulerInput {
	pub fn new() -> Self {
		Self {
			inbound: VecDeque::new(),
		}
	}

	pub fn push(&mut self, pcb: Arc<Pcb>) {
		self.inbound.push_back(pcb);
	}

	pub fn pop(&mut self) -> Option<Arc<Pcb>> {
		self.inbound.pop_front()
	}
}

/// Per-core scheduler state, owned by the dispatcher thread of its core.
pub(crate) struct PerCoreScheduler {
	rt: Arc<RuntimeInner>,
	/// Core ID of this per-core scheduler.
	core_id: CoreId,
	/// Process which is currently running.
	current: Option<Arc<Pcb>>,
	/// Reductions left in the current process's budget.
	reductions: i32,
	/// The core's live register file; copied from and back into the
	/// current PCB at every context switch.
	current_context: Context,
	parker: Parker,
	/// Victim-selection stream for work stealing.
	rng: ChaCha8Rng,
}

impl PerCoreScheduler {
	pub fn new(rt: Arc<RuntimeInner>, core_id: CoreId) -> Result<Self> {
		if core_id >= rt.config.cores {
			return Err(Error::InvalidCore(core_id));
		}

		let parker = Parker::new();
		rt.cores[core_id as usize].set_unparker(parker.unparker().clone());

		let reductions = rt.config.default_reductions;
		Ok(Self {
			rt,
			core_id,
			current: None,
			reductions,
			current_context: Context::new(0, 0),
			parker,
			rng: ChaCha8Rng::seed_from_u64(0x5eed_0000 | u64::from(core_id)),
		})
	}

	pub fn core_id(&self) -> CoreId {
		self.core_id
	}

	pub fn rt(&self) -> &Arc<RuntimeInner> {
		&self.rt
	}

	pub fn rng(&mut self) -> &mut ChaCha8Rng {
		&mut self.rng
	}

	fn slot(&self) -> &CoreSlot {
		&self.rt.cores[self.core_id as usize]
	}

	/// Appends a ready process to the tail of its priority queue on this
	/// core.
	pub fn enqueue(&mut self, pcb: Arc<Pcb>) {
		debug_assert_eq!(pcb.owner_core(), self.core_id);
		self.slot().push_ready(pcb);
	}

	/// Removes the head of one priority level.
	#[allow(dead_code)]
	pub fn dequeue(&mut self, prio: Priority) -> Option<Arc<Pcb>> {
		self.slot().pop_ready_prio(prio)
	}

	/// Selects the next process: strict priority, FIFO within a level.
	///
	/// The selected PCB becomes `current`, is marked `Running` and gets a
	/// fresh reduction budget. Kill requests that arrived while the
	/// process sat in the queue are honored here instead of running it.
	pub fn schedule(&mut self) -> Option<Arc<Pcb>> {
		debug_assert!(self.current.is_none());

		loop {
			let pcb = self.slot().pop_ready()?;
			if pcb.kill_requested() {
				self.rt.finalize(&pcb, -1);
				continue;
			}

			debug_assert_eq!(pcb.state(), PcbState::Ready);
			pcb.set_state(PcbState::Running);
			self.reductions = self.rt.config.default_reductions;
			self.current = Some(pcb.clone());
			self.slot()
				.stats
				.total_scheduled
				.fetch_add(1, Ordering::Relaxed);
			return Some(pcb);
		}
	}

	#[allow(dead_code)]
	pub fn get_current(&self) -> Option<Arc<Pcb>> {
		self.current.clone()
	}

	#[allow(dead_code)]
	pub fn set_current(&mut self, pcb: Option<Arc<Pcb>>) {
		self.current = pcb;
	}

	pub fn get_reductions(&self) -> i32 {
		self.reductions
	}

	/// Overrides the remaining budget; values outside the configured
	/// window are rejected without a state change.
	#[allow(dead_code)]
	pub fn set_reductions(&mut self, n: i32) -> Result<()> {
		if !(MIN_REDUCTIONS..=MAX_REDUCTIONS).contains(&n) {
			return Err(Error::InvalidReductions(n));
		}

		self.reductions = n;
		Ok(())
	}

	/// One safe-point decrement; returns the remaining budget.
	pub fn decrement_reductions(&mut self) -> i32 {
		self.reductions -= 1;
		self.reductions
	}

	/// Preemption point: keep running while budget remains, otherwise
	/// requeue the current process. Returns `true` to continue running.
	pub fn yield_check(&mut self) -> bool {
		if self.reductions > 0 {
			true
		} else {
			self.preempt();
			false
		}
	}

	/// Deschedules the current process at the tail of its priority queue,
	/// keeping the exhausted budget as its snapshot.
	pub fn preempt(&mut self) {
		self.requeue_current(false);
	}

	/// Unconditional voluntary yield; the budget snapshot is reset to the
	/// default before the process is requeued.
	pub fn yield_with_state(&mut self) {
		self.requeue_current(true);
	}

	/// Yields only when another ready process is waiting on this core.
	/// Returns `true` if the current process was descheduled.
	pub fn yield_conditional(&mut self) -> bool {
		if self.slot().ready_len() > 0 {
			self.yield_with_state();
			true
		} else {
			false
		}
	}

	fn requeue_current(&mut self, reset_budget: bool) {
		let pcb = self.current.take().expect("no current process to requeue");
		let snapshot = if reset_budget {
			self.rt.config.default_reductions
		} else {
			self.reductions.max(0)
		};
		pcb.set_reduction_budget(snapshot);
		pcb.save_context(self.current_context);

		if pcb.suspend_requested() {
			debug!("suspending process {} on requeue", pcb.pid());
			pcb.set_state(PcbState::Suspended);
			return;
		}

		pcb.set_state(PcbState::Ready);
		self.slot()
			.stats
			.total_yields
			.fetch_add(1, Ordering::Relaxed);

		// An affinity change while the process ran may have excluded this
		// core; re-home instead of violating the mask.
		if !pcb.affinity().contains(self.core_id) {
			let new_owner = self.rt.pick_core_in(pcb.affinity());
			warn!(
				"re-homing process {} from core {} to core {new_owner} after affinity change",
				pcb.pid(),
				self.core_id
			);
			pcb.set_owner_core(new_owner);
			self.rt.make_ready(pcb);
			return;
		}

		self.enqueue(pcb);
	}

	/// Runs the current process until it deschedules itself.
	pub fn execute(&mut self, pcb: Arc<Pcb>) {
		self.current_context = pcb.restore_context();
		self.slot().stats.set_state(CoreState::RunningPcb);

		loop {
			if pcb.kill_requested() {
				self.exit_current(-1);
				break;
			}

			// Re-entering the body is a safe point of its own; charging
			// it here bounds even a body that never calls `consume`, and
			// an exhausted budget preempts no matter what the body's
			// last trap asked for.
			self.decrement_reductions();
			if !self.yield_check() {
				break;
			}

			let Some(mut body) = pcb.take_body() else {
				self.exit_current(-1);
				break;
			};
			let trap = {
				let mut ctx = BifContext {
					sched: self,
					pcb: pcb.clone(),
				};
				body(&mut ctx)
			};
			pcb.put_body(body);

			if pcb.kill_requested() {
				self.exit_current(-1);
				break;
			}

			match trap {
				Trap::Preempted => {
					// A body may trap conservatively with budget left;
					// yield_check keeps it on the core in that case.
					if !self.yield_check() {
						break;
					}
				}
				Trap::Yield => {
					self.yield_with_state();
					break;
				}
				Trap::YieldIfContended => {
					if self.yield_conditional() {
						break;
					}
				}
				Trap::Receive(timeout) => {
					if self.block_on_receive(&pcb, timeout) {
						break;
					}
				}
				Trap::Sleep(ticks) => {
					self.block_on_sleep(&pcb, ticks);
					break;
				}
				Trap::Join(target) => {
					if self.block_on_join(&pcb, target) {
						break;
					}
				}
				Trap::Exit(code) => {
					self.exit_current(code);
					break;
				}
			}
		}

		debug_assert!(self.current.is_none());
		self.slot().stats.set_state(CoreState::Dispatching);
	}

	/// Parks the current process on its empty mailbox.
	///
	/// Returns `false` when a message raced in before the mailbox lock
	/// was taken; the caller keeps running and re-enters the body, which
	/// will see the message. The timeout token is reserved up front and
	/// armed only after the process is fully parked.
	fn block_on_receive(&mut self, pcb: &Arc<Pcb>, timeout: Option<u64>) -> bool {
		let reserved = timeout.map(|ticks| {
			let deadline = self.rt.clock.now() + ticks.max(1);
			(self.rt.wheel.reserve(), deadline)
		});

		if !fabric::try_block_on_receive(pcb, reserved.map(|(token, _)| token)) {
			if let Some((token, _)) = reserved {
				self.rt.wheel.discard(token);
			}
			return false;
		}

		trace!("blocking process {} on receive", pcb.pid());
		self.deschedule_blocked();
		if let Some((token, deadline)) = reserved {
			self.rt
				.wheel
				.arm(token, deadline, pcb.pid(), TimerKind::Wake);
		}
		self.reap_if_killed(pcb);
		true
	}

	fn block_on_sleep(&mut self, pcb: &Arc<Pcb>, ticks: u64) {
		let token = self.rt.wheel.reserve();
		let deadline = self.rt.clock.now() + ticks.max(1);
		pcb.set_blocked_on(BlockedOn::Timer(token));
		pcb.set_state(PcbState::Waiting);

		trace!("process {} sleeping until tick {deadline}", pcb.pid());
		self.deschedule_blocked();
		self.rt
			.wheel
			.arm(token, deadline, pcb.pid(), TimerKind::Wake);
		self.reap_if_killed(pcb);
	}

	/// Parks the current process until `target` exits. Returns `false`
	/// (keep running) when the target is already gone.
	fn block_on_join(&mut self, pcb: &Arc<Pcb>, target: Pid) -> bool {
		if !self.rt.register_waiter(target, pcb.pid()) {
			return false;
		}

		pcb.set_state(PcbState::Waiting);
		if self.rt.store.get(target).is_none() {
			// The target died inside the registration window; settle
			// the race against its exit drain.
			if pcb.try_wake_any().is_some() {
				pcb.set_state(PcbState::Running);
				return false;
			}
			// The drain won and already enqueued this process on our
			// own input channel; deschedule normally.
		}

		debug!("process {} is waiting for process {target}", pcb.pid());
		self.deschedule_blocked();
		self.reap_if_killed(pcb);
		true
	}

	fn deschedule_blocked(&mut self) {
		let pcb = self.current.take().expect("no current process to block");
		pcb.set_reduction_budget(self.reductions.max(0));
		pcb.save_context(self.current_context);
	}

	/// Settles the kill/park race: `kill` sets the flag before it reads
	/// the state, this runs after the state was stored, so one side
	/// always observes the other. If the flag is set and this call still
	/// wins the wake, the process is collected right here.
	fn reap_if_killed(&mut self, pcb: &Arc<Pcb>) {
		if pcb.kill_requested()
			&& let Some(timer) = pcb.try_wake_any()
		{
			if let Some(token) = timer {
				self.rt.wheel.cancel(token);
			}
			self.rt.finalize(pcb, -1);
		}
	}

	fn exit_current(&mut self, code: i32) {
		self.reductions -= BIF_EXIT_COST;
		let pcb = self.current.take().expect("no current process to exit");
		self.rt.finalize(&pcb, code);
	}

	/// Drains the cross-core input channel into the local ready queues.
	pub fn check_input(&mut self) {
		loop {
			let pcb = self.slot().input.lock().pop();
			let Some(pcb) = pcb else {
				break;
			};

			if pcb.kill_requested() {
				self.rt.finalize(&pcb, -1);
				continue;
			}
			if pcb.suspend_requested() {
				pcb.set_state(PcbState::Suspended);
				continue;
			}

			self.slot().push_ready(pcb);
		}
	}

	/// The dispatcher main loop; runs until shutdown.
	pub fn run(&mut self) {
		info!("dispatcher online on core {}", self.core_id);
		let backoff = Backoff::new();

		while !self.rt.is_shutting_down() {
			self.slot().stats.set_state(CoreState::Dispatching);
			self.check_input();
			if self.core_id == TIMER_CORE {
				self.rt.drive_timers();
			}

			if let Some(pcb) = self.schedule() {
				self.execute(pcb);
				backoff.reset();
				continue;
			}

			if balancer::try_steal(self) {
				backoff.reset();
				continue;
			}

			if backoff.is_completed() {
				self.idle_wait();
				backoff.reset();
			} else {
				backoff.snooze();
			}
		}

		info!("dispatcher on core {} stopped", self.core_id);
	}

	/// Low-power wait for an event: any cross-core enqueue or timer fire
	/// targeting this core unparks it. The timer core never sleeps past
	/// its next tick.
	fn idle_wait(&mut self) {
		let stats = &self.slot().stats;
		stats.set_state(CoreState::Idle);
		stats.idle_ticks.fetch_add(1, Ordering::Relaxed);

		let timeout = if self.core_id == TIMER_CORE {
			self.rt.clock.tick_duration()
		} else {
			IDLE_PARK
		};
		self.parker.park_timeout(timeout);
	}
}

/// The view a process body has of its scheduler: reduction accounting and
/// the dispatch-level BIFs (spawn, send, receive).
///
/// Compiled process code charges every call, arithmetic burst and loop
/// back-edge through [`consume`](Self::consume) and traps out with
/// [`Trap::Preempted`] once the budget is gone.
pub struct BifContext<'a> {
	sched: &'a mut PerCoreScheduler,
	pcb: Arc<Pcb>,
}

impl BifContext<'_> {
	pub fn pid(&self) -> Pid {
		self.pcb.pid()
	}

	pub fn core_id(&self) -> CoreId {
		self.sched.core_id
	}

	/// Remaining reduction budget.
	pub fn reductions(&self) -> i32 {
		self.sched.get_reductions()
	}

	/// Charges `n` reductions; returns `false` once the budget is
	/// exhausted, at which point the body must trap at its next safe
	/// point.
	pub fn consume(&mut self, n: u32) -> bool {
		self.sched.reductions -= n as i32;
		self.sched.reductions > 0
	}

	/// Sends `payload` to `to`, waking the receiver if it is blocked in
	/// `receive`. Costs one reduction.
	pub fn send(&mut self, to: Pid, payload: &[u8]) -> Result<()> {
		self.sched.reductions -= 1;
		let rt = self.sched.rt.clone();
		rt.send_from(self.pcb.pid(), to, payload, Some(&mut *self.sched))
	}

	/// Consumes the head of the own mailbox. Costs one reduction.
	///
	/// [`RecvStatus::WouldBlock`] asks the body to return
	/// [`Trap::Receive`]; after a timed-out wait the next call reports
	/// [`RecvStatus::TimedOut`] exactly once.
	pub fn receive(&mut self) -> RecvStatus {
		self.sched.reductions -= 1;
		if self.pcb.take_timed_out() {
			return RecvStatus::TimedOut;
		}

		match self.pcb.mailbox.pop() {
			Some(envelope) => RecvStatus::Message(envelope),
			None => RecvStatus::WouldBlock,
		}
	}

	/// Spawns a child process. Costs [`BIF_SPAWN_COST`] reductions.
	pub fn spawn(&mut self, options: SpawnOptions, body: ProcessBody) -> Result<Pid> {
		self.sched.reductions -= BIF_SPAWN_COST;
		let rt = self.sched.rt.clone();
		rt.spawn_process(options, body, Some(&mut *self.sched))
	}

	/// Whether `pid` is still known to the store. Pair with
	/// [`Trap::Join`] to wait for a termination.
	pub fn is_alive(&self, pid: Pid) -> bool {
		self.sched.rt.store.get(pid).is_some()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;
	use std::sync::atomic::AtomicI32;

	use super::*;
	use crate::config::{Config, DEFAULT_REDUCTIONS};
	use crate::runtime::Runtime;
	use crate::scheduler::pcb::{HIGH_PRIO, MAX_PRIO, NORMAL_PRIO};

	fn runtime(cores: u32) -> Runtime {
		Runtime::new(Config::with_cores(cores)).unwrap()
	}

	fn exit_body() -> ProcessBody {
		Box::new(|_| Trap::Exit(0))
	}

	#[test]
	fn init_rejects_an_invalid_core_id() {
		let rt = runtime(2);
		assert!(PerCoreScheduler::new(rt.inner().clone(), 1).is_ok());
		assert_eq!(
			PerCoreScheduler::new(rt.inner().clone(), 2).err(),
			Some(Error::InvalidCore(2))
		);
	}

	#[test]
	fn strict_priority_selection() {
		// Three processes on core 0, spawned NORMAL, HIGH, MAX - selected
		// in the reverse order, regardless of arrival.
		let rt = runtime(1);
		let mut sched = PerCoreScheduler::new(rt.inner().clone(), 0).unwrap();

		let p1 = rt
			.spawn(
				crate::runtime::SpawnOptions::new().with_priority(NORMAL_PRIO),
				exit_body(),
			)
			.unwrap();
		let p2 = rt
			.spawn(
				crate::runtime::SpawnOptions::new().with_priority(HIGH_PRIO),
				exit_body(),
			)
			.unwrap();
		let p3 = rt
			.spawn(
				crate::runtime::SpawnOptions::new().with_priority(MAX_PRIO),
				exit_body(),
			)
			.unwrap();

		sched.check_input();
		rt.inner().cores[0].verify_ready();

		for expected in [p3, p2, p1] {
			let pcb = sched.schedule().unwrap();
			assert_eq!(pcb.pid(), expected);
			assert_eq!(pcb.state(), PcbState::Running);
			assert_eq!(pcb.queued_on(), None);
			sched.execute(pcb);
		}
		assert!(sched.schedule().is_none());
		assert_eq!(rt.inner().cores[0].stats.snapshot().total_scheduled, 3);
	}

	#[test]
	fn reduction_exhaustion_preempts_to_the_tail() {
		let rt = runtime(1);
		let mut sched = PerCoreScheduler::new(rt.inner().clone(), 0).unwrap();

		let pid_a = rt.spawn(crate::runtime::SpawnOptions::new(), exit_body()).unwrap();
		let pid_b = rt.spawn(crate::runtime::SpawnOptions::new(), exit_body()).unwrap();
		sched.check_input();

		// First selection: A, with a full budget.
		let a = sched.schedule().unwrap();
		assert_eq!(a.pid(), pid_a);
		assert_eq!(sched.get_reductions(), DEFAULT_REDUCTIONS);
		let _ = a.restore_context();

		// Burn the whole budget one safe point at a time.
		for _ in 0..DEFAULT_REDUCTIONS {
			sched.decrement_reductions();
		}
		assert!(!sched.yield_check());
		assert_eq!(a.state(), PcbState::Ready);
		assert_eq!(a.reduction_budget(), 0);

		// A went to the tail: B runs next, then A again.
		let b = sched.schedule().unwrap();
		assert_eq!(b.pid(), pid_b);
		let _ = b.restore_context();
		sched.yield_with_state();
		assert_eq!(b.reduction_budget(), DEFAULT_REDUCTIONS);

		let again = sched.schedule().unwrap();
		assert_eq!(again.pid(), pid_a);
	}

	#[test]
	fn reduction_accessors_are_bounded() {
		let rt = runtime(1);
		let mut sched = PerCoreScheduler::new(rt.inner().clone(), 0).unwrap();

		assert_eq!(
			sched.set_reductions(MIN_REDUCTIONS - 1),
			Err(Error::InvalidReductions(MIN_REDUCTIONS - 1))
		);
		assert_eq!(
			sched.set_reductions(MAX_REDUCTIONS + 1),
			Err(Error::InvalidReductions(MAX_REDUCTIONS + 1))
		);

		sched.set_reductions(500).unwrap();
		assert_eq!(sched.decrement_reductions(), 499);
		assert_eq!(sched.get_reductions(), 499);
	}

	#[test]
	fn yield_conditional_only_fires_under_contention() {
		let rt = runtime(1);
		let mut sched = PerCoreScheduler::new(rt.inner().clone(), 0).unwrap();

		let lone = rt.spawn(crate::runtime::SpawnOptions::new(), exit_body()).unwrap();
		sched.check_input();
		let pcb = sched.schedule().unwrap();
		assert_eq!(pcb.pid(), lone);
		let _ = pcb.restore_context();

		// Empty queues: the process keeps the core.
		assert!(!sched.yield_conditional());
		assert_eq!(pcb.state(), PcbState::Running);

		// A newcomer appears; now the yield happens.
		rt.spawn(crate::runtime::SpawnOptions::new(), exit_body()).unwrap();
		sched.check_input();
		assert!(sched.yield_conditional());
		assert_eq!(pcb.state(), PcbState::Ready);
		assert!(sched.get_current().is_none());
	}

	#[test]
	fn enqueue_then_schedule_round_trips() {
		let rt = runtime(1);
		let mut sched = PerCoreScheduler::new(rt.inner().clone(), 0).unwrap();

		let pid = rt.spawn(crate::runtime::SpawnOptions::new(), exit_body()).unwrap();
		sched.check_input();

		let pcb = sched.schedule().unwrap();
		assert_eq!(pcb.pid(), pid);
		assert!(sched.schedule().is_none());
		sched.execute(pcb);
		assert_eq!(rt.process_count(), 0);
	}

	#[test]
	fn dequeue_takes_one_specific_level() {
		let rt = runtime(1);
		let mut sched = PerCoreScheduler::new(rt.inner().clone(), 0).unwrap();

		rt.spawn(
			crate::runtime::SpawnOptions::new().with_priority(HIGH_PRIO),
			exit_body(),
		)
		.unwrap();
		let normal = rt.spawn(crate::runtime::SpawnOptions::new(), exit_body()).unwrap();
		sched.check_input();

		let pcb = sched.dequeue(NORMAL_PRIO).unwrap();
		assert_eq!(pcb.pid(), normal);
		assert!(sched.dequeue(NORMAL_PRIO).is_none());
		assert_eq!(rt.inner().cores[0].ready_len(), 1);

		// Put it back so the queue invariants stay intact for the drop.
		sched.enqueue(pcb);
	}

	#[test]
	fn send_wakes_a_blocked_receiver_across_cores() {
		// A receiver owned by core 1 blocks in receive; a host-side send
		// makes it ready on core 1 again and the message arrives intact.
		let rt = runtime(2);
		let inner = rt.inner().clone();
		let mut core1 = PerCoreScheduler::new(inner.clone(), 1).unwrap();

		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = seen.clone();
		let pid = rt
			.spawn(
				crate::runtime::SpawnOptions::new().on_core(1),
				Box::new(move |ctx| match ctx.receive() {
					RecvStatus::Message(envelope) => {
						sink.lock().unwrap().extend_from_slice(&envelope.payload);
						Trap::Exit(0)
					}
					RecvStatus::WouldBlock => Trap::Receive(None),
					RecvStatus::TimedOut => Trap::Exit(1),
				}),
			)
			.unwrap();

		core1.check_input();
		let receiver = core1.schedule().unwrap();
		core1.execute(receiver);
		assert_eq!(rt.process_info(pid).unwrap().state, PcbState::Waiting);

		rt.send(pid, &[42]).unwrap();
		assert_eq!(rt.process_info(pid).unwrap().state, PcbState::Ready);
		assert_eq!(rt.process_info(pid).unwrap().owner_core, 1);

		core1.check_input();
		let woken = core1.schedule().unwrap();
		core1.execute(woken);
		assert_eq!(seen.lock().unwrap().as_slice(), &[42]);
		assert_eq!(rt.process_count(), 0);
	}

	#[test]
	fn receive_timeout_races_cleanly_with_delivery() {
		// A receive with a 10-tick timeout; a message at "tick 5" wins
		// and the later timer fire is a no-op.
		let rt = runtime(1);
		let inner = rt.inner().clone();
		let mut sched = PerCoreScheduler::new(inner.clone(), 0).unwrap();

		let outcome = Arc::new(AtomicI32::new(0));
		let flag = outcome.clone();
		let pid = rt
			.spawn(
				crate::runtime::SpawnOptions::new(),
				Box::new(move |ctx| match ctx.receive() {
					RecvStatus::Message(_) => {
						flag.store(1, Ordering::SeqCst);
						Trap::Exit(0)
					}
					RecvStatus::WouldBlock => Trap::Receive(Some(10)),
					RecvStatus::TimedOut => {
						flag.store(2, Ordering::SeqCst);
						Trap::Exit(0)
					}
				}),
			)
			.unwrap();

		sched.check_input();
		let receiver = sched.schedule().unwrap();
		sched.execute(receiver);
		assert_eq!(rt.process_info(pid).unwrap().state, PcbState::Waiting);

		// The message arrives before the deadline.
		rt.send(pid, b"hi").unwrap();
		sched.check_input();
		let woken = sched.schedule().unwrap();
		sched.execute(woken);
		assert_eq!(outcome.load(Ordering::SeqCst), 1);

		// The deadline passes long after; the stale timer must not blow
		// up on the terminated receiver.
		inner.advance_timers(inner.clock.now() + 100);
		assert_eq!(rt.process_count(), 0);
	}

	#[test]
	fn receive_timeout_fires_without_a_message() {
		let rt = runtime(1);
		let inner = rt.inner().clone();
		let mut sched = PerCoreScheduler::new(inner.clone(), 0).unwrap();

		let outcome = Arc::new(AtomicI32::new(0));
		let flag = outcome.clone();
		let pid = rt
			.spawn(
				crate::runtime::SpawnOptions::new(),
				Box::new(move |ctx| match ctx.receive() {
					RecvStatus::Message(_) => {
						flag.store(1, Ordering::SeqCst);
						Trap::Exit(0)
					}
					RecvStatus::WouldBlock => Trap::Receive(Some(10)),
					RecvStatus::TimedOut => {
						flag.store(2, Ordering::SeqCst);
						Trap::Exit(0)
					}
				}),
			)
			.unwrap();

		sched.check_input();
		let receiver = sched.schedule().unwrap();
		sched.execute(receiver);

		// Push the wheel well past the deadline; the wake must arrive.
		inner.advance_timers(inner.clock.now() + 1000);
		assert_eq!(rt.process_info(pid).unwrap().state, PcbState::Ready);

		sched.check_input();
		let woken = sched.schedule().unwrap();
		sched.execute(woken);
		assert_eq!(outcome.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn sleeping_processes_wake_on_their_deadline() {
		let rt = runtime(1);
		let inner = rt.inner().clone();
		let mut sched = PerCoreScheduler::new(inner.clone(), 0).unwrap();

		let slept = Arc::new(AtomicI32::new(0));
		let flag = slept.clone();
		let mut first = true;
		let pid = rt
			.spawn(
				crate::runtime::SpawnOptions::new(),
				Box::new(move |_| {
					if first {
						first = false;
						Trap::Sleep(10_000)
					} else {
						flag.store(1, Ordering::SeqCst);
						Trap::Exit(0)
					}
				}),
			)
			.unwrap();

		sched.check_input();
		let pcb = sched.schedule().unwrap();
		sched.execute(pcb);
		assert_eq!(rt.process_info(pid).unwrap().state, PcbState::Waiting);

		// Nothing happens before the deadline.
		inner.advance_timers(inner.clock.now() + 1);
		assert_eq!(rt.process_info(pid).unwrap().state, PcbState::Waiting);

		inner.advance_timers(inner.clock.now() + 20_000);
		sched.check_input();
		let woken = sched.schedule().unwrap();
		sched.execute(woken);
		assert_eq!(slept.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn exit_drops_the_mailbox_and_releases_joiners() {
		let rt = runtime(1);
		let mut sched = PerCoreScheduler::new(rt.inner().clone(), 0).unwrap();

		let target = rt
			.spawn(crate::runtime::SpawnOptions::new(), Box::new(|_| Trap::Exit(0)))
			.unwrap();

		// The joiner runs first (higher priority), so it really parks on
		// the target before the target gets to exit.
		let joined = Arc::new(AtomicI32::new(0));
		let flag = joined.clone();
		rt.spawn(
			crate::runtime::SpawnOptions::new().with_priority(HIGH_PRIO),
			Box::new(move |ctx| {
				if ctx.is_alive(target) {
					Trap::Join(target)
				} else {
					flag.store(1, Ordering::SeqCst);
					Trap::Exit(0)
				}
			}),
		)
		.unwrap();

		// Undelivered messages die with the target.
		rt.send(target, b"never read").unwrap();

		sched.check_input();
		while let Some(pcb) = sched.schedule() {
			sched.execute(pcb);
			sched.check_input();
		}

		assert_eq!(rt.send(target, b"late").err(), Some(Error::NoSuchProcess(target)));
		assert_eq!(joined.load(Ordering::SeqCst), 1);
		assert_eq!(rt.process_count(), 0);
	}
}

