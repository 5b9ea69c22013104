//! The runtime value: boot, dispatcher threads, and the host-facing API.
//!
//! A [`Runtime`] owns everything the scheduler substrate needs - the PCB
//! store, one [`CoreSlot`] per online core, the timer wheel and the tick
//! clock. Dispatcher threads hold a shared reference to their own slot and
//! reach any other core only through that core's input channel, never
//! through its queues directly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;

use crossbeam_utils::sync::Unparker;
use hermit_sync::SpinMutex;

use crate::affinity::{CoreMask, CoreType, ProcessType, Topology};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fabric::{self, DeliverOutcome, Envelope};
use crate::scheduler::pcb::{Pcb, PcbState, Pid, Priority, ProcessBody, NORMAL_PRIO};
use crate::scheduler::queue::PriorityPcbQueue;
use crate::scheduler::{CoreId, PerCoreScheduler, SchedulerInput};
use crate::stats::{CoreStats, StatsSnapshot};
use crate::store::PcbStore;
use crate::time::{TickClock, Ticks};
use crate::timer::{TimerEntry, TimerKind, TimerToken, TimerWheel};

/// Spawn-time options; the defaults are priority `NORMAL`, affinity to all
/// online cores, and policy-driven placement.
#[derive(Clone, Debug, Default)]
pub struct SpawnOptions {
	priority: Option<Priority>,
	affinity: Option<CoreMask>,
	core: Option<CoreId>,
	process_type: Option<ProcessType>,
	stack_size: Option<usize>,
	heap_size: Option<usize>,
}

impl SpawnOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_priority(mut self, priority: Priority) -> Self {
		self.priority = Some(priority);
		self
	}

	pub fn with_affinity(mut self, affinity: CoreMask) -> Self {
		self.affinity = Some(affinity);
		self
	}

	/// Pins the initial placement to one core. The core must be online
	/// and inside the affinity mask.
	pub fn on_core(mut self, core: CoreId) -> Self {
		self.core = Some(core);
		self
	}

	/// Lets the placement policy pick a core class instead of
	/// round-robin.
	pub fn with_process_type(mut self, process_type: ProcessType) -> Self {
		self.process_type = Some(process_type);
		self
	}

	pub fn with_stack_size(mut self, bytes: usize) -> Self {
		self.stack_size = Some(bytes);
		self
	}

	pub fn with_heap_size(mut self, bytes: usize) -> Self {
		self.heap_size = Some(bytes);
		self
	}
}

/// Point-in-time view of one process, resolved through the store.
#[derive(Clone, Debug)]
pub struct ProcessInfo {
	pub pid: Pid,
	pub state: PcbState,
	pub priority: Priority,
	pub owner_core: CoreId,
	pub affinity: CoreMask,
	pub mailbox_len: usize,
	pub migration_count: u32,
	pub reduction_budget: i32,
	pub stack_size: usize,
	pub heap_size: usize,
}

/// Everything one core owns, padded against false sharing with its
/// neighbors.
#[repr(align(128))]
pub(crate) struct CoreSlot {
	/// The four ready queues. The owner takes the head; thieves take the
	/// tail through [`steal_ready`](Self::steal_ready).
	ready: SpinMutex<PriorityPcbQueue>,
	/// Cross-core hand-over channel, drained by the owner.
	pub input: SpinMutex<SchedulerInput>,
	pub stats: CoreStats,
	unparker: SpinMutex<Option<Unparker>>,
}

impl CoreSlot {
	fn new(core_id: CoreId) -> Self {
		Self {
			ready: SpinMutex::new(PriorityPcbQueue::new(core_id)),
			input: SpinMutex::new(SchedulerInput::new()),
			stats: CoreStats::new(),
			unparker: SpinMutex::new(None),
		}
	}

	pub fn set_unparker(&self, unparker: Unparker) {
		*self.unparker.lock() = Some(unparker);
	}

	/// Wake event for an idle dispatcher; a spurious unpark is harmless.
	pub fn unpark(&self) {
		if let Some(unparker) = self.unparker.lock().as_ref() {
			unparker.unpark();
		}
	}

	pub fn push_ready(&self, pcb: Arc<Pcb>) {
		let mut ready = self.ready.lock();
		ready.push(pcb);
		self.stats.ready_len.store(ready.len(), Ordering::Release);
	}

	pub fn pop_ready(&self) -> Option<Arc<Pcb>> {
		let mut ready = self.ready.lock();
		let pcb = ready.pop();
		self.stats.ready_len.store(ready.len(), Ordering::Release);
		pcb
	}

	pub fn pop_ready_prio(&self, prio: Priority) -> Option<Arc<Pcb>> {
		let mut ready = self.ready.lock();
		let pcb = ready.pop_prio(prio);
		self.stats.ready_len.store(ready.len(), Ordering::Release);
		pcb
	}

	/// Thief-side removal; refuses to contend with a busy owner.
	pub fn steal_ready(&self) -> Option<Arc<Pcb>> {
		let mut ready = self.ready.try_lock()?;
		let pcb = ready.steal_tail();
		self.stats.ready_len.store(ready.len(), Ordering::Release);
		pcb
	}

	pub fn remove_ready(&self, pid: Pid) -> Option<Arc<Pcb>> {
		let mut ready = self.ready.lock();
		let pcb = ready.remove(pid);
		self.stats.ready_len.store(ready.len(), Ordering::Release);
		pcb
	}

	pub fn set_priority_ready(&self, pid: Pid, prio: Priority) -> bool {
		self.ready.lock().set_priority(pid, prio)
	}

	/// Load estimate: ready processes across all priorities.
	pub fn ready_len(&self) -> usize {
		self.stats.ready_len.load(Ordering::Acquire)
	}

	#[cfg(test)]
	pub fn verify_ready(&self) {
		self.ready.lock().verify();
	}
}

pub(crate) struct RuntimeInner {
	pub store: PcbStore,
	pub wheel: TimerWheel,
	pub clock: TickClock,
	pub topology: Topology,
	pub cores: Box<[CoreSlot]>,
	shutdown: AtomicBool,
	/// Round-robin cursor for policy-free spawns.
	round_robin: AtomicU32,
	/// Processes waiting for another process to exit, keyed by the
	/// awaited pid.
	waiters: SpinMutex<BTreeMap<Pid, Vec<Pid>>>,
	pub config: Config,
}

impl RuntimeInner {
	pub fn is_shutting_down(&self) -> bool {
		self.shutdown.load(Ordering::Acquire)
	}

	/// Per-core load vector, indexed by core id.
	pub fn loads(&self) -> Vec<usize> {
		self.cores.iter().map(CoreSlot::ready_len).collect()
	}

	/// Least-loaded core inside `mask`.
	pub fn pick_core_in(&self, mask: CoreMask) -> CoreId {
		debug_assert!(!mask.is_empty());
		let loads = self.loads();
		mask.iter()
			.min_by_key(|core| loads[*core as usize])
			.expect("empty affinity mask")
	}

	/// Hands a ready process to its owner core and signals the core.
	///
	/// The input channel's lock pairs with the owner's drain in
	/// `check_input`; the unpark covers the case where the owner already
	/// went idle. Signaling a busy core is a wasted token, nothing more.
	pub fn make_ready(&self, pcb: Arc<Pcb>) {
		if pcb.suspend_requested() {
			pcb.set_state(PcbState::Suspended);
			return;
		}

		debug_assert_eq!(pcb.state(), PcbState::Ready);
		let slot = &self.cores[pcb.owner_core() as usize];
		slot.input.lock().push(pcb);
		slot.unpark();
	}

	/// Routes a freshly woken process, using the local fast path when the
	/// waker runs on the owning core's own dispatcher.
	fn ready_after_wake(&self, pcb: Arc<Pcb>, local: Option<&mut PerCoreScheduler>) {
		match local {
			Some(sched)
				if sched.core_id() == pcb.owner_core() && !pcb.suspend_requested() =>
			{
				sched.enqueue(pcb);
			}
			_ => self.make_ready(pcb),
		}
	}

	/// Delivers `payload` from `from` to `to`, waking the receiver if it
	/// is blocked in `receive`.
	pub fn send_from(
		&self,
		from: Pid,
		to: Pid,
		payload: &[u8],
		local: Option<&mut PerCoreScheduler>,
	) -> Result<()> {
		let Some(target) = self.store.get(to) else {
			return Err(Error::NoSuchProcess(to));
		};

		let envelope = Envelope {
			sender: from,
			payload: Arc::from(payload),
			sent_at: self.clock.now(),
		};

		match fabric::deliver(&target, envelope) {
			DeliverOutcome::Delivered => Ok(()),
			DeliverOutcome::Closed => Err(Error::NoSuchProcess(to)),
			DeliverOutcome::Wake(timer) => {
				if let Some(token) = timer {
					self.wheel.cancel(token);
				}
				trace!("message from {from} woke process {to}");
				self.ready_after_wake(target, local);
				Ok(())
			}
		}
	}

	/// Allocates, registers and places a new process.
	pub fn spawn_process(
		&self,
		options: SpawnOptions,
		body: ProcessBody,
		local: Option<&mut PerCoreScheduler>,
	) -> Result<Pid> {
		// Hosts can mint arbitrary raw priorities; reject anything
		// outside the four levels before it becomes a queue index.
		let priority = Priority::checked_from(options.priority.unwrap_or(NORMAL_PRIO).into())?;
		let requested = options.affinity.unwrap_or(self.topology.online_mask());
		if requested.is_empty() {
			return Err(Error::EmptyAffinity);
		}
		let affinity = requested.truncated(self.config.cores);
		if affinity.is_empty() {
			return Err(Error::EmptyAffinity);
		}

		let core = self.place(&options, affinity)?;
		let stack_size = options.stack_size.unwrap_or(self.config.default_stack_size);
		let heap_size = options.heap_size.unwrap_or(self.config.default_heap_size);

		let pid = self.store.issue_pid();
		let pcb = Arc::new(Pcb::new(
			pid, priority, affinity, core, body, stack_size, heap_size,
		));
		self.store.insert(pcb.clone())?;

		debug!("Creating process {pid} with priority {priority} on core {core}");

		let became_ready = pcb.try_transition(PcbState::Created, PcbState::Ready);
		debug_assert!(became_ready, "newborn process raced out of Created");
		self.ready_after_wake(pcb, local);
		Ok(pid)
	}

	/// Initial placement: explicit pin, else core-class policy, else
	/// round-robin across the allowed cores.
	fn place(&self, options: &SpawnOptions, affinity: CoreMask) -> Result<CoreId> {
		if let Some(core) = options.core {
			if core >= self.config.cores {
				return Err(Error::InvalidCore(core));
			}
			if !affinity.contains(core) {
				return Err(Error::EmptyAffinity);
			}
			return Ok(core);
		}

		if let Some(process_type) = options.process_type {
			let loads = self.loads();
			return Ok(self.topology.optimal_core_in(process_type, affinity, &loads));
		}

		let nth = self.round_robin.fetch_add(1, Ordering::Relaxed) % affinity.count();
		Ok(affinity
			.iter()
			.nth(nth as usize)
			.expect("empty affinity mask"))
	}

	/// Registers `waiter` to be woken when `target` exits. Returns
	/// `false` if the target is already gone. The store check lives
	/// inside the waiters critical section, paired with the drain in
	/// `finalize`, so a registration cannot slip past the drain.
	pub fn register_waiter(&self, target: Pid, waiter: Pid) -> bool {
		let mut waiters = self.waiters.lock();
		if self.store.get(target).is_none() {
			return false;
		}

		waiters.entry(target).or_default().push(waiter);
		true
	}

	/// Terminates a process: drops its mailbox, reclaims its memory,
	/// unregisters it and releases everyone joined on it. Pending timers
	/// are left to drain lazily - firing against a removed pid is a
	/// no-op.
	pub fn finalize(&self, pcb: &Arc<Pcb>, exit_code: i32) {
		let pid = pcb.pid();
		debug_assert!(pcb.queued_on().is_none(), "finalizing a queued process");
		debug!("Finishing process {pid} with exit code {exit_code}");

		pcb.set_state(PcbState::Terminated);
		let dropped = pcb.mailbox.close();
		if dropped > 0 {
			trace!("dropped {dropped} undelivered messages for process {pid}");
		}
		pcb.reclaim();
		self.store.remove(pid);

		let released = self.waiters.lock().remove(&pid);
		for waiter in released.into_iter().flatten() {
			let Some(waiter_pcb) = self.store.get(waiter) else {
				continue;
			};
			if let Some(timer) = waiter_pcb.try_wake_any() {
				if let Some(token) = timer {
					self.wheel.cancel(token);
				}
				self.make_ready(waiter_pcb);
			}
		}
	}

	/// Advances the wheel to the clock's now; called by the timer core.
	pub fn drive_timers(&self) {
		self.advance_timers(self.clock.now());
	}

	/// Advances the wheel to an explicit tick and settles every fired
	/// entry.
	pub fn advance_timers(&self, now: Ticks) {
		for entry in self.wheel.tick(now) {
			self.fire_entry(entry, now);
		}
	}

	fn fire_entry(&self, entry: TimerEntry, now: Ticks) {
		let Some(pcb) = self.store.get(entry.pid) else {
			trace!("timer for terminated process {} dropped", entry.pid);
			return;
		};

		match entry.kind {
			TimerKind::Wake => {
				if pcb.try_wake_timer(entry.token) {
					debug!("timer woke process {} at tick {now}", entry.pid);
					self.make_ready(pcb);
				}
			}
			TimerKind::Signal => {
				let envelope = Envelope {
					sender: Pid::SYSTEM,
					payload: Arc::from([]),
					sent_at: now,
				};
				match fabric::deliver(&pcb, envelope) {
					DeliverOutcome::Wake(timer) => {
						if let Some(token) = timer {
							self.wheel.cancel(token);
						}
						self.make_ready(pcb);
					}
					DeliverOutcome::Delivered | DeliverOutcome::Closed => {}
				}
			}
		}
	}
}

/// A booted scheduler runtime.
///
/// Constructing one initializes every per-core scheduler; [`start`] brings
/// the dispatcher threads up, [`shutdown`] stops and joins them. All
/// operations address processes by pid and are safe to call from any thread.
///
/// [`start`]: Self::start
/// [`shutdown`]: Self::shutdown
pub struct Runtime {
	inner: Arc<RuntimeInner>,
	threads: SpinMutex<Vec<JoinHandle<()>>>,
	started: AtomicBool,
}

impl Runtime {
	pub fn new(config: Config) -> Result<Self> {
		let config = config.validated()?;
		let topology = Topology::new(&config);
		let cores: Box<[CoreSlot]> = (0..config.cores).map(CoreSlot::new).collect();

		info!(
			"booting runtime with {} cores ({} performance)",
			config.cores,
			config.p_core_range.len()
		);

		let inner = Arc::new(RuntimeInner {
			store: PcbStore::new(config.max_processes),
			wheel: TimerWheel::new(),
			clock: TickClock::new(config.timer_tick_hz),
			topology,
			cores,
			shutdown: AtomicBool::new(false),
			round_robin: AtomicU32::new(0),
			waiters: SpinMutex::new(BTreeMap::new()),
			config,
		});

		Ok(Self {
			inner,
			threads: SpinMutex::new(Vec::new()),
			started: AtomicBool::new(false),
		})
	}

	pub(crate) fn inner(&self) -> &Arc<RuntimeInner> {
		&self.inner
	}

	/// Brings up one dispatcher thread per online core. Idempotent.
	pub fn start(&self) {
		if self.started.swap(true, Ordering::SeqCst) {
			return;
		}

		let mut threads = self.threads.lock();
		for core_id in 0..self.inner.config.cores {
			let inner = self.inner.clone();
			let handle = std::thread::Builder::new()
				.name(format!("dispatcher-{core_id}"))
				.spawn(move || {
					let mut sched = PerCoreScheduler::new(inner, core_id)
						.expect("core id was validated at boot");
					sched.run();
				})
				.expect("failed to spawn dispatcher thread");
			threads.push(handle);
		}
	}

	/// Stops the dispatchers and joins their threads. Processes that are
	/// still alive stay in memory until the runtime drops.
	pub fn shutdown(&self) {
		self.inner.shutdown.store(true, Ordering::Release);
		for slot in self.inner.cores.iter() {
			slot.unpark();
		}

		let mut threads = self.threads.lock();
		for handle in threads.drain(..) {
			let _ = handle.join();
		}
	}

	/// Spawns a process and places it per `options`.
	pub fn spawn(&self, options: SpawnOptions, body: ProcessBody) -> Result<Pid> {
		self.inner.spawn_process(options, body, None)
	}

	/// Terminates `pid` from outside, wherever it currently is. A
	/// running process is collected at its next safe point.
	pub fn kill(&self, pid: Pid) -> Result<()> {
		let pcb = self.inner.store.get(pid).ok_or(Error::NoSuchProcess(pid))?;
		pcb.request_kill();

		loop {
			match pcb.state() {
				PcbState::Terminated => return Ok(()),
				// The owning dispatcher honors the flag at its next
				// dispatch boundary.
				PcbState::Running | PcbState::Created => return Ok(()),
				PcbState::Ready => {
					let slot = &self.inner.cores[pcb.owner_core() as usize];
					if let Some(victim) = slot.remove_ready(pid) {
						self.inner.finalize(&victim, -1);
					}
					// Not in a queue: it sits in an input channel and
					// the drain will collect it.
					return Ok(());
				}
				PcbState::Waiting => {
					if let Some(timer) = pcb.try_wake_any() {
						if let Some(token) = timer {
							self.inner.wheel.cancel(token);
						}
						self.inner.finalize(&pcb, -1);
						return Ok(());
					}
					// Lost the wake race; re-inspect the new state.
				}
				PcbState::Suspended => {
					if pcb.try_transition(PcbState::Suspended, PcbState::Terminated) {
						self.inner.finalize(&pcb, -1);
						return Ok(());
					}
					// A concurrent resume won; re-inspect.
				}
			}
		}
	}

	/// Sends `payload` to `to` on behalf of the host (sender pid 0).
	pub fn send(&self, to: Pid, payload: &[u8]) -> Result<()> {
		self.inner.send_from(Pid::SYSTEM, to, payload, None)
	}

	/// Replaces the affinity mask of `pid`. The mask is truncated to the
	/// online cores; a mask that selects none of them is rejected. If the
	/// current owner core falls outside the new mask, the process is
	/// re-homed to the least-loaded allowed core.
	pub fn set_affinity(&self, pid: Pid, mask: CoreMask) -> Result<()> {
		if mask.is_empty() {
			return Err(Error::EmptyAffinity);
		}
		let truncated = mask.truncated(self.inner.config.cores);
		if truncated.is_empty() {
			return Err(Error::EmptyAffinity);
		}

		let pcb = self.inner.store.get(pid).ok_or(Error::NoSuchProcess(pid))?;
		pcb.set_affinity(truncated);

		let owner = pcb.owner_core();
		if !truncated.contains(owner) {
			let new_owner = self.inner.pick_core_in(truncated);
			pcb.set_owner_core(new_owner);
			// A ready process must not stay queued on a forbidden
			// core; a running one re-homes itself at its next requeue.
			if pcb.state() == PcbState::Ready
				&& let Some(moved) = self.inner.cores[owner as usize].remove_ready(pid)
			{
				self.inner.make_ready(moved);
			}
		}

		Ok(())
	}

	pub fn get_affinity(&self, pid: Pid) -> Result<CoreMask> {
		let pcb = self.inner.store.get(pid).ok_or(Error::NoSuchProcess(pid))?;
		Ok(pcb.affinity())
	}

	/// Changes the priority of `pid`. For a queued process this is an
	/// atomic dequeue + enqueue on its owner core.
	pub fn set_priority(&self, pid: Pid, priority: Priority) -> Result<()> {
		let priority = Priority::checked_from(priority.into())?;
		let pcb = self.inner.store.get(pid).ok_or(Error::NoSuchProcess(pid))?;

		if pcb.state() == PcbState::Ready {
			let slot = &self.inner.cores[pcb.owner_core() as usize];
			if slot.set_priority_ready(pid, priority) {
				return Ok(());
			}
		}

		pcb.set_priority_raw(priority);
		Ok(())
	}

	/// Parks `pid` until [`resume`](Self::resume). A running process is
	/// parked at its next dispatch boundary, a waiting one when it wakes.
	pub fn suspend(&self, pid: Pid) -> Result<()> {
		let pcb = self.inner.store.get(pid).ok_or(Error::NoSuchProcess(pid))?;
		pcb.request_suspend();

		if pcb.state() == PcbState::Ready {
			let slot = &self.inner.cores[pcb.owner_core() as usize];
			if let Some(parked) = slot.remove_ready(pid) {
				parked.set_state(PcbState::Suspended);
			}
		}

		Ok(())
	}

	pub fn resume(&self, pid: Pid) -> Result<()> {
		let pcb = self.inner.store.get(pid).ok_or(Error::NoSuchProcess(pid))?;
		pcb.clear_suspend();

		if pcb.try_transition(PcbState::Suspended, PcbState::Ready) {
			self.inner.make_ready(pcb);
		}

		Ok(())
	}

	/// Manual wake-up for host-side IO completion: rouses `pid` from
	/// whatever it is blocked on. A process that is not waiting is left
	/// alone.
	pub fn wake(&self, pid: Pid) -> Result<()> {
		let pcb = self.inner.store.get(pid).ok_or(Error::NoSuchProcess(pid))?;
		if let Some(timer) = pcb.try_wake_any() {
			if let Some(token) = timer {
				self.inner.wheel.cancel(token);
			}
			self.inner.make_ready(pcb);
		}

		Ok(())
	}

	/// Arms a timer for an absolute tick deadline (see
	/// [`now_ticks`](Self::now_ticks)). `Wake` entries rouse a process
	/// blocked in `sleep`/`receive`; `Signal` entries post an empty
	/// system message through the fabric.
	pub fn timer_add(&self, deadline: Ticks, pid: Pid, kind: TimerKind) -> Result<TimerToken> {
		if self.inner.store.get(pid).is_none() {
			return Err(Error::NoSuchProcess(pid));
		}

		Ok(self.inner.wheel.add(deadline, pid, kind))
	}

	/// Disarms a timer; idempotent.
	pub fn timer_cancel(&self, token: TimerToken) {
		self.inner.wheel.cancel(token);
	}

	/// Current tick of the runtime clock.
	pub fn now_ticks(&self) -> Ticks {
		self.inner.clock.now()
	}

	pub fn core_type(&self, core: CoreId) -> Result<CoreType> {
		if core >= self.inner.config.cores {
			return Err(Error::InvalidCore(core));
		}

		Ok(self.inner.topology.core_type(core))
	}

	pub fn cluster(&self, core: CoreId) -> Result<u32> {
		if core >= self.inner.config.cores {
			return Err(Error::InvalidCore(core));
		}

		Ok(self.inner.topology.cluster(core))
	}

	/// Placement probe: where the policy would put a process of this type
	/// right now.
	pub fn optimal_core(&self, process_type: ProcessType) -> CoreId {
		let loads = self.inner.loads();
		self.inner.topology.optimal_core(process_type, &loads)
	}

	pub fn core_count(&self) -> u32 {
		self.inner.config.cores
	}

	pub fn process_count(&self) -> u64 {
		self.inner.store.process_count()
	}

	pub fn stats(&self, core: CoreId) -> Result<StatsSnapshot> {
		if core >= self.inner.config.cores {
			return Err(Error::InvalidCore(core));
		}

		Ok(self.inner.cores[core as usize].stats.snapshot())
	}

	pub fn process_info(&self, pid: Pid) -> Result<ProcessInfo> {
		let pcb = self.inner.store.get(pid).ok_or(Error::NoSuchProcess(pid))?;
		Ok(ProcessInfo {
			pid,
			state: pcb.state(),
			priority: pcb.priority(),
			owner_core: pcb.owner_core(),
			affinity: pcb.affinity(),
			mailbox_len: pcb.mailbox.len(),
			migration_count: pcb.migration_count.load(Ordering::Relaxed),
			reduction_budget: pcb.reduction_budget(),
			stack_size: pcb.stack_info().1,
			heap_size: pcb.heap_info().1,
		})
	}

	pub fn config(&self) -> &Config {
		&self.inner.config
	}
}

impl Drop for Runtime {
	fn drop(&mut self) {
		self.shutdown();
	}
}
