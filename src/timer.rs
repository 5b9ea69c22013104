//! Hierarchical timer wheel driving timeouts and sleeps.
//!
//! Four levels of 64 slots each cover ~16.7 million ticks (hours, at the
//! millisecond resolution the configuration enforces); deadlines beyond the
//! horizon park in an overflow list. `add` and `cancel` are O(1);
//! advancing the wheel costs O(fired + cascaded) per tick, so a burst of
//! timers expiring on the same tick drains in one slot visit.
//!
//! The wheel is logically owned by the timer core, which drives
//! [`TimerWheel::tick`]; every core may call `add`/`cancel`, which
//! synchronize internally. Firing is split from waking: `tick` returns the
//! expired entries and the runtime settles, per entry, whether the target is
//! still blocked on that timer - entries for terminated or already-woken
//! processes are stale and dropped there.

use ahash::RandomState;
use hashbrown::HashSet;
use hermit_sync::SpinMutex;
use smallvec::SmallVec;

use crate::scheduler::pcb::Pid;
use crate::time::Ticks;

const SLOT_BITS: u32 = 6;
const SLOTS: usize = 1 << SLOT_BITS;
const LEVELS: usize = 4;
/// First deadline distance that no longer fits the wheel.
const HORIZON: u64 = 1 << (SLOT_BITS * LEVELS as u32);

/// Handle for cancelling a pending timer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TimerToken(u64);

/// What firing a timer does to its target.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimerKind {
	/// Wake the target if it is still blocked on this timer (sleeps and
	/// receive timeouts).
	Wake,
	/// Post a system message to the target's mailbox.
	Signal,
}

/// One pending deadline.
#[derive(Clone, Debug)]
pub(crate) struct TimerEntry {
	pub deadline: Ticks,
	pub pid: Pid,
	pub kind: TimerKind,
	pub token: TimerToken,
}

pub(crate) type FiredBatch = SmallVec<[TimerEntry; 8]>;

struct WheelState {
	/// Last tick that has been fully processed.
	now: Ticks,
	levels: [[Vec<TimerEntry>; SLOTS]; LEVELS],
	/// Entries with deadlines beyond the horizon, re-placed as the wheel
	/// rolls around.
	overflow: Vec<TimerEntry>,
	/// Tokens of entries that are armed and not cancelled.
	live: HashSet<u64, RandomState>,
	/// Tokens cancelled while still parked in a slot; the entries are
	/// dropped lazily when their slot drains.
	cancelled: HashSet<u64, RandomState>,
	next_token: u64,
}

impl WheelState {
	/// Slots an entry relative to `self.now`. Past deadlines land in the
	/// very next tick.
	fn place(&mut self, entry: TimerEntry) {
		let deadline = entry.deadline.max(self.now + 1);
		let delta = deadline - self.now;

		if delta >= HORIZON {
			self.overflow.push(entry);
			return;
		}

		let mut level = 0;
		while delta >= 1 << (SLOT_BITS * (level as u32 + 1)) {
			level += 1;
		}
		let slot = (deadline >> (SLOT_BITS * level as u32)) as usize & (SLOTS - 1);
		self.levels[level][slot].push(entry);
	}

	/// Moves every entry of the given level's current slot down one
	/// level, firing the ones that are already due.
	fn cascade(&mut self, level: usize, t: Ticks, fired: &mut FiredBatch) {
		let slot = (t >> (SLOT_BITS * level as u32)) as usize & (SLOTS - 1);
		let entries = core::mem::take(&mut self.levels[level][slot]);
		for entry in entries {
			self.settle(entry, t, fired);
		}
	}

	fn settle(&mut self, entry: TimerEntry, t: Ticks, fired: &mut FiredBatch) {
		if self.cancelled.remove(&entry.token.0) {
			return;
		}

		if entry.deadline <= t {
			self.live.remove(&entry.token.0);
			fired.push(entry);
		} else {
			self.place(entry);
		}
	}
}

/// The pending-deadline set of one runtime.
pub(crate) struct TimerWheel {
	state: SpinMutex<WheelState>,
}

impl TimerWheel {
	pub fn new() -> Self {
		Self {
			state: SpinMutex::new(WheelState {
				now: 0,
				levels: core::array::from_fn(|_| core::array::from_fn(|_| Vec::new())),
				overflow: Vec::new(),
				live: HashSet::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
				cancelled: HashSet::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
				next_token: 1,
			}),
		}
	}

	/// Arms a timer for `deadline` and returns its cancel token.
	pub fn add(&self, deadline: Ticks, pid: Pid, kind: TimerKind) -> TimerToken {
		let token = self.reserve();
		self.arm(token, deadline, pid, kind);
		token
	}

	/// Allocates a token without placing an entry.
	///
	/// A blocking process reserves its token first, publishes it in its
	/// own `blocked_on` and parks, and only then arms the entry - so a
	/// fire can never observe a half-parked process.
	pub fn reserve(&self) -> TimerToken {
		let mut state = self.state.lock();
		let token = TimerToken(state.next_token);
		state.next_token += 1;
		state.live.insert(token.0);
		token
	}

	/// Places the entry for a reserved token. A token cancelled between
	/// reserve and arm is consumed here and never fires.
	pub fn arm(&self, token: TimerToken, deadline: Ticks, pid: Pid, kind: TimerKind) {
		let mut state = self.state.lock();
		if !state.live.contains(&token.0) {
			state.cancelled.remove(&token.0);
			return;
		}

		trace!("arming {kind:?} timer {token:?} for process {pid} at tick {deadline}");
		state.place(TimerEntry {
			deadline,
			pid,
			kind,
			token,
		});
	}

	/// Forgets a reserved token that was never armed.
	pub fn discard(&self, token: TimerToken) {
		self.state.lock().live.remove(&token.0);
	}

	/// Disarms a timer. Idempotent; cancelling a fired or unknown token
	/// is a no-op. The parked entry is dropped lazily when its slot
	/// drains.
	pub fn cancel(&self, token: TimerToken) {
		let mut state = self.state.lock();
		if state.live.remove(&token.0) {
			state.cancelled.insert(token.0);
		}
	}

	/// Advances the wheel to `now` and returns everything that expired.
	pub fn tick(&self, now: Ticks) -> FiredBatch {
		let mut state = self.state.lock();
		let mut fired = FiredBatch::new();

		if state.live.is_empty() {
			// Nothing armed; drop cancelled leftovers and jump.
			if !state.cancelled.is_empty() {
				for level in state.levels.iter_mut() {
					for slot in level.iter_mut() {
						slot.clear();
					}
				}
				state.overflow.clear();
				state.cancelled.clear();
			}
			state.now = state.now.max(now);
			return fired;
		}

		while state.now < now {
			let t = state.now + 1;
			state.now = t;

			// Cascade upper levels on their boundaries before draining,
			// so freshly lowered entries land in the slot drained below.
			for level in 1..LEVELS {
				if t.trailing_zeros() >= SLOT_BITS * level as u32 {
					state.cascade(level, t, &mut fired);
				} else {
					break;
				}
			}
			if t % HORIZON == 0 {
				let overflow = core::mem::take(&mut state.overflow);
				for entry in overflow {
					state.settle(entry, t, &mut fired);
				}
			}

			let slot = t as usize & (SLOTS - 1);
			let entries = core::mem::take(&mut state.levels[0][slot]);
			for entry in entries {
				state.settle(entry, t, &mut fired);
			}
		}

		fired
	}

	/// Number of armed, uncancelled timers.
	pub fn pending(&self) -> usize {
		self.state.lock().live.len()
	}
}
