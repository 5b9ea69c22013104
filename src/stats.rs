use core::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Dispatcher run state, published for observers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CoreState {
	/// No local work and stealing failed; the dispatcher is parked.
	Idle,
	/// The dispatcher is selecting the next process.
	Dispatching,
	/// A process body is executing on this core.
	RunningPcb,
}

/// Per-core scheduling counters.
///
/// Written by the owning dispatcher (and, for `total_migrations`, by a
/// thieving dispatcher); read by anyone. Padded so two cores never share a
/// cache line.
#[derive(Debug, Default)]
pub struct CoreStats {
	/// Processes selected by `schedule()`.
	pub total_scheduled: CachePadded<AtomicU64>,
	/// Preemptions and voluntary yields.
	pub total_yields: CachePadded<AtomicU64>,
	/// Processes stolen *into* this core.
	pub total_migrations: CachePadded<AtomicU64>,
	/// Park intervals spent with no runnable work.
	pub idle_ticks: CachePadded<AtomicU64>,
	/// Ready processes across all four local queues.
	pub ready_len: CachePadded<AtomicUsize>,
	/// Current [`CoreState`], as a `u8`.
	pub core_state: CachePadded<AtomicU8>,
}

impl CoreStats {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_state(&self, state: CoreState) {
		self.core_state.store(state.into(), Ordering::Release);
	}

	pub fn state(&self) -> CoreState {
		CoreState::try_from(self.core_state.load(Ordering::Acquire)).unwrap()
	}

	pub fn snapshot(&self) -> StatsSnapshot {
		StatsSnapshot {
			total_scheduled: self.total_scheduled.load(Ordering::Relaxed),
			total_yields: self.total_yields.load(Ordering::Relaxed),
			total_migrations: self.total_migrations.load(Ordering::Relaxed),
			idle_ticks: self.idle_ticks.load(Ordering::Relaxed),
			ready_len: self.ready_len.load(Ordering::Relaxed),
			core_state: self.state(),
		}
	}
}

/// Point-in-time copy of one core's counters.
#[derive(Copy, Clone, Debug)]
pub struct StatsSnapshot {
	pub total_scheduled: u64,
	pub total_yields: u64,
	pub total_migrations: u64,
	pub idle_ticks: u64,
	pub ready_len: usize,
	pub core_state: CoreState,
}
