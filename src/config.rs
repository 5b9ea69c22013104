use core::ops::Range;

use crate::error::Error;
use crate::time::Ticks;

/// Hard cap on the number of dispatchers.
pub const MAX_CORES: u32 = 128;

/// Reduction budget granted to a process on every selection.
pub const DEFAULT_REDUCTIONS: i32 = 2000;

/// Lower bound accepted by `set_reductions`.
pub const MIN_REDUCTIONS: i32 = 100;

/// Upper bound accepted by `set_reductions`.
pub const MAX_REDUCTIONS: i32 = 10000;

/// Reductions charged to the caller for a `spawn`.
pub const BIF_SPAWN_COST: i32 = 10;

/// Reductions charged for an `exit`.
pub const BIF_EXIT_COST: i32 = 1;

/// Number of priority levels (MAX, HIGH, NORMAL, LOW).
pub const NO_PRIORITIES: usize = 4;

pub const DEFAULT_STACK_SIZE: usize = 0x4000;

pub const DEFAULT_HEAP_SIZE: usize = 0x2000;

/// Runtime configuration, fixed at boot.
///
/// All fields have working defaults; `Config::default()` sizes the runtime to
/// the machine it runs on. Out-of-range values are either clamped
/// (`default_reductions`, `timer_tick_hz`) or rejected by
/// [`Config::validated`].
#[derive(Clone, Debug)]
pub struct Config {
	/// Number of online cores, one dispatcher each.
	pub cores: u32,
	/// Reduction budget granted on selection, clamped to
	/// `[MIN_REDUCTIONS, MAX_REDUCTIONS]`.
	pub default_reductions: i32,
	/// Victims tried per steal round before the dispatcher goes idle.
	pub max_steal_attempts: u32,
	/// Migrations after which a process is pinned to its current core.
	pub max_migrations: u32,
	/// Minimum ticks between two migrations of the same process.
	/// `None` disables the cooldown check.
	pub migration_cooldown: Option<Ticks>,
	/// Timer resolution; one tick is `1 / timer_tick_hz` seconds.
	/// Raised to 1000 if configured lower, so a tick is never coarser
	/// than one millisecond.
	pub timer_tick_hz: u32,
	/// Contiguous range of core ids treated as performance cores; the
	/// remainder are efficiency cores.
	pub p_core_range: Range<u32>,
	/// Stack bytes owned by a process unless `SpawnOptions` overrides it.
	pub default_stack_size: usize,
	/// Heap bytes owned by a process unless `SpawnOptions` overrides it.
	pub default_heap_size: usize,
	/// Live-process cap; `spawn` beyond it reports `Error::OutOfMemory`.
	pub max_processes: usize,
}

impl Default for Config {
	fn default() -> Self {
		let cores = std::thread::available_parallelism()
			.map(|n| n.get() as u32)
			.unwrap_or(1)
			.min(MAX_CORES);

		Self {
			cores,
			default_reductions: DEFAULT_REDUCTIONS,
			max_steal_attempts: 4,
			max_migrations: 64,
			migration_cooldown: None,
			timer_tick_hz: 1000,
			p_core_range: 0..cores.min(8),
			default_stack_size: DEFAULT_STACK_SIZE,
			default_heap_size: DEFAULT_HEAP_SIZE,
			max_processes: 1 << 16,
		}
	}
}

impl Config {
	/// A configuration with `cores` dispatchers and defaults otherwise.
	pub fn with_cores(cores: u32) -> Self {
		Self {
			cores,
			p_core_range: 0..cores.min(8),
			..Self::default()
		}
	}

	/// Checks the hard limits and normalizes the soft ones.
	///
	/// `default_reductions` and `timer_tick_hz` are clamped rather than
	/// rejected; `cores` outside `[1, MAX_CORES]` is an error.
	pub fn validated(mut self) -> Result<Self, Error> {
		if self.cores == 0 || self.cores > MAX_CORES {
			return Err(Error::InvalidCore(self.cores));
		}

		self.default_reductions = self
			.default_reductions
			.clamp(MIN_REDUCTIONS, MAX_REDUCTIONS);
		self.timer_tick_hz = self.timer_tick_hz.max(1000);

		// The performance cluster is a prefix of the online cores.
		self.p_core_range.start = self.p_core_range.start.min(self.cores);
		self.p_core_range.end = self.p_core_range.end.min(self.cores);

		if self.max_steal_attempts == 0 {
			self.max_steal_attempts = 1;
		}

		Ok(self)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reductions_are_clamped() {
		let mut config = Config::with_cores(2);
		config.default_reductions = 7;
		let config = config.validated().unwrap();
		assert_eq!(config.default_reductions, MIN_REDUCTIONS);

		let mut config = Config::with_cores(2);
		config.default_reductions = 1 << 20;
		let config = config.validated().unwrap();
		assert_eq!(config.default_reductions, MAX_REDUCTIONS);
	}

	#[test]
	fn tick_rate_is_at_least_one_khz() {
		let mut config = Config::with_cores(1);
		config.timer_tick_hz = 60;
		assert_eq!(config.validated().unwrap().timer_tick_hz, 1000);
	}

	#[test]
	fn core_count_is_bounded() {
		assert!(Config::with_cores(0).validated().is_err());
		assert!(Config::with_cores(MAX_CORES + 1).validated().is_err());
		assert!(Config::with_cores(MAX_CORES).validated().is_ok());
	}

	#[test]
	fn p_core_range_is_truncated_to_online_cores() {
		let mut config = Config::with_cores(4);
		config.p_core_range = 0..8;
		let config = config.validated().unwrap();
		assert_eq!(config.p_core_range, 0..4);
	}
}
