//! Core topology and placement policy.
//!
//! Cores are partitioned into a *performance* cluster (a configured prefix of
//! the core id space) and an *efficiency* cluster (the remainder), the way
//! asymmetric parts like Apple silicon number them. Placement decisions and
//! migration legality both live here; load is defined as the sum of
//! ready-queue counts on a core.

use core::fmt;
use core::ops::Range;
use core::sync::atomic::Ordering;

use crate::config::Config;
use crate::scheduler::CoreId;
use crate::scheduler::pcb::Pcb;
use crate::time::Ticks;

/// Bitmask of cores a process may run on. Bit `n` is core `n`.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct CoreMask(u128);

impl CoreMask {
	/// Mask with the first `cores` bits set.
	pub const fn all(cores: u32) -> Self {
		if cores >= 128 {
			Self(u128::MAX)
		} else {
			Self((1 << cores) - 1)
		}
	}

	pub const fn from_bits(bits: u128) -> Self {
		Self(bits)
	}

	pub const fn bits(self) -> u128 {
		self.0
	}

	/// Mask containing only `core`. A core id beyond the mask width
	/// yields an empty mask, which the affinity API rejects as
	/// selecting no online core.
	pub const fn single(core: CoreId) -> Self {
		if core < 128 {
			Self(1 << core)
		} else {
			Self(0)
		}
	}

	pub const fn contains(self, core: CoreId) -> bool {
		core < 128 && self.0 & (1 << core) != 0
	}

	pub const fn is_empty(self) -> bool {
		self.0 == 0
	}

	pub const fn count(self) -> u32 {
		self.0.count_ones()
	}

	/// Drops all bits at or beyond `cores`. Bits outside the online set
	/// are silently discarded, matching the truncation the placement
	/// policy applies everywhere.
	pub const fn truncated(self, cores: u32) -> Self {
		Self(self.0 & Self::all(cores).0)
	}

	/// Sets the bit for `core`; ids beyond the mask width are ignored,
	/// like every other out-of-range bit.
	pub fn insert(&mut self, core: CoreId) {
		if core < 128 {
			self.0 |= 1 << core;
		}
	}

	/// Iterates the set core ids, lowest first.
	pub fn iter(self) -> impl Iterator<Item = CoreId> {
		(0..128).filter(move |core| self.contains(*core))
	}
}

impl fmt::Debug for CoreMask {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "CoreMask({:#x})", self.0)
	}
}

/// Classification of a core in an asymmetric multiprocessor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CoreType {
	Performance,
	Efficiency,
}

/// Workload hint used by the placement policy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcessType {
	/// Long reduction bursts; wants a performance core.
	CpuIntensive,
	/// Mostly blocked; an efficiency core is enough.
	IoBound,
	/// Bursty; prefers performance cores when available.
	Mixed,
}

/// Static core layout of the machine, fixed at boot.
#[derive(Clone, Debug)]
pub struct Topology {
	cores: u32,
	p_range: Range<u32>,
}

impl Topology {
	pub fn new(config: &Config) -> Self {
		Self {
			cores: config.cores,
			p_range: config.p_core_range.clone(),
		}
	}

	pub fn core_count(&self) -> u32 {
		self.cores
	}

	/// Mask of all online cores.
	pub fn online_mask(&self) -> CoreMask {
		CoreMask::all(self.cores)
	}

	pub fn core_type(&self, core: CoreId) -> CoreType {
		if self.p_range.contains(&core) {
			CoreType::Performance
		} else {
			CoreType::Efficiency
		}
	}

	/// Cluster id of a core: 0 for the performance cluster, 1 for the
	/// efficiency cluster.
	pub fn cluster(&self, core: CoreId) -> u32 {
		match self.core_type(core) {
			CoreType::Performance => 0,
			CoreType::Efficiency => 1,
		}
	}

	fn cores_of_type(&self, wanted: CoreType) -> impl Iterator<Item = CoreId> + '_ {
		(0..self.cores).filter(move |core| self.core_type(*core) == wanted)
	}

	/// Least-loaded core of the cluster matching `process_type`.
	///
	/// `loads` holds the per-core ready counts, indexed by core id. Falls
	/// back to the other cluster when the preferred one has no cores, so
	/// a machine without an efficiency cluster still places everything.
	/// Ties go to the lowest core id.
	pub fn optimal_core(&self, process_type: ProcessType, loads: &[usize]) -> CoreId {
		self.optimal_core_in(process_type, self.online_mask(), loads)
	}

	/// [`optimal_core`](Self::optimal_core) restricted to the cores in
	/// `mask`; falls back to the whole mask when the preferred cluster is
	/// masked out.
	pub fn optimal_core_in(
		&self,
		process_type: ProcessType,
		mask: CoreMask,
		loads: &[usize],
	) -> CoreId {
		debug_assert_eq!(loads.len(), self.cores as usize);

		let preferred = match process_type {
			ProcessType::CpuIntensive | ProcessType::Mixed => CoreType::Performance,
			ProcessType::IoBound => CoreType::Efficiency,
		};

		let allowed = move |core: &CoreId| mask.contains(*core);
		self.least_loaded(self.cores_of_type(preferred).filter(allowed), loads)
			.or_else(|| self.least_loaded((0..self.cores).filter(allowed), loads))
			.expect("affinity mask selects no online core")
	}

	fn least_loaded(
		&self,
		candidates: impl Iterator<Item = CoreId>,
		loads: &[usize],
	) -> Option<CoreId> {
		candidates.min_by_key(|core| loads[*core as usize])
	}
}

/// Whether moving `pcb` from `src` to `dst` is legal right now.
///
/// A move stays legal while `dst` is in the affinity mask, the process has
/// not exhausted its migration allowance, and the optional cooldown since its
/// last move has elapsed. Staying put is always allowed.
pub(crate) fn migration_allowed(
	pcb: &Pcb,
	src: CoreId,
	dst: CoreId,
	config: &Config,
	now: Ticks,
) -> bool {
	if src == dst {
		return true;
	}

	if !pcb.affinity().contains(dst) {
		return false;
	}

	if pcb.migration_count.load(Ordering::Relaxed) >= config.max_migrations {
		return false;
	}

	if let Some(cooldown) = config.migration_cooldown {
		let last = pcb.last_migration_time.load(Ordering::Relaxed);
		if now.saturating_sub(last) < cooldown {
			return false;
		}
	}

	true
}
