//! Work-stealing load balancer.
//!
//! A dispatcher whose local queues ran dry asks the balancer for work before
//! parking. Victims are drawn pseudo-randomly from the loaded non-local
//! cores, same-cluster victims first (pulling across the P/E boundary moves
//! a process to a different core class, so it is the fallback, not the
//! default). The steal itself takes the *tail* of the victim's highest
//! non-empty level under the victim's queue lock; once that pop has
//! happened, only the thief holds the PCB. A steal that affinity then
//! forbids is pushed back to the victim's tail and the next victim is tried.

use smallvec::SmallVec;

use rand_chacha::rand_core::Rng;

use crate::affinity::migration_allowed;
use crate::scheduler::{CoreId, PerCoreScheduler};

/// Attempts to repopulate an idle core. Returns `true` when a process was
/// migrated onto the thief's queues.
pub(crate) fn try_steal(sched: &mut PerCoreScheduler) -> bool {
	let rt = sched.rt().clone();
	let thief = sched.core_id();
	if rt.config.cores <= 1 {
		return false;
	}

	// Loaded victims only; a zero estimate is not worth a lock.
	let mut victims: SmallVec<[CoreId; 16]> = (0..rt.config.cores)
		.filter(|core| *core != thief && rt.cores[*core as usize].ready_len() > 0)
		.collect();
	if victims.is_empty() {
		return false;
	}

	shuffle(sched, &mut victims);
	let thief_cluster = rt.topology.cluster(thief);
	// Stable partition: keeps the shuffled order within each group.
	victims.sort_by_key(|core| rt.topology.cluster(*core) != thief_cluster);

	let attempts = rt.config.max_steal_attempts as usize;
	for victim in victims.into_iter().take(attempts) {
		let slot = &rt.cores[victim as usize];
		let Some(pcb) = slot.steal_ready() else {
			// Contended or drained in the meantime; next victim.
			continue;
		};

		let now = rt.clock.now();
		if !migration_allowed(&pcb, victim, thief, &rt.config, now) {
			trace!(
				"migration of process {} from core {victim} to core {thief} denied",
				pcb.pid()
			);
			slot.push_ready(pcb);
			continue;
		}

		pcb.set_owner_core(thief);
		pcb.migration_count
			.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
		pcb.last_migration_time
			.store(now, core::sync::atomic::Ordering::Relaxed);

		debug!(
			"core {thief} stole process {} from core {victim}",
			pcb.pid()
		);
		sched.enqueue(pcb);
		rt.cores[thief as usize]
			.stats
			.total_migrations
			.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
		return true;
	}

	false
}

/// Fisher-Yates over the victim candidates, driven by the thief's own
/// deterministic stream.
fn shuffle(sched: &mut PerCoreScheduler, victims: &mut [CoreId]) {
	let rng = sched.rng();
	for i in (1..victims.len()).rev() {
		let j = (rng.next_u32() as usize) % (i + 1);
		victims.swap(i, j);
	}
}
