//! A BEAM-style multi-core cooperative scheduler for asymmetric
//! multiprocessors.
//!
//! beamline hosts large numbers of lightweight processes on one dispatcher
//! thread per online core: four strict-priority run queues per core with
//! reduction-based preemption, a work-stealing balancer between cores, a
//! CPU-affinity and core-type-aware placement policy (performance vs.
//! efficiency clusters), per-process mailboxes with cross-core wake-up, and
//! a hierarchical timer wheel for sleeps and receive timeouts.
//!
//! Process bodies are cooperative closures: the host (typically a compiler
//! emitting process code) charges reductions through the [`BifContext`] and
//! returns a [`Trap`] at every suspension point - yield, receive, sleep,
//! exit. The scheduler never interrupts a body; it dispatches, accounts, and
//! acts on the traps.
//!
//! ```
//! use beamline::{Config, Runtime, SpawnOptions, Trap};
//!
//! let runtime = Runtime::new(Config::with_cores(2))?;
//! runtime.start();
//!
//! let mut rounds = 0u32;
//! runtime.spawn(
//! 	SpawnOptions::new(),
//! 	Box::new(move |ctx| {
//! 		rounds += 1;
//! 		if ctx.consume(1) && rounds < 3 {
//! 			Trap::Yield
//! 		} else {
//! 			Trap::Exit(0)
//! 		}
//! 	}),
//! )?;
//!
//! runtime.shutdown();
//! # Ok::<(), beamline::Error>(())
//! ```

#[macro_use]
extern crate log;

pub mod affinity;
mod balancer;
pub mod config;
pub mod error;
pub mod fabric;
pub mod runtime;
pub mod scheduler;
pub mod stats;
mod store;
pub mod time;
pub mod timer;

pub use crate::affinity::{CoreMask, CoreType, ProcessType};
pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::fabric::{Envelope, RecvStatus};
pub use crate::runtime::{ProcessInfo, Runtime, SpawnOptions};
pub use crate::scheduler::pcb::{
	HIGH_PRIO, LOW_PRIO, MAX_PRIO, NORMAL_PRIO, PcbState, Pid, Priority, ProcessBody, Trap,
};
pub use crate::scheduler::{BifContext, CoreId};
pub use crate::stats::{CoreState, StatsSnapshot};
pub use crate::time::Ticks;
pub use crate::timer::{TimerKind, TimerToken};
