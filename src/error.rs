use thiserror::Error;

use crate::scheduler::CoreId;
use crate::scheduler::pcb::Pid;

/// Errors surfaced across the library boundary.
///
/// These cover the recoverable classes only: bad arguments and resource
/// exhaustion. Invariant violations (a PCB linked into two queues, a queue
/// count disagreeing with its chain) are bugs, not conditions: they abort
/// via `assert!` and never show up here. An empty mailbox or an elapsed
/// receive timeout is not an error either; see
/// [`RecvStatus`](crate::fabric::RecvStatus).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	/// A core id at or beyond the configured dispatcher count.
	#[error("invalid core id {0}")]
	InvalidCore(CoreId),

	/// A priority outside the four scheduling levels.
	#[error("invalid priority {0}")]
	InvalidPriority(u8),

	/// An affinity mask with no online core set.
	#[error("affinity mask selects no online core")]
	EmptyAffinity,

	/// The pid is unknown to the PCB store (never issued, or terminated).
	#[error("no such process {0}")]
	NoSuchProcess(Pid),

	/// The PCB store cannot allocate another process.
	#[error("process table exhausted")]
	OutOfMemory,

	/// A reduction budget outside `[MIN_REDUCTIONS, MAX_REDUCTIONS]`.
	#[error("reduction budget {0} out of range")]
	InvalidReductions(i32),
}

pub type Result<T> = core::result::Result<T, Error>;
