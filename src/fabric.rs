//! Inter-process message fabric.
//!
//! Every process owns one mailbox: a FIFO ordered by arrival on the
//! receiving core. Delivery and the decision to wake a receiver are made
//! under the mailbox lock, and a receiver transitions into the waiting state
//! under that same lock - that discipline is what rules out the lost-wakeup
//! race between "mailbox is empty, block" and "message appended, wake".
//!
//! Ordering guarantees: messages from one sender to one receiver arrive in
//! send order (the mailbox lock serializes appends); there is no ordering
//! across senders; nothing is dropped short of receiver termination.

use std::collections::VecDeque;
use std::sync::Arc;

use hermit_sync::SpinMutex;

use crate::scheduler::pcb::{BlockedOn, Pcb, PcbState, Pid};
use crate::time::Ticks;
use crate::timer::TimerToken;

/// One message in a mailbox.
#[derive(Clone, Debug)]
pub struct Envelope {
	pub sender: Pid,
	pub payload: Arc<[u8]>,
	/// Tick at which the fabric accepted the message.
	pub sent_at: Ticks,
}

/// Outcome of a `receive` attempt, none of which are errors.
#[derive(Debug)]
pub enum RecvStatus {
	/// The head of the mailbox.
	Message(Envelope),
	/// Mailbox empty; the caller should trap with [`Trap::Receive`] to
	/// block.
	///
	/// [`Trap::Receive`]: crate::Trap::Receive
	WouldBlock,
	/// A receive timeout elapsed before a message arrived.
	TimedOut,
}

/// What [`deliver`] asks the caller to do next.
#[derive(Debug)]
pub(crate) enum DeliverOutcome {
	/// Appended; the receiver was not blocked on its mailbox.
	Delivered,
	/// Appended and this call won the wake-up race: the receiver is now
	/// `Ready` and must be enqueued on its owner core. Any receive
	/// timeout that was armed is returned for cancellation.
	Wake(Option<TimerToken>),
	/// The receiver terminated; the message is dropped.
	Closed,
}

struct MailboxState {
	queue: VecDeque<Envelope>,
	closed: bool,
}

/// FIFO of inbound messages for one process.
pub(crate) struct Mailbox {
	state: SpinMutex<MailboxState>,
}

impl Mailbox {
	pub fn new() -> Self {
		Self {
			state: SpinMutex::new(MailboxState {
				queue: VecDeque::new(),
				closed: false,
			}),
		}
	}

	/// Consumes the head of the mailbox.
	pub fn pop(&self) -> Option<Envelope> {
		self.state.lock().queue.pop_front()
	}

	pub fn len(&self) -> usize {
		self.state.lock().queue.len()
	}

	/// Closes the mailbox at termination and discards the backlog.
	/// Subsequent deliveries report [`DeliverOutcome::Closed`].
	pub fn close(&self) -> usize {
		let mut state = self.state.lock();
		state.closed = true;
		let dropped = state.queue.len();
		state.queue.clear();
		dropped
	}
}

/// Appends `envelope` to the mailbox of `pcb` and settles the wake-up race.
///
/// The state inspection happens under the mailbox lock, paired with
/// [`try_block_on_receive`] taking the same lock on the receiving side; the
/// `Waiting -> Ready` compare-exchange is the single linearization point
/// shared with the timer path.
pub(crate) fn deliver(pcb: &Pcb, envelope: Envelope) -> DeliverOutcome {
	let mut mailbox = pcb.mailbox.state.lock();
	if mailbox.closed {
		return DeliverOutcome::Closed;
	}

	mailbox.queue.push_back(envelope);

	if let Some(timer) = pcb.try_wake_receive() {
		return DeliverOutcome::Wake(timer);
	}

	DeliverOutcome::Delivered
}

/// Parks `pcb` on its empty mailbox.
///
/// Returns `false` without blocking when a message raced in before the lock
/// was taken - the caller keeps running and will see the message. `timer` is
/// a *reserved* (not yet armed) token for the receive timeout; the caller
/// arms it after this returns `true`, so the entry cannot fire against a
/// half-parked process.
pub(crate) fn try_block_on_receive(pcb: &Pcb, timer: Option<TimerToken>) -> bool {
	let mailbox = pcb.mailbox.state.lock();
	if !mailbox.queue.is_empty() {
		return false;
	}

	debug_assert_eq!(pcb.state(), PcbState::Running);
	pcb.set_blocked_on(BlockedOn::Receive { timer });
	pcb.set_state(PcbState::Waiting);
	true
}
