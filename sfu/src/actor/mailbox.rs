use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

use crate::{Error, Result};

/// A message that can be cancelled by kind.
///
/// The tag identifies the *kind* of message, not the instance: `cancel`
/// removes every queued message with a matching tag. Together with a
/// delayed push this yields the "at most one pending event of this kind"
/// idiom used throughout the actors.
pub trait Tagged {
	type Tag: Copy + Eq + std::fmt::Debug + Send;

	fn tag(&self) -> Self::Tag;
}

struct Entry<M> {
	at: Instant,
	seq: u64,
	message: M,
}

// Ordered by delivery time; the sequence number keeps ties stable.
impl<M> PartialEq for Entry<M> {
	fn eq(&self, other: &Self) -> bool {
		self.at == other.at && self.seq == other.seq
	}
}

impl<M> Eq for Entry<M> {}

impl<M> PartialOrd for Entry<M> {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl<M> Ord for Entry<M> {
	fn cmp(&self, other: &Self) -> Ordering {
		self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
	}
}

struct State<M> {
	heap: BinaryHeap<Reverse<Entry<M>>>,
	next_seq: u64,
	aborted: bool,
}

struct Shared<M> {
	label: String,
	capacity: usize,
	state: Mutex<State<M>>,
	notify: Notify,
}

/// A bounded, time-ordered mailbox shared between producers and one consumer.
///
/// Producers push messages (optionally delayed) and the consumer drains the
/// ones that are due. The notifier coalesces: a notification posted while
/// nobody waits is remembered exactly once, so repeated pushes before the
/// next wait are idempotent.
pub struct Mailbox<M: Tagged> {
	shared: Arc<Shared<M>>,
}

impl<M: Tagged> Clone for Mailbox<M> {
	fn clone(&self) -> Self {
		Self {
			shared: self.shared.clone(),
		}
	}
}

impl<M: Tagged> Mailbox<M> {
	pub fn new<L: ToString>(label: L, capacity: usize) -> Self {
		Self {
			shared: Arc::new(Shared {
				label: label.to_string(),
				capacity,
				state: Mutex::new(State {
					heap: BinaryHeap::with_capacity(capacity),
					next_seq: 0,
					aborted: false,
				}),
				notify: Notify::new(),
			}),
		}
	}

	fn state(&self) -> MutexGuard<'_, State<M>> {
		self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Schedule a message for immediate delivery.
	pub fn send(&self, message: M) -> Result<()> {
		self.send_in(message, Duration::ZERO)
	}

	/// Schedule a message for delivery after `delay`.
	pub fn send_in(&self, message: M, delay: Duration) -> Result<()> {
		let tag = message.tag();

		{
			let mut state = self.state();
			if state.aborted {
				tracing::debug!(label = %self.shared.label, ?tag, "send after abort");
				return Err(Error::MailboxAborted);
			}

			if state.heap.len() >= self.shared.capacity {
				// Queues are sized so this never happens; surface it loudly.
				tracing::error!(label = %self.shared.label, ?tag, "mailbox full");
				return Err(Error::MailboxFull);
			}

			let seq = state.next_seq;
			state.next_seq += 1;
			state.heap.push(Reverse(Entry {
				at: Instant::now() + delay,
				seq,
				message,
			}));
		}

		self.shared.notify.notify_one();
		Ok(())
	}

	/// Remove every queued message with the given tag.
	pub fn cancel(&self, tag: M::Tag) {
		{
			let mut state = self.state();
			if state.aborted {
				return;
			}

			state.heap.retain(|entry| entry.0.message.tag() != tag);
		}

		self.shared.notify.notify_one();
	}

	/// Remove all queued messages.
	pub fn clear(&self) {
		self.state().heap.clear();
		self.shared.notify.notify_one();
	}

	/// Stop accepting messages and flush the queue. The consuming loop
	/// observes this and exits.
	pub fn abort(&self) {
		{
			let mut state = self.state();
			state.aborted = true;
			state.heap.clear();
		}

		self.shared.notify.notify_one();
	}

	pub fn is_aborted(&self) -> bool {
		self.state().aborted
	}

	pub fn len(&self) -> usize {
		self.state().heap.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn capacity(&self) -> usize {
		self.shared.capacity
	}

	/// Pop the earliest message that is due at `now`, if any.
	pub fn pop_due(&self, now: Instant) -> Option<M> {
		let mut state = self.state();

		match state.heap.peek() {
			Some(entry) if entry.0.at <= now => {}
			_ => return None,
		}

		state.heap.pop().map(|entry| entry.0.message)
	}

	/// The delivery time of the earliest queued message, or None when empty
	/// (sleep as long as you like).
	pub fn next_deadline(&self) -> Option<Instant> {
		self.state().heap.peek().map(|entry| entry.0.at)
	}

	/// Wait until `deadline` or until a producer notifies, whichever comes
	/// first. Stale notifications are consumed here, so they cannot pile up.
	pub async fn wait_until(&self, deadline: Instant) {
		let notified = self.shared.notify.notified();
		tokio::pin!(notified);

		tokio::select! {
			_ = &mut notified => {}
			_ = tokio::time::sleep_until(deadline) => {}
		}
	}
}
