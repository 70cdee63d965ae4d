use async_trait::async_trait;
use tokio::time::{Duration, Instant};

use super::{Mailbox, Tagged};

// Bound on messages handled per wakeup, so a busy actor still observes time.
const MAX_MESSAGES_PER_TURN: usize = 10;

// An idle actor re-checks its state this often even without a wakeup.
const IDLE_WAIT: Duration = Duration::from_secs(5);

/// A stateful component driven by exactly one task.
///
/// All state lives inside the actor and is only touched from `handle`, so no
/// locking is needed beyond the mailbox itself. Handlers must not perform
/// long-running synchronous work; anything slow belongs on its own task.
#[async_trait]
pub trait Actor: Send + 'static {
	type Message: Tagged + Send + 'static;

	async fn handle(&mut self, message: Self::Message);

	/// Runs after the loop observes the abort flag.
	async fn cleanup(&mut self) {}
}

/// Drive `actor` from `mailbox` on a dedicated task until it aborts.
pub fn spawn<A: Actor>(mailbox: Mailbox<A::Message>, mut actor: A) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		while !mailbox.is_aborted() {
			let now = Instant::now();

			for _ in 0..MAX_MESSAGES_PER_TURN {
				// An abort mid-batch flushes the queue, ending the drain here.
				match mailbox.pop_due(now) {
					Some(message) => actor.handle(message).await,
					None => break,
				}
			}

			if mailbox.is_aborted() {
				break;
			}

			let idle = now + IDLE_WAIT;
			let deadline = match mailbox.next_deadline() {
				Some(deadline) if deadline < idle => deadline,
				_ => idle,
			};

			mailbox.wait_until(deadline).await;
		}

		actor.cleanup().await;
	})
}
