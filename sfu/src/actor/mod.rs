//! Single-threaded-per-actor message dispatch: a time-ordered priority
//! mailbox plus the loop that drains it.

mod mailbox;
mod runner;

pub use mailbox::*;
pub use runner::*;
