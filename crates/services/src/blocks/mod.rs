//! Block scheduling and block summary polling.

mod poller;
mod scheduler;

pub use poller::{PollOutcome, SummaryPoller};
pub use scheduler::BlockScheduler;
