#![forbid(unsafe_code)]

pub mod blocks;
pub mod config;
pub mod error;
pub mod progress_tracker;
pub mod remote;
pub mod session;

pub use reader_core::Clock;

pub use blocks::{BlockScheduler, PollOutcome, SummaryPoller};
pub use config::{ApiConfig, SessionConfig};
pub use error::{ProgressError, RemoteError, SchedulerError, SessionError};
pub use progress_tracker::{ProgressEvent, ProgressTracker};
pub use remote::{
    ActiveBlock, AdvanceResponse, HttpStudyApi, InMemoryStudyApi, OverallProgress, StudyApi,
};
pub use session::ReaderSession;
