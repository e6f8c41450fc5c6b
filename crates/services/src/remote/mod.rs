//! Remote study service consumed by the tracker, scheduler and poller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use reader_core::model::{
    AdvanceStatus, AssessmentRecord, Assignment, BlockIndex, BlockSummary, Case,
    SummaryAvailability, UserId,
};

use crate::error::RemoteError;

mod http;
mod memory;

pub use http::HttpStudyApi;
pub use memory::InMemoryStudyApi;

/// Answer of the "next assignment" operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvanceResponse {
    pub status: AdvanceStatus,
    #[serde(default)]
    pub block_index: Option<BlockIndex>,
    #[serde(default)]
    pub assignment: Option<Assignment>,
    /// Assignments in the current block whose POST phase is not done.
    #[serde(default)]
    pub remaining: u32,
}

impl AdvanceResponse {
    #[must_use]
    pub fn exhausted() -> Self {
        Self {
            status: AdvanceStatus::Exhausted,
            block_index: None,
            assignment: None,
            remaining: 0,
        }
    }
}

/// The reader's in-progress block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveBlock {
    pub block_index: BlockIndex,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
}

/// Study-wide case counts for the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OverallProgress {
    #[serde(rename = "total_cases")]
    pub total: u32,
    /// Cases with POST done.
    #[serde(rename = "completed_cases")]
    pub completed: u32,
    #[serde(rename = "remaining_cases")]
    pub remaining: u32,
    /// Cases already placed in some block.
    #[serde(rename = "assigned_cases")]
    pub assigned: u32,
    #[serde(rename = "unassigned_cases")]
    pub unassigned: u32,
    /// PRE done, POST not yet.
    #[serde(rename = "in_progress_cases")]
    pub in_progress: u32,
}

/// Operations offered by the remote study service.
///
/// `NotFound` means "not there yet"; any other error is a transport failure.
#[async_trait]
pub trait StudyApi: Send + Sync {
    async fn list_cases(&self) -> Result<Vec<Case>, RemoteError>;

    async fn advance_assignment(&self) -> Result<AdvanceResponse, RemoteError>;

    async fn start_block(
        &self,
        size: u32,
        human_ai_probability: f64,
    ) -> Result<Vec<Assignment>, RemoteError>;

    /// `None` when the reader has no block in progress.
    async fn active_block(&self) -> Result<Option<ActiveBlock>, RemoteError>;

    async fn list_block_assessments(
        &self,
        user: UserId,
        block: BlockIndex,
    ) -> Result<Vec<AssessmentRecord>, RemoteError>;

    /// Fails with `NotFound` while the summary is not ready.
    async fn block_summary(&self, block: BlockIndex) -> Result<BlockSummary, RemoteError>;

    async fn can_view_summary(&self, block: BlockIndex)
    -> Result<SummaryAvailability, RemoteError>;

    /// Historical summaries for every finished block.
    async fn list_summaries(&self) -> Result<Vec<BlockSummary>, RemoteError>;

    /// Summary of the most recent finished block; `NotFound` when none exists.
    async fn latest_summary(&self) -> Result<BlockSummary, RemoteError>;

    async fn overall_progress(&self) -> Result<OverallProgress, RemoteError>;
}
