use std::sync::{Arc, Weak};

use reader_core::Clock;
use reader_core::blocks::BlockProgress;
use reader_core::model::{
    Assignment, BlockIndex, BlockSummary, Case, CaseId, CaseProgress, Phase, UserId,
};
use storage::repository::Storage;

use crate::blocks::{BlockScheduler, SummaryPoller};
use crate::config::{ApiConfig, SessionConfig};
use crate::error::SessionError;
use crate::progress_tracker::ProgressTracker;
use crate::remote::{AdvanceResponse, HttpStudyApi, OverallProgress, StudyApi};

/// Everything one reader needs: tracker, scheduler and poller wired to the
/// same service and cache.
#[derive(Clone)]
pub struct ReaderSession {
    user: UserId,
    config: SessionConfig,
    tracker: ProgressTracker,
    scheduler: Arc<BlockScheduler>,
    poller: SummaryPoller,
}

impl ReaderSession {
    #[must_use]
    pub fn new(
        user: UserId,
        clock: Clock,
        api: Arc<dyn StudyApi>,
        storage: &Storage,
        config: SessionConfig,
    ) -> Self {
        let tracker =
            ProgressTracker::new(Arc::clone(&api), Arc::clone(&storage.progress)).with_user(user);
        let scheduler = Arc::new(BlockScheduler::new(clock, Arc::clone(&api), tracker.clone()));
        let poller = SummaryPoller::new(
            api,
            Arc::clone(&scheduler),
            tracker.clone(),
            config.poll_interval,
        );

        let weak_scheduler: Weak<BlockScheduler> = Arc::downgrade(&scheduler);
        let weak_poller = poller.downgrade();
        tracker.on_revert(move |case_id, phase| {
            let Some(scheduler) = weak_scheduler.upgrade() else {
                return;
            };
            let Some(block) = scheduler.clear_phase(case_id, phase) else {
                return;
            };
            if let Some(poller) = weak_poller.upgrade() {
                poller.stop_polling(block);
            }
        });

        Self {
            user,
            config,
            tracker,
            scheduler,
            poller,
        }
    }

    /// Build a session against the HTTP service with a `SQLite` cache.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Sqlite` if the cache database cannot be opened.
    pub async fn connect(
        user: UserId,
        api: ApiConfig,
        database_url: &str,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let storage = Storage::sqlite(database_url, &config.cache_key).await?;
        let api: Arc<dyn StudyApi> = Arc::new(HttpStudyApi::new(api));
        Ok(Self::new(user, Clock::default(), api, &storage, config))
    }

    /// Restore cached progress, then refresh cases, the active block,
    /// per-block progress and known summaries from the service.
    ///
    /// Only cache failures are fatal; service failures are logged and the
    /// cached view stays in place.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Progress` if the cache cannot be read.
    pub async fn bootstrap(&self) -> Result<(), SessionError> {
        self.tracker.load_cached().await?;
        if let Err(error) = self.tracker.load_cases().await {
            tracing::warn!(%error, "starting with cached case progress");
        }
        if let Err(error) = self.scheduler.hydrate_active_block().await {
            tracing::warn!(%error, "could not hydrate active block");
        }

        let blocks = self.scheduler.tracked_blocks();
        if !blocks.is_empty() {
            if let Err(error) = self
                .tracker
                .load_from_remote_across_blocks(self.user, &blocks)
                .await
            {
                tracing::warn!(%error, "reconciliation failed");
            }
        }
        if let Err(error) = self.poller.load_all_summaries(false).await {
            tracing::warn!(%error, "could not load block summaries");
        }
        Ok(())
    }

    #[must_use]
    pub fn user(&self) -> UserId {
        self.user
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    #[must_use]
    pub fn scheduler(&self) -> &BlockScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn poller(&self) -> &SummaryPoller {
        &self.poller
    }

    #[must_use]
    pub fn get_progress(&self, case_id: CaseId) -> CaseProgress {
        self.tracker.get_progress(case_id)
    }

    #[must_use]
    pub fn next_case(&self) -> Option<Case> {
        self.tracker.next_incomplete()
    }

    /// Record a submitted phase: stamp the block's assignment, mark it in the
    /// tracker and start polling when a POST completes the block.
    ///
    /// The stamp goes first so a verification that denies the phase always
    /// finds it to clear.
    pub async fn submit_phase(&self, case_id: CaseId, phase: Phase) -> CaseProgress {
        let block = self.scheduler.note_phase_completed(case_id, phase);
        let progress = self.tracker.mark_phase(case_id, phase).await;
        let Some(block) = block else {
            tracing::debug!(case_id = %case_id, "submitted case is not in a tracked block");
            return progress;
        };
        if phase == Phase::Post && self.scheduler.block_progress(block).is_complete() {
            self.scheduler.ensure_placeholder(block);
            self.poller.start_polling(block);
        }
        progress
    }

    /// # Errors
    ///
    /// Returns `SessionError::Scheduler` if the service call fails.
    pub async fn advance(&self) -> Result<AdvanceResponse, SessionError> {
        Ok(self.scheduler.advance().await?)
    }

    /// Start the next block with the configured size and AI probability.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Scheduler` with `PreconditionFailed` while a
    /// block is incomplete, or when the service call fails.
    pub async fn start_next_block(&self) -> Result<Vec<Assignment>, SessionError> {
        Ok(self
            .scheduler
            .start_next_block(self.config.block_size, self.config.human_ai_probability)
            .await?)
    }

    #[must_use]
    pub fn block_progress(&self, block: BlockIndex) -> BlockProgress {
        self.scheduler.block_progress(block)
    }

    #[must_use]
    pub fn known_summaries(&self) -> Vec<BlockSummary> {
        self.poller.known_summaries()
    }

    /// Summary of the most recent finished block, merged into the known set.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Remote` on transport failures.
    pub async fn latest_summary(&self) -> Result<Option<BlockSummary>, SessionError> {
        Ok(self.poller.load_latest_summary().await?)
    }

    /// # Errors
    ///
    /// Returns `SessionError::Remote` if the service call fails.
    pub async fn overall_progress(&self) -> Result<OverallProgress, SessionError> {
        Ok(self.poller.overall_progress().await?)
    }

    /// Feedback for `block`: the service's summary when it has figures,
    /// otherwise one computed locally once the block is complete, otherwise a
    /// placeholder.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Remote` if the local computation cannot list
    /// the block's assessments.
    pub async fn block_feedback(&self, block: BlockIndex) -> Result<BlockSummary, SessionError> {
        if let Some(summary) = self.scheduler.summary(block).filter(BlockSummary::has_accuracy) {
            return Ok(summary);
        }
        if !self.scheduler.block_progress(block).is_complete() {
            return Ok(BlockSummary::placeholder(block));
        }
        Ok(self.poller.compute_local_summary(block).await?)
    }

    /// Stop all polling and wait for in-flight verifications.
    pub async fn shutdown(&self) {
        self.poller.stop_all();
        self.tracker.settle().await;
        tracing::debug!(user = %self.user, "reader session shut down");
    }
}
