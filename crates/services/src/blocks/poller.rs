use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use reader_core::accuracy::BlockAccuracy;
use reader_core::model::{BlockIndex, BlockSummary, CaseId};

use super::scheduler::BlockScheduler;
use crate::error::RemoteError;
use crate::progress_tracker::ProgressTracker;
use crate::remote::{OverallProgress, StudyApi};

/// Result of one polling tick.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The block still has assignments without POST; nothing was fetched.
    Incomplete,
    /// A fetch was made but the summary has no figures yet.
    NotReady,
    /// A populated summary arrived and polling for the block stopped.
    Ready(BlockSummary),
}

/// Fetches block summaries and owns at most one polling task per block.
///
/// Cheap to clone; clones share the task table.
#[derive(Clone)]
pub struct SummaryPoller {
    inner: Arc<Inner>,
}

/// Non-owning handle to a [`SummaryPoller`].
#[derive(Clone)]
pub(crate) struct WeakPoller(Weak<Inner>);

impl WeakPoller {
    pub(crate) fn upgrade(&self) -> Option<SummaryPoller> {
        self.0.upgrade().map(|inner| SummaryPoller { inner })
    }
}

struct Inner {
    api: Arc<dyn StudyApi>,
    scheduler: Arc<BlockScheduler>,
    tracker: ProgressTracker,
    interval: Duration,
    handles: Mutex<HashMap<BlockIndex, JoinHandle<()>>>,
    history_loaded: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let handles = self.handles.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in handles.drain() {
            handle.abort();
        }
    }
}

impl SummaryPoller {
    #[must_use]
    pub fn new(
        api: Arc<dyn StudyApi>,
        scheduler: Arc<BlockScheduler>,
        tracker: ProgressTracker,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                scheduler,
                tracker,
                interval,
                handles: Mutex::new(HashMap::new()),
                history_loaded: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakPoller {
        WeakPoller(Arc::downgrade(&self.inner))
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<BlockIndex, JoinHandle<()>>> {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    //
    // ─── POLLING LIFECYCLE ─────────────────────────────────────────────────────
    //

    /// Start polling `block` every interval, the first tick one interval from
    /// now. Returns `false` when the block is already being polled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_polling(&self, block: BlockIndex) -> bool {
        let mut handles = self.handles();
        if handles.get(&block).is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.interval;
        let task = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let poller = SummaryPoller { inner };
                if matches!(poller.tick(block).await, PollOutcome::Ready(_)) {
                    return;
                }
            }
        });
        handles.insert(block, task);
        tracing::info!(block = %block, "summary polling started");
        true
    }

    /// Cancel polling for `block`. Returns `true` if a task was running.
    pub fn stop_polling(&self, block: BlockIndex) -> bool {
        let Some(handle) = self.handles().remove(&block) else {
            return false;
        };
        let running = !handle.is_finished();
        handle.abort();
        if running {
            tracing::info!(block = %block, "summary polling stopped");
        }
        running
    }

    /// Cancel every polling task.
    pub fn stop_all(&self) {
        let drained: Vec<_> = self.handles().drain().collect();
        for (block, handle) in drained {
            handle.abort();
            tracing::debug!(block = %block, "summary polling cancelled");
        }
    }

    #[must_use]
    pub fn is_polling(&self, block: BlockIndex) -> bool {
        self.handles().get(&block).is_some_and(|h| !h.is_finished())
    }

    /// Blocks with a live polling task, ascending.
    #[must_use]
    pub fn polling_blocks(&self) -> Vec<BlockIndex> {
        let mut blocks: Vec<_> = self
            .handles()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(block, _)| *block)
            .collect();
        blocks.sort_unstable();
        blocks
    }

    /// One polling step for `block`.
    ///
    /// Fetches only when every assignment of a non-empty block has its POST
    /// phase, and then always bypasses the cache. A populated summary is merged
    /// and ends polling; a missing one or a transport failure leaves polling on.
    pub async fn tick(&self, block: BlockIndex) -> PollOutcome {
        let progress = self.inner.scheduler.block_progress(block);
        if !progress.is_complete() {
            tracing::debug!(block = %block, post = progress.post, total = progress.total, "block not complete yet");
            return PollOutcome::Incomplete;
        }

        match self.inner.api.block_summary(block).await {
            Ok(summary) if summary.has_accuracy() => {
                self.inner.scheduler.upsert_summary(summary.clone());
                if let Some(handle) = self.handles().remove(&block) {
                    handle.abort();
                }
                tracing::info!(block = %block, "block summary ready, polling stopped");
                PollOutcome::Ready(summary)
            }
            Ok(_) => {
                tracing::debug!(block = %block, "block summary has no figures yet");
                PollOutcome::NotReady
            }
            Err(RemoteError::NotFound) => {
                tracing::debug!(block = %block, "block summary not ready");
                PollOutcome::NotReady
            }
            Err(error) => {
                tracing::warn!(block = %block, %error, "block summary fetch failed");
                PollOutcome::NotReady
            }
        }
    }

    //
    // ─── FETCHING ──────────────────────────────────────────────────────────────
    //

    /// Fetch the summary for `block` and merge it.
    ///
    /// Without `force`, a populated summary already known is returned as is.
    /// The availability check runs first; when it says no, nothing is fetched
    /// and `None` is returned. A failing availability check does not stop the
    /// fetch. A summary the service does not have yet is also `None`.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError` for transport failures of the fetch itself.
    pub async fn load_summary(
        &self,
        block: BlockIndex,
        force: bool,
    ) -> Result<Option<BlockSummary>, RemoteError> {
        if !force {
            if let Some(known) = self.inner.scheduler.summary(block).filter(BlockSummary::has_accuracy) {
                return Ok(Some(known));
            }
        }

        match self.inner.api.can_view_summary(block).await {
            Ok(availability) if !availability.available => {
                tracing::debug!(
                    block = %block,
                    reason = availability.reason.as_deref().unwrap_or("unspecified"),
                    "summary not viewable yet"
                );
                return Ok(None);
            }
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(block = %block, %error, "availability check failed, fetching anyway");
            }
        }

        match self.inner.api.block_summary(block).await {
            Ok(summary) => {
                self.inner.scheduler.upsert_summary(summary.clone());
                Ok(Some(summary))
            }
            Err(RemoteError::NotFound) => {
                tracing::debug!(block = %block, "block summary not found");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    /// Forced `load_summary` for a block whose assignments all have POST.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError` for transport failures of the fetch.
    pub async fn refresh_summary_if_completed(
        &self,
        block: BlockIndex,
    ) -> Result<Option<BlockSummary>, RemoteError> {
        if !self.inner.scheduler.block_progress(block).is_complete() {
            return Ok(None);
        }
        self.load_summary(block, true).await
    }

    /// Merge every historical summary the service lists. Without `force` the
    /// list is fetched once per poller.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError` if the listing fails.
    pub async fn load_all_summaries(&self, force: bool) -> Result<Vec<BlockSummary>, RemoteError> {
        if force || !self.inner.history_loaded.load(Ordering::Acquire) {
            let summaries = self.inner.api.list_summaries().await?;
            tracing::debug!(count = summaries.len(), "loaded block summaries");
            self.inner.scheduler.merge_summaries(summaries);
            self.inner.history_loaded.store(true, Ordering::Release);
        }
        Ok(self.known_summaries())
    }

    /// Fetch the summary of the most recent finished block and merge it.
    /// `None` when the service has no finished block yet.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError` for transport failures.
    pub async fn load_latest_summary(&self) -> Result<Option<BlockSummary>, RemoteError> {
        match self.inner.api.latest_summary().await {
            Ok(summary) => {
                tracing::debug!(block = %summary.block_index, "loaded latest block summary");
                self.inner.scheduler.upsert_summary(summary.clone());
                Ok(Some(summary))
            }
            Err(RemoteError::NotFound) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Study-wide case counts straight from the service.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError` if the call fails.
    pub async fn overall_progress(&self) -> Result<OverallProgress, RemoteError> {
        self.inner.api.overall_progress().await
    }

    /// Known summaries (placeholders included), ascending by block.
    #[must_use]
    pub fn known_summaries(&self) -> Vec<BlockSummary> {
        self.inner.scheduler.known_summaries()
    }

    /// Accuracy of `block` computed locally from the service's assessment
    /// listing. Empty when no user is set.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError` if the listing fails.
    pub async fn compute_local_accuracy(&self, block: BlockIndex) -> Result<BlockAccuracy, RemoteError> {
        let Some(user) = self.inner.tracker.user() else {
            return Ok(BlockAccuracy::default());
        };
        let case_ids: Vec<CaseId> = self
            .inner
            .scheduler
            .block_assignments(block)
            .iter()
            .map(|a| a.case_id)
            .collect();
        let records = match self.inner.api.list_block_assessments(user, block).await {
            Ok(records) => records,
            Err(RemoteError::NotFound) => Vec::new(),
            Err(error) => return Err(error),
        };
        Ok(self.inner.tracker.block_accuracy(&case_ids, &records))
    }

    /// `compute_local_accuracy` as a summary without peer percentiles.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError` if the listing fails.
    pub async fn compute_local_summary(&self, block: BlockIndex) -> Result<BlockSummary, RemoteError> {
        Ok(self.compute_local_accuracy(block).await?.into_summary(block))
    }
}
