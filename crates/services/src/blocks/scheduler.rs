use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reader_core::Clock;
use reader_core::blocks::{BlockLedger, BlockProgress};
use reader_core::model::{AdvanceStatus, Assignment, BlockIndex, BlockSummary, CaseId, Phase};

use crate::error::SchedulerError;
use crate::progress_tracker::ProgressTracker;
use crate::remote::{AdvanceResponse, StudyApi};

/// Walks a reader through fixed-size blocks of case assignments.
pub struct BlockScheduler {
    clock: Clock,
    api: Arc<dyn StudyApi>,
    tracker: ProgressTracker,
    ledger: Mutex<BlockLedger>,
    last: Mutex<Option<AdvanceResponse>>,
    starting: AtomicBool,
}

/// Clears the single-flight flag however `start_next_block` exits.
struct StartGuard<'a>(&'a AtomicBool);

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BlockScheduler {
    #[must_use]
    pub fn new(clock: Clock, api: Arc<dyn StudyApi>, tracker: ProgressTracker) -> Self {
        Self {
            clock,
            api,
            tracker,
            ledger: Mutex::new(BlockLedger::new()),
            last: Mutex::new(None),
            starting: AtomicBool::new(false),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, BlockLedger> {
        guard(&self.ledger)
    }

    /// Ask the service for the next assignment and record it.
    ///
    /// The service decides the status. The first assignment seen from a block
    /// pulls in the block's full assignment list. A response without an
    /// assignment clears the active assignment and reports `Exhausted`.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Remote` if the service call fails.
    pub async fn advance(&self) -> Result<AdvanceResponse, SchedulerError> {
        let mut response = self.api.advance_assignment().await?;

        match &response.assignment {
            Some(assignment) => {
                let block = assignment.block_index;
                response.block_index = Some(block);
                let (known, added) = {
                    let mut ledger = self.ledger();
                    let known = ledger.is_tracked(block);
                    (known, ledger.insert_assignment(block, assignment.clone()))
                };
                self.tracker
                    .record_assignments(std::slice::from_ref(assignment))
                    .await;
                if !known {
                    if let Err(error) = self.load_assignments(block, true).await {
                        tracing::warn!(block = %block, %error, "could not load block assignments");
                    }
                }
                tracing::debug!(
                    block = %block,
                    case_id = %assignment.case_id,
                    status = ?response.status,
                    remaining = response.remaining,
                    added,
                    "advanced to assignment"
                );
            }
            None => {
                response.status = AdvanceStatus::Exhausted;
                tracing::info!("no assignments remain");
            }
        }

        *guard(&self.last) = Some(response.clone());
        Ok(response)
    }

    /// Latest advance result while an assignment is active.
    #[must_use]
    pub fn active(&self) -> Option<AdvanceResponse> {
        guard(&self.last)
            .as_ref()
            .filter(|r| r.assignment.is_some())
            .cloned()
    }

    /// Status of the last `advance`, `None` before the first call.
    #[must_use]
    pub fn status(&self) -> Option<AdvanceStatus> {
        guard(&self.last).as_ref().map(|r| r.status)
    }

    /// Assignments the service reported as left after the last `advance`.
    #[must_use]
    pub fn remaining(&self) -> Option<u32> {
        guard(&self.last).as_ref().map(|r| r.remaining)
    }

    /// Start the next block of `size` assignments.
    ///
    /// Only one start runs at a time: a call made while another is in flight
    /// returns an empty list without contacting the service. On success a
    /// placeholder summary is registered for the new block and its assignment
    /// list is loaded.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::PreconditionFailed` while any tracked block has
    /// an assignment without POST, or `SchedulerError::Remote` if the service
    /// call fails.
    pub async fn start_next_block(
        &self,
        size: u32,
        human_ai_probability: f64,
    ) -> Result<Vec<Assignment>, SchedulerError> {
        if self
            .starting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("block start already in flight");
            return Ok(Vec::new());
        }
        let _guard = StartGuard(&self.starting);

        if let Some(block) = self.ledger().first_incomplete_block() {
            tracing::info!(block = %block, "refusing to start a block while one is incomplete");
            return Err(SchedulerError::PreconditionFailed { block });
        }

        let assignments = self.api.start_block(size, human_ai_probability).await?;
        let Some(block) = assignments.first().map(|a| a.block_index) else {
            tracing::info!("service returned no assignments for a new block");
            return Ok(assignments);
        };

        {
            let mut ledger = self.ledger();
            ledger.ensure_placeholder(block);
            ledger.set_assignments(block, assignments.clone());
        }
        self.tracker.record_assignments(&assignments).await;
        tracing::info!(block = %block, size = assignments.len(), "started block");

        if let Err(error) = self.load_assignments(block, true).await {
            tracing::warn!(block = %block, %error, "could not refresh new block assignments");
        }
        Ok(self.block_assignments(block))
    }

    /// Fetch the assignment list of `block` from the active-block endpoint.
    ///
    /// Blocks already tracked are left alone unless `force` is set. Returns the
    /// number of assignments now tracked for the block; the list is only
    /// replaced when the service's active block is `block`.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Remote` if the service call fails.
    pub async fn load_assignments(
        &self,
        block: BlockIndex,
        force: bool,
    ) -> Result<usize, SchedulerError> {
        if !force {
            let ledger = self.ledger();
            if ledger.is_tracked(block) {
                return Ok(ledger.block_assignments(block).len());
            }
        }

        match self.api.active_block().await? {
            Some(active) if active.block_index == block && !active.assignments.is_empty() => {
                self.ledger().set_assignments(block, active.assignments.clone());
                self.tracker.record_assignments(&active.assignments).await;
                Ok(active.assignments.len())
            }
            _ => Ok(self.ledger().block_assignments(block).len()),
        }
    }

    /// Seed the ledger with the service's in-progress block after a restart.
    ///
    /// Does nothing when blocks are already tracked. Returns the block that was
    /// seeded.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Remote` if the service call fails.
    pub async fn hydrate_active_block(&self) -> Result<Option<BlockIndex>, SchedulerError> {
        if self.ledger().has_any_assignments() {
            return Ok(None);
        }
        let Some(active) = self.api.active_block().await? else {
            tracing::debug!("no active block to hydrate");
            return Ok(None);
        };

        let block = active.block_index;
        {
            let mut ledger = self.ledger();
            ledger.set_assignments(block, active.assignments.clone());
            ledger.ensure_placeholder(block);
        }
        self.tracker.record_assignments(&active.assignments).await;
        tracing::info!(block = %block, assignments = active.assignments.len(), "hydrated active block");
        Ok(Some(block))
    }

    /// Record a local phase submission on the tracked assignment so progress
    /// counts reflect it before the next reload. Returns the case's block.
    pub fn note_phase_completed(&self, case_id: CaseId, phase: Phase) -> Option<BlockIndex> {
        self.ledger().stamp(case_id, phase, self.clock.now())
    }

    /// Drop a local stamp the service denied. Returns the block when its
    /// counts changed.
    pub fn clear_phase(&self, case_id: CaseId, phase: Phase) -> Option<BlockIndex> {
        let block = self.ledger().clear_stamp(case_id, phase);
        if let Some(block) = block {
            tracing::info!(block = %block, case_id = %case_id, ?phase, "cleared denied stamp");
        }
        block
    }

    #[must_use]
    pub fn block_progress(&self, block: BlockIndex) -> BlockProgress {
        self.ledger().block_progress(block)
    }

    #[must_use]
    pub fn has_incomplete_block(&self) -> bool {
        self.ledger().has_incomplete_block()
    }

    #[must_use]
    pub fn latest_block_index(&self) -> Option<BlockIndex> {
        self.ledger().latest_block_index()
    }

    #[must_use]
    pub fn tracked_blocks(&self) -> Vec<BlockIndex> {
        self.ledger().tracked_blocks()
    }

    #[must_use]
    pub fn block_assignments(&self, block: BlockIndex) -> Vec<Assignment> {
        self.ledger().block_assignments(block).to_vec()
    }

    //
    // ─── SUMMARIES ─────────────────────────────────────────────────────────────
    //

    /// Known summaries (placeholders included), ascending by block.
    #[must_use]
    pub fn known_summaries(&self) -> Vec<BlockSummary> {
        self.ledger().summaries().to_vec()
    }

    #[must_use]
    pub fn summary(&self, block: BlockIndex) -> Option<BlockSummary> {
        self.ledger().summary(block).cloned()
    }

    /// Register an empty summary for `block` unless one is known.
    pub fn ensure_placeholder(&self, block: BlockIndex) -> bool {
        self.ledger().ensure_placeholder(block)
    }

    pub fn upsert_summary(&self, summary: BlockSummary) {
        self.ledger().upsert_summary(summary);
    }

    pub fn merge_summaries(&self, summaries: impl IntoIterator<Item = BlockSummary>) {
        self.ledger().merge_summaries(summaries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryStudyApi;
    use reader_core::model::{Arm, AssignmentId, UserId};
    use reader_core::time::{fixed_clock, fixed_now};
    use storage::repository::InMemoryProgressCache;

    fn scheduler(api: &InMemoryStudyApi) -> BlockScheduler {
        let api: Arc<dyn StudyApi> = Arc::new(api.clone());
        let tracker = ProgressTracker::new(Arc::clone(&api), Arc::new(InMemoryProgressCache::new()));
        BlockScheduler::new(fixed_clock(), api, tracker)
    }

    fn assignment(id: u64, block: u32, pre: bool, post: bool) -> Assignment {
        Assignment {
            id: AssignmentId::new(id),
            user_id: UserId::new(1),
            case_id: CaseId::new(id),
            arm: Arm::Human,
            display_order: u32::try_from(id).unwrap(),
            block_index: BlockIndex::new(block),
            started_at: None,
            completed_pre_at: pre.then(fixed_now),
            completed_post_at: post.then(fixed_now),
        }
    }

    #[tokio::test]
    async fn advance_records_assignment_and_exhausts() {
        let api = InMemoryStudyApi::new(UserId::new(1))
            .with_numbered_cases(1)
            .with_block_size(1);
        let scheduler = scheduler(&api);

        let first = scheduler.advance().await.unwrap();
        assert_eq!(first.status, AdvanceStatus::Started);
        assert_eq!(scheduler.block_assignments(BlockIndex::new(0)).len(), 1);
        assert!(scheduler.active().is_some());

        api.record_assessment(CaseId::new(1), Phase::Post, &[]);
        let done = scheduler.advance().await.unwrap();
        assert_eq!(done.status, AdvanceStatus::Exhausted);
        assert!(scheduler.active().is_none());
        assert_eq!(scheduler.status(), Some(AdvanceStatus::Exhausted));
        assert_eq!(scheduler.remaining(), Some(0));
    }

    #[tokio::test]
    async fn repeated_advance_does_not_duplicate() {
        let api = InMemoryStudyApi::new(UserId::new(1)).with_numbered_cases(3);
        let scheduler = scheduler(&api);

        scheduler.advance().await.unwrap();
        assert_eq!(scheduler.block_assignments(BlockIndex::new(0)).len(), 3);
        let again = scheduler.advance().await.unwrap();
        assert_eq!(again.status, AdvanceStatus::Continuing);
        assert_eq!(scheduler.block_assignments(BlockIndex::new(0)).len(), 3);
        assert_eq!(api.calls("active_block"), 1);
    }

    #[tokio::test]
    async fn start_refused_while_block_incomplete() {
        let api = InMemoryStudyApi::new(UserId::new(1)).with_numbered_cases(20);
        let scheduler = scheduler(&api);
        let block = vec![assignment(1, 2, true, false), assignment(2, 2, true, true)];
        api.seed_block(BlockIndex::new(2), block);
        scheduler.hydrate_active_block().await.unwrap();

        let err = scheduler.start_next_block(10, 0.5).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::PreconditionFailed { block } if block == BlockIndex::new(2)
        ));
        assert_eq!(api.calls("start_block"), 0);
        assert_eq!(scheduler.latest_block_index(), Some(BlockIndex::new(2)));
    }

    #[tokio::test]
    async fn start_registers_placeholder_and_assignments() {
        let api = InMemoryStudyApi::new(UserId::new(1)).with_numbered_cases(4);
        let scheduler = scheduler(&api);

        let assignments = scheduler.start_next_block(4, 0.5).await.unwrap();
        assert_eq!(assignments.len(), 4);
        let block = BlockIndex::new(0);
        assert!(scheduler.summary(block).is_some_and(|s| s.is_placeholder()));
        assert_eq!(scheduler.block_progress(block).total, 4);
        assert!(scheduler.has_incomplete_block());
    }

    #[tokio::test]
    async fn hydrate_is_skipped_when_blocks_are_known() {
        let api = InMemoryStudyApi::new(UserId::new(1));
        api.seed_block(BlockIndex::new(0), vec![assignment(1, 0, false, false)]);
        let scheduler = scheduler(&api);

        assert_eq!(
            scheduler.hydrate_active_block().await.unwrap(),
            Some(BlockIndex::new(0))
        );
        assert_eq!(scheduler.hydrate_active_block().await.unwrap(), None);
        assert_eq!(api.calls("active_block"), 1);
    }

    #[tokio::test]
    async fn local_submissions_move_block_progress() {
        let api = InMemoryStudyApi::new(UserId::new(1));
        api.seed_block(
            BlockIndex::new(0),
            vec![assignment(1, 0, false, false), assignment(2, 0, false, false)],
        );
        let scheduler = scheduler(&api);
        scheduler.hydrate_active_block().await.unwrap();

        assert_eq!(
            scheduler.note_phase_completed(CaseId::new(2), Phase::Post),
            Some(BlockIndex::new(0))
        );
        let progress = scheduler.block_progress(BlockIndex::new(0));
        assert_eq!((progress.pre, progress.post, progress.total), (1, 1, 2));
        assert!((progress.percent_complete - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn denied_stamp_is_cleared_from_block() {
        let api = InMemoryStudyApi::new(UserId::new(1));
        api.seed_block(
            BlockIndex::new(0),
            vec![assignment(1, 0, true, true), assignment(2, 0, true, false)],
        );
        let scheduler = scheduler(&api);
        scheduler.hydrate_active_block().await.unwrap();
        scheduler.note_phase_completed(CaseId::new(2), Phase::Post);
        assert!(!scheduler.has_incomplete_block());

        assert_eq!(
            scheduler.clear_phase(CaseId::new(2), Phase::Post),
            Some(BlockIndex::new(0))
        );
        assert!(scheduler.has_incomplete_block());
        assert_eq!(scheduler.block_progress(BlockIndex::new(0)).post, 1);
        assert_eq!(scheduler.clear_phase(CaseId::new(2), Phase::Post), None);
    }

    #[tokio::test]
    async fn load_assignments_skips_cached_unless_forced() {
        let api = InMemoryStudyApi::new(UserId::new(1));
        api.seed_block(BlockIndex::new(0), vec![assignment(1, 0, false, false)]);
        let scheduler = scheduler(&api);

        assert_eq!(scheduler.load_assignments(BlockIndex::new(0), false).await.unwrap(), 1);
        assert_eq!(scheduler.load_assignments(BlockIndex::new(0), false).await.unwrap(), 1);
        assert_eq!(api.calls("active_block"), 1);
        scheduler.load_assignments(BlockIndex::new(0), true).await.unwrap();
        assert_eq!(api.calls("active_block"), 2);
    }
}
