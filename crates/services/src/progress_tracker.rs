//! Per-case phase completion with optimistic marks and background verification.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use reader_core::accuracy::{BlockAccuracy, pair_by_case};
use reader_core::model::{
    AssessmentRecord, Assignment, BlockIndex, Case, CaseId, CaseProgress, Phase, PhaseState,
    UserId,
};
use reader_core::tracking::{ProgressBook, ReconcileStats};
use storage::repository::{ProgressCache, ProgressSnapshot, StorageError};

use crate::error::{ProgressError, RemoteError};
use crate::remote::StudyApi;

const EVENT_CAPACITY: usize = 64;

/// Called synchronously with each phase a verification reverted.
type RevertObserver = Arc<dyn Fn(CaseId, Phase) + Send + Sync>;

/// Change notifications published by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Marked { case_id: CaseId, phase: Phase },
    Confirmed { case_id: CaseId, phase: Phase },
    Reverted { case_id: CaseId, phase: Phase },
    /// A bulk load changed the map; `block` is `None` for cache restores.
    Reconciled {
        block: Option<BlockIndex>,
        confirmed: usize,
    },
}

/// Owns the in-memory progress map of one reader session.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<Inner>,
}

struct Inner {
    api: Arc<dyn StudyApi>,
    cache: Arc<dyn ProgressCache>,
    book: Mutex<ProgressBook>,
    user: Mutex<Option<UserId>>,
    events: broadcast::Sender<ProgressEvent>,
    pending: Mutex<Vec<JoinHandle<()>>>,
    persist: tokio::sync::Mutex<()>,
    revert_observers: Mutex<Vec<RevertObserver>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProgressTracker {
    #[must_use]
    pub fn new(api: Arc<dyn StudyApi>, cache: Arc<dyn ProgressCache>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                api,
                cache,
                book: Mutex::new(ProgressBook::new()),
                user: Mutex::new(None),
                events,
                pending: Mutex::new(Vec::new()),
                persist: tokio::sync::Mutex::new(()),
                revert_observers: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn with_user(self, user: UserId) -> Self {
        self.set_user(Some(user));
        self
    }

    pub fn set_user(&self, user: Option<UserId>) {
        *guard(&self.inner.user) = user;
    }

    #[must_use]
    pub fn user(&self) -> Option<UserId> {
        *guard(&self.inner.user)
    }

    /// Receive every change applied from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.events.subscribe()
    }

    /// Run `observer` inside the verification that reverts a phase, before the
    /// `Reverted` event is published. A PRE revert is reported once, as PRE.
    pub fn on_revert(&self, observer: impl Fn(CaseId, Phase) + Send + Sync + 'static) {
        guard(&self.inner.revert_observers).push(Arc::new(observer));
    }

    fn book(&self) -> MutexGuard<'_, ProgressBook> {
        guard(&self.inner.book)
    }

    fn publish(&self, event: ProgressEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    //
    // ─── READS ─────────────────────────────────────────────────────────────────
    //

    /// Current flags for `case_id`.
    ///
    /// A case seen for the first time gets a default entry. When a runtime is
    /// available the entry is persisted in the background and, if a user is
    /// known, both phases are verified. Never waits on the network.
    pub fn get_progress(&self, case_id: CaseId) -> CaseProgress {
        let (progress, created) = self.book().ensure(case_id);
        if created {
            if let Ok(handle) = Handle::try_current() {
                self.spawn_persist(&handle);
                if self.user().is_some() {
                    for phase in Phase::ALL {
                        self.spawn_verification(&handle, case_id, phase, 0);
                    }
                }
            }
        }
        progress
    }

    /// Verification state of one phase, if the case is tracked.
    #[must_use]
    pub fn phase_state(&self, case_id: CaseId, phase: Phase) -> Option<PhaseState> {
        self.book().entry(case_id).map(|e| e.slot(phase).state())
    }

    /// First case lacking PRE, else the first lacking POST, in case list order.
    #[must_use]
    pub fn next_incomplete(&self) -> Option<Case> {
        self.book().next_incomplete().cloned()
    }

    #[must_use]
    pub fn incomplete_cases(&self) -> Vec<Case> {
        self.book().incomplete_cases().into_iter().cloned().collect()
    }

    #[must_use]
    pub fn completed_cases(&self) -> Vec<CaseId> {
        self.book().completed_cases()
    }

    #[must_use]
    pub fn cases(&self) -> Vec<Case> {
        self.book().cases().to_vec()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<CaseProgress> {
        self.book().snapshot()
    }

    /// Accuracy of the given block cases against listed assessments, using the
    /// tracked case list for ground truth and assignment links for records
    /// without a case id.
    #[must_use]
    pub fn block_accuracy(&self, case_ids: &[CaseId], records: &[AssessmentRecord]) -> BlockAccuracy {
        let book = self.book();
        let pairs = pair_by_case(
            case_ids,
            records,
            |record| book.resolve_case(record),
            |case_id| book.case(case_id).and_then(|c| c.ground_truth_diagnosis_id),
        );
        BlockAccuracy::compute(pairs)
    }

    //
    // ─── MARKING ───────────────────────────────────────────────────────────────
    //

    /// Optimistically complete `phase` for `case_id`, persist the map and verify
    /// in the background.
    ///
    /// Re-marking a completed phase changes nothing and starts no verification.
    /// A failed cache write is logged and does not undo the mark.
    pub async fn mark_phase(&self, case_id: CaseId, phase: Phase) -> CaseProgress {
        let (marked, progress) = {
            let mut book = self.book();
            let marked = book.mark(case_id, phase);
            let progress = book.ensure(case_id).0;
            (marked, progress)
        };
        if marked.is_empty() {
            tracing::debug!(case_id = %case_id, phase = %phase, "phase already complete");
            return progress;
        }

        tracing::debug!(case_id = %case_id, phase = %phase, "phase marked optimistically");
        for (marked_phase, _) in &marked {
            self.publish(ProgressEvent::Marked {
                case_id,
                phase: *marked_phase,
            });
        }

        if let Err(error) = self.persist().await {
            tracing::warn!(case_id = %case_id, %error, "failed to persist progress");
        }

        if let Ok(handle) = Handle::try_current() {
            for (marked_phase, epoch) in marked {
                self.spawn_verification(&handle, case_id, marked_phase, epoch);
            }
        }
        progress
    }

    fn spawn_verification(&self, handle: &Handle, case_id: CaseId, phase: Phase, epoch: u32) {
        let tracker = self.clone();
        let task = handle.spawn(async move {
            match tracker.verify_at(case_id, phase, epoch).await {
                Ok(()) => {}
                Err(ProgressError::VerificationMismatch { .. }) => {}
                Err(ProgressError::Remote(error)) if error.is_not_found() => {
                    tracing::debug!(case_id = %case_id, phase = %phase, "verification listing not found");
                }
                Err(error) => {
                    tracing::warn!(case_id = %case_id, phase = %phase, %error, "verification inconclusive");
                }
            }
        });
        self.track(task);
    }

    fn spawn_persist(&self, handle: &Handle) {
        let tracker = self.clone();
        let task = handle.spawn(async move {
            if let Err(error) = tracker.persist().await {
                tracing::warn!(%error, "failed to persist new progress entry");
            }
        });
        self.track(task);
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut pending = guard(&self.inner.pending);
        pending.retain(|h| !h.is_finished());
        pending.push(task);
    }

    /// Ask the service whether `phase` of `case_id` is recorded and apply the
    /// answer to the current mark.
    ///
    /// # Errors
    ///
    /// `ProgressError::VerificationMismatch` when the service has no record and
    /// the optimistic mark was reverted; `ProgressError::Remote` when the
    /// service could not answer (state is left untouched).
    pub async fn verify_phase(&self, case_id: CaseId, phase: Phase) -> Result<(), ProgressError> {
        let epoch = self
            .book()
            .entry(case_id)
            .map_or(0, |e| e.slot(phase).epoch());
        self.verify_at(case_id, phase, epoch).await
    }

    async fn verify_at(&self, case_id: CaseId, phase: Phase, epoch: u32) -> Result<(), ProgressError> {
        let Some(user) = self.user() else {
            tracing::debug!(case_id = %case_id, "no user, verification skipped");
            return Ok(());
        };
        let Some(block) = self.book().block_of(case_id) else {
            tracing::debug!(case_id = %case_id, "case block unknown, verification skipped");
            return Ok(());
        };

        let records = self.inner.api.list_block_assessments(user, block).await?;

        let (recorded, confirmed, reverted) = {
            let mut book = self.book();
            let recorded = records.iter().any(|r| {
                book.resolve_case(r) == Some(case_id)
                    && (r.phase == phase || r.phase == Phase::Post)
            });
            let stats = book.reconcile(block, &records);
            let reverted = !recorded && book.revert(case_id, phase, epoch);
            (recorded, stats.confirmed, reverted)
        };

        if recorded && confirmed > 0 {
            self.publish(ProgressEvent::Confirmed { case_id, phase });
        }
        if confirmed > 0 || reverted {
            if let Err(error) = self.persist().await {
                tracing::warn!(case_id = %case_id, %error, "failed to persist verification result");
            }
        }
        if reverted {
            let observers = guard(&self.inner.revert_observers).clone();
            for observer in observers {
                observer(case_id, phase);
            }
            let mismatch = ProgressError::VerificationMismatch { case_id, phase };
            tracing::warn!(case_id = %case_id, phase = %phase, error = %mismatch, "reverted optimistic mark");
            self.publish(ProgressEvent::Reverted { case_id, phase });
            return Err(mismatch);
        }
        Ok(())
    }

    /// Wait for every background verification started so far.
    pub async fn settle(&self) {
        loop {
            let handles: Vec<_> = guard(&self.inner.pending).drain(..).collect();
            if handles.is_empty() {
                return;
            }
            for result in join_all(handles).await {
                if let Err(error) = result {
                    if !error.is_cancelled() {
                        tracing::warn!(%error, "verification task failed");
                    }
                }
            }
        }
    }

    /// Abort verifications still in flight.
    pub fn cancel_pending(&self) {
        for handle in guard(&self.inner.pending).drain(..) {
            handle.abort();
        }
    }

    //
    // ─── BULK LOADS ────────────────────────────────────────────────────────────
    //

    /// Learn case/block links from assignments and confirm phases the service
    /// already stamped.
    pub async fn record_assignments(&self, assignments: &[Assignment]) {
        let confirmed = self.book().record_assignments(assignments);
        if confirmed > 0 {
            self.publish(ProgressEvent::Reconciled {
                block: assignments.first().map(|a| a.block_index),
                confirmed,
            });
            if let Err(error) = self.persist().await {
                tracing::warn!(%error, "failed to persist assignment progress");
            }
        }
    }

    /// Fetch the case list, adopt its order and give every case an entry.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::Remote` when the list cannot be fetched; the
    /// map is then filled from the cache instead.
    pub async fn load_cases(&self) -> Result<usize, ProgressError> {
        match self.inner.api.list_cases().await {
            Ok(cases) => {
                let count = cases.len();
                self.book().set_cases(cases);
                tracing::info!(count, "loaded case list");
                if let Err(error) = self.persist().await {
                    tracing::warn!(%error, "failed to persist progress");
                }
                Ok(count)
            }
            Err(error) => {
                tracing::warn!(%error, "case list unavailable, using cached progress");
                self.fall_back_to_cache().await;
                Err(error.into())
            }
        }
    }

    /// Read the cached snapshot into the map, replacing it.
    ///
    /// A corrupt snapshot is discarded: every known case restarts from
    /// incomplete and the fresh map is written back immediately. Returns the
    /// number of cached entries restored.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::Storage` if the cache cannot be read or the
    /// rebuilt map cannot be written.
    pub async fn load_cached(&self) -> Result<usize, ProgressError> {
        match self.inner.cache.load().await {
            Ok(Some(snapshot)) => {
                let count = snapshot.len();
                self.book().restore(snapshot.into_progress());
                self.publish(ProgressEvent::Reconciled {
                    block: None,
                    confirmed: 0,
                });
                tracing::debug!(count, "restored cached progress");
                Ok(count)
            }
            Ok(None) => {
                self.book().reset();
                Ok(0)
            }
            Err(error) if error.is_corrupt() => {
                tracing::warn!(%error, "discarding corrupt progress cache");
                self.book().reset();
                self.persist().await?;
                Ok(0)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn fall_back_to_cache(&self) {
        match self.inner.cache.load().await {
            Ok(snapshot) => {
                let adopted = self
                    .book()
                    .merge_cached(snapshot.map(ProgressSnapshot::into_progress).unwrap_or_default());
                tracing::debug!(adopted, "merged cached progress");
            }
            Err(error) if error.is_corrupt() => {
                tracing::warn!(%error, "discarding corrupt progress cache");
                self.book().merge_cached(Vec::new());
                if let Err(error) = self.persist().await {
                    tracing::warn!(%error, "failed to rewrite progress cache");
                }
            }
            Err(error) => {
                tracing::warn!(%error, "progress cache unavailable");
                self.book().merge_cached(Vec::new());
            }
        }
    }

    /// Confirm phases from the service's assessment listing for one block.
    ///
    /// Records without a resolvable case are skipped. A block the service does
    /// not know yields no changes.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::Remote` on transport failure, after falling back
    /// to the cached progress.
    pub async fn load_from_remote(
        &self,
        user: UserId,
        block: BlockIndex,
    ) -> Result<ReconcileStats, ProgressError> {
        match self.inner.api.list_block_assessments(user, block).await {
            Ok(records) => Ok(self.apply_listing(block, &records).await),
            Err(RemoteError::NotFound) => {
                tracing::debug!(block = %block, "no assessments listed for block");
                Ok(ReconcileStats::default())
            }
            Err(error) => {
                tracing::warn!(block = %block, %error, "reconciliation failed, using cached progress");
                self.fall_back_to_cache().await;
                Err(error.into())
            }
        }
    }

    /// `load_from_remote` for several blocks at once. Blocks that fail are
    /// skipped; only when every block fails does the cache take over.
    ///
    /// # Errors
    ///
    /// Returns the last `ProgressError::Remote` when no block could be loaded.
    pub async fn load_from_remote_across_blocks(
        &self,
        user: UserId,
        blocks: &[BlockIndex],
    ) -> Result<ReconcileStats, ProgressError> {
        let api = &self.inner.api;
        let listings = join_all(
            blocks
                .iter()
                .map(|block| async move { (*block, api.list_block_assessments(user, *block).await) }),
        )
        .await;

        let mut stats = ReconcileStats::default();
        let mut loaded = 0_usize;
        let mut last_error = None;
        for (block, listing) in listings {
            match listing {
                Ok(records) => {
                    loaded += 1;
                    stats.merge(self.apply_listing(block, &records).await);
                }
                Err(RemoteError::NotFound) => loaded += 1,
                Err(error) => {
                    tracing::warn!(block = %block, %error, "skipping block during reconciliation");
                    last_error = Some(error);
                }
            }
        }

        match last_error {
            Some(error) if loaded == 0 => {
                self.fall_back_to_cache().await;
                Err(error.into())
            }
            _ => Ok(stats),
        }
    }

    async fn apply_listing(&self, block: BlockIndex, records: &[AssessmentRecord]) -> ReconcileStats {
        let stats = self.book().reconcile(block, records);
        if stats.skipped > 0 {
            tracing::debug!(block = %block, skipped = stats.skipped, "skipped unlinked assessments");
        }
        if stats.confirmed > 0 {
            self.publish(ProgressEvent::Reconciled {
                block: Some(block),
                confirmed: stats.confirmed,
            });
            if let Err(error) = self.persist().await {
                tracing::warn!(block = %block, %error, "failed to persist reconciled progress");
            }
        }
        stats
    }

    //
    // ─── PERSISTENCE ───────────────────────────────────────────────────────────
    //

    /// Write the whole map to the cache. Writes are serialized and each takes
    /// its snapshot under the write lock, so the last write holds the newest
    /// state.
    async fn persist(&self) -> Result<(), StorageError> {
        let _write = self.inner.persist.lock().await;
        let snapshot = ProgressSnapshot::from_progress(self.book().snapshot());
        self.inner.cache.save(&snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryStudyApi;
    use reader_core::model::{DiagnosisId, PhaseState};
    use storage::repository::InMemoryProgressCache;

    fn tracker(api: &InMemoryStudyApi, cache: &InMemoryProgressCache) -> ProgressTracker {
        ProgressTracker::new(Arc::new(api.clone()), Arc::new(cache.clone()))
    }

    #[tokio::test]
    async fn fresh_tracker_without_network_starts_at_first_case() {
        let api = InMemoryStudyApi::new(UserId::new(1)).with_numbered_cases(3);
        let cache = InMemoryProgressCache::new();
        let tracker = tracker(&api, &cache);

        tracker.load_cached().await.unwrap();
        tracker.load_cases().await.unwrap();

        assert_eq!(tracker.next_incomplete().map(|c| c.id), Some(CaseId::new(1)));
    }

    #[tokio::test]
    async fn mark_is_visible_immediately_and_cached() {
        let api = InMemoryStudyApi::new(UserId::new(1)).with_numbered_cases(3);
        let cache = InMemoryProgressCache::new();
        let tracker = tracker(&api, &cache);
        tracker.load_cases().await.unwrap();

        tracker.mark_phase(CaseId::new(1), Phase::Pre).await;

        assert_eq!(
            tracker.get_progress(CaseId::new(1)),
            CaseProgress {
                case_id: CaseId::new(1),
                pre_completed: true,
                post_completed: false
            }
        );
        let cached = cache.load().await.unwrap().expect("persisted");
        assert!(cached.get(CaseId::new(1)).is_some_and(|p| p.pre_completed));
    }

    #[tokio::test]
    async fn remarking_is_a_no_op() {
        let api = InMemoryStudyApi::new(UserId::new(1)).with_numbered_cases(1);
        let cache = InMemoryProgressCache::new();
        let tracker = tracker(&api, &cache);
        let mut events = tracker.subscribe();

        tracker.mark_phase(CaseId::new(1), Phase::Pre).await;
        let before = tracker.snapshot();
        tracker.mark_phase(CaseId::new(1), Phase::Pre).await;

        assert_eq!(tracker.snapshot(), before);
        assert_eq!(
            events.try_recv().unwrap(),
            ProgressEvent::Marked {
                case_id: CaseId::new(1),
                phase: Phase::Pre
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn corrupt_cache_is_reset_and_rewritten() {
        let api = InMemoryStudyApi::new(UserId::new(1)).with_numbered_cases(2);
        let cache = InMemoryProgressCache::with_raw("{\"1\": tru");
        let tracker = tracker(&api, &cache);

        assert_eq!(tracker.load_cached().await.unwrap(), 0);
        assert!(cache.load().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cached_post_without_pre_is_normalized() {
        let api = InMemoryStudyApi::new(UserId::new(1));
        let cache = InMemoryProgressCache::with_raw(r#"{"4": {"postCompleted": true}}"#);
        let tracker = tracker(&api, &cache);

        tracker.load_cached().await.unwrap();
        let progress = tracker.get_progress(CaseId::new(4));
        assert!(progress.pre_completed && progress.post_completed);
        assert_eq!(
            tracker.phase_state(CaseId::new(4), Phase::Pre),
            Some(PhaseState::OptimisticTrue)
        );
    }

    #[tokio::test]
    async fn offline_case_list_falls_back_to_cache() {
        let api = InMemoryStudyApi::new(UserId::new(1)).with_numbered_cases(2);
        let cache = InMemoryProgressCache::new();
        cache
            .save(&ProgressSnapshot::from_progress(vec![CaseProgress {
                case_id: CaseId::new(2),
                pre_completed: true,
                post_completed: false,
            }]))
            .await
            .unwrap();
        api.set_offline(true);
        let tracker = tracker(&api, &cache);

        assert!(tracker.load_cases().await.is_err());
        assert!(tracker.get_progress(CaseId::new(2)).pre_completed);
    }

    #[tokio::test]
    async fn verification_confirms_recorded_phase() {
        let user = UserId::new(1);
        let api = InMemoryStudyApi::new(user).with_numbered_cases(2).with_block_size(2);
        let cache = InMemoryProgressCache::new();
        let tracker = tracker(&api, &cache).with_user(user);

        let assignments = api.start_block(2, 0.5).await.unwrap();
        tracker.record_assignments(&assignments).await;
        api.record_assessment(CaseId::new(1), Phase::Pre, &[DiagnosisId::new(10)]);

        tracker.mark_phase(CaseId::new(1), Phase::Pre).await;
        tracker.settle().await;

        assert_eq!(
            tracker.phase_state(CaseId::new(1), Phase::Pre),
            Some(PhaseState::Confirmed)
        );
    }
}
