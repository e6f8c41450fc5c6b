//! In-memory progress map owned by the progress tracker.
//!
//! `ProgressBook` is synchronous and I/O free; the services layer wraps it with
//! persistence and background verification.

use std::collections::{BTreeSet, HashMap};

use crate::model::{
    AssessmentRecord, Assignment, AssignmentId, BlockIndex, Case, CaseId, CaseProgress, Phase,
    ProgressEntry,
};

/// Counts produced by a bulk reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileStats {
    /// Records that resolved to a case.
    pub applied: usize,
    /// Records without a resolvable case link.
    pub skipped: usize,
    /// Phases that moved to confirmed.
    pub confirmed: usize,
}

impl ReconcileStats {
    pub fn merge(&mut self, other: ReconcileStats) {
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.confirmed += other.confirmed;
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgressBook {
    cases: Vec<Case>,
    entries: HashMap<CaseId, ProgressEntry>,
    completed: BTreeSet<CaseId>,
    case_blocks: HashMap<CaseId, BlockIndex>,
    assignment_cases: HashMap<AssignmentId, CaseId>,
}

impl ProgressBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cases(cases: Vec<Case>) -> Self {
        let mut book = Self::new();
        book.set_cases(cases);
        book
    }

    /// Adopt the authoritative case list (and its order) and give every listed
    /// case an entry.
    pub fn set_cases(&mut self, cases: Vec<Case>) {
        for case in &cases {
            self.entries.entry(case.id).or_default();
        }
        self.cases = cases;
    }

    #[must_use]
    pub fn cases(&self) -> &[Case] {
        &self.cases
    }

    #[must_use]
    pub fn case(&self, case_id: CaseId) -> Option<&Case> {
        self.cases.iter().find(|c| c.id == case_id)
    }

    #[must_use]
    pub fn contains(&self, case_id: CaseId) -> bool {
        self.entries.contains_key(&case_id)
    }

    #[must_use]
    pub fn entry(&self, case_id: CaseId) -> Option<&ProgressEntry> {
        self.entries.get(&case_id)
    }

    #[must_use]
    pub fn progress(&self, case_id: CaseId) -> Option<CaseProgress> {
        self.entries.get(&case_id).map(|e| e.to_progress(case_id))
    }

    /// Return the case's progress, creating a default entry when missing.
    /// The flag is `true` when an entry was created.
    pub fn ensure(&mut self, case_id: CaseId) -> (CaseProgress, bool) {
        let mut created = false;
        let entry = self.entries.entry(case_id).or_insert_with(|| {
            created = true;
            ProgressEntry::default()
        });
        (entry.to_progress(case_id), created)
    }

    #[must_use]
    pub fn block_of(&self, case_id: CaseId) -> Option<BlockIndex> {
        self.case_blocks.get(&case_id).copied()
    }

    /// Optimistically complete a phase. Returns the phases that changed with the
    /// epoch each must be verified against.
    pub fn mark(&mut self, case_id: CaseId, phase: Phase) -> Vec<(Phase, u32)> {
        let marked = self.entries.entry(case_id).or_default().mark(phase);
        self.sync_completed(case_id);
        marked
    }

    pub fn confirm(&mut self, case_id: CaseId, phase: Phase) -> bool {
        let changed = self.entries.entry(case_id).or_default().confirm(phase);
        self.sync_completed(case_id);
        changed
    }

    pub fn revert(&mut self, case_id: CaseId, phase: Phase, epoch: u32) -> bool {
        let Some(entry) = self.entries.get_mut(&case_id) else {
            return false;
        };
        let changed = entry.revert(phase, epoch);
        self.sync_completed(case_id);
        changed
    }

    /// Learn case/block/assignment links and confirm phases the server has
    /// already stamped. Returns how many assignments raised a phase.
    pub fn record_assignments(&mut self, assignments: &[Assignment]) -> usize {
        let mut confirmed = 0;
        for assignment in assignments {
            self.case_blocks
                .insert(assignment.case_id, assignment.block_index);
            self.assignment_cases
                .insert(assignment.id, assignment.case_id);
            let raised = if assignment.is_post_completed() {
                self.confirm(assignment.case_id, Phase::Post)
            } else if assignment.is_pre_completed() {
                self.confirm(assignment.case_id, Phase::Pre)
            } else {
                self.entries.entry(assignment.case_id).or_default();
                false
            };
            confirmed += usize::from(raised);
        }
        confirmed
    }

    /// Resolve the case a listed assessment belongs to.
    #[must_use]
    pub fn resolve_case(&self, record: &AssessmentRecord) -> Option<CaseId> {
        record
            .case_id
            .or_else(|| self.assignment_cases.get(&record.assignment_id).copied())
    }

    /// Raise phases to confirmed from an authoritative block listing.
    ///
    /// Records that cannot be linked to a case are skipped. Optimistic state
    /// without a matching record is left alone.
    pub fn reconcile(&mut self, block: BlockIndex, records: &[AssessmentRecord]) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        for record in records {
            let Some(case_id) = self.resolve_case(record) else {
                stats.skipped += 1;
                continue;
            };
            stats.applied += 1;
            self.assignment_cases.insert(record.assignment_id, case_id);
            self.case_blocks.entry(case_id).or_insert(block);
            if self.confirm(case_id, record.phase) {
                stats.confirmed += 1;
            }
        }
        stats
    }

    /// First case lacking PRE, else first case with PRE but not POST, in case
    /// list order.
    #[must_use]
    pub fn next_incomplete(&self) -> Option<&Case> {
        let pre_done = |c: &Case| self.entries.get(&c.id).is_some_and(|e| e.is_complete(Phase::Pre));
        let post_done =
            |c: &Case| self.entries.get(&c.id).is_some_and(|e| e.is_complete(Phase::Post));

        self.cases
            .iter()
            .find(|c| !pre_done(c))
            .or_else(|| self.cases.iter().find(|c| pre_done(c) && !post_done(c)))
    }

    /// Cases whose POST phase is not complete, in list order.
    #[must_use]
    pub fn incomplete_cases(&self) -> Vec<&Case> {
        self.cases
            .iter()
            .filter(|c| {
                !self
                    .entries
                    .get(&c.id)
                    .is_some_and(|e| e.is_complete(Phase::Post))
            })
            .collect()
    }

    /// The completed-cases aggregate, ascending.
    #[must_use]
    pub fn completed_cases(&self) -> Vec<CaseId> {
        self.completed.iter().copied().collect()
    }

    /// All entries as plain flags, ordered by case id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CaseProgress> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .map(|(id, entry)| entry.to_progress(*id))
            .collect();
        out.sort_by_key(|p| p.case_id);
        out
    }

    /// Replace every entry with cached flags, then default any listed case the
    /// cache does not mention.
    pub fn restore(&mut self, cached: impl IntoIterator<Item = CaseProgress>) {
        self.entries.clear();
        self.completed.clear();
        for progress in cached {
            self.entries.insert(
                progress.case_id,
                ProgressEntry::from_cached(progress.pre_completed, progress.post_completed),
            );
            self.sync_completed(progress.case_id);
        }
        for case in &self.cases {
            self.entries.entry(case.id).or_default();
        }
    }

    /// Fill in cached flags only for cases that have no entry yet; entries
    /// already tracked this session win. Listed cases still missing get a
    /// default. Returns how many cached entries were adopted.
    pub fn merge_cached(&mut self, cached: impl IntoIterator<Item = CaseProgress>) -> usize {
        let mut adopted = 0;
        for progress in cached {
            if self.entries.contains_key(&progress.case_id) {
                continue;
            }
            self.entries.insert(
                progress.case_id,
                ProgressEntry::from_cached(progress.pre_completed, progress.post_completed),
            );
            self.sync_completed(progress.case_id);
            adopted += 1;
        }
        for case in &self.cases {
            self.entries.entry(case.id).or_default();
        }
        adopted
    }

    /// Drop all progress and start every listed case from incomplete.
    pub fn reset(&mut self) {
        self.restore(std::iter::empty());
    }

    fn sync_completed(&mut self, case_id: CaseId) {
        let done = self
            .entries
            .get(&case_id)
            .is_some_and(|e| e.is_complete(Phase::Post));
        if done {
            self.completed.insert(case_id);
        } else {
            self.completed.remove(&case_id);
        }
    }
}
