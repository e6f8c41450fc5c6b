use serde::{Deserialize, Serialize};

use crate::model::{CaseId, Phase};

//
// ─── PHASE STATE ───────────────────────────────────────────────────────────────
//

/// Coherence state of one (case, phase) completion flag.
///
/// ```text
/// Unknown ──mark──▶ OptimisticTrue ──verified──▶ Confirmed
///    ▲                   │
///    │                 denied
///    │                   ▼
///    └───(mark again)── Reverted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhaseState {
    #[default]
    Unknown,
    OptimisticTrue,
    Confirmed,
    Reverted,
}

impl PhaseState {
    /// Whether the phase currently counts as done.
    #[must_use]
    pub fn is_complete(self) -> bool {
        matches!(self, PhaseState::OptimisticTrue | PhaseState::Confirmed)
    }
}

/// A phase state plus the epoch of the most recent optimistic mark.
///
/// Verification results carry the epoch they were issued for; results for an
/// older epoch are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhaseSlot {
    state: PhaseState,
    epoch: u32,
}

impl PhaseSlot {
    #[must_use]
    pub fn state(&self) -> PhaseState {
        self.state
    }

    #[must_use]
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// Apply an optimistic completion. Returns the new epoch, or `None` when the
    /// phase was already complete.
    fn mark(&mut self) -> Option<u32> {
        if self.is_complete() {
            return None;
        }
        self.epoch = self.epoch.wrapping_add(1);
        self.state = PhaseState::OptimisticTrue;
        Some(self.epoch)
    }

    fn confirm(&mut self) -> bool {
        let changed = self.state != PhaseState::Confirmed;
        self.state = PhaseState::Confirmed;
        changed
    }

    fn revert(&mut self, epoch: u32) -> bool {
        if self.state != PhaseState::OptimisticTrue || self.epoch != epoch {
            return false;
        }
        self.state = PhaseState::Reverted;
        true
    }

    fn cascade_revert(&mut self) -> bool {
        if !self.is_complete() {
            return false;
        }
        // Invalidate any verification still in flight for the old mark.
        self.epoch = self.epoch.wrapping_add(1);
        self.state = PhaseState::Reverted;
        true
    }
}

//
// ─── PROGRESS ENTRY ────────────────────────────────────────────────────────────
//

/// Per-case pair of phase slots. Every transition keeps POST ⇒ PRE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressEntry {
    pre: PhaseSlot,
    post: PhaseSlot,
}

impl ProgressEntry {
    /// Rebuild an entry from cached flags. Cached truths are unverified, so
    /// they come back as optimistic. A cached POST without PRE raises PRE.
    #[must_use]
    pub fn from_cached(pre_completed: bool, post_completed: bool) -> Self {
        let mut entry = Self::default();
        if pre_completed || post_completed {
            entry.pre.mark();
        }
        if post_completed {
            entry.post.mark();
        }
        entry
    }

    #[must_use]
    pub fn slot(&self, phase: Phase) -> PhaseSlot {
        match phase {
            Phase::Pre => self.pre,
            Phase::Post => self.post,
        }
    }

    fn slot_mut(&mut self, phase: Phase) -> &mut PhaseSlot {
        match phase {
            Phase::Pre => &mut self.pre,
            Phase::Post => &mut self.post,
        }
    }

    #[must_use]
    pub fn is_complete(&self, phase: Phase) -> bool {
        self.slot(phase).is_complete()
    }

    /// Optimistically complete `phase`. Returns each newly marked phase with its
    /// epoch; empty when nothing changed.
    pub fn mark(&mut self, phase: Phase) -> Vec<(Phase, u32)> {
        let mut marked = Vec::new();
        if phase == Phase::Post {
            if let Some(epoch) = self.pre.mark() {
                marked.push((Phase::Pre, epoch));
            }
        }
        if let Some(epoch) = self.slot_mut(phase).mark() {
            marked.push((phase, epoch));
        }
        marked
    }

    /// Record server confirmation of `phase` (POST confirms PRE too).
    pub fn confirm(&mut self, phase: Phase) -> bool {
        let mut changed = false;
        if phase == Phase::Post {
            changed |= self.post.confirm();
        }
        changed |= self.pre.confirm();
        changed
    }

    /// Revert an optimistic mark the server denied. Reverting PRE cascades to
    /// POST. Returns `true` if anything changed.
    pub fn revert(&mut self, phase: Phase, epoch: u32) -> bool {
        match phase {
            Phase::Pre => {
                if !self.pre.revert(epoch) {
                    return false;
                }
                self.post.cascade_revert();
                true
            }
            Phase::Post => self.post.revert(epoch),
        }
    }

    #[must_use]
    pub fn to_progress(&self, case_id: CaseId) -> CaseProgress {
        CaseProgress {
            case_id,
            pre_completed: self.pre.is_complete(),
            post_completed: self.post.is_complete(),
        }
    }
}

//
// ─── CASE PROGRESS ─────────────────────────────────────────────────────────────
//

/// Immutable snapshot of a case's completion flags handed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseProgress {
    pub case_id: CaseId,
    pub pre_completed: bool,
    pub post_completed: bool,
}

impl CaseProgress {
    #[must_use]
    pub fn incomplete(case_id: CaseId) -> Self {
        Self {
            case_id,
            pre_completed: false,
            post_completed: false,
        }
    }

    #[must_use]
    pub fn is_phase_completed(&self, phase: Phase) -> bool {
        match phase {
            Phase::Pre => self.pre_completed,
            Phase::Post => self.post_completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marking_post_raises_pre() {
        let mut entry = ProgressEntry::default();
        let marked = entry.mark(Phase::Post);
        assert_eq!(marked, vec![(Phase::Pre, 1), (Phase::Post, 1)]);
        assert!(entry.is_complete(Phase::Pre));
        assert!(entry.is_complete(Phase::Post));
    }

    #[test]
    fn remarking_is_a_no_op() {
        let mut entry = ProgressEntry::default();
        entry.mark(Phase::Pre);
        let before = entry;
        assert!(entry.mark(Phase::Pre).is_empty());
        assert_eq!(entry, before);
    }

    #[test]
    fn reverting_pre_cascades_to_post() {
        let mut entry = ProgressEntry::default();
        entry.mark(Phase::Pre);
        let pre_epoch = entry.slot(Phase::Pre).epoch();
        entry.mark(Phase::Post);

        assert!(entry.revert(Phase::Pre, pre_epoch));
        assert_eq!(entry.slot(Phase::Pre).state(), PhaseState::Reverted);
        assert_eq!(entry.slot(Phase::Post).state(), PhaseState::Reverted);
    }

    #[test]
    fn stale_epoch_does_not_revert_newer_mark() {
        let mut entry = ProgressEntry::default();
        entry.mark(Phase::Pre);
        let first = entry.slot(Phase::Pre).epoch();
        assert!(entry.revert(Phase::Pre, first));
        entry.mark(Phase::Pre);

        assert!(!entry.revert(Phase::Pre, first));
        assert!(entry.is_complete(Phase::Pre));
    }

    #[test]
    fn confirmed_phase_is_never_reverted() {
        let mut entry = ProgressEntry::default();
        entry.mark(Phase::Pre);
        let epoch = entry.slot(Phase::Pre).epoch();
        entry.confirm(Phase::Pre);
        assert!(!entry.revert(Phase::Pre, epoch));
        assert_eq!(entry.slot(Phase::Pre).state(), PhaseState::Confirmed);
    }

    #[test]
    fn cached_post_without_pre_is_normalized() {
        let entry = ProgressEntry::from_cached(false, true);
        let progress = entry.to_progress(CaseId::new(1));
        assert!(progress.pre_completed);
        assert!(progress.post_completed);
        assert_eq!(entry.slot(Phase::Post).state(), PhaseState::OptimisticTrue);
    }
}
