use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use reader_core::model::{
    AdvanceStatus, Arm, AssessmentId, AssessmentRecord, Assignment, AssignmentId, BlockIndex,
    BlockSummary, Case, CaseId, DiagnosisId, Phase, SummaryAvailability, UserId,
};

use super::{ActiveBlock, AdvanceResponse, OverallProgress, StudyApi};
use crate::error::RemoteError;

/// In-process stand-in for the study service.
///
/// Hands out blocks from its case list, records submitted assessments and
/// serves whatever summaries were registered. Every operation is counted so
/// callers can assert how often the service was contacted.
#[derive(Clone)]
pub struct InMemoryStudyApi {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    user: UserId,
    block_size: u32,
    cases: Vec<Case>,
    blocks: BTreeMap<BlockIndex, Vec<Assignment>>,
    assessments: Vec<AssessmentRecord>,
    summaries: BTreeMap<BlockIndex, BlockSummary>,
    availability: HashMap<BlockIndex, SummaryAvailability>,
    offline: bool,
    can_view_failing: bool,
    listing_delay: Option<Duration>,
    listing_failures: HashSet<BlockIndex>,
    calls: HashMap<&'static str, usize>,
    next_assignment_id: u64,
}

impl State {
    fn enter(&mut self, op: &'static str) -> Result<(), RemoteError> {
        *self.calls.entry(op).or_insert(0) += 1;
        if self.offline {
            return Err(RemoteError::Transport(format!("{op}: service unreachable")));
        }
        Ok(())
    }

    fn active_block(&self) -> Option<BlockIndex> {
        self.blocks
            .iter()
            .find(|(_, list)| list.iter().any(|a| !a.is_post_completed()))
            .map(|(block, _)| *block)
    }

    fn create_block(&mut self, size: u32, human_ai_probability: f64) -> Vec<Assignment> {
        let assigned: Vec<CaseId> = self
            .blocks
            .values()
            .flatten()
            .map(|a| a.case_id)
            .collect();
        let fresh: Vec<CaseId> = self
            .cases
            .iter()
            .map(|c| c.id)
            .filter(|id| !assigned.contains(id))
            .take(size as usize)
            .collect();
        if fresh.is_empty() {
            return Vec::new();
        }

        let block = self
            .blocks
            .keys()
            .next_back()
            .map_or(BlockIndex::new(0), |b| b.next());
        let len = f64::from(u32::try_from(fresh.len()).unwrap_or(u32::MAX));
        let mut assignments = Vec::with_capacity(fresh.len());
        for (order, case_id) in (0_u32..).zip(fresh) {
            self.next_assignment_id += 1;
            let arm = if (f64::from(order) + 0.5) / len < human_ai_probability {
                Arm::HumanAi
            } else {
                Arm::Human
            };
            assignments.push(Assignment {
                id: AssignmentId::new(self.next_assignment_id),
                user_id: self.user,
                case_id,
                arm,
                display_order: order,
                block_index: block,
                started_at: None,
                completed_pre_at: None,
                completed_post_at: None,
            });
        }
        self.blocks.insert(block, assignments.clone());
        assignments
    }

    fn assignment_mut(&mut self, case_id: CaseId) -> Option<&mut Assignment> {
        self.blocks
            .values_mut()
            .rev()
            .flat_map(|list| list.iter_mut())
            .find(|a| a.case_id == case_id)
    }
}

impl InMemoryStudyApi {
    #[must_use]
    pub fn new(user: UserId) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                user,
                block_size: 10,
                ..State::default()
            })),
        }
    }

    #[must_use]
    pub fn with_cases(self, cases: Vec<Case>) -> Self {
        self.state().cases = cases;
        self
    }

    /// `count` cases with ids `1..=count`; case `n` has ground truth diagnosis `n * 10`.
    #[must_use]
    pub fn with_numbered_cases(self, count: u64) -> Self {
        let cases = (1..=count)
            .map(|n| Case::new(CaseId::new(n), DiagnosisId::new(n * 10)))
            .collect();
        self.with_cases(cases)
    }

    #[must_use]
    pub fn with_block_size(self, size: u32) -> Self {
        self.state().block_size = size;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a block as if the service had already assigned it.
    pub fn seed_block(&self, block: BlockIndex, assignments: Vec<Assignment>) {
        let mut state = self.state();
        for assignment in &assignments {
            state.next_assignment_id = state.next_assignment_id.max(assignment.id.value());
        }
        state.blocks.insert(block, assignments);
    }

    /// Record an assessment for the case's assignment, stamping it complete.
    /// `ranked` lists diagnosis ids from rank 1 down.
    pub fn record_assessment(&self, case_id: CaseId, phase: Phase, ranked: &[DiagnosisId]) -> bool {
        let mut state = self.state();
        let Some(assignment) = state.assignment_mut(case_id) else {
            return false;
        };
        assignment.stamp_completed(phase, Utc::now());
        let assignment_id = assignment.id;
        let id = AssessmentId::new(u64::try_from(state.assessments.len()).unwrap_or(u64::MAX) + 1);
        state.assessments.retain(|r| !(r.assignment_id == assignment_id && r.phase == phase));
        state
            .assessments
            .push(AssessmentRecord::new(id, assignment_id, phase, ranked));
        true
    }

    /// Forget a previously recorded assessment (the service lost it).
    pub fn drop_assessment(&self, case_id: CaseId, phase: Phase) {
        let mut state = self.state();
        let assignment_ids: Vec<AssignmentId> = state
            .blocks
            .values()
            .flatten()
            .filter(|a| a.case_id == case_id)
            .map(|a| a.id)
            .collect();
        state
            .assessments
            .retain(|r| !(assignment_ids.contains(&r.assignment_id) && r.phase == phase));
    }

    pub fn set_summary(&self, summary: BlockSummary) {
        self.state().summaries.insert(summary.block_index, summary);
    }

    pub fn set_availability(&self, block: BlockIndex, availability: SummaryAvailability) {
        self.state().availability.insert(block, availability);
    }

    /// Make every operation fail with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn set_can_view_failing(&self, failing: bool) {
        self.state().can_view_failing = failing;
    }

    /// Delay block assessment listings by `delay`.
    pub fn set_listing_delay(&self, delay: Option<Duration>) {
        self.state().listing_delay = delay;
    }

    /// Make assessment listings for `block` fail with a transport error.
    pub fn set_listing_failing(&self, block: BlockIndex, failing: bool) {
        let mut state = self.state();
        if failing {
            state.listing_failures.insert(block);
        } else {
            state.listing_failures.remove(&block);
        }
    }

    /// How many times `op` (a `StudyApi` method name) was called.
    #[must_use]
    pub fn calls(&self, op: &str) -> usize {
        self.state().calls.get(op).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn block(&self, block: BlockIndex) -> Vec<Assignment> {
        self.state().blocks.get(&block).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl StudyApi for InMemoryStudyApi {
    async fn list_cases(&self) -> Result<Vec<Case>, RemoteError> {
        let mut state = self.state();
        state.enter("list_cases")?;
        Ok(state.cases.clone())
    }

    async fn advance_assignment(&self) -> Result<AdvanceResponse, RemoteError> {
        let mut state = self.state();
        state.enter("advance_assignment")?;

        let (status, block) = match state.active_block() {
            Some(block) => (AdvanceStatus::Continuing, block),
            None => {
                let (size, probability) = (state.block_size, 0.5);
                let created = state.create_block(size, probability);
                match created.first() {
                    Some(first) => (AdvanceStatus::Started, first.block_index),
                    None => return Ok(AdvanceResponse::exhausted()),
                }
            }
        };

        let list = state.blocks.entry(block).or_default();
        let remaining = list.iter().filter(|a| !a.is_post_completed()).count();
        let next = list.iter_mut().find(|a| !a.is_post_completed()).map(|a| {
            a.started_at = a.started_at.or(Some(Utc::now()));
            a.clone()
        });
        Ok(AdvanceResponse {
            status,
            block_index: Some(block),
            assignment: next,
            remaining: u32::try_from(remaining).unwrap_or(u32::MAX),
        })
    }

    async fn start_block(
        &self,
        size: u32,
        human_ai_probability: f64,
    ) -> Result<Vec<Assignment>, RemoteError> {
        let mut state = self.state();
        state.enter("start_block")?;
        if let Some(block) = state.active_block() {
            return Ok(state.blocks.get(&block).cloned().unwrap_or_default());
        }
        Ok(state.create_block(size, human_ai_probability))
    }

    async fn active_block(&self) -> Result<Option<ActiveBlock>, RemoteError> {
        let mut state = self.state();
        state.enter("active_block")?;
        Ok(state.active_block().map(|block| ActiveBlock {
            block_index: block,
            assignments: state.blocks.get(&block).cloned().unwrap_or_default(),
        }))
    }

    async fn list_block_assessments(
        &self,
        user: UserId,
        block: BlockIndex,
    ) -> Result<Vec<AssessmentRecord>, RemoteError> {
        let (records, delay) = {
            let mut state = self.state();
            state.enter("list_block_assessments")?;
            if state.listing_failures.contains(&block) {
                return Err(RemoteError::Transport(format!(
                    "list_block_assessments: block {block} unavailable"
                )));
            }
            let in_block: Vec<AssignmentId> = state
                .blocks
                .get(&block)
                .into_iter()
                .flatten()
                .filter(|a| a.user_id == user)
                .map(|a| a.id)
                .collect();
            let records: Vec<AssessmentRecord> = state
                .assessments
                .iter()
                .filter(|r| in_block.contains(&r.assignment_id))
                .cloned()
                .collect();
            (records, state.listing_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(records)
    }

    async fn block_summary(&self, block: BlockIndex) -> Result<BlockSummary, RemoteError> {
        let mut state = self.state();
        state.enter("block_summary")?;
        state.summaries.get(&block).cloned().ok_or(RemoteError::NotFound)
    }

    async fn can_view_summary(
        &self,
        block: BlockIndex,
    ) -> Result<SummaryAvailability, RemoteError> {
        let mut state = self.state();
        state.enter("can_view_summary")?;
        if state.can_view_failing {
            return Err(RemoteError::HttpStatus(reqwest::StatusCode::BAD_GATEWAY));
        }
        if let Some(availability) = state.availability.get(&block) {
            return Ok(availability.clone());
        }
        let Some(list) = state.blocks.get(&block) else {
            return Ok(SummaryAvailability::unavailable("block_not_found"));
        };
        let remaining = list.iter().filter(|a| !a.is_post_completed()).count();
        if remaining == 0 {
            return Ok(SummaryAvailability::ready());
        }
        Ok(SummaryAvailability {
            remaining_cases: u32::try_from(remaining).ok(),
            ..SummaryAvailability::unavailable("block_incomplete")
        })
    }

    async fn list_summaries(&self) -> Result<Vec<BlockSummary>, RemoteError> {
        let mut state = self.state();
        state.enter("list_summaries")?;
        Ok(state.summaries.values().cloned().collect())
    }

    async fn latest_summary(&self) -> Result<BlockSummary, RemoteError> {
        let mut state = self.state();
        state.enter("latest_summary")?;
        state
            .summaries
            .values()
            .next_back()
            .cloned()
            .ok_or(RemoteError::NotFound)
    }

    async fn overall_progress(&self) -> Result<OverallProgress, RemoteError> {
        let mut state = self.state();
        state.enter("overall_progress")?;
        let count = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
        let user = state.user;
        let assignments: Vec<&Assignment> = state
            .blocks
            .values()
            .flatten()
            .filter(|a| a.user_id == user)
            .collect();
        let total = count(state.cases.len());
        let assigned = count(assignments.len()).min(total);
        let completed = count(assignments.iter().filter(|a| a.is_post_completed()).count());
        let in_progress = count(
            assignments
                .iter()
                .filter(|a| a.is_pre_completed() && !a.is_post_completed())
                .count(),
        );
        Ok(OverallProgress {
            total,
            completed,
            remaining: total.saturating_sub(completed),
            assigned,
            unassigned: total.saturating_sub(assigned),
            in_progress,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn advance_starts_then_continues_then_exhausts() {
        let api = InMemoryStudyApi::new(UserId::new(1))
            .with_numbered_cases(2)
            .with_block_size(2);

        let first = api.advance_assignment().await.unwrap();
        assert_eq!(first.status, AdvanceStatus::Started);
        assert_eq!(first.remaining, 2);

        let case = first.assignment.expect("assignment").case_id;
        api.record_assessment(case, Phase::Post, &[DiagnosisId::new(10)]);
        let second = api.advance_assignment().await.unwrap();
        assert_eq!(second.status, AdvanceStatus::Continuing);
        assert_eq!(second.remaining, 1);

        let case = second.assignment.expect("assignment").case_id;
        api.record_assessment(case, Phase::Post, &[DiagnosisId::new(20)]);
        let done = api.advance_assignment().await.unwrap();
        assert_eq!(done, AdvanceResponse::exhausted());
        assert_eq!(api.calls("advance_assignment"), 3);
    }

    #[tokio::test]
    async fn offline_fails_with_transport_error() {
        let api = InMemoryStudyApi::new(UserId::new(1));
        api.set_offline(true);
        let err = api.list_cases().await.unwrap_err();
        assert!(!err.is_not_found());
        assert!(matches!(err, RemoteError::Transport(_)));
    }

    #[tokio::test]
    async fn missing_summary_is_not_found() {
        let api = InMemoryStudyApi::new(UserId::new(1));
        let err = api.block_summary(BlockIndex::new(0)).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(api.latest_summary().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn latest_summary_is_highest_block() {
        let api = InMemoryStudyApi::new(UserId::new(1));
        api.set_summary(BlockSummary::placeholder(BlockIndex::new(2)));
        api.set_summary(BlockSummary::placeholder(BlockIndex::new(0)));
        let latest = api.latest_summary().await.unwrap();
        assert_eq!(latest.block_index, BlockIndex::new(2));
    }

    #[tokio::test]
    async fn overall_progress_counts_assigned_and_finished_cases() {
        let api = InMemoryStudyApi::new(UserId::new(1))
            .with_numbered_cases(5)
            .with_block_size(3);
        api.start_block(3, 0.5).await.unwrap();
        api.record_assessment(CaseId::new(1), Phase::Post, &[]);
        api.record_assessment(CaseId::new(2), Phase::Pre, &[]);

        let progress = api.overall_progress().await.unwrap();
        assert_eq!(
            progress,
            OverallProgress {
                total: 5,
                completed: 1,
                remaining: 4,
                assigned: 3,
                unassigned: 2,
                in_progress: 1,
            }
        );
    }

    #[tokio::test]
    async fn listing_failure_is_per_block() {
        let api = InMemoryStudyApi::new(UserId::new(1))
            .with_numbered_cases(2)
            .with_block_size(2);
        api.start_block(2, 0.5).await.unwrap();
        api.set_listing_failing(BlockIndex::new(0), true);

        let err = api
            .list_block_assessments(UserId::new(1), BlockIndex::new(0))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_)));
        assert!(api
            .list_block_assessments(UserId::new(1), BlockIndex::new(1))
            .await
            .unwrap()
            .is_empty());

        api.set_listing_failing(BlockIndex::new(0), false);
        assert!(api
            .list_block_assessments(UserId::new(1), BlockIndex::new(0))
            .await
            .is_ok());
    }
}
