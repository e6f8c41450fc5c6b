//! Top-1 / top-3 accuracy of paired PRE/POST assessments within a block.

use std::collections::HashMap;

use crate::model::{AssessmentRecord, BlockIndex, BlockSummary, CaseId, DiagnosisId, Phase};

/// Assessments and ground truth gathered for one case.
#[derive(Debug, Clone, Copy)]
pub struct CaseAssessments<'a> {
    pub case_id: CaseId,
    pub ground_truth: Option<DiagnosisId>,
    pub pre: Option<&'a AssessmentRecord>,
    pub post: Option<&'a AssessmentRecord>,
}

/// Group listed records by case for the given block cases.
///
/// `resolve` links a record to its case; `truth` yields the case's ground
/// truth. Records that resolve to no listed case are ignored.
pub fn pair_by_case<'a>(
    case_ids: &[CaseId],
    records: &'a [AssessmentRecord],
    resolve: impl Fn(&AssessmentRecord) -> Option<CaseId>,
    truth: impl Fn(CaseId) -> Option<DiagnosisId>,
) -> Vec<CaseAssessments<'a>> {
    let mut by_case: HashMap<CaseId, CaseAssessments<'a>> = case_ids
        .iter()
        .map(|id| {
            (
                *id,
                CaseAssessments {
                    case_id: *id,
                    ground_truth: truth(*id),
                    pre: None,
                    post: None,
                },
            )
        })
        .collect();

    for record in records {
        let Some(slot) = resolve(record).and_then(|id| by_case.get_mut(&id)) else {
            continue;
        };
        match record.phase {
            Phase::Pre => slot.pre = Some(record),
            Phase::Post => slot.post = Some(record),
        }
    }

    case_ids.iter().filter_map(|id| by_case.remove(id)).collect()
}

/// Accuracy figures for a block. Every figure is `None` when no case qualified.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BlockAccuracy {
    /// Cases with both phases and a ground truth.
    pub counted: u32,
    pub top1_pre: Option<f64>,
    pub top1_post: Option<f64>,
    pub top3_pre: Option<f64>,
    pub top3_post: Option<f64>,
    pub delta_top1: Option<f64>,
    pub delta_top3: Option<f64>,
    /// Counted cases whose POST assessment differs from PRE.
    pub changed_after_ai: u32,
}

impl BlockAccuracy {
    /// Compute accuracy over the cases that have both a PRE and a POST record.
    /// Unpaired cases are left out of the denominator.
    pub fn compute<'a>(cases: impl IntoIterator<Item = CaseAssessments<'a>>) -> Self {
        let mut counted = 0_u32;
        let (mut pre1, mut post1, mut pre3, mut post3) = (0_i64, 0_i64, 0_i64, 0_i64);
        let mut changed = 0_u32;

        for case in cases {
            let (Some(truth), Some(pre), Some(post)) = (case.ground_truth, case.pre, case.post)
            else {
                continue;
            };
            counted += 1;
            pre1 += i64::from(pre.top1_matches(truth));
            post1 += i64::from(post.top1_matches(truth));
            pre3 += i64::from(pre.top3_contains(truth));
            post3 += i64::from(post.top3_contains(truth));
            if post.differs_from(pre) {
                changed += 1;
            }
        }

        if counted == 0 {
            return Self::default();
        }

        #[allow(clippy::cast_precision_loss)]
        let ratio = |hits: i64| Some(hits as f64 / f64::from(counted));

        Self {
            counted,
            top1_pre: ratio(pre1),
            top1_post: ratio(post1),
            top3_pre: ratio(pre3),
            top3_post: ratio(post3),
            delta_top1: ratio(post1 - pre1),
            delta_top3: ratio(post3 - pre3),
            changed_after_ai: changed,
        }
    }

    /// Summary for `block` carrying these figures (no peer percentiles).
    #[must_use]
    pub fn into_summary(self, block: BlockIndex) -> BlockSummary {
        BlockSummary {
            top1_accuracy_pre: self.top1_pre,
            top1_accuracy_post: self.top1_post,
            top3_accuracy_pre: self.top3_pre,
            top3_accuracy_post: self.top3_post,
            delta_top1: self.delta_top1,
            delta_top3: self.delta_top3,
            ..BlockSummary::placeholder(block)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssessmentId, AssignmentId};

    fn rec(case: u64, phase: Phase, ranked: &[u64]) -> AssessmentRecord {
        let ids: Vec<_> = ranked.iter().copied().map(DiagnosisId::new).collect();
        AssessmentRecord::new(AssessmentId::new(0), AssignmentId::new(case), phase, &ids)
            .with_case(CaseId::new(case))
    }

    fn compute(case_ids: &[u64], records: &[AssessmentRecord]) -> BlockAccuracy {
        let ids: Vec<_> = case_ids.iter().copied().map(CaseId::new).collect();
        // Ground truth for case N is diagnosis N * 10.
        let pairs = pair_by_case(&ids, records, |r| r.case_id, |c| {
            Some(DiagnosisId::new(c.value() * 10))
        });
        BlockAccuracy::compute(pairs)
    }

    #[test]
    fn computes_fractions_and_deltas() {
        let records = vec![
            // case 1: wrong → top-1
            rec(1, Phase::Pre, &[99, 10]),
            rec(1, Phase::Post, &[10, 99]),
            // case 2: top-1 both times
            rec(2, Phase::Pre, &[20]),
            rec(2, Phase::Post, &[20]),
            // case 3: miss both times
            rec(3, Phase::Pre, &[1, 2, 3]),
            rec(3, Phase::Post, &[1, 2, 3]),
            // case 4: top-3 → miss
            rec(4, Phase::Pre, &[1, 40]),
            rec(4, Phase::Post, &[1, 2]),
        ];
        let acc = compute(&[1, 2, 3, 4], &records);

        assert_eq!(acc.counted, 4);
        assert_eq!(acc.top1_pre, Some(0.25));
        assert_eq!(acc.top1_post, Some(0.5));
        assert_eq!(acc.top3_pre, Some(0.75));
        assert_eq!(acc.top3_post, Some(0.5));
        assert_eq!(acc.delta_top1, Some(0.25));
        assert_eq!(acc.delta_top3, Some(-0.25));
        assert_eq!(acc.changed_after_ai, 2);
    }

    #[test]
    fn unpaired_cases_are_excluded_not_failed() {
        let records = vec![
            rec(1, Phase::Pre, &[10]),
            rec(1, Phase::Post, &[10]),
            rec(2, Phase::Pre, &[99]),
        ];
        let acc = compute(&[1, 2], &records);
        assert_eq!(acc.counted, 1);
        assert_eq!(acc.top1_pre, Some(1.0));
    }

    #[test]
    fn no_qualifying_cases_leaves_figures_undefined() {
        let records = vec![rec(1, Phase::Pre, &[10])];
        let acc = compute(&[1], &records);
        assert_eq!(acc, BlockAccuracy::default());
        assert!(acc.into_summary(BlockIndex::new(0)).is_placeholder());
    }

    #[test]
    fn genuine_zero_is_defined() {
        let records = vec![rec(1, Phase::Pre, &[1]), rec(1, Phase::Post, &[2])];
        let summary = compute(&[1], &records).into_summary(BlockIndex::new(5));
        assert_eq!(summary.top1_accuracy_pre, Some(0.0));
        assert!(summary.has_accuracy());
        assert_eq!(summary.block_index, BlockIndex::new(5));
    }

    #[test]
    fn records_for_other_cases_are_ignored() {
        let records = vec![rec(7, Phase::Pre, &[70]), rec(7, Phase::Post, &[70])];
        let acc = compute(&[1], &records);
        assert_eq!(acc.counted, 0);
    }
}
