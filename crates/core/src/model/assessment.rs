use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{AssessmentId, AssignmentId, CaseId, DiagnosisId, Phase};

/// Highest rank a reader may submit.
pub const MAX_RANK: u8 = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AssessmentError {
    #[error("diagnosis rank {rank} is outside 1..={MAX_RANK}")]
    InvalidRank { rank: u8 },

    #[error("diagnosis rank {rank} submitted more than once")]
    DuplicateRank { rank: u8 },
}

/// One ranked diagnosis inside an assessment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedDiagnosis {
    pub rank: u8,
    #[serde(default)]
    pub diagnosis_term_id: Option<DiagnosisId>,
    #[serde(default)]
    pub raw_text: Option<String>,
}

impl RankedDiagnosis {
    #[must_use]
    pub fn new(rank: u8, diagnosis: DiagnosisId) -> Self {
        Self {
            rank,
            diagnosis_term_id: Some(diagnosis),
            raw_text: None,
        }
    }
}

/// Phase-tagged assessment as listed by the backend for a block.
///
/// `case_id` is only present when the backend links the record to its case
/// directly; otherwise the case is resolved through `assignment_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentRecord {
    pub id: AssessmentId,
    pub assignment_id: AssignmentId,
    #[serde(default)]
    pub case_id: Option<CaseId>,
    pub phase: Phase,
    #[serde(default)]
    pub diagnostic_confidence: Option<u8>,
    #[serde(default)]
    pub management_confidence: Option<u8>,
    #[serde(default)]
    pub changed_primary_diagnosis: Option<bool>,
    #[serde(default)]
    pub changed_management_plan: Option<bool>,
    #[serde(default)]
    pub ai_usefulness: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "diagnosis_entries")]
    pub diagnoses: Vec<RankedDiagnosis>,
}

impl AssessmentRecord {
    /// Minimal record for one phase with the given ranked diagnoses (rank = position + 1).
    #[must_use]
    pub fn new(
        id: AssessmentId,
        assignment_id: AssignmentId,
        phase: Phase,
        ranked: &[DiagnosisId],
    ) -> Self {
        let diagnoses = ranked
            .iter()
            .zip(1_u8..)
            .map(|(diagnosis, rank)| RankedDiagnosis::new(rank, *diagnosis))
            .collect();
        Self {
            id,
            assignment_id,
            case_id: None,
            phase,
            diagnostic_confidence: None,
            management_confidence: None,
            changed_primary_diagnosis: None,
            changed_management_plan: None,
            ai_usefulness: None,
            created_at: None,
            diagnoses,
        }
    }

    #[must_use]
    pub fn with_case(mut self, case_id: CaseId) -> Self {
        self.case_id = Some(case_id);
        self
    }

    /// Check that ranks are within 1..=3 and unique.
    ///
    /// # Errors
    ///
    /// Returns `AssessmentError` for an out-of-range or repeated rank.
    pub fn validate(&self) -> Result<(), AssessmentError> {
        let mut seen = [false; MAX_RANK as usize];
        for entry in &self.diagnoses {
            if entry.rank == 0 || entry.rank > MAX_RANK {
                return Err(AssessmentError::InvalidRank { rank: entry.rank });
            }
            let slot = &mut seen[usize::from(entry.rank - 1)];
            if *slot {
                return Err(AssessmentError::DuplicateRank { rank: entry.rank });
            }
            *slot = true;
        }
        Ok(())
    }

    #[must_use]
    pub fn diagnosis_at_rank(&self, rank: u8) -> Option<&RankedDiagnosis> {
        self.diagnoses.iter().find(|d| d.rank == rank)
    }

    /// True when the rank-1 diagnosis is `truth`.
    #[must_use]
    pub fn top1_matches(&self, truth: DiagnosisId) -> bool {
        self.diagnosis_at_rank(1)
            .and_then(|d| d.diagnosis_term_id)
            .is_some_and(|id| id == truth)
    }

    /// True when `truth` appears at any submitted rank.
    #[must_use]
    pub fn top3_contains(&self, truth: DiagnosisId) -> bool {
        self.diagnoses
            .iter()
            .filter(|d| d.rank >= 1 && d.rank <= MAX_RANK)
            .any(|d| d.diagnosis_term_id == Some(truth))
    }

    /// True when this (POST) record changed anything compared to `pre`.
    ///
    /// Confidence fields and each rank's diagnosis are compared. Free text only
    /// counts when both sides carry it.
    #[must_use]
    pub fn differs_from(&self, pre: &AssessmentRecord) -> bool {
        if self.diagnostic_confidence != pre.diagnostic_confidence
            || self.management_confidence != pre.management_confidence
        {
            return true;
        }
        (1..=MAX_RANK).any(|rank| {
            match (pre.diagnosis_at_rank(rank), self.diagnosis_at_rank(rank)) {
                (None, None) => false,
                (Some(_), None) | (None, Some(_)) => true,
                (Some(before), Some(after)) => {
                    if before.diagnosis_term_id != after.diagnosis_term_id {
                        return true;
                    }
                    match (&before.raw_text, &after.raw_text) {
                        (Some(a), Some(b)) => a != b,
                        _ => false,
                    }
                }
            }
        })
    }
}
