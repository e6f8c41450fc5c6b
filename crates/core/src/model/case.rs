use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{CaseId, DiagnosisId};

/// A diagnostic case as served by the study backend.
///
/// Cases are fetched read-only and never mutated locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Case {
    pub id: CaseId,
    #[serde(default)]
    pub ground_truth_diagnosis_id: Option<DiagnosisId>,
    #[serde(default)]
    pub typical_diagnosis: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Case {
    #[must_use]
    pub fn new(id: CaseId, ground_truth: DiagnosisId) -> Self {
        Self {
            id,
            ground_truth_diagnosis_id: Some(ground_truth),
            typical_diagnosis: true,
            created_at: None,
        }
    }
}
