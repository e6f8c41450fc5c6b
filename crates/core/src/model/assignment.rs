use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{AssignmentId, BlockIndex, CaseId, UserId};

//
// ─── PHASE ─────────────────────────────────────────────────────────────────────
//

/// Assessment phase of a case: before or after the AI suggestion is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Pre,
    Post,
}

impl Phase {
    pub const ALL: [Phase; 2] = [Phase::Pre, Phase::Post];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pre => "PRE",
            Phase::Post => "POST",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//
// ─── ARM ───────────────────────────────────────────────────────────────────────
//

/// Experimental condition of an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arm {
    #[serde(rename = "HUMAN")]
    Human,
    #[serde(rename = "HUMAN_AI")]
    HumanAi,
}

//
// ─── ASSIGNMENT ────────────────────────────────────────────────────────────────
//

/// Binding of a reader to a case within one block.
///
/// `arm` and `display_order` never change. The completion timestamps are set at
/// most once each and `completed_post_at` implies `completed_pre_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub user_id: UserId,
    pub case_id: CaseId,
    pub arm: Arm,
    pub display_order: u32,
    pub block_index: BlockIndex,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_pre_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_post_at: Option<DateTime<Utc>>,
}

impl Assignment {
    #[must_use]
    pub fn is_pre_completed(&self) -> bool {
        self.completed_pre_at.is_some()
    }

    #[must_use]
    pub fn is_post_completed(&self) -> bool {
        self.completed_post_at.is_some()
    }

    #[must_use]
    pub fn is_phase_completed(&self, phase: Phase) -> bool {
        match phase {
            Phase::Pre => self.is_pre_completed(),
            Phase::Post => self.is_post_completed(),
        }
    }

    /// Stamp a phase as completed at `at`.
    ///
    /// Existing stamps are kept. Completing POST also stamps PRE when it is
    /// still missing. Returns `true` if any timestamp changed.
    pub fn stamp_completed(&mut self, phase: Phase, at: DateTime<Utc>) -> bool {
        let mut changed = false;
        if self.completed_pre_at.is_none() {
            self.completed_pre_at = Some(at);
            changed = true;
        }
        if phase == Phase::Post && self.completed_post_at.is_none() {
            self.completed_post_at = Some(at);
            changed = true;
        }
        changed
    }

    /// Drop a phase stamp the server denied. Clearing PRE clears POST too.
    /// Returns `true` if any timestamp changed.
    pub fn clear_completed(&mut self, phase: Phase) -> bool {
        let changed = match phase {
            Phase::Pre => self.completed_pre_at.is_some() || self.completed_post_at.is_some(),
            Phase::Post => self.completed_post_at.is_some(),
        };
        if phase == Phase::Pre {
            self.completed_pre_at = None;
        }
        self.completed_post_at = None;
        changed
    }
}

//
// ─── ADVANCE STATUS ────────────────────────────────────────────────────────────
//

/// State reported by the remote "next assignment" operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvanceStatus {
    /// First assignment of a freshly started block.
    Started,
    /// Mid-block.
    Continuing,
    /// No cases remain to assign.
    Exhausted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    fn assignment() -> Assignment {
        Assignment {
            id: AssignmentId::new(1),
            user_id: UserId::new(9),
            case_id: CaseId::new(100),
            arm: Arm::HumanAi,
            display_order: 0,
            block_index: BlockIndex::new(0),
            started_at: None,
            completed_pre_at: None,
            completed_post_at: None,
        }
    }

    #[test]
    fn post_stamp_implies_pre_stamp() {
        let mut a = assignment();
        assert!(a.stamp_completed(Phase::Post, fixed_now()));
        assert!(a.is_pre_completed());
        assert!(a.is_post_completed());
    }

    #[test]
    fn clearing_pre_also_clears_post() {
        let mut a = assignment();
        a.stamp_completed(Phase::Post, fixed_now());

        assert!(a.clear_completed(Phase::Post));
        assert!(a.is_pre_completed() && !a.is_post_completed());

        a.stamp_completed(Phase::Post, fixed_now());
        assert!(a.clear_completed(Phase::Pre));
        assert!(!a.is_pre_completed() && !a.is_post_completed());
        assert!(!a.clear_completed(Phase::Pre));
    }

    #[test]
    fn stamps_are_set_once() {
        let mut a = assignment();
        let first = fixed_now();
        a.stamp_completed(Phase::Pre, first);
        let later = first + chrono::Duration::minutes(3);
        assert!(!a.stamp_completed(Phase::Pre, later));
        assert_eq!(a.completed_pre_at, Some(first));
    }

    #[test]
    fn wire_names_match_backend() {
        let json = r#"{
            "id": 5, "user_id": 2, "case_id": 40, "arm": "HUMAN_AI",
            "display_order": 3, "block_index": 1,
            "completed_pre_at": "2023-11-14T22:13:20Z"
        }"#;
        let a: Assignment = serde_json::from_str(json).unwrap();
        assert_eq!(a.arm, Arm::HumanAi);
        assert!(a.is_pre_completed());
        assert!(!a.is_post_completed());

        let status: AdvanceStatus = serde_json::from_str(r#""exhausted""#).unwrap();
        assert_eq!(status, AdvanceStatus::Exhausted);
        assert_eq!(serde_json::to_string(&Phase::Post).unwrap(), r#""POST""#);
    }
}
