use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::BlockIndex;

/// Aggregate accuracy feedback for one completed block.
///
/// Every figure is optional: a placeholder registered for a block that is still
/// in progress has none, and an all-`None` summary is distinct from one whose
/// accuracies are genuinely `0.0`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BlockSummary {
    pub block_index: BlockIndex,
    #[serde(default)]
    pub top1_accuracy_pre: Option<f64>,
    #[serde(default)]
    pub top1_accuracy_post: Option<f64>,
    #[serde(default)]
    pub top3_accuracy_pre: Option<f64>,
    #[serde(default)]
    pub top3_accuracy_post: Option<f64>,
    #[serde(default)]
    pub delta_top1: Option<f64>,
    #[serde(default)]
    pub delta_top3: Option<f64>,
    #[serde(default)]
    pub peer_percentile_top1: Option<f64>,
    #[serde(default)]
    pub peer_percentile_top3: Option<f64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl BlockSummary {
    /// Empty entry for a block whose summary is not available yet.
    #[must_use]
    pub fn placeholder(block_index: BlockIndex) -> Self {
        Self {
            block_index,
            ..Self::default()
        }
    }

    /// True when at least one accuracy figure is present.
    #[must_use]
    pub fn has_accuracy(&self) -> bool {
        [
            self.top1_accuracy_pre,
            self.top1_accuracy_post,
            self.top3_accuracy_pre,
            self.top3_accuracy_post,
        ]
        .iter()
        .any(Option::is_some)
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        !self.has_accuracy()
    }
}

/// Answer of the cheap "can the summary be viewed yet" check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SummaryAvailability {
    pub available: bool,
    pub reason: Option<String>,
    pub remaining_cases: Option<u32>,
}

impl SummaryAvailability {
    #[must_use]
    pub fn ready() -> Self {
        Self {
            available: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
            remaining_cases: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_accuracy_is_not_a_placeholder() {
        let zero = BlockSummary {
            top1_accuracy_pre: Some(0.0),
            ..BlockSummary::placeholder(BlockIndex::new(1))
        };
        assert!(zero.has_accuracy());
        assert!(BlockSummary::placeholder(BlockIndex::new(1)).is_placeholder());
    }

    #[test]
    fn deserializes_report_with_nulls() {
        let json = r#"{"block_index": 2, "top1_accuracy_pre": null, "top1_accuracy_post": 0.7}"#;
        let s: BlockSummary = serde_json::from_str(json).unwrap();
        assert_eq!(s.block_index, BlockIndex::new(2));
        assert_eq!(s.top1_accuracy_post, Some(0.7));
        assert!(s.has_accuracy());
    }
}
