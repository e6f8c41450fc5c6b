mod assessment;
mod assignment;
mod case;
mod ids;
mod progress;
mod summary;

pub use ids::{AssessmentId, AssignmentId, BlockIndex, CaseId, DiagnosisId, ParseIdError, UserId};

pub use assessment::{AssessmentError, AssessmentRecord, RankedDiagnosis};
pub use assignment::{AdvanceStatus, Arm, Assignment, Phase};
pub use case::Case;
pub use progress::{CaseProgress, PhaseSlot, PhaseState, ProgressEntry};
pub use summary::{BlockSummary, SummaryAvailability};
