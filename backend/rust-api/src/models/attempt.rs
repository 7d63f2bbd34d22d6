use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::session::TerminationReason;
use super::violation::ViolationLogEntry;

/// Final state of a session handed to the submission gateway.
///
/// Built once when the session enters `Terminating`; retries resend the same value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSubmission {
    pub exam_id: String,
    pub student_id: String,
    pub answers: Vec<Option<usize>>,
    pub termination_reason: TerminationReason,
    pub violation_log: Vec<ViolationLogEntry>,
    pub started_at: Option<DateTime<Utc>>,
}

impl AttemptSubmission {
    pub fn is_auto_submitted(&self) -> bool {
        self.termination_reason.is_automatic()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub attempt_id: String,
    pub score: u32,
    pub submitted_at: DateTime<Utc>,
}

/// Wire response of the attempts endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAttemptResponse {
    pub success: bool,
    pub message: String,
    pub attempt_id: String,
    pub score: u32,
    pub submitted_at: DateTime<Utc>,
}

impl From<SubmissionReceipt> for SubmitAttemptResponse {
    fn from(receipt: SubmissionReceipt) -> Self {
        Self {
            success: true,
            message: "Attempt saved".to_string(),
            attempt_id: receipt.attempt_id,
            score: receipt.score,
            submitted_at: receipt.submitted_at,
        }
    }
}

/// Stored attempt, one per (exam, student).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub exam_id: String,
    pub org_id: String,
    pub student_id: String,
    pub answers: Vec<Option<usize>>,
    pub score: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub submitted_at: DateTime<Utc>,
    pub is_auto_submitted: bool,
    pub termination_reason: TerminationReason,
    pub violation_log: Vec<ViolationLogEntry>,
}

impl AttemptRecord {
    pub fn receipt(&self) -> SubmissionReceipt {
        SubmissionReceipt {
            attempt_id: self.id.clone(),
            score: self.score,
            submitted_at: self.submitted_at,
        }
    }
}
