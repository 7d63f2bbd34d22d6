use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::timer::{ClockEvent, TimeExpired, TimerTick};
use super::violation::{SignalSource, ViolationKind};
use super::{ExamDefinition, StudentIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Waiting for fullscreen and media permissions.
    Pending,
    Active,
    /// Submission in flight; answers and violation log are frozen.
    Terminating,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Active => "active",
            SessionState::Terminating => "terminating",
            SessionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    #[serde(rename = "submitted")]
    Manual,
    #[serde(rename = "auto-submitted-for-violations")]
    ViolationLimit,
    #[serde(rename = "auto-submitted-for-timeout")]
    Timeout,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Manual => "submitted",
            TerminationReason::ViolationLimit => "auto-submitted-for-violations",
            TerminationReason::Timeout => "auto-submitted-for-timeout",
        }
    }

    pub fn is_automatic(&self) -> bool {
        !matches!(self, TerminationReason::Manual)
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One student's attempt at one exam, owned by its session controller.
///
/// The violation log is not stored here: it lives in the aggregator, which is
/// the only component allowed to append to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamSession {
    pub id: String,
    pub exam_id: String,
    pub org_id: String,
    pub student_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_seconds: u32,
    pub violation_threshold: u32,
    pub allow_tab_switching: bool,
    pub require_camera_mic: bool,
    pub state: SessionState,
    pub answers: Vec<Option<usize>>,
    pub termination_reason: Option<TerminationReason>,
    submitted: bool,
}

impl ExamSession {
    pub fn new(exam: &ExamDefinition, student: &StudentIdentity, default_threshold: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            exam_id: exam.id.clone(),
            org_id: exam.org_id.clone(),
            student_id: student.student_id.clone(),
            started_at: None,
            duration_seconds: exam.duration_seconds(),
            violation_threshold: exam.max_violations.unwrap_or(default_threshold).max(1),
            allow_tab_switching: exam.allow_tab_switching,
            require_camera_mic: exam.require_camera_mic,
            state: SessionState::Pending,
            answers: vec![None; exam.questions.len()],
            termination_reason: None,
            submitted: false,
        }
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    /// Flips the write-once submitted flag. Returns false if it was already set.
    pub fn mark_submitted(&mut self) -> bool {
        if self.submitted {
            return false;
        }
        self.submitted = true;
        true
    }

    pub fn question_count(&self) -> usize {
        self.answers.len()
    }
}

/// Read model handed to the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub exam_id: String,
    pub student_id: String,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_seconds: u32,
    pub remaining_seconds: u32,
    pub violation_count: u32,
    pub violation_threshold: u32,
    pub answers: Vec<Option<usize>>,
    pub termination_reason: Option<TerminationReason>,
    pub score: Option<u32>,
    pub submission_attempts: u32,
    pub last_error: Option<String>,
    pub degraded_sensors: Vec<SignalSource>,
}

impl SessionSnapshot {
    /// Snapshot of a session that has not started yet.
    pub fn pending(session: &ExamSession) -> Self {
        Self {
            session_id: session.id.clone(),
            exam_id: session.exam_id.clone(),
            student_id: session.student_id.clone(),
            state: session.state,
            started_at: session.started_at,
            duration_seconds: session.duration_seconds,
            remaining_seconds: session.duration_seconds,
            violation_count: 0,
            violation_threshold: session.violation_threshold,
            answers: session.answers.clone(),
            termination_reason: session.termination_reason,
            score: None,
            submission_attempts: 0,
            last_error: None,
            degraded_sensors: Vec::new(),
        }
    }
}

/// User-visible notifications streamed to the student's browser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionNotice {
    Started {
        session_id: String,
        started_at: DateTime<Utc>,
        duration_seconds: u32,
    },
    TimerTick(TimerTick),
    TimeExpired(TimeExpired),
    ViolationWarning {
        reason: ViolationKind,
        count: u32,
        threshold: u32,
        message: String,
    },
    SensorDegraded {
        source: SignalSource,
        detail: String,
    },
    SensorRestored {
        source: SignalSource,
    },
    Terminating {
        reason: TerminationReason,
        violation_count: u32,
    },
    Submitted {
        reason: TerminationReason,
        score: u32,
        message: String,
    },
    SubmissionFailed {
        attempts: u32,
        message: String,
        retryable: bool,
    },
}

impl SessionNotice {
    pub fn event_name(&self) -> &'static str {
        match self {
            SessionNotice::Started { .. } => "started",
            SessionNotice::TimerTick(_) => "timer-tick",
            SessionNotice::TimeExpired(_) => "time-expired",
            SessionNotice::ViolationWarning { .. } => "violation-warning",
            SessionNotice::SensorDegraded { .. } => "sensor-degraded",
            SessionNotice::SensorRestored { .. } => "sensor-restored",
            SessionNotice::Terminating { .. } => "terminating",
            SessionNotice::Submitted { .. } => "submitted",
            SessionNotice::SubmissionFailed { .. } => "submission-failed",
        }
    }

    pub fn to_sse_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Notices the UI must show as a blocking dialog.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            SessionNotice::Submitted { .. } | SessionNotice::SubmissionFailed { .. }
        )
    }
}

impl From<ClockEvent> for SessionNotice {
    fn from(event: ClockEvent) -> Self {
        match event {
            ClockEvent::TimerTick(tick) => SessionNotice::TimerTick(tick),
            ClockEvent::TimeExpired(expired) => SessionNotice::TimeExpired(expired),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Question;

    fn exam(max_violations: Option<u32>) -> ExamDefinition {
        ExamDefinition {
            id: "exam-1".to_string(),
            org_id: "org-1".to_string(),
            title: "Algebra".to_string(),
            description: None,
            start_time: Utc::now(),
            duration_minutes: 2,
            allow_tab_switching: false,
            require_camera_mic: true,
            max_violations,
            questions: vec![
                Question {
                    question: "1 + 1".to_string(),
                    options: vec!["1".to_string(), "2".to_string()],
                    correct_option: Some(1),
                };
                3
            ],
        }
    }

    fn student() -> StudentIdentity {
        StudentIdentity {
            student_id: "student-1".to_string(),
            org_id: "org-1".to_string(),
        }
    }

    #[test]
    fn new_session_starts_pending_with_unanswered_questions() {
        let session = ExamSession::new(&exam(None), &student(), 3);

        assert_eq!(session.state, SessionState::Pending);
        assert_eq!(session.duration_seconds, 120);
        assert_eq!(session.violation_threshold, 3);
        assert_eq!(session.answers, vec![None, None, None]);
        assert!(!session.is_submitted());
    }

    #[test]
    fn exam_override_replaces_default_threshold() {
        let session = ExamSession::new(&exam(Some(5)), &student(), 3);
        assert_eq!(session.violation_threshold, 5);
    }

    #[test]
    fn submitted_flag_is_write_once() {
        let mut session = ExamSession::new(&exam(None), &student(), 3);
        assert!(session.mark_submitted());
        assert!(!session.mark_submitted());
        assert!(session.is_submitted());
    }

    #[test]
    fn termination_reasons_use_wire_names() {
        assert_eq!(
            serde_json::to_string(&TerminationReason::ViolationLimit).unwrap(),
            "\"auto-submitted-for-violations\""
        );
        assert_eq!(
            serde_json::to_string(&TerminationReason::Timeout).unwrap(),
            "\"auto-submitted-for-timeout\""
        );
        assert!(!TerminationReason::Manual.is_automatic());
    }

    #[test]
    fn notice_tags_match_event_names() {
        let notice = SessionNotice::ViolationWarning {
            reason: ViolationKind::FocusLost,
            count: 1,
            threshold: 3,
            message: "Focus lost".to_string(),
        };
        let json: serde_json::Value = serde_json::from_str(&notice.to_sse_data()).unwrap();
        assert_eq!(json["type"], notice.event_name());
        assert!(!notice.is_blocking());
    }
}
