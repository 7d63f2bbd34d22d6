use chrono::{DateTime, Duration, Utc};
use mongodb::bson::{self, oid::ObjectId};
use serde::{Deserialize, Serialize};
use validator::Validate;

pub mod attempt;
pub mod session;
pub mod telemetry;
pub mod timer;
pub mod violation;

pub use session::{ExamSession, SessionNotice, SessionSnapshot, SessionState, TerminationReason};
pub use violation::{DetectionSignal, SignalSource, ViolationEvent, ViolationKind};

/// Identity resolved by the auth layer before a session is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentIdentity {
    pub student_id: String,
    pub org_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    pub options: Vec<String>,
    pub correct_option: Option<usize>,
}

/// Full exam definition including correct answers. Never sent to the student.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamDefinition {
    pub id: String,
    pub org_id: String,
    pub title: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub duration_minutes: u32,
    pub allow_tab_switching: bool,
    pub require_camera_mic: bool,
    pub max_violations: Option<u32>,
    pub questions: Vec<Question>,
}

impl ExamDefinition {
    pub fn duration_seconds(&self) -> u32 {
        self.duration_minutes.saturating_mul(60)
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        self.start_time + Duration::minutes(i64::from(self.duration_minutes))
    }

    /// An exam can be taken while `start_time <= now < start_time + duration`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.start_time <= now && now < self.ends_at()
    }

    /// Student-facing copy with the correct options stripped.
    pub fn paper(&self) -> ExamPaper {
        ExamPaper {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            duration_seconds: self.duration_seconds(),
            questions: self
                .questions
                .iter()
                .map(|q| QuestionView {
                    question: q.question.clone(),
                    options: q.options.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionView {
    pub question: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamPaper {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub duration_seconds: u32,
    pub questions: Vec<QuestionView>,
}

impl ExamPaper {
    /// Checks that `option` is a valid choice for question `index`.
    pub fn accepts(&self, index: usize, option: Option<usize>) -> bool {
        match self.questions.get(index) {
            Some(question) => option.is_none_or(|o| o < question.options.len()),
            None => false,
        }
    }
}

/// Exam as stored in the `exams` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub org_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub start_time: bson::DateTime,
    pub duration_minutes: u32,
    #[serde(default)]
    pub allow_tab_switching: bool,
    #[serde(default = "default_require_camera_mic")]
    pub require_camera_mic: bool,
    #[serde(default)]
    pub max_violations: Option<u32>,
    #[serde(default)]
    pub questions: Vec<Question>,
}

fn default_require_camera_mic() -> bool {
    true
}

impl From<ExamDocument> for ExamDefinition {
    fn from(doc: ExamDocument) -> Self {
        Self {
            id: doc.id.to_hex(),
            org_id: doc.org_id,
            title: doc.title,
            description: doc.description,
            start_time: crate::utils::time::bson_to_chrono(doc.start_time),
            duration_minutes: doc.duration_minutes,
            allow_tab_switching: doc.allow_tab_switching,
            require_camera_mic: doc.require_camera_mic,
            max_violations: doc.max_violations,
            questions: doc.questions,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateProctoredSessionRequest {
    #[validate(length(equal = 24, message = "exam_id must be a 24 character ObjectId"))]
    pub exam_id: String,
}

#[derive(Debug, Serialize)]
pub struct CreateProctoredSessionResponse {
    pub session_id: String,
    pub state: SessionState,
    pub violation_threshold: u32,
    pub paper: ExamPaper,
}

#[derive(Debug, Deserialize)]
pub struct SelectAnswerRequest {
    pub option: Option<usize>,
}
