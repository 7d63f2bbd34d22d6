//! Final hand-off of a session to scoring and storage.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::error::GatewayError;
use crate::models::attempt::{AttemptSubmission, SubmissionReceipt, SubmitAttemptResponse};
use crate::services::attempt_service::AttemptService;
use crate::services::exam_service::ExamService;

/// Scores and stores a finished session.
///
/// Implementations must be idempotent per (exam, student): a retry after a
/// failed call resubmits the same final state and must not create a second
/// attempt.
#[async_trait]
pub trait SubmissionGateway: Send + Sync {
    async fn submit(
        &self,
        submission: &AttemptSubmission,
    ) -> Result<SubmissionReceipt, GatewayError>;
}

/// In-process gateway backed by Mongo and Redis.
pub struct LocalSubmissionGateway {
    exams: ExamService,
    attempts: AttemptService,
    org_id: String,
}

impl LocalSubmissionGateway {
    pub fn new(exams: ExamService, attempts: AttemptService, org_id: String) -> Self {
        Self {
            exams,
            attempts,
            org_id,
        }
    }
}

#[async_trait]
impl SubmissionGateway for LocalSubmissionGateway {
    async fn submit(
        &self,
        submission: &AttemptSubmission,
    ) -> Result<SubmissionReceipt, GatewayError> {
        let exam = self
            .exams
            .get_exam(&submission.exam_id, &self.org_id)
            .await
            .map_err(|e| GatewayError::Transient(format!("{:#}", e)))?
            .ok_or_else(|| {
                GatewayError::Rejected(format!("Exam {} not found", submission.exam_id))
            })?;

        self.attempts
            .record_attempt(&exam, submission)
            .await
            .map_err(|e| GatewayError::Transient(format!("{:#}", e)))
    }
}

/// Gateway that posts to a remote attempts endpoint with the shared service
/// token.
pub struct HttpSubmissionGateway {
    client: Client,
    base_url: String,
    service_token: String,
    org_id: String,
}

impl HttpSubmissionGateway {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        service_token: impl Into<String>,
        org_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_token: service_token.into(),
            org_id: org_id.into(),
        }
    }

    fn endpoint(&self, exam_id: &str) -> String {
        format!("{}/api/v1/attempts/{}", self.base_url, exam_id)
    }
}

/// 5xx, 408 and 429 are worth retrying; any other non-success status is final.
pub fn classify_status(status: StatusCode, body: String) -> GatewayError {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        GatewayError::Transient(format!("{}: {}", status, body))
    } else {
        GatewayError::Rejected(format!("{}: {}", status, body))
    }
}

#[async_trait]
impl SubmissionGateway for HttpSubmissionGateway {
    async fn submit(
        &self,
        submission: &AttemptSubmission,
    ) -> Result<SubmissionReceipt, GatewayError> {
        let url = self.endpoint(&submission.exam_id);
        tracing::debug!("Posting attempt to {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.service_token)
            .query(&[("org_id", self.org_id.as_str())])
            .json(submission)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let body: SubmitAttemptResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Transient(format!("Invalid gateway response: {}", e)))?;

        Ok(SubmissionReceipt {
            attempt_id: body.attempt_id,
            score: body.score,
            submitted_at: body.submitted_at,
        })
    }
}
