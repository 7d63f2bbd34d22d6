use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;

use super::ApiError;
use crate::extractors::AppJson;
use crate::middlewares::auth::JwtClaims;
use crate::models::attempt::{AttemptSubmission, SubmitAttemptResponse};
use crate::services::AppState;

#[derive(Debug, Deserialize)]
pub struct AttemptTarget {
    pub org_id: String,
}

/// Submission endpoint used by remote gateways. Mounted behind the service
/// token guard, so only a closed session's gateway reaches it.
/// POST /api/v1/attempts/{exam_id}?org_id=
pub async fn submit_attempt(
    State(state): State<Arc<AppState>>,
    Path(exam_id): Path<String>,
    Query(target): Query<AttemptTarget>,
    AppJson(submission): AppJson<AttemptSubmission>,
) -> Result<impl IntoResponse, ApiError> {
    if submission.exam_id != exam_id {
        return Err(ApiError::bad_request("exam_id does not match the path"));
    }

    let exam = state
        .exam_service()
        .get_exam(&exam_id, &target.org_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Exam not found"))?;

    tracing::info!(
        "Recording gateway attempt: exam_id={}, student_id={}, reason={}",
        exam_id,
        submission.student_id,
        submission.termination_reason
    );
    let receipt = state
        .attempt_service()
        .record_attempt(&exam, &submission)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitAttemptResponse::from(receipt)),
    ))
}

/// GET /api/v1/attempts
pub async fn list_attempts(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
) -> Result<impl IntoResponse, ApiError> {
    let attempts = state.attempt_service().list_attempts(&claims.sub).await?;
    Ok(Json(attempts))
}
