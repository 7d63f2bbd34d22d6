use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use chrono::Utc;
use std::sync::Arc;

use super::ApiError;
use crate::extractors::{AppJson, ValidJson};
use crate::middlewares::auth::JwtClaims;
use crate::models::{
    CreateProctoredSessionRequest, CreateProctoredSessionResponse, ExamSession,
    SelectAnswerRequest,
};
use crate::services::browser_bridge::BrowserBridge;
use crate::services::capabilities::Capabilities;
use crate::services::session_controller::SessionController;
use crate::services::AppState;

/// POST /api/v1/sessions
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    ValidJson(req): ValidJson<CreateProctoredSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = claims.identity();
    tracing::info!(
        "Creating proctored session: exam_id={}, student_id={}",
        req.exam_id,
        identity.student_id
    );

    if let Some(session_id) = state
        .sessions
        .open_session_for(&identity.student_id, &req.exam_id)
        .await
    {
        tracing::info!("Resuming open session: session_id={}", session_id);
        let handle = state.sessions.handle(&session_id, &identity.student_id).await?;
        let paper = state.sessions.paper(&session_id, &identity.student_id).await?;
        let snapshot = handle.snapshot();
        return Ok((
            StatusCode::OK,
            Json(CreateProctoredSessionResponse {
                session_id,
                state: snapshot.state,
                violation_threshold: snapshot.violation_threshold,
                paper,
            }),
        ));
    }

    let exam = state
        .exam_service()
        .get_exam(&req.exam_id, &identity.org_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Exam not found"))?;

    if !exam.is_live_at(Utc::now()) {
        return Err(ApiError::conflict("Exam is not live"));
    }
    if state
        .attempt_service()
        .has_attempt(&exam.id, &identity.student_id)
        .await?
    {
        return Err(ApiError::conflict("Exam already attempted"));
    }

    let proctoring = state.config.proctoring.clone();
    let session = ExamSession::new(&exam, &identity, proctoring.violation_threshold);
    let bridge = Arc::new(BrowserBridge::new(proctoring.sensor_stale_after()));
    let gateway = state.submission_gateway(&identity.org_id);
    let controller = SessionController::new(
        session,
        proctoring,
        state.config.submission.clone(),
        Capabilities::from_shared(bridge.clone()),
        gateway,
    );

    let violation_threshold = controller.session().violation_threshold;
    let initial_state = controller.state();
    let paper = exam.paper();
    let session_id = state
        .sessions
        .insert(controller, paper.clone(), bridge, exam.ends_at())
        .await;

    tracing::info!(
        "Proctored session created: session_id={}, exam_id={}, threshold={}",
        session_id,
        exam.id,
        violation_threshold
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateProctoredSessionResponse {
            session_id,
            state: initial_state,
            violation_threshold,
            paper,
        }),
    ))
}

/// POST /api/v1/sessions/{id}/start
///
/// Blocks until the browser reported fullscreen and media grants (bounded by
/// the permission timeout).
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.sessions.start(&session_id, &claims.sub).await?;
    Ok(Json(snapshot))
}

/// GET /api/v1/sessions/{id}
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.sessions.handle(&session_id, &claims.sub).await?;
    Ok(Json(handle.snapshot()))
}

/// PUT /api/v1/sessions/{id}/answers/{index}
pub async fn select_answer(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path((session_id, index)): Path<(String, usize)>,
    AppJson(req): AppJson<SelectAnswerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let paper = state.sessions.paper(&session_id, &claims.sub).await?;
    if !paper.accepts(index, req.option) {
        return Err(ApiError::bad_request(format!(
            "Option {:?} is not valid for question {}",
            req.option, index
        )));
    }

    let handle = state.sessions.handle(&session_id, &claims.sub).await?;
    handle.select_answer(index, req.option).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/sessions/{id}/submit
pub async fn submit_session(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.sessions.handle(&session_id, &claims.sub).await?;
    handle.submit().await?;
    tracing::info!("Manual submit requested: session_id={}", session_id);
    Ok((StatusCode::ACCEPTED, Json(handle.snapshot())))
}

/// POST /api/v1/sessions/{id}/submit/retry
pub async fn retry_submission(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.sessions.handle(&session_id, &claims.sub).await?;
    handle.retry_submission().await?;
    Ok((StatusCode::ACCEPTED, Json(handle.snapshot())))
}
