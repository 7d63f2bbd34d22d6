//! Raw browser observations for a session's bridge.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension,
};
use std::sync::Arc;

use super::ApiError;
use crate::extractors::{AppJson, ValidJson};
use crate::middlewares::auth::JwtClaims;
use crate::models::telemetry::{
    AudioReport, FocusState, FrameReport, FrameSample, FullscreenReport, PermissionReport,
};
use crate::services::browser_bridge::BrowserBridge;
use crate::services::AppState;

async fn bridge_for(
    state: &AppState,
    session_id: &str,
    claims: &JwtClaims,
) -> Result<Arc<BrowserBridge>, ApiError> {
    Ok(state.sessions.bridge(session_id, &claims.sub).await?)
}

/// POST /api/v1/sessions/{id}/telemetry/permissions
pub async fn report_permissions(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(session_id): Path<String>,
    AppJson(report): AppJson<PermissionReport>,
) -> Result<StatusCode, ApiError> {
    tracing::info!(
        "Permission report: session_id={}, fullscreen={:?}, camera={:?}, microphone={:?}",
        session_id,
        report.fullscreen,
        report.camera,
        report.microphone
    );
    bridge_for(&state, &session_id, &claims)
        .await?
        .report_permissions(report);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/sessions/{id}/telemetry/focus
pub async fn report_focus(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(session_id): Path<String>,
    AppJson(report): AppJson<FocusState>,
) -> Result<StatusCode, ApiError> {
    bridge_for(&state, &session_id, &claims)
        .await?
        .report_focus(report);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/sessions/{id}/telemetry/fullscreen
pub async fn report_fullscreen(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(session_id): Path<String>,
    AppJson(report): AppJson<FullscreenReport>,
) -> Result<StatusCode, ApiError> {
    bridge_for(&state, &session_id, &claims)
        .await?
        .report_fullscreen(report.active);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/sessions/{id}/telemetry/frame
pub async fn report_frame(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(session_id): Path<String>,
    AppJson(report): AppJson<FrameReport>,
) -> Result<StatusCode, ApiError> {
    bridge_for(&state, &session_id, &claims)
        .await?
        .report_frame(FrameSample { face: report.face });
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/sessions/{id}/telemetry/audio
pub async fn report_audio(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(session_id): Path<String>,
    ValidJson(report): ValidJson<AudioReport>,
) -> Result<StatusCode, ApiError> {
    bridge_for(&state, &session_id, &claims)
        .await?
        .report_audio(report.frequency_bins);
    Ok(StatusCode::NO_CONTENT)
}
