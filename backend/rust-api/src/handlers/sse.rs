use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Extension,
};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

use super::ApiError;
use crate::metrics::SSE_CONNECTIONS_ACTIVE;
use crate::middlewares::auth::JwtClaims;
use crate::models::{SessionNotice, SessionState};
use crate::services::AppState;

/// SSE stream of session notices
/// GET /api/v1/sessions/{id}/stream
pub async fn session_stream(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.sessions.handle(&session_id, &claims.sub).await?;
    let notices = handle.subscribe();
    let already_closed = handle.snapshot().state == SessionState::Closed;

    tracing::info!("Client connected to SSE stream: session={}", session_id);
    SSE_CONNECTIONS_ACTIVE.inc();

    let stream = notice_stream(session_id, notices, already_closed);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Decrements the connection gauge when the stream is dropped.
struct ConnectionGuard {
    session_id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        SSE_CONNECTIONS_ACTIVE.dec();
        tracing::info!("SSE stream closed: session={}", self.session_id);
    }
}

fn to_event(notice: &SessionNotice) -> Event {
    Event::default()
        .event(notice.event_name())
        .data(notice.to_sse_data())
}

/// Forwards notices until the session is submitted or its controller is gone.
fn notice_stream(
    session_id: String,
    notices: broadcast::Receiver<SessionNotice>,
    already_closed: bool,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let guard = ConnectionGuard { session_id };

    stream::unfold(
        (notices, guard, already_closed),
        |(mut notices, guard, finished)| async move {
            if finished {
                return None;
            }

            loop {
                match notices.recv().await {
                    Ok(notice) => {
                        let last = matches!(notice, SessionNotice::Submitted { .. });
                        return Some((Ok(to_event(&notice)), (notices, guard, last)));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "SSE client lagging: session={}, skipped={}",
                            guard.session_id,
                            skipped
                        );
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        },
    )
}
