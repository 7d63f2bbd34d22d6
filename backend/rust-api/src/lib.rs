use axum::{
    http::{header, Method},
    middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use services::AppState;

pub fn create_router(app_state: Arc<services::AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(tower_http::cors::Any);

    Router::new()
        // Public endpoints (no auth required)
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(handlers::metrics_handler)
                .layer(middleware::from_fn(handlers::metrics_auth_middleware)),
        )
        .nest(
            "/api/v1/sessions",
            student_routes(app_state.clone(), sessions_routes()),
        )
        .nest("/api/v1/attempts", attempts_routes(app_state.clone()))
        .with_state(app_state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(middlewares::metrics::metrics_middleware))
                .layer(cors),
        )
}

/// JWT auth followed by the student role check.
fn student_routes(
    app_state: Arc<services::AppState>,
    routes: Router<Arc<services::AppState>>,
) -> Router<Arc<services::AppState>> {
    routes
        .route_layer(middleware::from_fn(
            middlewares::auth::student_guard_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            app_state,
            middlewares::auth::auth_middleware,
        ))
}

fn sessions_routes() -> Router<Arc<services::AppState>> {
    Router::new()
        .route("/", post(handlers::sessions::create_session))
        .route("/{id}", get(handlers::sessions::get_session))
        .route("/{id}/start", post(handlers::sessions::start_session))
        .route(
            "/{id}/answers/{index}",
            put(handlers::sessions::select_answer),
        )
        .route("/{id}/submit", post(handlers::sessions::submit_session))
        .route(
            "/{id}/submit/retry",
            post(handlers::sessions::retry_submission),
        )
        .route("/{id}/stream", get(handlers::sse::session_stream))
        .route(
            "/{id}/telemetry/permissions",
            post(handlers::telemetry::report_permissions),
        )
        .route(
            "/{id}/telemetry/focus",
            post(handlers::telemetry::report_focus),
        )
        .route(
            "/{id}/telemetry/fullscreen",
            post(handlers::telemetry::report_fullscreen),
        )
        .route(
            "/{id}/telemetry/frame",
            post(handlers::telemetry::report_frame),
        )
        .route(
            "/{id}/telemetry/audio",
            post(handlers::telemetry::report_audio),
        )
}

/// Students list their attempts; only gateways holding the service token
/// record them.
fn attempts_routes(app_state: Arc<services::AppState>) -> Router<Arc<services::AppState>> {
    let listing = Router::new().route("/", get(handlers::attempts::list_attempts));
    let recording = Router::new()
        .route("/{exam_id}", post(handlers::attempts::submit_attempt))
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            middlewares::auth::service_auth_middleware,
        ));

    student_routes(app_state, listing).merge(recording)
}
