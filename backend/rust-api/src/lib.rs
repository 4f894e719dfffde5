use axum::{
    extract::DefaultBodyLimit,
    http::{header, Method},
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;

pub use config::Config;
pub use error::PipelineError;
pub use services::AppState;

/// Headroom above the recording cap so oversized uploads reach `FILE_TOO_LARGE`
/// instead of a bare 413.
const MEDIA_BODY_LIMIT: usize = services::media_service::MAX_FILE_SIZE_BYTES + 1024 * 1024;

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(tower_http::cors::Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(handlers::metrics_handler)
                .layer(middleware::from_fn(handlers::metrics_auth_middleware)),
        )
        .nest(
            "/api/v1/attempts",
            attempt_routes()
                .layer(cors)
                .layer(middleware::from_fn_with_state(
                    app_state.clone(),
                    middlewares::auth::auth_middleware,
                )),
        )
        .nest(
            "/api/v1/admin",
            admin_routes().layer(middleware::from_fn_with_state(
                app_state.clone(),
                middlewares::auth::auth_middleware,
            )),
        )
        .with_state(app_state)
        .layer(middleware::from_fn(
            middlewares::metrics::metrics_middleware,
        ))
        .layer(middleware::from_fn(
            middlewares::trace::trace_context_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

fn attempt_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(handlers::attempts::create_attempt))
        .route("/{id}", get(handlers::attempts::get_attempt))
        .route("/{id}/content", put(handlers::attempts::update_content))
        .route(
            "/{id}/media",
            get(handlers::attempts::list_media)
                .post(handlers::attempts::upload_media)
                .layer(DefaultBodyLimit::max(MEDIA_BODY_LIMIT)),
        )
        .route(
            "/{id}/media/{media_id}",
            delete(handlers::attempts::delete_media),
        )
        .route(
            "/{id}/submit/speaking",
            post(handlers::attempts::submit_speaking),
        )
        .route(
            "/{id}/submit/writing",
            post(handlers::attempts::submit_writing),
        )
        .route("/{id}/result", get(handlers::attempts::get_result))
        .route("/{id}/rescore", post(handlers::attempts::request_rescore))
        .route(
            "/{id}/evaluation",
            post(handlers::attempts::evaluate_attempt),
        )
}

fn admin_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/scoring/jobs",
            get(handlers::admin::list_pending_jobs),
        )
        .route(
            "/scoring/jobs/{id}/process",
            post(handlers::admin::process_job),
        )
        .route("/scoring/drain", post(handlers::admin::drain_pending))
        .route("/prompts/{id}", put(handlers::admin::upsert_prompt))
        .route_layer(middleware::from_fn(
            middlewares::auth::admin_guard_middleware,
        ))
}
