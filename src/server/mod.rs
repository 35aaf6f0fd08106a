//! HTTP API
//!
//! One axum router serves every role: the core `/api` routes always, the
//! `/api/master/...` group only when the node runs the master subsystems.
//! All bodies ride the unified envelope; a panic anywhere in a handler is
//! converted into an `INTERNAL_ERROR` envelope by the recovery layer.

pub mod envelope;
pub mod events;
pub mod handlers;
pub mod master;
pub mod state;

use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::Router;
use serde_json::Value;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use envelope::{Envelope, ErrorCode};
pub use state::AppState;

/// Build the router for a node, composing route groups by role
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/api/info", get(handlers::get_info))
        .route("/api/models", get(handlers::list_models))
        .route("/api/models/{id}/load", post(handlers::load_model))
        .route("/api/models/{id}/unload", post(handlers::unload_model))
        .route("/api/models/{id}/favourite", post(handlers::set_favourite))
        .route("/api/scan", post(handlers::scan_models))
        .route("/api/resources", get(handlers::get_resources))
        .route("/api/processes", get(handlers::list_processes))
        .route("/api/events", get(events::event_stream))
        .route("/health", get(health_check));

    if state.node.role().is_master() {
        router = router
            .route(
                "/api/master/clients/register",
                post(master::register_client),
            )
            .route(
                "/api/master/clients/{id}",
                delete(master::deregister_client),
            )
            .route("/api/master/heartbeat", post(master::ingest_heartbeat))
            .route("/api/master/nodes", get(master::list_nodes))
            .route("/api/master/nodes/{id}", get(master::get_node))
            .route("/api/master/command", post(master::submit_command))
            .route(
                "/api/master/clients/{id}/commands/next",
                get(master::next_command),
            )
            .route(
                "/api/master/clients/{id}/results",
                post(master::ingest_result),
            )
            .route(
                "/api/master/results/{command_id}",
                get(master::get_result),
            );
    }

    router
        .fallback(not_found)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    axum::http::StatusCode::OK
}

async fn not_found() -> Envelope<Value> {
    Envelope::err(ErrorCode::InvalidRequest, "unknown route")
}

fn handle_panic(
    err: Box<dyn std::any::Any + Send + 'static>,
) -> axum::http::Response<axum::body::Body> {
    let detail = err
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| err.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());

    Envelope::<Value>::err(ErrorCode::InternalError, detail).into_response()
}
