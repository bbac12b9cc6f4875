//! API route definitions.

use axum::{
    Router, middleware,
    routing::{get, post, put},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::auth::auth_middleware;

use super::handlers;
use super::handlers::{agent, sessions};
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let auth_state = state.auth.clone();

    // Login and the terminal socket authenticate themselves; everything else
    // requires the admin bearer token.
    let public_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/auth/login", post(handlers::login))
        .route("/api/terminal/{username}", get(handlers::terminal_ws));

    let protected_routes = Router::new()
        .route("/api/sessions", get(sessions::list).post(sessions::create))
        .route(
            "/api/sessions/{username}",
            get(sessions::get).delete(sessions::delete),
        )
        .route("/api/sessions/{username}/restart", post(sessions::restart))
        .route("/api/sessions/{username}/stats", get(sessions::stats))
        .route("/api/sessions/{username}/agent", post(agent::toggle))
        .route(
            "/api/sessions/{username}/agent/keys",
            put(agent::set_keys).get(agent::key_status),
        )
        .route(
            "/api/sessions/{username}/tasks",
            get(agent::list_tasks).post(agent::submit_task),
        )
        .route(
            "/api/sessions/{username}/tasks/{task_id}",
            get(agent::get_task).delete(agent::cancel_task),
        )
        .route(
            "/api/sessions/{username}/tasks/{task_id}/stream",
            get(agent::stream_task),
        )
        .layer(middleware::from_fn_with_state(auth_state, auth_middleware));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(trace_layer)
        .with_state(state)
}
