//! Engine API router.
//!
//! Every route is served unversioned and under `/v1.24` through `/v1.43`.

use std::sync::Arc;

use andock_runtime::Runtime;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers;

/// Oldest and newest API minor versions mounted as prefixes.
const MIN_MINOR: u32 = 24;
const MAX_MINOR: u32 = 43;

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
}

/// Build the router with all endpoints.
#[must_use]
pub fn create_router(runtime: Arc<Runtime>) -> Router {
    let state = AppState { runtime };

    let mut router = api_routes();
    for minor in MIN_MINOR..=MAX_MINOR {
        router = router.nest(&format!("/v1.{minor}"), api_routes());
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        // System
        .route("/_ping", get(handlers::system::ping).head(handlers::system::ping))
        .route("/version", get(handlers::system::version))
        .route("/info", get(handlers::system::info))
        .route("/metrics", get(handlers::system::metrics))
        // Images
        .route("/images/create", post(handlers::images::pull_image))
        .route("/images/json", get(handlers::images::list_images))
        .route("/images/search", get(handlers::images::search_images))
        .route("/images/{name}/json", get(handlers::images::inspect_image))
        .route("/images/{name}", axum::routing::delete(handlers::images::remove_image))
        // Containers
        .route("/containers/create", post(handlers::containers::create_container))
        .route("/containers/json", get(handlers::containers::list_containers))
        .route("/containers/{id}/json", get(handlers::containers::inspect_container))
        .route("/containers/{id}/start", post(handlers::containers::start_container))
        .route("/containers/{id}/stop", post(handlers::containers::stop_container))
        .route("/containers/{id}/pause", post(handlers::containers::pause_container))
        .route("/containers/{id}/unpause", post(handlers::containers::unpause_container))
        .route("/containers/{id}/wait", post(handlers::containers::wait_container))
        .route("/containers/{id}/logs", get(handlers::containers::container_logs))
        .route("/containers/{id}/remove", post(handlers::containers::remove_container))
        .route(
            "/containers/{id}",
            axum::routing::delete(handlers::containers::remove_container),
        )
        // Exec
        .route("/containers/{id}/exec", post(handlers::exec::exec_create))
        .route("/exec/{id}/start", post(handlers::exec::exec_start))
        .route("/exec/{id}/json", get(handlers::exec::exec_inspect))
        // Mirrors
        .route(
            "/mirrors",
            get(handlers::mirrors::list_mirrors).post(handlers::mirrors::add_mirror),
        )
        .route(
            "/mirrors/{url}",
            axum::routing::patch(handlers::mirrors::update_mirror)
                .delete(handlers::mirrors::remove_mirror),
        )
}
