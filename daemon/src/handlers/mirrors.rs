//! Registry mirror management.
//!
//! `{url}` is the percent-encoded mirror URL, e.g.
//! `/mirrors/https%3A%2F%2Fmirror.example.com`.

use andock_core::mirror::Mirror;
use andock_runtime::MirrorPatch;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::api::AppState;
use crate::error::{ApiError, ApiResult};
use crate::types::{MirrorAddRequest, MirrorView};

pub async fn list_mirrors(State(state): State<AppState>) -> ApiResult<Json<Vec<MirrorView>>> {
    let mirrors = state.runtime.mirrors.list().await?;
    let views = mirrors
        .into_iter()
        .map(|mirror| MirrorView {
            health: state.runtime.resolver.health(&mirror.url),
            mirror,
        })
        .collect();
    Ok(Json(views))
}

pub async fn add_mirror(
    State(state): State<AppState>,
    Json(body): Json<MirrorAddRequest>,
) -> ApiResult<(StatusCode, Json<Mirror>)> {
    if body.url.trim().is_empty() {
        return Err(ApiError::bad_request("url is required"));
    }
    let mirror = state
        .runtime
        .mirrors
        .add(&body.url, body.name, body.bearer_token, body.priority)
        .await?;
    Ok((StatusCode::CREATED, Json(mirror)))
}

pub async fn update_mirror(
    State(state): State<AppState>,
    Path(url): Path<String>,
    Json(patch): Json<MirrorPatch>,
) -> ApiResult<Json<Mirror>> {
    Ok(Json(state.runtime.mirrors.update(&url, patch).await?))
}

pub async fn remove_mirror(
    State(state): State<AppState>,
    Path(url): Path<String>,
) -> ApiResult<StatusCode> {
    state.runtime.mirrors.remove(&url).await?;
    Ok(StatusCode::NO_CONTENT)
}
