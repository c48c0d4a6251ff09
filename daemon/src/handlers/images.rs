//! Image endpoints: streamed pull, list, inspect, remove and search.

use andock_runtime::{ImageDeleteItem, PullEvent, PullHandle};
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::error::{ApiError, ApiResult};
use crate::stream::{self, LineSender};
use crate::types::{ErrorMessage, ImageInspect, ImageSummary, ProgressMessage, SearchResponse};

/// Query parameters for `POST /images/create`.
#[derive(Debug, Deserialize)]
pub struct PullQuery {
    #[serde(rename = "fromImage")]
    pub from_image: Option<String>,
    pub tag: Option<String>,
}

/// Pull an image, streaming Docker progress lines.
///
/// A client disconnect drops this caller's handle; the pull is cancelled
/// once no caller is left.
pub async fn pull_image(
    State(state): State<AppState>,
    Query(query): Query<PullQuery>,
) -> ApiResult<Response> {
    let from_image = query
        .from_image
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("fromImage is required"))?;
    let tag = query.tag.filter(|t| !t.is_empty());

    let handle = state
        .runtime
        .pull(&from_image, tag.as_deref(), CancellationToken::new())
        .await?;

    let config = &state.runtime.config;
    let (tx, rx) = stream::channel(config.stream_buffer, config.stream_policy);
    tokio::spawn(forward_pull(handle, tx));

    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        rx.into_body(),
    )
        .into_response())
}

/// Copy pull events to the client. The closing `Status:` line is held
/// back and sent as the terminal line.
async fn forward_pull(mut handle: PullHandle, tx: LineSender) {
    let reference = handle.reference().to_string();
    let mut closing: Option<String> = None;

    while let Some(event) = handle.next_event().await {
        let message = match event {
            PullEvent::Status(status) if status.starts_with("Status:") => {
                closing = Some(status);
                continue;
            }
            PullEvent::Status(status) => ProgressMessage::status(status),
            PullEvent::Layer(progress) => ProgressMessage::from(&progress),
        };
        if !tx.send(stream::json_line(&message)).await {
            tracing::info!(reference = %reference, "Pull client disconnected");
            return;
        }
    }

    let last = match handle.result().await {
        Ok(image) => {
            let status = closing.unwrap_or_else(|| format!("Status: Pulled {}", image.id));
            stream::json_line(&ProgressMessage::status(status))
        }
        Err(e) => {
            tracing::warn!(reference = %reference, error = %e, "Pull failed");
            stream::json_line(&ErrorMessage::from_error(&e))
        }
    };
    tx.finish(last).await;
}

pub async fn list_images(State(state): State<AppState>) -> ApiResult<Json<Vec<ImageSummary>>> {
    let mut images = state.runtime.images.list().await?;
    images.sort_by(|a, b| b.created.cmp(&a.created));
    Ok(Json(images.iter().map(ImageSummary::from).collect()))
}

pub async fn inspect_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ImageInspect>> {
    let image = state.runtime.images.get(&name).await?;
    Ok(Json(ImageInspect::from(image)))
}

#[derive(Debug, Deserialize)]
pub struct RemoveImageQuery {
    #[serde(default, deserialize_with = "super::flag")]
    pub force: bool,
}

pub async fn remove_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<RemoveImageQuery>,
) -> ApiResult<Json<Vec<ImageDeleteItem>>> {
    let report = state.runtime.remove_image(&name, query.force).await?;
    tracing::info!(image = %name, force = query.force, "Image removed");
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub term: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

pub async fn search_images(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<SearchResponse>> {
    let term = query
        .term
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("term is required"))?;
    let page = state
        .runtime
        .registry
        .search(&term, query.page.unwrap_or(1), query.limit.unwrap_or(25))
        .await?;
    Ok(Json(SearchResponse::from(page)))
}
