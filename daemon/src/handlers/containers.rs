//! Container lifecycle endpoints.

use std::time::Duration;

use andock_core::error::AndockError;
use andock_core::log::LogStream;
use andock_runtime::CreateRequest;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::api::AppState;
use crate::error::{ApiError, ApiResult};
use crate::types::{
    ContainerCreateRequest, ContainerCreateResponse, ContainerInspect, ContainerSummary,
    WaitResponse,
};

#[derive(Debug, Deserialize)]
pub struct CreateQuery {
    pub name: Option<String>,
}

pub async fn create_container(
    State(state): State<AppState>,
    Query(query): Query<CreateQuery>,
    Json(body): Json<ContainerCreateRequest>,
) -> ApiResult<(StatusCode, Json<ContainerCreateResponse>)> {
    if body.image.trim().is_empty() {
        return Err(ApiError::bad_request("Image is required"));
    }
    let container = state
        .runtime
        .containers
        .create(CreateRequest {
            image: body.image,
            name: query.name.filter(|n| !n.is_empty()),
            cmd: body.cmd,
            entrypoint: body.entrypoint,
            env: body.env.unwrap_or_default(),
            working_dir: body.working_dir.filter(|w| !w.is_empty()),
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ContainerCreateResponse {
            id: container.id,
            warnings: Vec::new(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default, deserialize_with = "super::flag")]
    pub all: bool,
}

pub async fn list_containers(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<ContainerSummary>>> {
    let mut containers = state.runtime.containers.list(query.all).await?;
    containers.sort_by(|a, b| b.created.cmp(&a.created));
    Ok(Json(containers.iter().map(ContainerSummary::from).collect()))
}

pub async fn inspect_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ContainerInspect>> {
    let container = state.runtime.containers.inspect(&id).await?;
    Ok(Json(ContainerInspect::from(container)))
}

/// Turn "already in the requested state" into 304 Not Modified.
fn not_modified_if(err: AndockError, already: impl Fn(&str) -> bool) -> ApiResult<StatusCode> {
    match err {
        AndockError::InvalidStateTransition { ref from, .. } if already(from) => {
            Ok(StatusCode::NOT_MODIFIED)
        }
        other => Err(other.into()),
    }
}

pub async fn start_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    match state.runtime.containers.start(&id).await {
        Ok(_) => Ok(StatusCode::NO_CONTENT),
        Err(e) => not_modified_if(e, |from| from == "running"),
    }
}

#[derive(Debug, Deserialize)]
pub struct StopQuery {
    /// Grace period in seconds.
    pub t: Option<i64>,
}

/// Stop is a no-op only for containers with no process. Paused ones
/// conflict.
fn already_stopped(from: &str) -> bool {
    matches!(from, "created" | "stopped" | "exited")
}

pub async fn stop_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StopQuery>,
) -> ApiResult<StatusCode> {
    let grace = query.t.map(|t| Duration::from_secs(t.max(0) as u64));
    match state.runtime.containers.stop(&id, grace).await {
        Ok(_) => Ok(StatusCode::NO_CONTENT),
        Err(e) => not_modified_if(e, already_stopped),
    }
}

pub async fn pause_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.runtime.containers.pause(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unpause_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.runtime.containers.unpause(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn wait_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<WaitResponse>> {
    let status_code = state.runtime.containers.wait(&id).await?;
    Ok(Json(WaitResponse { status_code }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<String>,
    #[serde(default, deserialize_with = "super::flag")]
    pub stdout: bool,
    #[serde(default, deserialize_with = "super::flag")]
    pub stderr: bool,
}

impl LogsQuery {
    /// `None` for "all" or a missing value.
    fn tail(&self) -> ApiResult<Option<usize>> {
        match self.tail.as_deref() {
            None | Some("all") | Some("") => Ok(None),
            Some(n) => n
                .parse()
                .map(Some)
                .map_err(|_| ApiError::bad_request(format!("invalid tail value: {}", n))),
        }
    }

    /// Neither flag set means both streams.
    fn wants(&self, stream: LogStream) -> bool {
        if !self.stdout && !self.stderr {
            return true;
        }
        match stream {
            LogStream::Stdout => self.stdout,
            LogStream::Stderr => self.stderr,
        }
    }
}

pub async fn container_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Response> {
    let tail = query.tail()?;
    let entries = state.runtime.containers.logs(&id, None).await?;

    let mut selected: Vec<_> = entries.into_iter().filter(|e| query.wants(e.stream)).collect();
    if let Some(n) = tail {
        let skip = selected.len().saturating_sub(n);
        selected.drain(..skip);
    }
    let body: String = selected.into_iter().map(|e| e.log).collect();

    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    #[serde(default, deserialize_with = "super::flag")]
    pub force: bool,
}

pub async fn remove_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> ApiResult<StatusCode> {
    state.runtime.containers.remove(&id, query.force).await?;
    Ok(StatusCode::NO_CONTENT)
}
