//! Exec endpoints.

use std::sync::Arc;

use andock_core::error::AndockError;
use andock_core::exec::{ExecInstance, ExecOutput, ExecRequest, ExecResult};
use andock_core::log::LogStream;
use andock_runtime::{ExecIo, Runtime};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::error::{ApiError, ApiResult};
use crate::stream::{self, LineSender};
use crate::types::{
    ErrorMessage, ExecCreateRequest, ExecInspect, ExecResultResponse, ExecStartRequest,
    ExecStreamEvent, IdResponse,
};

pub async fn exec_create(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExecCreateRequest>,
) -> ApiResult<(StatusCode, Json<IdResponse>)> {
    if body.cmd.is_empty() {
        return Err(ApiError::bad_request("Cmd is required"));
    }
    let request = ExecRequest {
        cmd: body.cmd,
        env: body.env.unwrap_or_default(),
        working_dir: body.working_dir.filter(|w| !w.is_empty()),
    };
    let instance = state
        .runtime
        .containers
        .create_exec(&id, request, body.attach_stdout, body.attach_stderr)
        .await?;

    tracing::debug!(exec = %instance.id, container = %instance.container_id, "Exec created");
    Ok((StatusCode::CREATED, Json(IdResponse { id: instance.id })))
}

/// Start an exec instance.
///
/// Detached starts run to completion and answer with the captured result.
/// Otherwise output is streamed as it is produced, closed by an
/// `{"exitCode"}` line. A client disconnect cancels the command.
pub async fn exec_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ExecStartRequest>>,
) -> ApiResult<Response> {
    let detach = body.map(|Json(b)| b.detach).unwrap_or(false);
    let instance = state.runtime.containers.inspect_exec(&id)?;
    if instance.running {
        return Err(AndockError::Conflict(format!("Exec instance {} is already running", id)).into());
    }

    if detach {
        let result = state
            .runtime
            .containers
            .start_exec(&id, ExecIo::default())
            .await?;
        return Ok(Json(result_response(result)).into_response());
    }

    let config = &state.runtime.config;
    let (tx, rx) = stream::channel(config.stream_buffer, config.stream_policy);
    tokio::spawn(run_streamed(
        state.runtime.clone(),
        instance,
        config.stream_buffer,
        tx,
    ));

    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        rx.into_body(),
    )
        .into_response())
}

async fn run_streamed(runtime: Arc<Runtime>, instance: ExecInstance, buffer: usize, tx: LineSender) {
    let (out_tx, mut out_rx) = mpsc::channel::<ExecOutput>(buffer.max(1));
    let cancel = CancellationToken::new();
    let io = ExecIo {
        output: Some(out_tx),
        cancel: cancel.clone(),
    };

    let exec = runtime.containers.start_exec(&instance.id, io);
    tokio::pin!(exec);

    let result = loop {
        tokio::select! {
            result = &mut exec => break result,
            Some(chunk) = out_rx.recv() => {
                forward_chunk(&instance, &tx, &cancel, chunk).await;
            }
        }
    };

    // Output produced just before exit
    while let Ok(chunk) = out_rx.try_recv() {
        forward_chunk(&instance, &tx, &cancel, chunk).await;
    }

    let last = match result {
        Ok(result) => stream::json_line(&ExecStreamEvent::Exit {
            exit_code: result.exit_code,
        }),
        Err(e) => {
            tracing::warn!(exec = %instance.id, error = %e, "Exec failed");
            stream::json_line(&ErrorMessage::from_error(&e))
        }
    };
    tx.finish(last).await;
}

async fn forward_chunk(
    instance: &ExecInstance,
    tx: &LineSender,
    cancel: &CancellationToken,
    chunk: ExecOutput,
) {
    if cancel.is_cancelled() || !attached(instance, chunk.stream) {
        return;
    }
    let event = ExecStreamEvent::Output {
        stream: chunk.stream.as_str(),
        data: String::from_utf8_lossy(&chunk.data).into_owned(),
    };
    if !tx.send(stream::json_line(&event)).await {
        tracing::info!(exec = %instance.id, "Exec client disconnected, cancelling");
        cancel.cancel();
    }
}

/// Neither attach flag set means both streams.
fn attached(instance: &ExecInstance, stream: LogStream) -> bool {
    if !instance.attach_stdout && !instance.attach_stderr {
        return true;
    }
    match stream {
        LogStream::Stdout => instance.attach_stdout,
        LogStream::Stderr => instance.attach_stderr,
    }
}

fn result_response(result: ExecResult) -> ExecResultResponse {
    ExecResultResponse {
        exit_code: result.exit_code,
        stdout: result.stdout_lossy(),
        stderr: result.stderr_lossy(),
    }
}

pub async fn exec_inspect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ExecInspect>> {
    let instance = state.runtime.containers.inspect_exec(&id)?;
    Ok(Json(ExecInspect {
        id: instance.id,
        running: instance.running,
        exit_code: instance.exit_code,
        container_id: instance.container_id,
    }))
}
