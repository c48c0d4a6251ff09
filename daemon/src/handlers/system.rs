//! `/_ping`, `/version`, `/info` and `/metrics`.

use andock_core::{API_VERSION, MIN_API_VERSION, VERSION};
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;

use crate::api::AppState;
use crate::error::ApiResult;
use crate::types::{InfoResponse, VersionResponse};

pub async fn ping() -> &'static str {
    "OK"
}

pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: VERSION.to_string(),
        api_version: API_VERSION.to_string(),
        min_api_version: MIN_API_VERSION.to_string(),
        os: std::env::consts::OS.to_string(),
        arch: go_arch(std::env::consts::ARCH).to_string(),
        kernel_version: kernel_version(),
    })
}

pub async fn info(State(state): State<AppState>) -> ApiResult<Json<InfoResponse>> {
    let system = state.runtime.info().await?;
    Ok(Json(InfoResponse {
        id: "andock".to_string(),
        name: hostname(),
        server_version: VERSION.to_string(),
        operating_system: std::env::consts::OS.to_string(),
        os_type: std::env::consts::OS.to_string(),
        architecture: go_arch(std::env::consts::ARCH).to_string(),
        system,
    }))
}

pub async fn metrics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let body = state.runtime.render_metrics()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

/// Docker reports architectures with Go names.
fn go_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

fn kernel_version() -> String {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "andock".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_go_arch() {
        assert_eq!(go_arch("x86_64"), "amd64");
        assert_eq!(go_arch("aarch64"), "arm64");
        assert_eq!(go_arch("riscv64"), "riscv64");
    }
}
