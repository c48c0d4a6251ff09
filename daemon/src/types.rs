//! Docker engine API wire types.
//!
//! Field names follow the engine API (PascalCase) except for the mirror
//! endpoints, which are andock-specific and use snake_case.

use std::collections::HashMap;

use andock_core::container::Container;
use andock_core::error::AndockError;
use andock_core::image::{Image, ImageConfig};
use andock_core::mirror::Mirror;
use andock_core::progress::PullProgress;
use andock_runtime::{MirrorHealth, SearchPage, SystemInfo};
use serde::{Deserialize, Serialize};

/// Version response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionResponse {
    pub version: String,
    pub api_version: String,
    #[serde(rename = "MinAPIVersion")]
    pub min_api_version: String,
    pub os: String,
    pub arch: String,
    pub kernel_version: String,
}

/// System info response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InfoResponse {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub server_version: String,
    pub operating_system: String,
    #[serde(rename = "OSType")]
    pub os_type: String,
    pub architecture: String,
    #[serde(flatten)]
    pub system: SystemInfo,
}

/// Image list entry.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub created: i64,
    pub size: u64,
    pub labels: HashMap<String, String>,
}

impl From<&Image> for ImageSummary {
    fn from(image: &Image) -> Self {
        Self {
            id: image.id.clone(),
            repo_tags: image.repo_tags.clone(),
            created: image.created.timestamp(),
            size: image.size,
            labels: image.config.labels.clone(),
        }
    }
}

/// Image inspect response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageInspect {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub created: String,
    pub size: u64,
    pub architecture: String,
    pub os: String,
    pub config: ImageConfig,
    #[serde(rename = "RootFS")]
    pub root_fs: RootFs,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RootFs {
    #[serde(rename = "Type")]
    pub kind: String,
    pub layers: Vec<String>,
}

impl From<Image> for ImageInspect {
    fn from(image: Image) -> Self {
        Self {
            created: image.created.to_rfc3339(),
            root_fs: RootFs {
                kind: "layers".to_string(),
                layers: image.layers,
            },
            id: image.id,
            repo_tags: image.repo_tags,
            size: image.size,
            architecture: image.architecture,
            os: image.os,
            config: image.config,
        }
    }
}

/// One page of search results, with the hub's paging links kept.
#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub count: u64,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub results: Vec<SearchResponseItem>,
}

impl From<SearchPage> for SearchResponse {
    fn from(page: SearchPage) -> Self {
        Self {
            count: page.count,
            next: page.next,
            previous: page.previous,
            results: page
                .results
                .into_iter()
                .map(|r| SearchResponseItem {
                    name: r.repo_name,
                    description: r.short_description,
                    star_count: r.star_count,
                    is_official: r.is_official,
                    is_automated: r.is_automated,
                })
                .collect(),
        }
    }
}

/// Search result in the engine API shape.
#[derive(Debug, Serialize)]
pub struct SearchResponseItem {
    pub name: String,
    pub description: String,
    pub star_count: u64,
    pub is_official: bool,
    pub is_automated: bool,
}

/// Create container request body.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreateRequest {
    pub image: String,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// Create container response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreateResponse {
    pub id: String,
    pub warnings: Vec<String>,
}

/// Container list entry.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    #[serde(rename = "ImageID")]
    pub image_id: String,
    pub command: String,
    pub created: i64,
    pub state: String,
    pub status: String,
}

impl From<&Container> for ContainerSummary {
    fn from(c: &Container) -> Self {
        Self {
            id: c.id.clone(),
            names: vec![format!("/{}", c.name)],
            image: c.image.clone(),
            image_id: c.image_id.clone(),
            command: c.command.join(" "),
            created: c.created.timestamp(),
            state: c.status.as_str().to_string(),
            status: status_line(c),
        }
    }
}

/// Human status column (`Up 5 minutes`, `Exited (0) 2 hours ago`).
fn status_line(c: &Container) -> String {
    use andock_core::container::ContainerStatus::*;
    let now = chrono::Utc::now();
    let ago = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| humanize(now - t)).unwrap_or_default()
    };
    match c.status {
        Created => "Created".to_string(),
        Running => format!("Up {}", ago(c.started_at)),
        Paused => format!("Up {} (Paused)", ago(c.started_at)),
        Stopped | Exited => format!(
            "Exited ({}) {} ago",
            c.exit_code.unwrap_or(0),
            ago(c.finished_at)
        ),
    }
}

fn humanize(elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    match secs {
        0..=1 => "Less than a second".to_string(),
        2..=59 => format!("{} seconds", secs),
        60..=3599 => format!("{} minutes", secs / 60),
        3600..=86_399 => format!("{} hours", secs / 3600),
        _ => format!("{} days", secs / 86_400),
    }
}

/// Container inspect response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    pub image: String,
    pub created: String,
    pub path: String,
    pub args: Vec<String>,
    pub state: ContainerState,
    pub config: ContainerConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    pub status: String,
    pub running: bool,
    pub paused: bool,
    pub pid: u32,
    pub exit_code: i32,
    pub started_at: String,
    pub finished_at: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
}

/// Docker's zero time, used for timestamps that never happened.
const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

impl From<Container> for ContainerInspect {
    fn from(c: Container) -> Self {
        use andock_core::container::ContainerStatus;
        let stamp = |t: Option<chrono::DateTime<chrono::Utc>>| {
            t.map(|t| t.to_rfc3339()).unwrap_or_else(|| ZERO_TIME.to_string())
        };
        Self {
            id: c.id.clone(),
            name: format!("/{}", c.name),
            image: c.image_id.clone(),
            created: c.created.to_rfc3339(),
            path: c.command.first().cloned().unwrap_or_default(),
            args: c.command.iter().skip(1).cloned().collect(),
            state: ContainerState {
                status: c.status.as_str().to_string(),
                running: c.status == ContainerStatus::Running,
                paused: c.status == ContainerStatus::Paused,
                pid: c.pid.unwrap_or(0),
                exit_code: c.exit_code.unwrap_or(0),
                started_at: stamp(c.started_at),
                finished_at: stamp(c.finished_at),
            },
            config: ContainerConfig {
                image: c.image,
                cmd: c.command,
                env: c.env,
                working_dir: c.working_dir,
            },
        }
    }
}

/// Wait response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitResponse {
    pub status_code: i32,
}

/// Create exec request body.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecCreateRequest {
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub attach_stdout: bool,
    #[serde(default)]
    pub attach_stderr: bool,
}

/// `{Id}` response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdResponse {
    pub id: String,
}

/// Start exec request body.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecStartRequest {
    #[serde(default)]
    pub detach: bool,
}

/// Exec result returned by a detached start.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecResultResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Exec inspect response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecInspect {
    #[serde(rename = "ID")]
    pub id: String,
    pub running: bool,
    pub exit_code: Option<i32>,
    #[serde(rename = "ContainerID")]
    pub container_id: String,
}

/// One line of a streamed exec.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ExecStreamEvent {
    Output { stream: &'static str, data: String },
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
}

/// Pull progress line.
#[derive(Debug, Default, Serialize)]
pub struct ProgressMessage {
    pub status: String,
    #[serde(rename = "progressDetail", skip_serializing_if = "Option::is_none")]
    pub progress_detail: Option<ProgressDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProgressDetail {
    pub current: u64,
    pub total: u64,
}

impl ProgressMessage {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Default::default()
        }
    }
}

impl From<&PullProgress> for ProgressMessage {
    fn from(p: &PullProgress) -> Self {
        Self {
            status: p.status.docker_status().to_string(),
            progress_detail: Some(ProgressDetail {
                current: p.current,
                total: p.total,
            }),
            id: Some(p.short_digest().to_string()),
        }
    }
}

/// Terminal error line of a stream.
#[derive(Debug, Serialize)]
pub struct ErrorMessage {
    #[serde(rename = "errorDetail")]
    pub error_detail: ErrorDetail,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub kind: &'static str,
    pub message: String,
}

impl ErrorMessage {
    pub fn from_error(error: &AndockError) -> Self {
        let message = error.to_string();
        Self {
            error_detail: ErrorDetail {
                kind: error.kind(),
                message: message.clone(),
            },
            error: message,
        }
    }
}

/// A stored mirror with its latest health check.
#[derive(Debug, Serialize)]
pub struct MirrorView {
    #[serde(flatten)]
    pub mirror: Mirror,
    pub health: MirrorHealth,
}

/// Add mirror request body.
#[derive(Debug, Deserialize)]
pub struct MirrorAddRequest {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}
