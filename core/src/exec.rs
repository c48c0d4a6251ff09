//! Exec request/result types shared by the lifecycle manager and sandbox
//! backends.

use serde::{Deserialize, Serialize};

use crate::log::LogStream;

/// Maximum output size per stream (stdout/stderr): 16 MiB.
pub const MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

/// Command to run inside a running container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Command and arguments (e.g., ["ls", "-la"]).
    pub cmd: Vec<String>,
    /// Additional environment variables (KEY=VALUE pairs).
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory inside the rootfs.
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// Output from an executed command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecResult {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Final status of a sandbox main process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub exit_code: i32,
    /// Terminated by SIGKILL after the grace period elapsed.
    #[serde(default)]
    pub forced: bool,
}

/// A chunk of output from an attached exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stream: LogStream,
    pub data: Vec<u8>,
}

/// A command registered against a container by the two-step exec API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecInstance {
    pub id: String,
    pub container_id: String,
    pub request: ExecRequest,
    #[serde(default)]
    pub attach_stdout: bool,
    #[serde(default)]
    pub attach_stderr: bool,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Append bytes to `buf` without exceeding [`MAX_OUTPUT_BYTES`].
/// Returns false once the cap has been hit.
pub fn append_capped(buf: &mut Vec<u8>, data: &[u8]) -> bool {
    let room = MAX_OUTPUT_BYTES.saturating_sub(buf.len());
    let take = room.min(data.len());
    buf.extend_from_slice(&data[..take]);
    take == data.len()
}
