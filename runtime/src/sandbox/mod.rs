//! Sandbox backends - where container processes actually run.
//!
//! The lifecycle manager only talks to [`SandboxBackend`]. The shipped
//! backend is [`ProcessSandbox`], which runs the container command under a
//! user-space launcher. [`FakeSandbox`] records calls for tests.

pub mod fake;
pub mod process;

use std::path::PathBuf;
use std::time::Duration;

use andock_core::error::Result;
use andock_core::exec::{ExecOutput, ExecRequest, ExecResult, ProcessResult};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use fake::FakeSandbox;
pub use process::ProcessSandbox;

/// Exit code reported when the sandbox itself failed.
pub const SANDBOX_FAILURE_EXIT_CODE: i32 = 128;

/// Everything a backend needs to launch a container's main process.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub id: String,
    pub rootfs: PathBuf,
    /// Effective argv (entrypoint + cmd).
    pub argv: Vec<String>,
    /// KEY=VALUE pairs.
    pub env: Vec<String>,
    pub working_dir: String,
}

/// A started sandbox.
///
/// `output` carries the main process's stdout/stderr lines until the
/// process exits. The lifecycle manager takes it once to feed the log pump.
#[derive(Debug)]
pub struct SandboxHandle {
    pub id: String,
    pub pid: Option<u32>,
    output: Option<mpsc::Receiver<ExecOutput>>,
}

impl SandboxHandle {
    pub fn new(id: impl Into<String>, pid: Option<u32>) -> Self {
        Self {
            id: id.into(),
            pid,
            output: None,
        }
    }

    pub fn with_output(mut self, output: mpsc::Receiver<ExecOutput>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn take_output(&mut self) -> Option<mpsc::Receiver<ExecOutput>> {
        self.output.take()
    }
}

/// Streaming and cancellation for one exec.
#[derive(Debug, Clone, Default)]
pub struct ExecIo {
    /// Receives output chunks as they are produced.
    pub output: Option<mpsc::Sender<ExecOutput>>,
    pub cancel: CancellationToken,
}

/// A place to run container processes.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Launch the main process.
    async fn start_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle>;

    /// Run an additional command next to the main process.
    async fn exec_in(
        &self,
        handle: &SandboxHandle,
        request: &ExecRequest,
        io: ExecIo,
    ) -> Result<ExecResult>;

    /// Ask the main process to stop, force it after `grace`.
    async fn terminate(&self, handle: &SandboxHandle, grace: Duration) -> Result<ProcessResult>;

    /// Wait for the main process to exit on its own.
    async fn wait(&self, handle: &SandboxHandle) -> Result<ProcessResult>;

    async fn pause(&self, handle: &SandboxHandle) -> Result<()>;

    async fn resume(&self, handle: &SandboxHandle) -> Result<()>;

    fn supports_pause(&self) -> bool;

    /// Forget a handle whose process has exited.
    async fn release(&self, _handle: &SandboxHandle) {}

    fn name(&self) -> &'static str;
}

/// Split `KEY=VALUE` pairs; entries without `=` get an empty value.
pub(crate) fn env_pairs(env: &[String]) -> impl Iterator<Item = (&str, &str)> {
    env.iter()
        .map(|kv| kv.split_once('=').unwrap_or((kv.as_str(), "")))
        .filter(|(k, _)| !k.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_pairs() {
        let env = vec![
            "PATH=/bin".to_string(),
            "EMPTY=".to_string(),
            "BARE".to_string(),
            "=nokey".to_string(),
            "A=b=c".to_string(),
        ];
        let pairs: Vec<(&str, &str)> = env_pairs(&env).collect();
        assert_eq!(
            pairs,
            vec![("PATH", "/bin"), ("EMPTY", ""), ("BARE", ""), ("A", "b=c")]
        );
    }

    #[test]
    fn test_handle_output_taken_once() {
        let (_tx, rx) = mpsc::channel(1);
        let mut handle = SandboxHandle::new("c1", Some(42)).with_output(rx);
        assert!(handle.take_output().is_some());
        assert!(handle.take_output().is_none());
        assert_eq!(handle.pid, Some(42));
    }
}
