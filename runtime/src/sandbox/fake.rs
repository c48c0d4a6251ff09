//! In-process sandbox that runs nothing. Records calls so tests can check
//! what the lifecycle manager asked for.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use andock_core::error::{AndockError, Result};
use andock_core::exec::{ExecOutput, ExecRequest, ExecResult, ProcessResult};
use andock_core::log::LogStream;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{ExecIo, SandboxBackend, SandboxHandle, SandboxSpec};

/// Exit code a fake process reports after a graceful terminate.
pub const FAKE_TERM_EXIT_CODE: i32 = 143;

struct FakeProcess {
    exit: watch::Sender<Option<i32>>,
    output: Mutex<Option<mpsc::Sender<ExecOutput>>>,
    spec: SandboxSpec,
}

pub struct FakeSandbox {
    processes: DashMap<String, FakeProcess>,
    starts: AtomicUsize,
    execs: AtomicUsize,
    terminates: AtomicUsize,
    fail_start: AtomicBool,
    fail_exec: AtomicBool,
    block_exec: AtomicBool,
    pause_supported: bool,
    exec_result: Mutex<ExecResult>,
}

impl Default for FakeSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self {
            processes: DashMap::new(),
            starts: AtomicUsize::new(0),
            execs: AtomicUsize::new(0),
            terminates: AtomicUsize::new(0),
            fail_start: AtomicBool::new(false),
            fail_exec: AtomicBool::new(false),
            block_exec: AtomicBool::new(false),
            pause_supported: true,
            exec_result: Mutex::new(ExecResult::default()),
        }
    }

    /// A backend whose `supports_pause()` is false.
    pub fn without_pause() -> Self {
        Self {
            pause_supported: false,
            ..Self::new()
        }
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_exec(&self, fail: bool) {
        self.fail_exec.store(fail, Ordering::SeqCst);
    }

    /// Make execs run until their cancel token fires.
    pub fn set_block_exec(&self, block: bool) {
        self.block_exec.store(block, Ordering::SeqCst);
    }

    pub fn set_exec_result(&self, result: ExecResult) {
        *self.exec_result.lock() = result;
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn exec_count(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    pub fn terminate_count(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }

    /// Spec of the last start for `id`.
    pub fn spec(&self, id: &str) -> Option<SandboxSpec> {
        self.processes.get(id).map(|p| p.spec.clone())
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.processes
            .get(id)
            .map_or(false, |p| {
                let running = p.exit.borrow().is_none();
                running
            })
    }

    /// Make the main process of `id` exit on its own.
    pub fn exit(&self, id: &str, code: i32) {
        if let Some(process) = self.processes.get(id) {
            process.exit.send_replace(Some(code));
            process.output.lock().take();
        }
    }

    /// Emit one output line from the main process of `id`.
    pub async fn emit(&self, id: &str, stream: LogStream, line: &str) {
        let sender = self
            .processes
            .get(id)
            .and_then(|p| {
                let sender = p.output.lock().clone();
                sender
            });
        if let Some(sender) = sender {
            let _ = sender
                .send(ExecOutput {
                    stream,
                    data: line.as_bytes().to_vec(),
                })
                .await;
        }
    }

    fn exit_receiver(&self, handle: &SandboxHandle) -> Result<watch::Receiver<Option<i32>>> {
        self.processes
            .get(&handle.id)
            .map(|p| p.exit.subscribe())
            .ok_or_else(|| AndockError::Sandbox {
                id: handle.id.clone(),
                message: "no such sandbox".to_string(),
            })
    }
}

#[async_trait]
impl SandboxBackend for FakeSandbox {
    async fn start_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(AndockError::Sandbox {
                id: spec.id.clone(),
                message: "injected start failure".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(64);
        let (exit, _) = watch::channel(None);
        self.processes.insert(
            spec.id.clone(),
            FakeProcess {
                exit,
                output: Mutex::new(Some(tx)),
                spec: spec.clone(),
            },
        );
        Ok(SandboxHandle::new(spec.id.clone(), None).with_output(rx))
    }

    async fn exec_in(
        &self,
        handle: &SandboxHandle,
        _request: &ExecRequest,
        io: ExecIo,
    ) -> Result<ExecResult> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(AndockError::Sandbox {
                id: handle.id.clone(),
                message: "injected exec failure".to_string(),
            });
        }
        if self.block_exec.load(Ordering::SeqCst) {
            io.cancel.cancelled().await;
        }
        if io.cancel.is_cancelled() {
            return Err(AndockError::Cancelled(format!("exec in {}", handle.id)));
        }

        let result = self.exec_result.lock().clone();
        if let Some(output) = io.output {
            for (stream, data) in [
                (LogStream::Stdout, &result.stdout),
                (LogStream::Stderr, &result.stderr),
            ] {
                if !data.is_empty() {
                    let _ = output
                        .send(ExecOutput {
                            stream,
                            data: data.clone(),
                        })
                        .await;
                }
            }
        }
        Ok(result)
    }

    async fn terminate(&self, handle: &SandboxHandle, _grace: Duration) -> Result<ProcessResult> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        let exit = self.exit_receiver(handle)?;
        let existing = *exit.borrow();
        if let Some(exit_code) = existing {
            return Ok(ProcessResult {
                exit_code,
                forced: false,
            });
        }
        self.exit(&handle.id, FAKE_TERM_EXIT_CODE);
        Ok(ProcessResult {
            exit_code: FAKE_TERM_EXIT_CODE,
            forced: false,
        })
    }

    async fn wait(&self, handle: &SandboxHandle) -> Result<ProcessResult> {
        let mut exit = self.exit_receiver(handle)?;
        let exit_code = match exit.wait_for(|c| c.is_some()).await {
            Ok(code) => code.unwrap_or(super::SANDBOX_FAILURE_EXIT_CODE),
            Err(_) => super::SANDBOX_FAILURE_EXIT_CODE,
        };
        Ok(ProcessResult {
            exit_code,
            forced: false,
        })
    }

    async fn pause(&self, handle: &SandboxHandle) -> Result<()> {
        self.exit_receiver(handle).map(|_| ())
    }

    async fn resume(&self, handle: &SandboxHandle) -> Result<()> {
        self.exit_receiver(handle).map(|_| ())
    }

    fn supports_pause(&self) -> bool {
        self.pause_supported
    }

    async fn release(&self, handle: &SandboxHandle) {
        self.processes.remove(&handle.id);
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}
