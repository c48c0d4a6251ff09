//! Sandbox backend that runs container processes on the host under a
//! user-space launcher (`proot` by default).
//!
//! Each main process is started in its own process group so stop, pause
//! and resume signal the launcher and everything it spawned.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use andock_core::config::SandboxConfig;
use andock_core::error::{AndockError, Result};
use andock_core::exec::{append_capped, ExecOutput, ExecRequest, ExecResult, ProcessResult};
use andock_core::log::LogStream;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use super::{env_pairs, ExecIo, SandboxBackend, SandboxHandle, SandboxSpec, SANDBOX_FAILURE_EXIT_CODE};

/// Launcher value that runs the argv directly.
pub const DIRECT_LAUNCHER: &str = "none";

/// Lines buffered between the output readers and the log pump.
const OUTPUT_BUFFER: usize = 256;

/// A live main process.
struct Process {
    pid: u32,
    rootfs: PathBuf,
    env: Vec<String>,
    working_dir: String,
    exit: watch::Receiver<Option<i32>>,
    paused: AtomicBool,
}

impl Process {
    fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }
}

pub struct ProcessSandbox {
    config: SandboxConfig,
    processes: DashMap<String, Arc<Process>>,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            processes: DashMap::new(),
        }
    }

    fn is_direct(&self) -> bool {
        self.config.launcher == DIRECT_LAUNCHER
    }

    fn command(
        &self,
        id: &str,
        rootfs: &Path,
        working_dir: &str,
        argv: &[String],
        env: &[String],
    ) -> Result<Command> {
        let (program, rest) = argv.split_first().ok_or_else(|| AndockError::Sandbox {
            id: id.to_string(),
            message: "empty command".to_string(),
        })?;

        let mut cmd = if self.is_direct() {
            let mut cmd = Command::new(program);
            cmd.args(rest).current_dir(rootfs);
            cmd
        } else {
            let mut cmd = Command::new(&self.config.launcher);
            cmd.args(&self.config.extra_args)
                .arg("-0")
                .arg("-r")
                .arg(rootfs)
                .arg("-w")
                .arg(working_dir)
                .args(["-b", "/dev", "-b", "/proc", "-b", "/sys"])
                .args(argv);
            cmd
        };

        cmd.env_clear()
            .envs(env_pairs(env))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        Ok(cmd)
    }

    fn process(&self, handle: &SandboxHandle) -> Result<Arc<Process>> {
        self.processes
            .get(&handle.id)
            .map(|p| p.value().clone())
            .ok_or_else(|| AndockError::Sandbox {
                id: handle.id.clone(),
                message: "no such sandbox".to_string(),
            })
    }

    async fn wait_exit(process: &Process) -> i32 {
        let mut exit = process.exit.clone();
        let code = match exit.wait_for(|code| code.is_some()).await {
            Ok(code) => code.unwrap_or(SANDBOX_FAILURE_EXIT_CODE),
            Err(_) => SANDBOX_FAILURE_EXIT_CODE,
        };
        code
    }
}

#[async_trait]
impl SandboxBackend for ProcessSandbox {
    async fn start_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let mut cmd = self.command(
            &spec.id,
            &spec.rootfs,
            &spec.working_dir,
            &spec.argv,
            &spec.env,
        )?;
        let mut child = cmd.spawn().map_err(|e| AndockError::Sandbox {
            id: spec.id.clone(),
            message: format!("Failed to launch {}: {}", self.config.launcher, e),
        })?;
        let pid = child.id().ok_or_else(|| AndockError::Sandbox {
            id: spec.id.clone(),
            message: "process exited before it could be tracked".to_string(),
        })?;

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, LogStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, LogStream::Stderr, tx.clone()));
        }
        drop(tx);

        let (exit_tx, exit_rx) = watch::channel(None);
        let id = spec.id.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "Failed to wait for sandbox process");
                    SANDBOX_FAILURE_EXIT_CODE
                }
            };
            tracing::debug!(id = %id, pid, code, "Sandbox process exited");
            exit_tx.send_replace(Some(code));
        });

        self.processes.insert(
            spec.id.clone(),
            Arc::new(Process {
                pid,
                rootfs: spec.rootfs.clone(),
                env: spec.env.clone(),
                working_dir: spec.working_dir.clone(),
                exit: exit_rx,
                paused: AtomicBool::new(false),
            }),
        );

        tracing::info!(id = %spec.id, pid, launcher = %self.config.launcher, "Sandbox started");
        Ok(SandboxHandle::new(spec.id.clone(), Some(pid)).with_output(rx))
    }

    async fn exec_in(
        &self,
        handle: &SandboxHandle,
        request: &ExecRequest,
        io: ExecIo,
    ) -> Result<ExecResult> {
        let process = self.process(handle)?;
        if process.exit_code().is_some() {
            return Err(AndockError::Sandbox {
                id: handle.id.clone(),
                message: "main process has exited".to_string(),
            });
        }

        let mut env = process.env.clone();
        env.extend(request.env.iter().cloned());
        let working_dir = request
            .working_dir
            .clone()
            .unwrap_or_else(|| process.working_dir.clone());

        let mut cmd = self.command(&handle.id, &process.rootfs, &working_dir, &request.cmd, &env)?;
        cmd.kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| AndockError::Sandbox {
            id: handle.id.clone(),
            message: format!("Failed to exec {:?}: {}", request.cmd, e),
        })?;
        let exec_pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            let (out, err) = tokio::join!(
                collect(stdout, LogStream::Stdout, io.output.clone()),
                collect(stderr, LogStream::Stderr, io.output.clone()),
            );
            (out, err, child.wait().await)
        };
        let finished = tokio::select! {
            biased;
            _ = io.cancel.cancelled() => None,
            done = run => Some(done),
        };

        let (stdout, stderr, status) = match finished {
            Some(done) => done,
            None => {
                if let Some(pid) = exec_pid {
                    let _ = signal_group(pid, libc::SIGKILL);
                }
                let _ = child.start_kill();
                return Err(AndockError::Cancelled(format!("exec in {}", handle.id)));
            }
        };

        let status = status.map_err(|e| AndockError::Sandbox {
            id: handle.id.clone(),
            message: format!("Failed to wait for exec: {}", e),
        })?;
        Ok(ExecResult {
            exit_code: exit_code(status),
            stdout,
            stderr,
        })
    }

    async fn terminate(&self, handle: &SandboxHandle, grace: Duration) -> Result<ProcessResult> {
        let process = self.process(handle)?;
        if let Some(exit_code) = process.exit_code() {
            return Ok(ProcessResult {
                exit_code,
                forced: false,
            });
        }

        tracing::debug!(id = %handle.id, pid = process.pid, "Sending SIGTERM to sandbox");
        if process.paused.swap(false, Ordering::SeqCst) {
            let _ = signal_group(process.pid, libc::SIGCONT);
        }
        let _ = signal_group(process.pid, libc::SIGTERM);

        if let Ok(exit_code) = tokio::time::timeout(grace, Self::wait_exit(&process)).await {
            return Ok(ProcessResult {
                exit_code,
                forced: false,
            });
        }

        tracing::warn!(id = %handle.id, pid = process.pid, "Sandbox did not exit in time, sending SIGKILL");
        signal_group(process.pid, libc::SIGKILL).map_err(|e| AndockError::Sandbox {
            id: handle.id.clone(),
            message: format!("Failed to kill process group {}: {}", process.pid, e),
        })?;
        Ok(ProcessResult {
            exit_code: Self::wait_exit(&process).await,
            forced: true,
        })
    }

    async fn wait(&self, handle: &SandboxHandle) -> Result<ProcessResult> {
        let process = self.process(handle)?;
        Ok(ProcessResult {
            exit_code: Self::wait_exit(&process).await,
            forced: false,
        })
    }

    async fn pause(&self, handle: &SandboxHandle) -> Result<()> {
        let process = self.process(handle)?;
        signal_group(process.pid, libc::SIGSTOP).map_err(|e| AndockError::Sandbox {
            id: handle.id.clone(),
            message: format!("Failed to pause: {}", e),
        })?;
        process.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self, handle: &SandboxHandle) -> Result<()> {
        let process = self.process(handle)?;
        signal_group(process.pid, libc::SIGCONT).map_err(|e| AndockError::Sandbox {
            id: handle.id.clone(),
            message: format!("Failed to resume: {}", e),
        })?;
        process.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn supports_pause(&self) -> bool {
        true
    }

    async fn release(&self, handle: &SandboxHandle) {
        self.processes.remove(&handle.id);
    }

    fn name(&self) -> &'static str {
        if self.is_direct() {
            "direct"
        } else {
            "proot"
        }
    }
}

/// Shell-style exit code: the status, or 128 + signal.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn signal_group(pid: u32, signal: i32) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(-(pid as i32), signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Forward output line by line. Keeps draining after the receiver is gone
/// so the process never blocks on a full pipe.
async fn forward_lines<R>(reader: R, stream: LogStream, tx: mpsc::Sender<ExecOutput>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut open = true;
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if open {
                    let output = ExecOutput {
                        stream,
                        data: line.clone(),
                    };
                    open = tx.send(output).await.is_ok();
                }
            }
        }
    }
}

/// Read a whole stream, capped, streaming chunks to `tx` as they arrive.
async fn collect<R>(
    reader: Option<R>,
    stream: LogStream,
    tx: Option<mpsc::Sender<ExecOutput>>,
) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let Some(mut reader) = reader else {
        return buf;
    };

    let mut chunk = [0u8; 8192];
    let mut tx = tx;
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        append_capped(&mut buf, &chunk[..n]);
        if let Some(ref sender) = tx {
            let output = ExecOutput {
                stream,
                data: chunk[..n].to_vec(),
            };
            if sender.send(output).await.is_err() {
                tx = None;
            }
        }
    }
    buf
}
