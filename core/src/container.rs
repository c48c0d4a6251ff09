//! Container record and lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{AndockError, Result};

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Rootfs materialized, never started.
    Created,
    /// Sandbox process alive.
    Running,
    /// Sandbox process suspended.
    Paused,
    /// Stopped on request.
    Stopped,
    /// Process exited on its own or the sandbox failed.
    Exited,
}

/// Requests and observations that move a container between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOp {
    Start,
    Stop,
    Pause,
    Unpause,
    /// Process termination observed.
    Exit,
    Remove,
}

impl LifecycleOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleOp::Start => "start",
            LifecycleOp::Stop => "stop",
            LifecycleOp::Pause => "pause",
            LifecycleOp::Unpause => "unpause",
            LifecycleOp::Exit => "exit",
            LifecycleOp::Remove => "remove",
        }
    }
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Exited => "exited",
        }
    }

    /// Running or paused: a live sandbox handle exists.
    pub fn is_active(&self) -> bool {
        matches!(self, ContainerStatus::Running | ContainerStatus::Paused)
    }

    /// State reached by applying `op`, or `None` if the transition is not
    /// allowed. `Remove` maps to the current state when permitted.
    pub fn next(self, op: LifecycleOp) -> Option<ContainerStatus> {
        use ContainerStatus::*;
        match (self, op) {
            (Created | Stopped | Exited, LifecycleOp::Start) => Some(Running),
            (Running, LifecycleOp::Pause) => Some(Paused),
            (Paused, LifecycleOp::Unpause) => Some(Running),
            (Running, LifecycleOp::Stop) => Some(Stopped),
            (Running | Paused | Stopped, LifecycleOp::Exit) => Some(Exited),
            (Created | Stopped | Exited, LifecycleOp::Remove) => Some(self),
            _ => None,
        }
    }

    /// Check `op` against this state for container `id`.
    ///
    /// # Errors
    ///
    /// `Conflict` for removing an active container, otherwise
    /// `InvalidStateTransition`.
    pub fn check(self, id: &str, op: LifecycleOp) -> Result<ContainerStatus> {
        match self.next(op) {
            Some(next) => Ok(next),
            None if op == LifecycleOp::Remove => Err(AndockError::Conflict(format!(
                "You cannot remove a {} container {}. Stop the container before attempting removal or force remove",
                self.as_str(),
                id
            ))),
            None => Err(AndockError::InvalidStateTransition {
                id: id.to_string(),
                from: self.as_str().to_string(),
                operation: op.as_str(),
            }),
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container record as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// 64 hex chars.
    pub id: String,
    pub name: String,
    /// Image reference as given at create time.
    pub image: String,
    pub image_id: String,
    pub status: ContainerStatus,
    pub rootfs: PathBuf,
    /// Effective argv (entrypoint + cmd).
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub pid: Option<u32>,
}

impl Container {
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    pub fn mark_started(&mut self, pid: Option<u32>) {
        self.status = ContainerStatus::Running;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.exit_code = None;
        self.pid = pid;
    }

    pub fn mark_finished(&mut self, status: ContainerStatus, exit_code: i32) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.exit_code = Some(exit_code);
        self.pid = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_from_created() {
        assert_eq!(
            ContainerStatus::Created.next(LifecycleOp::Start),
            Some(ContainerStatus::Running)
        );
    }

    #[test]
    fn test_start_from_running_rejected() {
        let err = ContainerStatus::Running
            .check("c1", LifecycleOp::Start)
            .unwrap_err();
        assert!(matches!(
            err,
            AndockError::InvalidStateTransition { ref from, operation: "start", .. } if from == "running"
        ));
    }

    #[test]
    fn test_pause_cycle() {
        let paused = ContainerStatus::Running.next(LifecycleOp::Pause).unwrap();
        assert_eq!(paused, ContainerStatus::Paused);
        assert_eq!(paused.next(LifecycleOp::Unpause), Some(ContainerStatus::Running));
        assert_eq!(paused.next(LifecycleOp::Start), None);
        assert_eq!(paused.next(LifecycleOp::Stop), None);
    }

    #[test]
    fn test_stop_only_from_running() {
        assert_eq!(
            ContainerStatus::Running.next(LifecycleOp::Stop),
            Some(ContainerStatus::Stopped)
        );
        assert!(ContainerStatus::Created.check("c", LifecycleOp::Stop).is_err());
        assert!(ContainerStatus::Exited.check("c", LifecycleOp::Stop).is_err());
    }

    #[test]
    fn test_remove_active_is_conflict() {
        for status in [ContainerStatus::Running, ContainerStatus::Paused] {
            let err = status.check("c1", LifecycleOp::Remove).unwrap_err();
            assert!(matches!(err, AndockError::Conflict(_)));
        }
    }

    #[test]
    fn test_remove_allowed_when_inactive() {
        for status in [
            ContainerStatus::Created,
            ContainerStatus::Stopped,
            ContainerStatus::Exited,
        ] {
            assert!(status.check("c1", LifecycleOp::Remove).is_ok());
        }
    }

    #[test]
    fn test_exit_observed() {
        assert_eq!(
            ContainerStatus::Running.next(LifecycleOp::Exit),
            Some(ContainerStatus::Exited)
        );
        assert_eq!(ContainerStatus::Created.next(LifecycleOp::Exit), None);
    }

    #[test]
    fn test_status_serde_lowercase() {
        let json = serde_json::to_string(&ContainerStatus::Paused).unwrap();
        assert_eq!(json, "\"paused\"");
    }
}
