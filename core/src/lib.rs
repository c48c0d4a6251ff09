//! Andock Core - shared types for the andock container daemon.
//!
//! Holds the error taxonomy, daemon configuration, the persisted data
//! model (images, layers, containers, mirrors) and the entity store
//! contract used by the runtime.

pub mod config;
pub mod container;
pub mod digest;
pub mod error;
pub mod exec;
pub mod image;
pub mod log;
pub mod mirror;
pub mod progress;
pub mod store;

// Re-export commonly used types
pub use config::{DaemonConfig, MirrorSeed, SandboxConfig, StreamPolicy};
pub use container::{Container, ContainerStatus, LifecycleOp};
pub use error::{AndockError, Result};
pub use exec::{ExecInstance, ExecOutput, ExecRequest, ExecResult, ProcessResult};
pub use image::{Image, ImageConfig, Layer};
pub use mirror::Mirror;
pub use progress::{LayerStatus, PullProgress};
pub use store::{Entity, EntityStore, MemoryStore};

/// Andock version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Docker engine API version served by the daemon.
pub const API_VERSION: &str = "1.43";

/// Oldest Docker engine API version accepted.
pub const MIN_API_VERSION: &str = "1.24";
