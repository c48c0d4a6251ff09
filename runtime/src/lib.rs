//! Andock Runtime - image pulls, layer storage and container lifecycle.
//!
//! This crate implements everything behind the daemon's HTTP surface:
//! mirror resolution, the registry client, the content-addressed layer
//! store, image assembly, pull coalescing and the sandboxed container
//! lifecycle.

#![allow(clippy::result_large_err)]

pub mod cache;
pub mod container;
pub mod context;
pub mod log;
pub mod metrics;
pub mod mirror;
pub mod monitor;
pub mod oci;
pub mod sandbox;
pub mod state;

// Re-export common types
pub use cache::{LayerMeta, LayerStore};
pub use container::{ContainerManager, CreateRequest, ManagerOptions};
pub use context::{ImageDeleteItem, Runtime, RuntimeParts, SystemInfo};
pub use metrics::RuntimeMetrics;
pub use mirror::{
    MirrorHealth, MirrorManager, MirrorPatch, MirrorResolver, MirrorSource, RegistryEndpoint,
};
pub use monitor::MirrorMonitor;
pub use oci::{
    ImageAssembler, ImageReference, PullEvent, PullHandle, PullOrchestrator, RegistryClient,
    RegistryOptions, SearchPage,
};
pub use sandbox::{ExecIo, FakeSandbox, ProcessSandbox, SandboxBackend, SandboxHandle, SandboxSpec};
pub use state::JsonStore;

/// Andock runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
