//! Container lifecycle: records, rootfs, sandbox handles and exec.

pub mod manager;
pub mod names;

pub use manager::{ContainerManager, CreateRequest, ManagerOptions};
