//! OCI image handling: references, manifests, the registry client, pulls
//! and image assembly.

pub mod assembler;
pub mod manifest;
pub mod pull;
pub mod reference;
pub mod registry;
pub mod rootfs;

pub use assembler::ImageAssembler;
pub use pull::{PullEvent, PullHandle, PullOrchestrator};
pub use reference::ImageReference;
pub use registry::{RegistryClient, RegistryOptions, ResolvedManifest, SearchPage};
