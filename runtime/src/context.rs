//! The runtime context bundle.
//!
//! Built once at daemon startup and shared with every request handler.
//! Holds the stores, the registry client, the pull orchestrator, the
//! container manager and the metrics registry.

use std::sync::Arc;
use std::time::Duration;

use andock_core::config::DaemonConfig;
use andock_core::container::{Container, ContainerStatus};
use andock_core::error::{AndockError, Result};
use andock_core::image::Image;
use andock_core::mirror::Mirror;
use andock_core::store::EntityStore;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cache::LayerStore;
use crate::container::{ContainerManager, ManagerOptions};
use crate::metrics::RuntimeMetrics;
use crate::mirror::{MirrorManager, MirrorResolver};
use crate::monitor::MirrorMonitor;
use crate::oci::{
    ImageAssembler, ImageReference, PullHandle, PullOrchestrator, RegistryClient, RegistryOptions,
};
use crate::sandbox::{ProcessSandbox, SandboxBackend};
use crate::state::JsonStore;

/// Swappable backends. `Runtime::open` uses JSON-file stores and the
/// process sandbox.
pub struct RuntimeParts {
    pub images: Arc<dyn EntityStore<Image>>,
    pub containers: Arc<dyn EntityStore<Container>>,
    pub mirrors: Arc<dyn EntityStore<Mirror>>,
    pub sandbox: Arc<dyn SandboxBackend>,
}

/// One entry of an image removal report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ImageDeleteItem {
    Untagged(String),
    Deleted(String),
}

/// Daemon-wide counters for `/info`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemInfo {
    pub containers: usize,
    pub containers_running: usize,
    pub containers_paused: usize,
    pub containers_stopped: usize,
    pub images: usize,
    pub driver: String,
    pub docker_root_dir: String,
    pub mirrors: usize,
    pub pulls_in_flight: usize,
}

pub struct Runtime {
    pub config: DaemonConfig,
    pub mirrors: Arc<MirrorManager>,
    pub resolver: Arc<MirrorResolver>,
    pub registry: Arc<RegistryClient>,
    pub images: Arc<ImageAssembler>,
    pub puller: PullOrchestrator,
    pub containers: ContainerManager,
    pub metrics: Arc<RuntimeMetrics>,
    sandbox_name: &'static str,
    /// Stops background tasks when the runtime goes away.
    shutdown: CancellationToken,
}

impl Runtime {
    /// Open the runtime with persistent state under `config.data_dir`.
    pub async fn open(config: DaemonConfig) -> Result<Self> {
        config.validate()?;
        let state = config.state_dir();
        let parts = RuntimeParts {
            images: Arc::new(JsonStore::<Image>::open(&state.join("images"))?),
            containers: Arc::new(JsonStore::<Container>::open(&state.join("containers"))?),
            mirrors: Arc::new(JsonStore::<Mirror>::open(&state.join("mirrors"))?),
            sandbox: Arc::new(ProcessSandbox::new(config.sandbox.clone())),
        };
        Self::with_parts(config, parts).await
    }

    pub async fn with_parts(config: DaemonConfig, parts: RuntimeParts) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(RuntimeMetrics::new()?);

        let mirrors = Arc::new(MirrorManager::new(parts.mirrors));
        mirrors.seed(&config.builtin_mirrors).await?;
        let resolver = Arc::new(MirrorResolver::new(
            mirrors.clone(),
            config.builtin_mirrors.clone(),
        ));

        let registry = Arc::new(RegistryClient::new(RegistryOptions::from_config(&config))?);
        let layers = Arc::new(LayerStore::open(&config.blobs_dir(), &config.layers_dir())?);
        let images = Arc::new(ImageAssembler::new(parts.images, layers));

        let shutdown = CancellationToken::new();
        if config.mirror_check_interval_secs > 0 {
            MirrorMonitor::new(
                resolver.clone(),
                registry.clone(),
                Duration::from_secs(config.mirror_check_interval_secs),
            )
            .start(shutdown.child_token());
        }

        let puller = PullOrchestrator::new(
            registry.clone(),
            resolver.clone(),
            images.clone(),
            metrics.clone(),
            config.max_concurrent_downloads,
            config.stream_buffer,
        );

        let sandbox_name = parts.sandbox.name();
        let containers = ContainerManager::open(
            parts.containers,
            images.clone(),
            parts.sandbox,
            metrics.clone(),
            ManagerOptions {
                containers_dir: config.containers_dir(),
                log: config.log.clone(),
                stop_grace: Duration::from_secs(config.stop_grace_secs),
            },
        )
        .await?;

        tracing::info!(data_dir = %config.data_dir.display(), sandbox = sandbox_name, "Runtime ready");
        Ok(Self {
            config,
            mirrors,
            resolver,
            registry,
            images,
            puller,
            containers,
            metrics,
            sandbox_name,
            shutdown,
        })
    }

    /// Start or join a pull of `from_image[:tag]`.
    pub async fn pull(
        &self,
        from_image: &str,
        tag: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<PullHandle> {
        let reference = ImageReference::from_parts(from_image, tag)?;
        self.puller.pull(&reference, cancel).await
    }

    /// Remove an image, or only one of its tags when it has several and
    /// `name` is one of them.
    ///
    /// Images used by containers need `force`.
    pub async fn remove_image(&self, name: &str, force: bool) -> Result<Vec<ImageDeleteItem>> {
        let _creates = self.containers.lock_images().await;
        let image = self.images.get(name).await?;

        let tag = ImageReference::parse(name)
            .ok()
            .map(|r| r.full_reference())
            .filter(|full| image.has_tag(full));
        if let Some(tag) = tag {
            if image.repo_tags.len() > 1 {
                self.images.untag(&image, &tag).await?;
                return Ok(vec![ImageDeleteItem::Untagged(tag)]);
            }
        }

        let users = self.containers.using_image(&image.id).await?;
        if !users.is_empty() && !force {
            return Err(AndockError::Conflict(format!(
                "unable to remove image {}: image is being used by container {}",
                name,
                users[0].short_id()
            )));
        }

        self.images.remove(&image).await?;
        let mut report: Vec<ImageDeleteItem> = image
            .repo_tags
            .iter()
            .cloned()
            .map(ImageDeleteItem::Untagged)
            .collect();
        report.push(ImageDeleteItem::Deleted(image.id));
        Ok(report)
    }

    pub async fn info(&self) -> Result<SystemInfo> {
        let containers = self.containers.list(true).await?;
        let count = |status: ContainerStatus| containers.iter().filter(|c| c.status == status).count();
        let running = count(ContainerStatus::Running);
        let paused = count(ContainerStatus::Paused);

        Ok(SystemInfo {
            containers: containers.len(),
            containers_running: running,
            containers_paused: paused,
            containers_stopped: containers.len() - running - paused,
            images: self.images.list().await?.len(),
            driver: self.sandbox_name.to_string(),
            docker_root_dir: self.config.data_dir.display().to_string(),
            mirrors: self.mirrors.list().await?.len(),
            pulls_in_flight: self.puller.in_flight(),
        })
    }

    pub fn render_metrics(&self) -> Result<String> {
        self.metrics.render()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
