//! Container lifecycle manager.
//!
//! Owns container records, their rootfs directories and the live sandbox
//! handles. Operations on one container are serialized through its slot;
//! different containers proceed in parallel.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use andock_core::container::{Container, ContainerStatus, LifecycleOp};
use andock_core::error::{AndockError, Result};
use andock_core::exec::{ExecInstance, ExecRequest, ExecResult};
use andock_core::log::{LogConfig, LogEntry};
use andock_core::store::EntityStore;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{watch, Mutex, RwLock, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

use super::names::{generate_id, generate_name, validate_name};
use crate::cache::layer_store::remove_tree;
use crate::log::{json_log_path, read_logs, spawn_log_pump};
use crate::metrics::RuntimeMetrics;
use crate::oci::assembler::ImageAssembler;
use crate::oci::rootfs::RootfsBuilder;
use crate::sandbox::{ExecIo, SandboxBackend, SandboxHandle, SandboxSpec, SANDBOX_FAILURE_EXIT_CODE};

/// PATH given to containers whose image sets none.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Parameters of `create`. `None` fields fall back to the image config.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    /// Image id, full reference or short reference.
    pub image: String,
    pub name: Option<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub containers_dir: PathBuf,
    pub log: LogConfig,
    pub stop_grace: Duration,
}

/// Per-container serialization point and live handle.
struct Slot {
    state: Mutex<SlotState>,
    status: watch::Sender<ContainerStatus>,
}

impl Slot {
    fn new(status: ContainerStatus) -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            status: watch::channel(status).0,
        }
    }
}

#[derive(Default)]
struct SlotState {
    handle: Option<Arc<SandboxHandle>>,
    /// Bumped whenever the handle changes so a stale exit watcher backs off.
    generation: u64,
    /// Cancelled when the sandbox goes away; every exec runs under a child.
    execs: CancellationToken,
}

impl SlotState {
    /// Drop the live handle and cut off execs running against it.
    fn detach(&mut self) -> Option<Arc<SandboxHandle>> {
        self.generation += 1;
        self.execs.cancel();
        self.handle.take()
    }
}

pub struct ContainerManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    store: Arc<dyn EntityStore<Container>>,
    images: Arc<ImageAssembler>,
    sandbox: Arc<dyn SandboxBackend>,
    metrics: Arc<RuntimeMetrics>,
    options: ManagerOptions,
    slots: DashMap<String, Arc<Slot>>,
    execs: DashMap<String, ExecInstance>,
    /// Held across the name check and the reservation only.
    naming: Mutex<()>,
    /// Names claimed by creates that have not stored their record yet.
    reserved: parking_lot::Mutex<HashSet<String>>,
    /// Shared by creates from image lookup to record insert, exclusive for
    /// image removal.
    image_use: RwLock<()>,
}

/// A claimed container name, released on drop.
struct NameReservation<'a> {
    reserved: &'a parking_lot::Mutex<HashSet<String>>,
    name: String,
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        self.reserved.lock().remove(&self.name);
    }
}

impl ContainerManager {
    /// Load persisted containers. Anything recorded as running or paused
    /// lost its process with the previous daemon and is marked exited.
    pub async fn open(
        store: Arc<dyn EntityStore<Container>>,
        images: Arc<ImageAssembler>,
        sandbox: Arc<dyn SandboxBackend>,
        metrics: Arc<RuntimeMetrics>,
        options: ManagerOptions,
    ) -> Result<Self> {
        std::fs::create_dir_all(&options.containers_dir).map_err(|e| {
            AndockError::Disk(format!(
                "Failed to create {}: {}",
                options.containers_dir.display(),
                e
            ))
        })?;

        let inner = Arc::new(ManagerInner {
            store,
            images,
            sandbox,
            metrics,
            options,
            slots: DashMap::new(),
            execs: DashMap::new(),
            naming: Mutex::new(()),
            reserved: parking_lot::Mutex::new(HashSet::new()),
            image_use: RwLock::new(()),
        });

        let mut containers = inner.store.list().await?;
        for container in &mut containers {
            if container.status.is_active() {
                tracing::warn!(id = %container.id, status = %container.status, "Container did not survive daemon restart, marking exited");
                container.mark_finished(ContainerStatus::Exited, SANDBOX_FAILURE_EXIT_CODE);
                inner.store.put(container).await?;
            }
            inner
                .slots
                .insert(container.id.clone(), Arc::new(Slot::new(container.status)));
        }
        inner.metrics.set_containers(&containers);

        tracing::info!(count = containers.len(), backend = inner.sandbox.name(), "Container manager ready");
        Ok(Self { inner })
    }

    /// Materialize a rootfs for `request.image` and record a Created
    /// container.
    pub async fn create(&self, request: CreateRequest) -> Result<Container> {
        let inner = &self.inner;
        let _image_use = inner.image_use.read().await;
        let image = inner.images.get(&request.image).await?;

        let mut layers = Vec::with_capacity(image.layers.len());
        for digest in &image.layers {
            let meta = inner
                .images
                .layers()
                .get(digest)?
                .ok_or_else(|| AndockError::not_found("layer", digest.clone()))?;
            layers.push(meta);
        }

        let reservation = inner.reserve_name(request.name.as_deref()).await?;
        let name = reservation.name.clone();

        let id = generate_id();
        let dir = inner.options.containers_dir.join(&id);
        let rootfs = dir.join("rootfs");

        let builder = RootfsBuilder::new(rootfs.clone());
        let built = tokio::task::spawn_blocking(move || builder.build(&layers))
            .await
            .map_err(|e| AndockError::Disk(format!("Rootfs task failed: {}", e)))
            .and_then(|r| r);
        if let Err(e) = built {
            let _ = remove_tree(&dir);
            return Err(e);
        }

        let config = &image.config;
        let mut command = request
            .entrypoint
            .or_else(|| config.entrypoint.clone())
            .unwrap_or_default();
        command.extend(request.cmd.or_else(|| config.cmd.clone()).unwrap_or_default());
        if command.is_empty() {
            command.push("/bin/sh".to_string());
        }

        let short_id = id[..12].to_string();
        let env = container_env(&config.env, &request.env, &short_id);
        let working_dir = request
            .working_dir
            .filter(|w| !w.is_empty())
            .or_else(|| config.working_dir.clone().filter(|w| !w.is_empty()))
            .unwrap_or_else(|| "/".to_string());

        let container = Container {
            id: id.clone(),
            name,
            image: request.image,
            image_id: image.id,
            status: ContainerStatus::Created,
            rootfs,
            command,
            env,
            working_dir,
            created: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            pid: None,
        };

        if let Err(e) = inner.store.put(&container).await {
            let _ = remove_tree(&dir);
            return Err(e);
        }
        drop(reservation);
        inner
            .slots
            .insert(id.clone(), Arc::new(Slot::new(ContainerStatus::Created)));
        inner.refresh_metrics().await;

        tracing::info!(id = %id, name = %container.name, image = %container.image, "Container created");
        Ok(container)
    }

    /// Launch the sandbox. Allowed from Created, Stopped and Exited.
    pub async fn start(&self, name: &str) -> Result<Container> {
        let inner = &self.inner;
        let id = self.resolve(name).await?.id;
        let slot = inner.slot(&id, ContainerStatus::Created);
        let mut state = slot.state.lock().await;
        let mut container = inner.load(&id).await?;
        container.status.check(&id, LifecycleOp::Start)?;

        let spec = SandboxSpec {
            id: id.clone(),
            rootfs: container.rootfs.clone(),
            argv: container.command.clone(),
            env: container.env.clone(),
            working_dir: container.working_dir.clone(),
        };

        let mut handle = match inner.sandbox.start_sandbox(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Sandbox failed to start");
                container.mark_finished(ContainerStatus::Exited, SANDBOX_FAILURE_EXIT_CODE);
                inner.persist(&slot, &container).await?;
                return Err(e);
            }
        };

        if let Some(output) = handle.take_output() {
            let log_path = json_log_path(&inner.options.containers_dir.join(&id), &id);
            spawn_log_pump(output, log_path, inner.options.log.clone());
        }

        container.mark_started(handle.pid);
        let handle = Arc::new(handle);
        state.generation += 1;
        state.handle = Some(handle.clone());
        state.execs = CancellationToken::new();
        let generation = state.generation;
        inner.persist(&slot, &container).await?;

        tokio::spawn(ManagerInner::watch_exit(
            inner.clone(),
            id.clone(),
            generation,
            handle,
        ));

        tracing::info!(id = %id, pid = ?container.pid, "Container started");
        Ok(container)
    }

    /// Graceful stop: SIGTERM, wait `timeout` (or the configured grace),
    /// then force.
    pub async fn stop(&self, name: &str, timeout: Option<Duration>) -> Result<Container> {
        let inner = &self.inner;
        let id = self.resolve(name).await?.id;
        let slot = inner.slot(&id, ContainerStatus::Created);
        let mut state = slot.state.lock().await;
        let mut container = inner.load(&id).await?;
        container.status.check(&id, LifecycleOp::Stop)?;

        let grace = timeout.unwrap_or(inner.options.stop_grace);
        let outcome = match state.detach() {
            Some(handle) => {
                let result = inner.sandbox.terminate(&handle, grace).await;
                inner.sandbox.release(&handle).await;
                result
            }
            None => Err(AndockError::Sandbox {
                id: id.clone(),
                message: "no live sandbox for running container".to_string(),
            }),
        };

        inner.finish_execs(&id);
        match outcome {
            Ok(result) => {
                container.mark_finished(ContainerStatus::Stopped, result.exit_code);
                inner.persist(&slot, &container).await?;
                tracing::info!(id = %id, exit_code = result.exit_code, forced = result.forced, "Container stopped");
                Ok(container)
            }
            Err(e) => {
                container.mark_finished(ContainerStatus::Exited, SANDBOX_FAILURE_EXIT_CODE);
                inner.persist(&slot, &container).await?;
                Err(e)
            }
        }
    }

    /// Suspend the sandbox. Fails with a Sandbox error, leaving the
    /// container running, when the backend cannot pause.
    pub async fn pause(&self, name: &str) -> Result<Container> {
        self.suspend(name, LifecycleOp::Pause).await
    }

    pub async fn unpause(&self, name: &str) -> Result<Container> {
        self.suspend(name, LifecycleOp::Unpause).await
    }

    async fn suspend(&self, name: &str, op: LifecycleOp) -> Result<Container> {
        let inner = &self.inner;
        let id = self.resolve(name).await?.id;
        let slot = inner.slot(&id, ContainerStatus::Created);
        let state = slot.state.lock().await;
        let mut container = inner.load(&id).await?;
        let next = container.status.check(&id, op)?;

        if !inner.sandbox.supports_pause() {
            return Err(AndockError::Sandbox {
                id,
                message: "pause not supported".to_string(),
            });
        }
        let handle = state.handle.clone().ok_or_else(|| AndockError::Sandbox {
            id: id.clone(),
            message: "no live sandbox".to_string(),
        })?;
        match op {
            LifecycleOp::Pause => inner.sandbox.pause(&handle).await?,
            _ => inner.sandbox.resume(&handle).await?,
        }

        container.status = next;
        inner.persist(&slot, &container).await?;
        tracing::info!(id = %id, status = %next, "Container {}d", op.as_str());
        Ok(container)
    }

    /// Delete a container and its rootfs. Running or paused containers
    /// need `force`, which kills them first.
    pub async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let inner = &self.inner;
        let id = self.resolve(name).await?.id;
        let slot = inner.slot(&id, ContainerStatus::Created);
        let mut state = slot.state.lock().await;
        let container = inner.load(&id).await?;

        if !(force && container.status.is_active()) {
            container.status.check(&id, LifecycleOp::Remove)?;
        }
        if let Some(handle) = state.detach() {
            if let Err(e) = inner.sandbox.terminate(&handle, Duration::ZERO).await {
                tracing::warn!(id = %id, error = %e, "Failed to kill sandbox during forced remove");
            }
            inner.sandbox.release(&handle).await;
        }

        let dir = inner.options.containers_dir.join(&id);
        tokio::task::spawn_blocking(move || remove_tree(&dir))
            .await
            .map_err(|e| AndockError::Disk(format!("Remove task failed: {}", e)))??;
        inner.store.delete(&id).await?;

        slot.status.send_replace(ContainerStatus::Exited);
        drop(state);
        inner.slots.remove(&id);
        inner.execs.retain(|_, exec| exec.container_id != id);
        inner.refresh_metrics().await;

        tracing::info!(id = %id, name = %container.name, "Container removed");
        Ok(())
    }

    /// Run a command in a running container. Never changes its status
    /// unless the sandbox itself fails.
    pub async fn exec(&self, name: &str, request: &ExecRequest, io: ExecIo) -> Result<ExecResult> {
        let inner = &self.inner;
        if request.cmd.is_empty() {
            return Err(AndockError::InvalidRequest("exec command is empty".to_string()));
        }

        let id = self.resolve(name).await?.id;
        let slot = inner.slot(&id, ContainerStatus::Created);
        let (handle, cancel) = {
            let state = slot.state.lock().await;
            let container = inner.load(&id).await?;
            ensure_running(&container)?;
            let handle = state.handle.clone().ok_or_else(|| AndockError::Sandbox {
                id: id.clone(),
                message: "no live sandbox".to_string(),
            })?;
            (handle, state.execs.child_token())
        };

        inner.metrics.record_exec();
        tracing::debug!(id = %id, cmd = ?request.cmd, "Exec");
        let caller = io.cancel.clone();
        let io = ExecIo {
            output: io.output,
            cancel: cancel.clone(),
        };
        let run = inner.sandbox.exec_in(&handle, request, io);
        tokio::pin!(run);
        let result = tokio::select! {
            result = &mut run => result,
            _ = caller.cancelled() => {
                cancel.cancel();
                run.await
            }
        };
        match result {
            Err(e @ AndockError::Sandbox { .. }) => {
                inner.sandbox_failed(&id, &handle).await;
                Err(e)
            }
            other => other,
        }
    }

    /// Register a command for a later [`start_exec`](Self::start_exec).
    pub async fn create_exec(
        &self,
        name: &str,
        request: ExecRequest,
        attach_stdout: bool,
        attach_stderr: bool,
    ) -> Result<ExecInstance> {
        if request.cmd.is_empty() {
            return Err(AndockError::InvalidRequest("exec command is empty".to_string()));
        }
        let container = self.resolve(name).await?;
        ensure_running(&container)?;

        let instance = ExecInstance {
            id: generate_id(),
            container_id: container.id,
            request,
            attach_stdout,
            attach_stderr,
            running: false,
            exit_code: None,
        };
        self.inner
            .execs
            .insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    pub fn inspect_exec(&self, exec_id: &str) -> Result<ExecInstance> {
        self.inner
            .execs
            .get(exec_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| AndockError::not_found("exec instance", exec_id))
    }

    pub async fn start_exec(&self, exec_id: &str, io: ExecIo) -> Result<ExecResult> {
        let instance = {
            let mut entry = self
                .inner
                .execs
                .get_mut(exec_id)
                .ok_or_else(|| AndockError::not_found("exec instance", exec_id))?;
            if entry.running {
                return Err(AndockError::Conflict(format!(
                    "Exec instance {} is already running",
                    exec_id
                )));
            }
            entry.running = true;
            entry.clone()
        };

        let result = self
            .exec(&instance.container_id, &instance.request, io)
            .await;

        if let Some(mut entry) = self.inner.execs.get_mut(exec_id) {
            entry.running = false;
            entry.exit_code = result.as_ref().ok().map(|r| r.exit_code);
        }
        result
    }

    /// Log entries of the main process, oldest first.
    pub async fn logs(&self, name: &str, tail: Option<usize>) -> Result<Vec<LogEntry>> {
        let id = self.resolve(name).await?.id;
        let path = json_log_path(&self.inner.options.containers_dir.join(&id), &id);
        let max_file = self.inner.options.log.max_file();
        tokio::task::spawn_blocking(move || read_logs(&path, max_file, tail))
            .await
            .map_err(|e| AndockError::Disk(format!("Log read task failed: {}", e)))?
    }

    /// Wait until the container is neither running nor paused. Returns the
    /// recorded exit code.
    pub async fn wait(&self, name: &str) -> Result<i32> {
        let container = self.resolve(name).await?;
        let slot = self.inner.slot(&container.id, container.status);
        let mut status = slot.status.subscribe();
        let _ = status.wait_for(|s| !s.is_active()).await;

        let container = self.inner.load(&container.id).await?;
        Ok(container.exit_code.unwrap_or(0))
    }

    pub async fn inspect(&self, name: &str) -> Result<Container> {
        self.resolve(name).await
    }

    /// All containers, or only running and paused ones. Newest first.
    pub async fn list(&self, all: bool) -> Result<Vec<Container>> {
        let mut containers: Vec<Container> = self
            .inner
            .store
            .list()
            .await?
            .into_iter()
            .filter(|c| all || c.status.is_active())
            .collect();
        containers.sort_by(|a, b| b.created.cmp(&a.created).then(a.id.cmp(&b.id)));
        Ok(containers)
    }

    /// Blocks new creates until dropped. Image removal holds this across
    /// its in-use check and the delete.
    pub async fn lock_images(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.image_use.write().await
    }

    /// Containers created from `image_id`.
    pub async fn using_image(&self, image_id: &str) -> Result<Vec<Container>> {
        Ok(self
            .inner
            .store
            .list()
            .await?
            .into_iter()
            .filter(|c| c.image_id == image_id)
            .collect())
    }

    /// Look up by full id, name, or unique id prefix.
    pub async fn resolve(&self, name: &str) -> Result<Container> {
        let name = name.strip_prefix('/').unwrap_or(name);
        if name.is_empty() {
            return Err(AndockError::not_found("container", name));
        }
        if let Some(container) = self.inner.store.get(name).await? {
            return Ok(container);
        }

        let containers = self.inner.store.list().await?;
        if let Some(container) = containers.iter().find(|c| c.name == name) {
            return Ok(container.clone());
        }

        let matches: Vec<&Container> = containers
            .iter()
            .filter(|c| c.id.starts_with(name))
            .collect();
        match matches.len() {
            0 => Err(AndockError::not_found("container", name)),
            1 => Ok(matches[0].clone()),
            _ => Err(AndockError::InvalidRequest(format!(
                "Multiple containers match id prefix {}",
                name
            ))),
        }
    }
}

impl ManagerInner {
    /// Validate or generate a name and claim it until the record is stored.
    async fn reserve_name(&self, requested: Option<&str>) -> Result<NameReservation<'_>> {
        let _naming = self.naming.lock().await;
        let existing = self.store.list().await?;
        let mut reserved = self.reserved.lock();
        let taken = |name: &str| existing.iter().any(|c| c.name == name) || reserved.contains(name);

        let name = match requested.filter(|n| !n.is_empty()) {
            Some(requested) => {
                let name = validate_name(requested)?;
                if taken(name.as_str()) {
                    return Err(AndockError::Conflict(format!(
                        "The container name \"/{}\" is already in use",
                        name
                    )));
                }
                name
            }
            None => unique_name(taken),
        };
        reserved.insert(name.clone());
        Ok(NameReservation {
            reserved: &self.reserved,
            name,
        })
    }

    /// Running execs of `id` lost their sandbox.
    fn finish_execs(&self, id: &str) {
        for mut exec in self.execs.iter_mut() {
            if exec.container_id == id && exec.running {
                exec.running = false;
            }
        }
    }

    fn slot(&self, id: &str, status: ContainerStatus) -> Arc<Slot> {
        self.slots
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Slot::new(status)))
            .clone()
    }

    async fn load(&self, id: &str) -> Result<Container> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AndockError::not_found("container", id))
    }

    async fn persist(&self, slot: &Slot, container: &Container) -> Result<()> {
        self.store.put(container).await?;
        slot.status.send_replace(container.status);
        self.refresh_metrics().await;
        Ok(())
    }

    async fn refresh_metrics(&self) {
        match self.store.list().await {
            Ok(containers) => self.metrics.set_containers(&containers),
            Err(e) => tracing::debug!(error = %e, "Failed to refresh container metrics"),
        }
    }

    /// Record a main process exit observed by the sandbox.
    async fn watch_exit(self: Arc<Self>, id: String, generation: u64, handle: Arc<SandboxHandle>) {
        let exit_code = match self.sandbox.wait(&handle).await {
            Ok(result) => result.exit_code,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Lost track of sandbox process");
                SANDBOX_FAILURE_EXIT_CODE
            }
        };

        let Some(slot) = self.slots.get(&id).map(|s| s.value().clone()) else {
            return;
        };
        let mut state = slot.state.lock().await;
        if state.generation != generation || state.handle.is_none() {
            return;
        }
        state.detach();
        self.finish_execs(&id);
        self.sandbox.release(&handle).await;

        match self.load(&id).await {
            Ok(mut container) if container.status.next(LifecycleOp::Exit).is_some() => {
                container.mark_finished(ContainerStatus::Exited, exit_code);
                if let Err(e) = self.persist(&slot, &container).await {
                    tracing::warn!(id = %id, error = %e, "Failed to record container exit");
                }
                tracing::info!(id = %id, exit_code, "Container exited");
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(id = %id, error = %e, "Exited container no longer recorded"),
        }
    }

    /// The sandbox failed under a running container: kill what is left
    /// and mark it exited.
    async fn sandbox_failed(&self, id: &str, handle: &Arc<SandboxHandle>) {
        let Some(slot) = self.slots.get(id).map(|s| s.value().clone()) else {
            return;
        };
        let mut state = slot.state.lock().await;
        let current = state
            .handle
            .as_ref()
            .map_or(false, |h| Arc::ptr_eq(h, handle));
        if !current {
            return;
        }
        state.detach();
        self.finish_execs(id);
        if let Err(e) = self.sandbox.terminate(handle, Duration::ZERO).await {
            tracing::warn!(id = %id, error = %e, "Failed to kill failed sandbox");
        }
        self.sandbox.release(handle).await;

        if let Ok(mut container) = self.load(id).await {
            container.mark_finished(ContainerStatus::Exited, SANDBOX_FAILURE_EXIT_CODE);
            if let Err(e) = self.persist(&slot, &container).await {
                tracing::warn!(id = %id, error = %e, "Failed to record sandbox failure");
            }
        }
        tracing::warn!(id = %id, "Sandbox failed, container marked exited");
    }
}

fn ensure_running(container: &Container) -> Result<()> {
    if container.status == ContainerStatus::Running {
        return Ok(());
    }
    Err(AndockError::InvalidStateTransition {
        id: container.id.clone(),
        from: container.status.as_str().to_string(),
        operation: "exec",
    })
}

fn unique_name(taken: impl Fn(&str) -> bool) -> String {
    for _ in 0..16 {
        let name = generate_name();
        if !taken(&name) {
            return name;
        }
    }
    format!("{}_{}", generate_name(), &generate_id()[..6])
}

/// Image env overlaid by request env, then defaults for what is still
/// missing.
fn container_env(image_env: &[String], request_env: &[String], hostname: &str) -> Vec<String> {
    let mut env: Vec<String> = Vec::new();
    for entry in image_env.iter().chain(request_env) {
        let key = entry.split_once('=').map_or(entry.as_str(), |(k, _)| k);
        env.retain(|e| e.split_once('=').map_or(e.as_str(), |(k, _)| k) != key);
        env.push(entry.clone());
    }

    let has = |env: &[String], key: &str| env.iter().any(|e| e.starts_with(&format!("{}=", key)));
    if !has(&env, "PATH") {
        env.push(format!("PATH={}", DEFAULT_PATH));
    }
    if !has(&env, "HOME") {
        env.push("HOME=/root".to_string());
    }
    if !has(&env, "HOSTNAME") {
        env.push(format!("HOSTNAME={}", hostname));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::layer_store::LayerStore;
    use crate::oci::manifest::{Descriptor, ImageManifest};
    use crate::oci::reference::ImageReference;
    use crate::oci::registry::ResolvedManifest;
    use crate::sandbox::FakeSandbox;
    use andock_core::digest::sha256_digest;
    use andock_core::image::{ImageConfig, ImageConfigFile};
    use andock_core::log::LogStream;
    use andock_core::store::MemoryStore;
    use bytes::Bytes;
    use futures::StreamExt;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        tmp: TempDir,
        manager: ContainerManager,
        sandbox: Arc<FakeSandbox>,
        store: Arc<MemoryStore<Container>>,
    }

    async fn fixture_with(sandbox: FakeSandbox) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let layers = Arc::new(
            LayerStore::open(&tmp.path().join("blobs"), &tmp.path().join("layers")).unwrap(),
        );
        let images = Arc::new(ImageAssembler::new(Arc::new(MemoryStore::new()), layers.clone()));

        let mut builder = tar::Builder::new(Vec::new());
        let content = b"Alpine Linux\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "etc/issue", &content[..])
            .unwrap();
        let data = builder.into_inner().unwrap();
        let digest = sha256_digest(&data);
        let stream = futures::stream::iter(vec![Ok(Bytes::from(data))]).boxed();
        layers
            .put(&digest, "t", stream, &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        layers.acquire(&digest).await.unwrap();

        let resolved = ResolvedManifest {
            digest: sha256_digest(b"manifest"),
            manifest: ImageManifest {
                schema_version: 2,
                media_type: String::new(),
                config: Descriptor {
                    media_type: String::new(),
                    digest: sha256_digest(b"config"),
                    size: 6,
                },
                layers: vec![Descriptor {
                    media_type: String::new(),
                    digest: digest.clone(),
                    size: 10,
                }],
            },
            config: ImageConfigFile {
                config: Some(ImageConfig {
                    cmd: Some(vec!["/bin/sh".into()]),
                    env: vec!["PATH=/bin".into(), "LANG=C".into()],
                    ..Default::default()
                }),
                ..Default::default()
            },
        };
        images
            .assemble(&ImageReference::parse("alpine:3.19").unwrap(), &resolved, vec![digest])
            .await
            .unwrap();

        let sandbox = Arc::new(sandbox);
        let store = Arc::new(MemoryStore::new());
        let manager = ContainerManager::open(
            store.clone(),
            images,
            sandbox.clone(),
            Arc::new(RuntimeMetrics::new().unwrap()),
            ManagerOptions {
                containers_dir: tmp.path().join("containers"),
                log: LogConfig::default(),
                stop_grace: Duration::from_secs(1),
            },
        )
        .await
        .unwrap();

        Fixture {
            tmp,
            manager,
            sandbox,
            store,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(FakeSandbox::new()).await
    }

    fn request(name: Option<&str>) -> CreateRequest {
        CreateRequest {
            image: "alpine:3.19".into(),
            name: name.map(String::from),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_materializes_rootfs_and_merges_config() {
        let f = fixture().await;
        let container = f
            .manager
            .create(CreateRequest {
                env: vec!["LANG=en_US.UTF-8".into()],
                ..request(Some("web"))
            })
            .await
            .unwrap();

        assert_eq!(container.status, ContainerStatus::Created);
        assert_eq!(container.command, vec!["/bin/sh"]);
        assert_eq!(container.working_dir, "/");
        assert!(container.env.contains(&"PATH=/bin".to_string()));
        assert!(container.env.contains(&"LANG=en_US.UTF-8".to_string()));
        assert!(!container.env.contains(&"LANG=C".to_string()));
        assert!(container.env.contains(&"HOME=/root".to_string()));
        assert!(container.env.contains(&format!("HOSTNAME={}", container.short_id())));
        assert_eq!(
            std::fs::read_to_string(container.rootfs.join("etc/issue")).unwrap(),
            "Alpine Linux\n"
        );
        assert!(container.rootfs.join("etc/resolv.conf").exists());
    }

    #[tokio::test]
    async fn test_create_unknown_image_is_not_found() {
        let f = fixture().await;
        let err = f
            .manager
            .create(CreateRequest {
                image: "nope:latest".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AndockError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let f = fixture().await;
        f.manager.create(request(Some("web"))).await.unwrap();
        let err = f.manager.create(request(Some("web"))).await.unwrap_err();
        assert!(matches!(err, AndockError::Conflict(_)));

        let err = f.manager.create(request(Some("bad name"))).await.unwrap_err();
        assert!(matches!(err, AndockError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_generated_name_and_lookup() {
        let f = fixture().await;
        let container = f.manager.create(request(None)).await.unwrap();
        assert!(container.name.contains('_'));

        assert_eq!(f.manager.inspect(&container.name).await.unwrap().id, container.id);
        assert_eq!(f.manager.inspect(&container.id[..8]).await.unwrap().id, container.id);
        assert!(matches!(
            f.manager.inspect("missing").await.unwrap_err(),
            AndockError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let f = fixture().await;
        let c = f.manager.create(request(Some("web"))).await.unwrap();

        let started = f.manager.start(&c.id).await.unwrap();
        assert_eq!(started.status, ContainerStatus::Running);
        assert!(started.started_at.is_some());

        let err = f.manager.start(&c.id).await.unwrap_err();
        assert!(matches!(err, AndockError::InvalidStateTransition { .. }));
        assert_eq!(
            f.manager.inspect(&c.id).await.unwrap().status,
            ContainerStatus::Running
        );
        assert_eq!(f.sandbox.start_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_records_exit_code_and_restart() {
        let f = fixture().await;
        let c = f.manager.create(request(None)).await.unwrap();
        f.manager.start(&c.id).await.unwrap();

        let stopped = f.manager.stop(&c.id, None).await.unwrap();
        assert_eq!(stopped.status, ContainerStatus::Stopped);
        assert_eq!(stopped.exit_code, Some(crate::sandbox::fake::FAKE_TERM_EXIT_CODE));

        let err = f.manager.stop(&c.id, None).await.unwrap_err();
        assert!(matches!(err, AndockError::InvalidStateTransition { .. }));

        let restarted = f.manager.start(&c.id).await.unwrap();
        assert_eq!(restarted.status, ContainerStatus::Running);
        assert!(restarted.exit_code.is_none());
    }

    #[tokio::test]
    async fn test_natural_exit_observed() {
        let f = fixture().await;
        let c = f.manager.create(request(None)).await.unwrap();
        f.manager.start(&c.id).await.unwrap();

        f.sandbox.exit(&c.id, 7);
        let code = tokio::time::timeout(Duration::from_secs(5), f.manager.wait(&c.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 7);
        assert_eq!(
            f.manager.inspect(&c.id).await.unwrap().status,
            ContainerStatus::Exited
        );
    }

    #[tokio::test]
    async fn test_remove_rules() {
        let f = fixture().await;
        let c = f.manager.create(request(None)).await.unwrap();
        f.manager.start(&c.id).await.unwrap();

        let err = f.manager.remove(&c.id, false).await.unwrap_err();
        assert!(matches!(err, AndockError::Conflict(_)));

        f.manager.stop(&c.id, None).await.unwrap();
        f.manager.remove(&c.id, false).await.unwrap();
        assert!(!c.rootfs.exists());
        assert!(f.manager.list(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_force_remove_running() {
        let f = fixture().await;
        let c = f.manager.create(request(None)).await.unwrap();
        f.manager.start(&c.id).await.unwrap();

        f.manager.remove(&c.id, true).await.unwrap();
        assert_eq!(f.sandbox.terminate_count(), 1);
        assert!(!f.tmp.path().join("containers").join(&c.id).exists());
    }

    #[tokio::test]
    async fn test_exec_requires_running() {
        let f = fixture().await;
        let c = f.manager.create(request(None)).await.unwrap();
        let req = ExecRequest {
            cmd: vec!["ls".into()],
            ..Default::default()
        };

        let err = f
            .manager
            .exec(&c.id, &req, ExecIo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AndockError::InvalidStateTransition { operation: "exec", .. }));
        assert_eq!(f.sandbox.exec_count(), 0);

        f.manager.start(&c.id).await.unwrap();
        f.sandbox.set_exec_result(ExecResult {
            exit_code: 0,
            stdout: b"bin\netc\n".to_vec(),
            stderr: vec![],
        });
        let result = f.manager.exec(&c.id, &req, ExecIo::default()).await.unwrap();
        assert_eq!(result.stdout_lossy(), "bin\netc\n");
        assert_eq!(
            f.manager.inspect(&c.id).await.unwrap().status,
            ContainerStatus::Running
        );
    }

    #[tokio::test]
    async fn test_sandbox_failure_marks_exited() {
        let f = fixture().await;
        let c = f.manager.create(request(None)).await.unwrap();

        f.sandbox.set_fail_start(true);
        let err = f.manager.start(&c.id).await.unwrap_err();
        assert!(matches!(err, AndockError::Sandbox { .. }));
        let after = f.manager.inspect(&c.id).await.unwrap();
        assert_eq!(after.status, ContainerStatus::Exited);
        assert_eq!(after.exit_code, Some(SANDBOX_FAILURE_EXIT_CODE));

        f.sandbox.set_fail_start(false);
        f.manager.start(&c.id).await.unwrap();
        f.sandbox.set_fail_exec(true);
        let req = ExecRequest {
            cmd: vec!["true".into()],
            ..Default::default()
        };
        assert!(f.manager.exec(&c.id, &req, ExecIo::default()).await.is_err());
        assert_eq!(
            f.manager.inspect(&c.id).await.unwrap().status,
            ContainerStatus::Exited
        );
    }

    #[tokio::test]
    async fn test_pause_cycle() {
        let f = fixture().await;
        let c = f.manager.create(request(None)).await.unwrap();
        f.manager.start(&c.id).await.unwrap();

        assert_eq!(f.manager.pause(&c.id).await.unwrap().status, ContainerStatus::Paused);
        assert!(f.manager.start(&c.id).await.is_err());
        assert_eq!(f.manager.unpause(&c.id).await.unwrap().status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn test_pause_unsupported_leaves_running() {
        let f = fixture_with(FakeSandbox::without_pause()).await;
        let c = f.manager.create(request(None)).await.unwrap();
        f.manager.start(&c.id).await.unwrap();

        let err = f.manager.pause(&c.id).await.unwrap_err();
        assert!(matches!(err, AndockError::Sandbox { ref message, .. } if message.contains("not supported")));
        assert_eq!(
            f.manager.inspect(&c.id).await.unwrap().status,
            ContainerStatus::Running
        );
    }

    #[tokio::test]
    async fn test_two_step_exec() {
        let f = fixture().await;
        let c = f.manager.create(request(None)).await.unwrap();
        f.manager.start(&c.id).await.unwrap();
        f.sandbox.set_exec_result(ExecResult {
            exit_code: 3,
            ..Default::default()
        });

        let req = ExecRequest {
            cmd: vec!["false".into()],
            ..Default::default()
        };
        let instance = f.manager.create_exec(&c.name, req, true, true).await.unwrap();
        let result = f
            .manager
            .start_exec(&instance.id, ExecIo::default())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);

        let inspected = f.manager.inspect_exec(&instance.id).unwrap();
        assert!(!inspected.running);
        assert_eq!(inspected.exit_code, Some(3));
        assert_eq!(inspected.container_id, c.id);
    }

    #[tokio::test]
    async fn test_logs_capture_main_process_output() {
        let f = fixture().await;
        let c = f.manager.create(request(None)).await.unwrap();
        f.manager.start(&c.id).await.unwrap();

        f.sandbox.emit(&c.id, LogStream::Stdout, "ready\n").await;
        f.sandbox.emit(&c.id, LogStream::Stderr, "warn\n").await;
        f.manager.stop(&c.id, None).await.unwrap();

        let mut entries = Vec::new();
        for _ in 0..50 {
            entries = f.manager.logs(&c.id, None).await.unwrap();
            if entries.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].log, "ready\n");
        assert_eq!(entries[1].stream, LogStream::Stderr);

        let tail = f.manager.logs(&c.id, Some(1)).await.unwrap();
        assert_eq!(tail[0].log, "warn\n");
    }

    #[tokio::test]
    async fn test_reopen_marks_running_as_exited() {
        let f = fixture().await;
        let c = f.manager.create(request(None)).await.unwrap();
        f.manager.start(&c.id).await.unwrap();

        let reopened = ContainerManager::open(
            f.store.clone(),
            f.manager.inner.images.clone(),
            Arc::new(FakeSandbox::new()),
            Arc::new(RuntimeMetrics::new().unwrap()),
            f.manager.inner.options.clone(),
        )
        .await
        .unwrap();

        let after = reopened.inspect(&c.id).await.unwrap();
        assert_eq!(after.status, ContainerStatus::Exited);
        assert_eq!(after.exit_code, Some(SANDBOX_FAILURE_EXIT_CODE));
    }

    #[tokio::test]
    async fn test_list_filters_inactive() {
        let f = fixture().await;
        let a = f.manager.create(request(Some("a"))).await.unwrap();
        f.manager.create(request(Some("b"))).await.unwrap();
        f.manager.start(&a.id).await.unwrap();

        let running = f.manager.list(false).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);
        assert_eq!(f.manager.list(true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reserved_name_does_not_block_other_creates() {
        let f = fixture().await;
        let held = f.manager.inner.reserve_name(Some("web")).await.unwrap();

        let err = f.manager.create(request(Some("web"))).await.unwrap_err();
        assert!(matches!(err, AndockError::Conflict(_)));
        let db = tokio::time::timeout(Duration::from_secs(5), f.manager.create(request(Some("db"))))
            .await
            .expect("create should not wait on another name")
            .unwrap();
        assert_eq!(db.name, "db");

        drop(held);
        f.manager.create(request(Some("web"))).await.unwrap();
    }

    #[tokio::test]
    async fn test_overlapping_creates() {
        let f = fixture().await;
        let (a, b) = tokio::join!(
            f.manager.create(request(Some("a"))),
            f.manager.create(request(Some("b")))
        );
        assert_eq!(a.unwrap().name, "a");
        assert_eq!(b.unwrap().name, "b");

        let (x, y) = tokio::join!(
            f.manager.create(request(Some("same"))),
            f.manager.create(request(Some("same")))
        );
        assert_eq!(x.is_ok() as u8 + y.is_ok() as u8, 1);
        assert!(f.manager.inner.reserved.lock().is_empty());
    }

    #[tokio::test]
    async fn test_image_lock_holds_back_create() {
        let f = fixture().await;
        let guard = f.manager.lock_images().await;

        let manager = &f.manager;
        let create = manager.create(request(Some("late")));
        tokio::pin!(create);
        assert!(tokio::time::timeout(Duration::from_millis(100), &mut create)
            .await
            .is_err());

        drop(guard);
        let container = create.await.unwrap();
        assert_eq!(container.name, "late");
    }

    #[tokio::test]
    async fn test_stop_cancels_running_exec() {
        let f = fixture().await;
        let c = f.manager.create(request(None)).await.unwrap();
        f.manager.start(&c.id).await.unwrap();
        f.sandbox.set_block_exec(true);

        let req = ExecRequest {
            cmd: vec!["sleep".into(), "100".into()],
            ..Default::default()
        };
        let instance = f.manager.create_exec(&c.id, req, true, true).await.unwrap();
        let manager = Arc::new(f.manager);
        let exec = {
            let manager = manager.clone();
            let exec_id = instance.id.clone();
            tokio::spawn(async move { manager.start_exec(&exec_id, ExecIo::default()).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.sandbox.exec_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(manager.inspect_exec(&instance.id).unwrap().running);

        manager.stop(&c.id, None).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), exec)
            .await
            .expect("exec should end with its container")
            .unwrap();
        assert!(matches!(result, Err(AndockError::Cancelled(_))));
        assert!(!manager.inspect_exec(&instance.id).unwrap().running);
        assert_eq!(
            manager.inspect(&c.id).await.unwrap().status,
            ContainerStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_caller_cancel_ends_exec_only() {
        let f = fixture().await;
        let c = f.manager.create(request(None)).await.unwrap();
        f.manager.start(&c.id).await.unwrap();
        f.sandbox.set_block_exec(true);

        let req = ExecRequest {
            cmd: vec!["sleep".into()],
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let io = ExecIo {
            output: None,
            cancel: cancel.clone(),
        };
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        };
        let (result, _) = tokio::join!(f.manager.exec(&c.id, &req, io), canceller);
        assert!(matches!(result, Err(AndockError::Cancelled(_))));
        assert_eq!(
            f.manager.inspect(&c.id).await.unwrap().status,
            ContainerStatus::Running
        );

        f.sandbox.set_block_exec(false);
        f.manager.exec(&c.id, &req, ExecIo::default()).await.unwrap();
    }

    #[test]
    fn test_container_env_overlay() {
        let env = container_env(
            &["PATH=/bin".into(), "A=1".into()],
            &["A=2".into(), "HOME=/home/app".into()],
            "abc",
        );
        assert_eq!(
            env,
            vec!["PATH=/bin", "A=2", "HOME=/home/app", "HOSTNAME=abc"]
        );
    }
}
