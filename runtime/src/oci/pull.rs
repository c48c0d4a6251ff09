//! Pull orchestration.
//!
//! One pull walks the mirror list until a manifest resolves, fans layer
//! downloads out over a bounded worker pool and hands the extracted layers
//! to the assembler. Concurrent pulls of the same normalized reference, or
//! of references that resolve to the same manifest digest, share a single
//! underlying task. Every subscriber sees the same progress and the same
//! terminal result.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use andock_core::error::{AndockError, Result};
use andock_core::image::Image;
use andock_core::progress::{LayerStatus, PullProgress};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::assembler::ImageAssembler;
use super::manifest::Descriptor;
use super::reference::ImageReference;
use super::registry::{RegistryClient, ResolvedManifest};
use crate::cache::layer_store::LayerStore;
use crate::metrics::RuntimeMetrics;
use crate::mirror::{MirrorResolver, RegistryEndpoint};

/// Minimum byte delta between two Downloading events for one layer.
const PROGRESS_STEP_BYTES: u64 = 512 * 1024;

/// Terminal outcome shared by every subscriber.
pub type PullResult = std::result::Result<Image, Arc<AndockError>>;

/// Something that happened during a pull.
#[derive(Debug, Clone, PartialEq)]
pub enum PullEvent {
    /// Free-form status line (`Pulling from library/alpine`, `Digest: ...`).
    Status(String),
    Layer(PullProgress),
}

/// What a late subscriber needs to catch up.
#[derive(Debug, Default)]
struct Snapshot {
    statuses: Vec<String>,
    /// In manifest order.
    layers: Vec<PullProgress>,
}

impl Snapshot {
    fn apply(&mut self, event: &PullEvent) {
        match event {
            PullEvent::Status(s) => self.statuses.push(s.clone()),
            PullEvent::Layer(p) => match self.layers.iter_mut().find(|l| l.digest == p.digest) {
                Some(existing) => *existing = p.clone(),
                None => self.layers.push(p.clone()),
            },
        }
    }

    fn replay(&self, with_statuses: bool) -> VecDeque<PullEvent> {
        let statuses = self
            .statuses
            .iter()
            .filter(|_| with_statuses)
            .cloned()
            .map(PullEvent::Status);
        let layers = self.layers.iter().cloned().map(PullEvent::Layer);
        statuses.chain(layers).collect()
    }
}

/// One underlying pull, possibly shared by several callers.
struct PullTask {
    reference: String,
    events: broadcast::Sender<PullEvent>,
    snapshot: Mutex<Snapshot>,
    result: watch::Sender<Option<PullResult>>,
    cancel: CancellationToken,
    subscribers: AtomicUsize,
}

impl PullTask {
    fn new(reference: String, buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        let (result, _) = watch::channel(None);
        Self {
            reference,
            events,
            snapshot: Mutex::new(Snapshot::default()),
            result,
            cancel: CancellationToken::new(),
            subscribers: AtomicUsize::new(0),
        }
    }

    /// Snapshot and broadcast are updated under one lock so a subscriber
    /// never misses or double-counts an event.
    fn publish(&self, event: PullEvent) {
        let mut snapshot = self.snapshot.lock();
        snapshot.apply(&event);
        let _ = self.events.send(event);
    }

    fn layer(&self, digest: &str, current: u64, total: u64, status: LayerStatus) {
        self.publish(PullEvent::Layer(PullProgress {
            digest: digest.to_string(),
            current,
            total,
            status,
        }));
    }

    fn subscribe(&self) -> (VecDeque<PullEvent>, broadcast::Receiver<PullEvent>) {
        let snapshot = self.snapshot.lock();
        (snapshot.replay(true), self.events.subscribe())
    }

    fn finish(&self, result: PullResult) {
        self.result.send_replace(Some(result));
    }

    fn is_finished(&self) -> bool {
        self.result.borrow().is_some()
    }
}

/// In-flight tasks by normalized reference and by manifest digest.
#[derive(Default)]
struct Inflight {
    by_reference: HashMap<String, Arc<PullTask>>,
    by_digest: HashMap<String, Arc<PullTask>>,
}

/// One caller's claim on a task. The task is cancelled when the last
/// claim is released.
struct Subscription {
    task: Arc<PullTask>,
    inflight: Arc<Mutex<Inflight>>,
    released: AtomicBool,
}

impl Subscription {
    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let _inflight = self.inflight.lock();
        if self.task.subscribers.fetch_sub(1, Ordering::SeqCst) == 1 && !self.task.is_finished() {
            tracing::info!(reference = %self.task.reference, "All subscribers gone, cancelling pull");
            self.task.cancel.cancel();
        }
    }
}

/// A caller's view of a pull: progress events and the terminal result.
pub struct PullHandle {
    reference: String,
    replay: VecDeque<PullEvent>,
    events: broadcast::Receiver<PullEvent>,
    result: watch::Receiver<Option<PullResult>>,
    task: Arc<PullTask>,
    subscription: Option<Arc<Subscription>>,
    drained: bool,
}

impl PullHandle {
    /// A handle for an image that is already present.
    fn ready(reference: String, image: Image, message: String) -> Self {
        let task = Arc::new(PullTask::new(reference.clone(), 1));
        task.publish(PullEvent::Status(message));
        task.finish(Ok(image));
        let (replay, events) = task.subscribe();
        Self {
            reference,
            replay,
            events,
            result: task.result.subscribe(),
            task,
            subscription: None,
            drained: false,
        }
    }

    /// Normalized reference being pulled.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Next progress event, or `None` once the pull has finished and every
    /// event has been delivered. A subscriber that falls behind skips to
    /// the latest per-layer snapshot.
    pub async fn next_event(&mut self) -> Option<PullEvent> {
        loop {
            if let Some(event) = self.replay.pop_front() {
                return Some(event);
            }
            if self.drained {
                return None;
            }

            let finished = tokio::select! {
                biased;
                event = self.events.recv() => match event {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(reference = %self.reference, skipped, "Progress subscriber lagged, resyncing");
                        self.replay = self.task.snapshot.lock().replay(false);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => true,
                },
                _ = self.result.wait_for(|r| r.is_some()) => true,
            };

            if finished {
                // Events are published before the result, so drain what is queued
                loop {
                    match self.events.try_recv() {
                        Ok(event) => self.replay.push_back(event),
                        Err(broadcast::error::TryRecvError::Lagged(_)) => {
                            self.replay = self.task.snapshot.lock().replay(false);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                self.drained = true;
            }
        }
    }

    /// Wait for the terminal result.
    pub async fn result(&mut self) -> Result<Image> {
        let outcome = match self.result.wait_for(|r| r.is_some()).await {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(image)) => Ok(image),
            Some(Err(e)) => Err(e.duplicate()),
            None => Err(AndockError::Cancelled(format!(
                "pull of {} ended without a result",
                self.reference
            ))),
        }
    }

    /// Consume the handle and wait for the result.
    pub async fn wait(mut self) -> Result<Image> {
        self.result().await
    }
}

impl Drop for PullHandle {
    fn drop(&mut self) {
        if let Some(ref subscription) = self.subscription {
            subscription.release();
        }
    }
}

/// Coordinates image pulls.
pub struct PullOrchestrator {
    inner: Arc<PullInner>,
}

struct PullInner {
    registry: Arc<RegistryClient>,
    resolver: Arc<MirrorResolver>,
    layers: Arc<LayerStore>,
    assembler: Arc<ImageAssembler>,
    metrics: Arc<RuntimeMetrics>,
    inflight: Arc<Mutex<Inflight>>,
    max_concurrent_downloads: usize,
    buffer: usize,
}

impl PullOrchestrator {
    pub fn new(
        registry: Arc<RegistryClient>,
        resolver: Arc<MirrorResolver>,
        assembler: Arc<ImageAssembler>,
        metrics: Arc<RuntimeMetrics>,
        max_concurrent_downloads: usize,
        buffer: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PullInner {
                registry,
                resolver,
                layers: assembler.layers().clone(),
                assembler,
                metrics,
                inflight: Arc::new(Mutex::new(Inflight::default())),
                max_concurrent_downloads: max_concurrent_downloads.max(1),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Start (or join) a pull of `reference`.
    ///
    /// `cancel` withdraws this caller only; the shared task is cancelled
    /// once every caller has cancelled or dropped its handle.
    pub async fn pull(&self, reference: &ImageReference, cancel: CancellationToken) -> Result<PullHandle> {
        let key = reference.full_reference();

        if let Some(image) = self.inner.find_local(reference).await? {
            tracing::info!(reference = %key, id = %image.id, "Image already present");
            self.inner.metrics.record_pull("cached", 0.0);
            let message = format!("Status: Image is up to date for {}", reference.familiar());
            return Ok(PullHandle::ready(key, image, message));
        }

        let (handle, task) = {
            let mut inflight = self.inner.inflight.lock();
            let existing = inflight
                .by_reference
                .get(&key)
                .filter(|t| !t.cancel.is_cancelled())
                .cloned();
            if let Some(task) = existing {
                tracing::debug!(reference = %key, "Joining in-flight pull");
                return Ok(attach(&inflight, &self.inner.inflight, &task, cancel));
            }

            let task = Arc::new(PullTask::new(key.clone(), self.inner.buffer));
            inflight.by_reference.insert(key.clone(), task.clone());
            let handle = attach(&inflight, &self.inner.inflight, &task, cancel);
            (handle, task)
        };

        let inner = self.inner.clone();
        let reference = reference.clone();
        tokio::spawn(async move { inner.run(task, reference).await });

        Ok(handle)
    }

    /// Number of distinct pulls in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.lock().by_reference.len()
    }
}

/// Register a subscriber on `task`. The caller holds the inflight lock
/// (witnessed by `_locked`), so the count cannot race with a release.
fn attach(
    _locked: &Inflight,
    inflight: &Arc<Mutex<Inflight>>,
    task: &Arc<PullTask>,
    cancel: CancellationToken,
) -> PullHandle {
    task.subscribers.fetch_add(1, Ordering::SeqCst);
    let subscription = Arc::new(Subscription {
        task: task.clone(),
        inflight: inflight.clone(),
        released: AtomicBool::new(false),
    });

    let watcher = subscription.clone();
    let mut done = task.result.subscribe();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => watcher.release(),
            _ = done.wait_for(|r| r.is_some()) => {}
        }
    });

    let (replay, events) = task.subscribe();
    PullHandle {
        reference: task.reference.clone(),
        replay,
        events,
        result: task.result.subscribe(),
        task: task.clone(),
        subscription: Some(subscription),
        drained: false,
    }
}

/// Run `fut` unless `cancel` fires first.
async fn cancellable<T>(
    cancel: &CancellationToken,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AndockError::Cancelled(what.to_string())),
        result = fut => result,
    }
}

impl PullInner {
    async fn find_local(&self, reference: &ImageReference) -> Result<Option<Image>> {
        let images = self.assembler.list().await?;
        let full = reference.full_reference();
        Ok(images.into_iter().find(|image| {
            (reference.tag.is_some() && reference.digest.is_none() && image.has_tag(&full))
                || reference.digest.as_deref() == Some(image.id.as_str())
        }))
    }

    async fn run(self: Arc<Self>, task: Arc<PullTask>, reference: ImageReference) {
        let started = Instant::now();
        tracing::info!(reference = %task.reference, "Pull started");

        let result = self.execute(&task, &reference).await;

        {
            let mut inflight = self.inflight.lock();
            let owned = inflight
                .by_reference
                .get(&task.reference)
                .map_or(false, |t| Arc::ptr_eq(t, &task));
            if owned {
                inflight.by_reference.remove(&task.reference);
            }
            inflight.by_digest.retain(|_, t| !Arc::ptr_eq(t, &task));
        }

        let seconds = started.elapsed().as_secs_f64();
        match &result {
            Ok(image) => {
                self.metrics.record_pull("success", seconds);
                tracing::info!(reference = %task.reference, id = %image.id, seconds, "Image pulled");
            }
            Err(e) => {
                self.metrics.record_pull(e.kind(), seconds);
                tracing::warn!(reference = %task.reference, error = %e, "Pull failed");
            }
        }

        task.finish(result.map_err(Arc::new));
    }

    async fn execute(&self, task: &Arc<PullTask>, reference: &ImageReference) -> Result<Image> {
        let what = format!("pull of {}", task.reference);
        let endpoints = self.resolver.resolve(&reference.registry).await;
        task.publish(PullEvent::Status(format!(
            "Pulling from {}",
            reference.repository
        )));

        let (index, resolved) = self
            .resolve_on_mirrors(task, reference, &endpoints)
            .await?;

        if let Some(existing) = self.assembler.find(&resolved.digest).await? {
            if existing.id == resolved.digest {
                let image = self.assembler.add_tag(existing, reference).await?;
                self.finish_statuses(task, reference, &resolved.digest, false);
                return Ok(image);
            }
        }

        if let Some(other) = self.claim_digest(task, &resolved.digest) {
            return self.follow(task, reference, other, &resolved.digest).await;
        }

        // Blob fallback: the mirror that resolved the manifest, then the rest
        let fallback: Vec<RegistryEndpoint> = endpoints[index..].to_vec();
        let held = self
            .download_layers(task, reference, &resolved, fallback)
            .await?;

        if task.cancel.is_cancelled() {
            self.release_held(&held).await;
            return Err(AndockError::Cancelled(what));
        }
        let image = self.assembler.assemble(reference, &resolved, held).await?;
        self.finish_statuses(task, reference, &resolved.digest, true);
        Ok(image)
    }

    fn finish_statuses(&self, task: &PullTask, reference: &ImageReference, digest: &str, downloaded: bool) {
        task.publish(PullEvent::Status(format!("Digest: {}", digest)));
        let status = if downloaded {
            format!("Status: Downloaded newer image for {}", reference.familiar())
        } else {
            format!("Status: Image is up to date for {}", reference.familiar())
        };
        task.publish(PullEvent::Status(status));
    }

    /// Walk the mirrors until one resolves the manifest.
    ///
    /// When all fail: NotFound if any mirror reported it, else Auth if any
    /// did, else the last network error.
    async fn resolve_on_mirrors(
        &self,
        task: &PullTask,
        reference: &ImageReference,
        endpoints: &[RegistryEndpoint],
    ) -> Result<(usize, ResolvedManifest)> {
        let what = format!("pull of {}", task.reference);
        let mut not_found = None;
        let mut auth = None;
        let mut last = None;

        for (index, endpoint) in endpoints.iter().enumerate() {
            let attempt = self.registry.resolve_manifest(
                endpoint,
                &reference.repository,
                reference.manifest_reference(),
            );
            match cancellable(&task.cancel, &what, attempt).await {
                Ok(resolved) => {
                    tracing::info!(reference = %task.reference, mirror = %endpoint.url, digest = %resolved.digest, "Manifest resolved");
                    return Ok((index, resolved));
                }
                Err(e) if e.is_mirror_retryable() => {
                    tracing::warn!(reference = %task.reference, mirror = %endpoint.url, error = %e, "Mirror failed, trying next");
                    match e {
                        AndockError::NotFound { .. } => not_found = Some(e),
                        AndockError::Auth { .. } => auth = Some(e),
                        _ => last = Some(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(not_found
            .or(auth)
            .or(last)
            .unwrap_or_else(|| AndockError::not_found("manifest", task.reference.clone())))
    }

    /// Register `task` as the in-flight pull for `digest`, or return the
    /// task that already is.
    fn claim_digest(&self, task: &Arc<PullTask>, digest: &str) -> Option<PullHandle> {
        let mut inflight = self.inflight.lock();
        let other = inflight
            .by_digest
            .get(digest)
            .filter(|t| !Arc::ptr_eq(t, task) && !t.cancel.is_cancelled())
            .cloned();
        match other {
            Some(other) => {
                tracing::debug!(reference = %task.reference, other = %other.reference, digest, "Joining in-flight pull by digest");
                Some(attach(&inflight, &self.inflight, &other, task.cancel.clone()))
            }
            None => {
                inflight.by_digest.insert(digest.to_string(), task.clone());
                None
            }
        }
    }

    /// Mirror another task's progress and take over its result.
    async fn follow(
        &self,
        task: &PullTask,
        reference: &ImageReference,
        mut other: PullHandle,
        digest: &str,
    ) -> Result<Image> {
        while let Some(event) = other.next_event().await {
            if let PullEvent::Layer(_) = event {
                task.publish(event);
            }
        }
        let image = other.result().await?;
        let image = self.assembler.add_tag(image, reference).await?;
        self.finish_statuses(task, reference, digest, true);
        Ok(image)
    }

    /// Give back layer references taken by a pull that will not assemble.
    async fn release_held(&self, held: &[String]) {
        for digest in held {
            if let Err(e) = self.layers.release(digest).await {
                tracing::warn!(digest = %digest, error = %e, "Failed to release layer held by pull");
            }
        }
    }

    /// Download and extract every distinct layer, returning them with one
    /// reference held on each. Layers already extracted for another image
    /// are referenced without downloading.
    async fn download_layers(
        &self,
        task: &Arc<PullTask>,
        reference: &ImageReference,
        resolved: &ResolvedManifest,
        fallback: Vec<RegistryEndpoint>,
    ) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let descriptors: Vec<Descriptor> = resolved
            .manifest
            .layers
            .iter()
            .filter(|d| seen.insert(d.digest.clone()))
            .cloned()
            .collect();

        for desc in &descriptors {
            task.layer(&desc.digest, 0, desc.size, LayerStatus::Waiting);
        }

        let child = task.cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_downloads));
        let fallback = Arc::new(fallback);
        let mut set = JoinSet::new();
        let mut held = Vec::new();
        let mut first_error: Option<AndockError> = None;

        for desc in descriptors {
            match self.layers.retain_extracted(&desc.digest).await {
                Ok(true) => {
                    held.push(desc.digest.clone());
                    task.layer(&desc.digest, desc.size, desc.size, LayerStatus::Done);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    first_error = Some(e);
                    child.cancel();
                    break;
                }
            }

            let ctx = LayerJob {
                registry: self.registry.clone(),
                layers: self.layers.clone(),
                metrics: self.metrics.clone(),
                task: task.clone(),
                repository: reference.repository.clone(),
                endpoints: fallback.clone(),
                cancel: child.clone(),
            };
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => {
                        return Err(AndockError::Cancelled(format!("layer {}", desc.digest)));
                    }
                    permit = semaphore.acquire_owned() => permit.map_err(|_| {
                        AndockError::Cancelled(format!("layer {}", desc.digest))
                    })?,
                };
                let result = ctx.run(&desc).await;
                if result.is_err() {
                    ctx.task.layer(&desc.digest, 0, desc.size, LayerStatus::Error);
                }
                result
            });
        }

        // Drain every job so aborted downloads clean up their temp files
        while let Some(joined) = set.join_next().await {
            let outcome = joined
                .map_err(|e| AndockError::Disk(format!("Layer task failed: {}", e)))
                .and_then(|r| r);
            let e = match outcome {
                Ok(digest) => {
                    held.push(digest);
                    continue;
                }
                Err(e) => e,
            };
            let replace = match &first_error {
                None => true,
                Some(AndockError::Cancelled(_)) => !matches!(e, AndockError::Cancelled(_)),
                Some(_) => false,
            };
            if replace {
                if !matches!(e, AndockError::Cancelled(_)) {
                    tracing::warn!(reference = %task.reference, error = %e, "Layer failed, aborting pull");
                }
                first_error = Some(e);
            }
            child.cancel();
        }

        let error = match first_error {
            None => return Ok(held),
            Some(AndockError::Cancelled(_)) => {
                AndockError::Cancelled(format!("pull of {}", task.reference))
            }
            Some(e) => e,
        };
        self.release_held(&held).await;
        Err(error)
    }
}

/// Everything one layer download needs, owned so it can be spawned.
struct LayerJob {
    registry: Arc<RegistryClient>,
    layers: Arc<LayerStore>,
    metrics: Arc<RuntimeMetrics>,
    task: Arc<PullTask>,
    repository: String,
    endpoints: Arc<Vec<RegistryEndpoint>>,
    cancel: CancellationToken,
}

impl LayerJob {
    /// Returns the digest with a reference held on it.
    async fn run(&self, desc: &Descriptor) -> Result<String> {
        let digest = desc.digest.as_str();
        if !self.layers.has(digest) {
            self.download(desc).await?;
        }

        if self.cancel.is_cancelled() {
            return Err(AndockError::Cancelled(format!("layer {}", digest)));
        }
        self.task
            .layer(digest, desc.size, desc.size, LayerStatus::Extracting);
        self.layers.acquire(digest).await?;
        self.task.layer(digest, desc.size, desc.size, LayerStatus::Done);
        Ok(digest.to_string())
    }

    /// Try each endpoint in turn. Only transport-level failures move on to
    /// the next one; a digest mismatch or disk error is final.
    async fn download(&self, desc: &Descriptor) -> Result<()> {
        let digest = desc.digest.as_str();
        let what = format!("layer {}", digest);
        let mut last_error = None;

        for endpoint in self.endpoints.iter() {
            self.task.layer(digest, 0, desc.size, LayerStatus::Downloading);

            let fetch = self.registry.fetch_blob(endpoint, &self.repository, digest);
            let blob = match cancellable(&self.cancel, &what, fetch).await {
                Ok(blob) => blob,
                Err(e) if e.is_mirror_retryable() => {
                    tracing::warn!(digest, mirror = %endpoint.url, error = %e, "Blob fetch failed, trying next mirror");
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let total = blob.length.unwrap_or(desc.size);
            let task = self.task.clone();
            let mut reported = 0u64;
            let on_progress = move |current: u64| {
                if current == total || current.saturating_sub(reported) >= PROGRESS_STEP_BYTES {
                    reported = current;
                    task.layer(digest, current, total, LayerStatus::Downloading);
                }
            };

            match self
                .layers
                .put(digest, &desc.media_type, blob.stream, &self.cancel, on_progress)
                .await
            {
                Ok(_) => {
                    self.metrics.add_layer_bytes(total);
                    return Ok(());
                }
                Err(e @ AndockError::Network { .. }) => {
                    tracing::warn!(digest, mirror = %endpoint.url, error = %e, "Blob download interrupted, trying next mirror");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| AndockError::not_found("blob", digest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(digest: &str, current: u64, status: LayerStatus) -> PullEvent {
        PullEvent::Layer(PullProgress {
            digest: digest.to_string(),
            current,
            total: 100,
            status,
        })
    }

    #[test]
    fn test_snapshot_keeps_latest_per_layer_in_order() {
        let mut snapshot = Snapshot::default();
        snapshot.apply(&PullEvent::Status("Pulling from library/alpine".into()));
        snapshot.apply(&progress("sha256:a", 0, LayerStatus::Waiting));
        snapshot.apply(&progress("sha256:b", 0, LayerStatus::Waiting));
        snapshot.apply(&progress("sha256:a", 50, LayerStatus::Downloading));

        let replay: Vec<PullEvent> = snapshot.replay(true).into_iter().collect();
        assert_eq!(replay.len(), 3);
        assert_eq!(replay[1], progress("sha256:a", 50, LayerStatus::Downloading));
        assert_eq!(snapshot.replay(false).len(), 2);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_replay() {
        let inflight = Arc::new(Mutex::new(Inflight::default()));
        let task = Arc::new(PullTask::new("docker.io/library/alpine:latest".into(), 4));
        task.layer("sha256:a", 10, 100, LayerStatus::Downloading);

        let mut handle = {
            let guard = inflight.lock();
            attach(&guard, &inflight, &task, CancellationToken::new())
        };
        task.layer("sha256:a", 100, 100, LayerStatus::Done);
        task.finish(Err(Arc::new(AndockError::Cancelled("test".into()))));

        assert_eq!(
            handle.next_event().await,
            Some(progress("sha256:a", 10, LayerStatus::Downloading))
        );
        assert_eq!(
            handle.next_event().await,
            Some(progress("sha256:a", 100, LayerStatus::Done))
        );
        assert_eq!(handle.next_event().await, None);
        assert!(matches!(handle.result().await, Err(AndockError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_slow_subscriber_resyncs_to_snapshot() {
        let inflight = Arc::new(Mutex::new(Inflight::default()));
        let task = Arc::new(PullTask::new("r".into(), 2));
        let mut handle = {
            let guard = inflight.lock();
            attach(&guard, &inflight, &task, CancellationToken::new())
        };

        for i in 0..10 {
            task.layer("sha256:a", i * 10, 100, LayerStatus::Downloading);
        }

        let event = handle.next_event().await.unwrap();
        assert_eq!(event, progress("sha256:a", 90, LayerStatus::Downloading));
    }

    #[tokio::test]
    async fn test_last_subscriber_release_cancels_task() {
        let inflight = Arc::new(Mutex::new(Inflight::default()));
        let task = Arc::new(PullTask::new("r".into(), 4));
        let (a, b) = {
            let guard = inflight.lock();
            (
                attach(&guard, &inflight, &task, CancellationToken::new()),
                attach(&guard, &inflight, &task, CancellationToken::new()),
            )
        };

        drop(a);
        assert!(!task.cancel.is_cancelled());
        drop(b);
        assert!(task.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_caller_cancel_releases_subscription() {
        let inflight = Arc::new(Mutex::new(Inflight::default()));
        let task = Arc::new(PullTask::new("r".into(), 4));
        let cancel = CancellationToken::new();
        let _handle = {
            let guard = inflight.lock();
            attach(&guard, &inflight, &task, cancel.clone())
        };

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), task.cancel.cancelled())
            .await
            .unwrap();
        assert_eq!(task.subscribers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ready_handle() {
        let image = Image {
            id: "sha256:x".into(),
            repo_tags: vec![],
            config_digest: String::new(),
            layers: vec![],
            size: 0,
            created: chrono::Utc::now(),
            architecture: String::new(),
            os: String::new(),
            config: Default::default(),
        };
        let mut handle = PullHandle::ready("r".into(), image, "Status: Image is up to date for r".into());
        assert!(matches!(handle.next_event().await, Some(PullEvent::Status(_))));
        assert!(handle.next_event().await.is_none());
        assert_eq!(handle.wait().await.unwrap().id, "sha256:x");
    }
}
