//! In-process registry and runtime fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use andock_core::config::{DaemonConfig, MirrorSeed};
use andock_core::container::Container;
use andock_core::digest::sha256_digest;
use andock_core::image::Image;
use andock_core::mirror::Mirror;
use andock_core::store::MemoryStore;
use andock_runtime::{FakeSandbox, Runtime, RuntimeParts};
use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

const MANIFEST_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
const CONFIG_TYPE: &str = "application/vnd.docker.container.image.v1+json";
const LAYER_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

#[derive(Default)]
struct RegistryState {
    /// (repository, tag or digest) -> manifest body
    manifests: Mutex<HashMap<(String, String), Bytes>>,
    blobs: Mutex<HashMap<String, Bytes>>,
    manifest_hits: AtomicUsize,
    blob_hits: Mutex<HashMap<String, usize>>,
    manifest_failure: Mutex<Option<StatusCode>>,
    corrupt: Mutex<HashSet<String>>,
    forged_digest: Mutex<Option<String>>,
    blob_delay: Mutex<Duration>,
}

/// What [`FakeRegistry::publish`] stored.
#[derive(Debug, Clone)]
pub struct PublishedImage {
    pub manifest_digest: String,
    pub config_digest: String,
    pub layers: Vec<String>,
}

/// A registry v2 server on a loopback port.
pub struct FakeRegistry {
    pub url: String,
    state: Arc<RegistryState>,
    server: JoinHandle<()>,
}

impl FakeRegistry {
    pub async fn start() -> Self {
        let state = Arc::new(RegistryState::default());
        let app = Router::new()
            .route("/v2/", get(|| async { StatusCode::OK }))
            .route("/v2/{*path}", any(serve))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{}", addr),
            state,
            server,
        }
    }

    /// Store an image made of `layers` (tar.gz bytes) under `repository:tag`.
    pub fn publish(&self, repository: &str, tag: &str, layers: &[Bytes]) -> PublishedImage {
        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "created": "2024-01-27T00:30:48Z",
            "config": {
                "Cmd": ["/bin/sh"],
                "Env": ["PATH=/usr/bin:/bin"],
                "WorkingDir": "/"
            }
        });
        let config = Bytes::from(serde_json::to_vec(&config).unwrap());
        let config_digest = sha256_digest(&config);

        let mut descriptors = Vec::new();
        let mut digests = Vec::new();
        for layer in layers {
            let digest = sha256_digest(layer);
            descriptors.push(serde_json::json!({
                "mediaType": LAYER_TYPE,
                "digest": digest,
                "size": layer.len(),
            }));
            self.state.blobs.lock().insert(digest.clone(), layer.clone());
            digests.push(digest);
        }
        self.state
            .blobs
            .lock()
            .insert(config_digest.clone(), config.clone());

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_TYPE,
            "config": {
                "mediaType": CONFIG_TYPE,
                "digest": config_digest,
                "size": config.len(),
            },
            "layers": descriptors,
        });
        let manifest = Bytes::from(serde_json::to_vec(&manifest).unwrap());
        let manifest_digest = sha256_digest(&manifest);

        let mut manifests = self.state.manifests.lock();
        manifests.insert((repository.to_string(), tag.to_string()), manifest.clone());
        manifests.insert((repository.to_string(), manifest_digest.clone()), manifest);

        PublishedImage {
            manifest_digest,
            config_digest,
            layers: digests,
        }
    }

    /// Every manifest request answers with `status`.
    pub fn fail_manifests(&self, status: StatusCode) {
        *self.state.manifest_failure.lock() = Some(status);
    }

    /// Serve altered bytes for `digest`.
    pub fn corrupt_blob(&self, digest: &str) {
        self.state.corrupt.lock().insert(digest.to_string());
    }

    /// Answer every manifest with `digest` in `Docker-Content-Digest`.
    pub fn forge_manifest_digest(&self, digest: &str) {
        *self.state.forged_digest.lock() = Some(digest.to_string());
    }

    /// Hold every blob response for `delay` before sending it.
    pub fn set_blob_delay(&self, delay: Duration) {
        *self.state.blob_delay.lock() = delay;
    }

    pub fn manifest_hits(&self) -> usize {
        self.state.manifest_hits.load(Ordering::SeqCst)
    }

    pub fn blob_hits(&self, digest: &str) -> usize {
        self.state.blob_hits.lock().get(digest).copied().unwrap_or(0)
    }

    pub fn seed(&self, name: &str, priority: i32) -> MirrorSeed {
        MirrorSeed {
            priority,
            ..MirrorSeed::new(&self.url, name)
        }
    }
}

impl Drop for FakeRegistry {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve(
    State(state): State<Arc<RegistryState>>,
    method: Method,
    UrlPath(path): UrlPath<String>,
) -> Response {
    if let Some((repository, reference)) = path.rsplit_once("/manifests/") {
        state.manifest_hits.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *state.manifest_failure.lock() {
            return status.into_response();
        }
        let body = state
            .manifests
            .lock()
            .get(&(repository.to_string(), reference.to_string()))
            .cloned();
        let forged = state.forged_digest.lock().clone();
        return match body {
            Some(body) => Response::builder()
                .header(header::CONTENT_TYPE, MANIFEST_TYPE)
                .header(
                    "docker-content-digest",
                    forged.unwrap_or_else(|| sha256_digest(&body)),
                )
                .body(Body::from(body))
                .unwrap(),
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }

    if let Some((_, digest)) = path.rsplit_once("/blobs/") {
        let blob = state.blobs.lock().get(digest).cloned();
        let Some(blob) = blob else {
            return StatusCode::NOT_FOUND.into_response();
        };
        if method == Method::HEAD {
            return Response::builder()
                .header(header::CONTENT_LENGTH, blob.len())
                .body(Body::empty())
                .unwrap();
        }

        *state.blob_hits.lock().entry(digest.to_string()).or_default() += 1;
        let delay = *state.blob_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let body = if state.corrupt.lock().contains(digest) {
            let mut altered = blob.to_vec();
            if let Some(last) = altered.last_mut() {
                *last ^= 0xff;
            }
            Bytes::from(altered)
        } else {
            blob
        };
        return Response::builder()
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(body))
            .unwrap();
    }

    StatusCode::NOT_FOUND.into_response()
}

/// A gzip-compressed tar holding regular files.
pub fn layer(files: &[(&str, &[u8])]) -> Bytes {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    let tar = builder.into_inner().unwrap();

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(&tar).unwrap();
    Bytes::from(encoder.finish().unwrap())
}

/// Daemon config rooted at `data_dir` that only knows `mirrors`.
pub fn config(data_dir: &Path, mirrors: Vec<MirrorSeed>) -> DaemonConfig {
    DaemonConfig {
        data_dir: data_dir.to_path_buf(),
        tcp_addr: None,
        builtin_mirrors: mirrors,
        max_retries: 0,
        retry_backoff_ms: 1,
        request_timeout_secs: 5,
        blob_timeout_secs: 10,
        stop_grace_secs: 1,
        ..DaemonConfig::default()
    }
}

/// A runtime over in-memory stores and the fake sandbox.
pub async fn runtime(config: DaemonConfig) -> (Runtime, Arc<FakeSandbox>) {
    let sandbox = Arc::new(FakeSandbox::new());
    let parts = RuntimeParts {
        images: Arc::new(MemoryStore::<Image>::new()),
        containers: Arc::new(MemoryStore::<Container>::new()),
        mirrors: Arc::new(MemoryStore::<Mirror>::new()),
        sandbox: sandbox.clone(),
    };
    let runtime = Runtime::with_parts(config, parts).await.unwrap();
    (runtime, sandbox)
}
