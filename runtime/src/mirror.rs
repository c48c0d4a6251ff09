//! Registry mirror management and fallback resolution.
//!
//! Mirrors only apply to Docker Hub references. The resolver turns the
//! stored mirror list into the ordered endpoint sequence the puller walks
//! through: selected user mirrors by priority first, then every built-in
//! mirror as a guaranteed fallback. User mirrors that failed
//! [`UNHEALTHY_THRESHOLD`] health checks in a row are skipped until a
//! check succeeds again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use andock_core::config::{MirrorSeed, DOCKER_HUB_ENDPOINT};
use andock_core::error::{AndockError, Result};
use andock_core::mirror::{normalize_url, Mirror, DEFAULT_MIRROR_PRIORITY};
use andock_core::store::EntityStore;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

use crate::oci::registry::RegistryClient;

/// Registry host whose pulls go through mirrors.
pub const DOCKER_HUB_REGISTRY: &str = "docker.io";

/// Consecutive failed health checks after which a user mirror is skipped.
pub const UNHEALTHY_THRESHOLD: u32 = 3;

/// Latest health check outcome for one mirror url.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MirrorHealth {
    pub consecutive_failures: u32,
    /// Round trip of the last successful check.
    pub latency_ms: Option<u64>,
}

impl MirrorHealth {
    pub fn is_unhealthy(&self) -> bool {
        self.consecutive_failures >= UNHEALTHY_THRESHOLD
    }
}

/// One registry base url to try, with an optional static bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEndpoint {
    pub url: String,
    pub bearer_token: Option<String>,
}

impl RegistryEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: normalize_url(&url.into()),
            bearer_token: None,
        }
    }

    /// Endpoint for a non-Docker-Hub registry host.
    pub fn for_registry(registry: &str) -> Self {
        let host = registry.split(':').next().unwrap_or(registry);
        let scheme = if host == "localhost" || host == "127.0.0.1" {
            "http"
        } else {
            "https"
        };
        Self::new(format!("{}://{}", scheme, registry))
    }
}

/// Source of the current mirror list.
#[async_trait]
pub trait MirrorSource: Send + Sync {
    async fn mirrors(&self) -> Result<Vec<Mirror>>;
}

/// Changes accepted by [`MirrorManager::update`].
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct MirrorPatch {
    pub name: Option<String>,
    pub is_selected: Option<bool>,
    pub is_default: Option<bool>,
    pub priority: Option<i32>,
}

/// CRUD over persisted mirrors, enforcing default uniqueness on write.
pub struct MirrorManager {
    store: Arc<dyn EntityStore<Mirror>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl MirrorManager {
    pub fn new(store: Arc<dyn EntityStore<Mirror>>) -> Self {
        Self {
            store,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Make sure every built-in seed is stored and flagged as built-in.
    ///
    /// User changes to an existing built-in (selection, priority) are kept.
    pub async fn seed(&self, seeds: &[MirrorSeed]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let existing = self.store.list().await?;
        let has_default = existing.iter().any(|m| m.is_default);

        for seed in seeds {
            let url = normalize_url(&seed.url);
            match existing.iter().find(|m| m.url == url) {
                Some(m) if m.is_built_in => continue,
                Some(m) => {
                    let mut m = m.clone();
                    m.is_built_in = true;
                    self.store.put(&m).await?;
                }
                None => {
                    let mirror = Mirror {
                        url,
                        name: seed.name.clone(),
                        is_default: seed.is_default && !has_default,
                        is_built_in: true,
                        is_selected: true,
                        priority: seed.priority,
                        bearer_token: seed.bearer_token.clone(),
                    };
                    self.store.put(&mirror).await?;
                }
            }
        }

        tracing::debug!(count = seeds.len(), "Seeded built-in mirrors");
        Ok(())
    }

    /// Add a user mirror. New mirrors are selected.
    pub async fn add(
        &self,
        url: &str,
        name: Option<String>,
        bearer_token: Option<String>,
        priority: Option<i32>,
    ) -> Result<Mirror> {
        let url = normalize_url(url);
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AndockError::InvalidRequest(format!(
                "Mirror url must start with http:// or https://: {}",
                url
            )));
        }

        let _guard = self.write_lock.lock().await;
        if self.store.get(&url).await?.is_some() {
            return Err(AndockError::Conflict(format!("Mirror already exists: {}", url)));
        }

        let mirror = Mirror {
            name: name.unwrap_or_else(|| url.clone()),
            url,
            is_default: false,
            is_built_in: false,
            is_selected: true,
            priority: priority.unwrap_or(DEFAULT_MIRROR_PRIORITY),
            bearer_token,
        };
        self.store.put(&mirror).await?;

        tracing::info!(url = %mirror.url, priority = mirror.priority, "Mirror added");
        Ok(mirror)
    }

    /// Patch a mirror. Setting `is_default` clears every other default.
    pub async fn update(&self, url: &str, patch: MirrorPatch) -> Result<Mirror> {
        let url = normalize_url(url);
        let _guard = self.write_lock.lock().await;
        let mut mirror = self
            .store
            .get(&url)
            .await?
            .ok_or_else(|| AndockError::not_found("mirror", url.clone()))?;

        if let Some(name) = patch.name {
            mirror.name = name;
        }
        if let Some(selected) = patch.is_selected {
            mirror.is_selected = selected;
        }
        if let Some(priority) = patch.priority {
            mirror.priority = priority;
        }
        if let Some(is_default) = patch.is_default {
            if is_default {
                for mut other in self.store.list().await? {
                    if other.is_default && other.url != mirror.url {
                        other.is_default = false;
                        self.store.put(&other).await?;
                    }
                }
            }
            mirror.is_default = is_default;
        }

        self.store.put(&mirror).await?;
        tracing::info!(url = %mirror.url, "Mirror updated");
        Ok(mirror)
    }

    /// Delete a user-added mirror.
    pub async fn remove(&self, url: &str) -> Result<()> {
        let url = normalize_url(url);
        let _guard = self.write_lock.lock().await;
        let mirror = self
            .store
            .get(&url)
            .await?
            .ok_or_else(|| AndockError::not_found("mirror", url.clone()))?;
        if mirror.is_built_in {
            return Err(AndockError::Conflict(format!(
                "Built-in mirror cannot be removed: {}",
                url
            )));
        }
        self.store.delete(&url).await?;
        tracing::info!(url = %url, "Mirror removed");
        Ok(())
    }

    /// Every stored mirror, selected ones first in resolve order.
    pub async fn list(&self) -> Result<Vec<Mirror>> {
        let mut mirrors = self.store.list().await?;
        mirrors.sort_by(compare_mirrors);
        Ok(mirrors)
    }
}

#[async_trait]
impl MirrorSource for MirrorManager {
    async fn mirrors(&self) -> Result<Vec<Mirror>> {
        self.store.list().await
    }
}

/// Resolve order: selected first, user mirrors before built-ins, higher
/// priority first, default first on ties, then by name.
fn compare_mirrors(a: &Mirror, b: &Mirror) -> std::cmp::Ordering {
    b.is_selected
        .cmp(&a.is_selected)
        .then(a.is_built_in.cmp(&b.is_built_in))
        .then(b.priority.cmp(&a.priority))
        .then(b.is_default.cmp(&a.is_default))
        .then(a.name.cmp(&b.name))
}

/// Produces the endpoint fallback sequence for a registry host.
pub struct MirrorResolver {
    source: Arc<dyn MirrorSource>,
    builtin: Vec<MirrorSeed>,
    health: DashMap<String, MirrorHealth>,
}

impl MirrorResolver {
    pub fn new(source: Arc<dyn MirrorSource>, builtin: Vec<MirrorSeed>) -> Self {
        let builtin = if builtin.is_empty() {
            vec![MirrorSeed::new(DOCKER_HUB_ENDPOINT, "Docker Hub")]
        } else {
            builtin
        };
        Self {
            source,
            builtin,
            health: DashMap::new(),
        }
    }

    /// Health of `url`. Never-checked mirrors count as healthy.
    pub fn health(&self, url: &str) -> MirrorHealth {
        self.health
            .get(&normalize_url(url))
            .map(|h| *h.value())
            .unwrap_or_default()
    }

    /// Record one health check outcome for `url`.
    pub fn record_check(&self, url: &str, outcome: &Result<Duration>) {
        let mut entry = self.health.entry(normalize_url(url)).or_default();
        match outcome {
            Ok(latency) => {
                entry.consecutive_failures = 0;
                entry.latency_ms = Some(latency.as_millis() as u64);
            }
            Err(_) => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                if entry.consecutive_failures == UNHEALTHY_THRESHOLD {
                    tracing::warn!(url, failures = UNHEALTHY_THRESHOLD, "Mirror marked unhealthy");
                }
            }
        }
    }

    /// Ping every selected mirror and every built-in concurrently.
    pub async fn check_all(&self, registry: &RegistryClient) {
        let stored = match self.source.mirrors().await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read mirrors for health check");
                Vec::new()
            }
        };

        let mut seen = HashSet::new();
        let endpoints: Vec<RegistryEndpoint> = stored
            .iter()
            .filter(|m| m.is_selected)
            .map(|m| RegistryEndpoint::new(&m.url))
            .chain(self.builtin.iter().map(|s| RegistryEndpoint::new(&s.url)))
            .filter(|e| seen.insert(e.url.clone()))
            .collect();

        let checks = endpoints.iter().map(|endpoint| async move {
            let outcome = registry.ping(endpoint).await;
            match &outcome {
                Ok(latency) => tracing::debug!(url = %endpoint.url, latency_ms = latency.as_millis() as u64, "Mirror healthy"),
                Err(e) => tracing::debug!(url = %endpoint.url, error = %e, "Mirror health check failed"),
            }
            (endpoint, outcome)
        });
        for (endpoint, outcome) in futures::future::join_all(checks).await {
            self.record_check(&endpoint.url, &outcome);
        }
    }

    /// Ordered, deduplicated endpoints to try for `registry`. Never empty.
    ///
    /// The mirror source is re-read on every call. If it cannot be read,
    /// only the built-in list is returned.
    pub async fn resolve(&self, registry: &str) -> Vec<RegistryEndpoint> {
        if registry != DOCKER_HUB_REGISTRY {
            return vec![RegistryEndpoint::for_registry(registry)];
        }

        let mut stored = match self.source.mirrors().await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read mirrors, using built-ins only");
                Vec::new()
            }
        };
        stored.sort_by(compare_mirrors);

        let mut seen = HashSet::new();
        let mut endpoints = Vec::new();

        for mirror in stored.iter().filter(|m| m.is_selected) {
            let url = normalize_url(&mirror.url);
            if !mirror.is_built_in && self.health(&url).is_unhealthy() {
                continue;
            }
            if seen.insert(url.clone()) {
                endpoints.push(RegistryEndpoint {
                    url,
                    bearer_token: mirror.bearer_token.clone(),
                });
            }
        }

        for seed in &self.builtin {
            let url = normalize_url(&seed.url);
            if seen.insert(url.clone()) {
                let bearer_token = stored
                    .iter()
                    .find(|m| m.url == url)
                    .and_then(|m| m.bearer_token.clone())
                    .or_else(|| seed.bearer_token.clone());
                endpoints.push(RegistryEndpoint { url, bearer_token });
            }
        }

        endpoints
    }
}
