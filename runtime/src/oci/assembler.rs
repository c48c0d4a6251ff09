//! Image records: assembly from a resolved manifest, lookup and removal.

use std::collections::HashSet;
use std::sync::Arc;

use andock_core::error::{AndockError, Result};
use andock_core::image::Image;
use andock_core::store::EntityStore;
use chrono::Utc;
use tokio::sync::Mutex;

use super::reference::ImageReference;
use super::registry::ResolvedManifest;
use crate::cache::layer_store::LayerStore;

/// Owns the image store and its layer references.
pub struct ImageAssembler {
    images: Arc<dyn EntityStore<Image>>,
    layers: Arc<LayerStore>,
    /// Serializes tag moves and record writes.
    write_lock: Mutex<()>,
}

impl ImageAssembler {
    pub fn new(images: Arc<dyn EntityStore<Image>>, layers: Arc<LayerStore>) -> Self {
        Self {
            images,
            layers,
            write_lock: Mutex::new(()),
        }
    }

    pub fn layers(&self) -> &Arc<LayerStore> {
        &self.layers
    }

    /// Persist an image for `resolved`, tagged with `reference`.
    ///
    /// `held` lists the distinct layers the caller already holds one
    /// reference on. Those references are handed over: a new image keeps
    /// them, and they are released when the manifest digest is already
    /// recorded (the image only gains the tag) or anything fails.
    pub async fn assemble(
        &self,
        reference: &ImageReference,
        resolved: &ResolvedManifest,
        held: Vec<String>,
    ) -> Result<Image> {
        let _guard = self.write_lock.lock().await;
        let tag = reference.tag.as_ref().map(|_| reference.full_reference());

        if let Some(existing) = self.images.get(&resolved.digest).await? {
            self.rollback(&held).await;
            return self.add_tag_locked(existing, tag).await;
        }

        let layer_digests: Vec<String> = resolved
            .manifest
            .layers
            .iter()
            .map(|l| l.digest.clone())
            .collect();
        let held_set: HashSet<&str> = held.iter().map(String::as_str).collect();
        if let Some(missing) = layer_digests
            .iter()
            .find(|d| !held_set.contains(d.as_str()) || !self.layers.is_extracted(d))
        {
            let missing = missing.clone();
            self.rollback(&held).await;
            return Err(AndockError::not_found("extracted layer", missing));
        }
        // Extra references beyond the manifest's layers are not kept
        let extra: Vec<String> = held
            .iter()
            .filter(|d| !layer_digests.contains(d))
            .cloned()
            .collect();
        self.rollback(&extra).await;
        let retained: Vec<String> = held.into_iter().filter(|d| !extra.contains(d)).collect();

        let file = &resolved.config;
        let image = Image {
            id: resolved.digest.clone(),
            repo_tags: tag.iter().cloned().collect(),
            config_digest: resolved.manifest.config.digest.clone(),
            layers: layer_digests,
            size: resolved.manifest.total_size(),
            created: file.created.unwrap_or_else(Utc::now),
            architecture: file.architecture.clone(),
            os: file.os.clone(),
            config: file.config.clone().unwrap_or_default(),
        };

        let persisted = async {
            if let Some(ref tag) = tag {
                self.untag_others(tag, &image.id).await?;
            }
            self.images.put(&image).await
        };
        if let Err(e) = persisted.await {
            self.rollback(&retained).await;
            return Err(e);
        }

        tracing::info!(id = %image.id, reference = %reference, layers = image.layers.len(), "Image assembled");
        Ok(image)
    }

    /// Add `reference`'s tag to an existing image.
    pub async fn add_tag(&self, image: Image, reference: &ImageReference) -> Result<Image> {
        let _guard = self.write_lock.lock().await;
        let tag = reference.tag.as_ref().map(|_| reference.full_reference());
        // Re-read under the lock so concurrent tag moves are not lost
        let current = self.images.get(&image.id).await?.unwrap_or(image);
        self.add_tag_locked(current, tag).await
    }

    async fn add_tag_locked(&self, mut image: Image, tag: Option<String>) -> Result<Image> {
        let Some(tag) = tag else {
            return Ok(image);
        };
        if image.has_tag(&tag) {
            return Ok(image);
        }
        self.untag_others(&tag, &image.id).await?;
        image.repo_tags.push(tag.clone());
        self.images.put(&image).await?;
        tracing::info!(id = %image.id, tag = %tag, "Image tagged");
        Ok(image)
    }

    /// A tag names one image at a time.
    async fn untag_others(&self, tag: &str, keep_id: &str) -> Result<()> {
        for mut other in self.images.list().await? {
            if other.id != keep_id && other.has_tag(tag) {
                other.repo_tags.retain(|t| t != tag);
                self.images.put(&other).await?;
                tracing::debug!(id = %other.id, tag, "Tag moved off image");
            }
        }
        Ok(())
    }

    async fn rollback(&self, retained: &[String]) {
        for digest in retained {
            if let Err(e) = self.layers.release(digest).await {
                tracing::warn!(digest = %digest, error = %e, "Failed to release layer during rollback");
            }
        }
    }

    /// Look up an image by id, id prefix or reference.
    pub async fn find(&self, name: &str) -> Result<Option<Image>> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }

        if let Some(image) = self.images.get(name).await? {
            return Ok(Some(image));
        }
        if !name.starts_with("sha256:") {
            if let Some(image) = self.images.get(&format!("sha256:{}", name)).await? {
                return Ok(Some(image));
            }
        }

        let images = self.images.list().await?;

        if let Ok(reference) = ImageReference::parse(name) {
            let full = reference.full_reference();
            if let Some(image) = images.iter().find(|i| i.has_tag(&full)) {
                return Ok(Some(image.clone()));
            }
            if let Some(ref digest) = reference.digest {
                if let Some(image) = images.iter().find(|i| &i.id == digest) {
                    return Ok(Some(image.clone()));
                }
            }
        }

        let hex = name.strip_prefix("sha256:").unwrap_or(name);
        if hex.len() >= 4 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            let matches: Vec<&Image> = images
                .iter()
                .filter(|i| i.id.trim_start_matches("sha256:").starts_with(hex))
                .collect();
            match matches.len() {
                0 => {}
                1 => return Ok(Some(matches[0].clone())),
                _ => {
                    return Err(AndockError::InvalidRequest(format!(
                        "Image id prefix {} is ambiguous",
                        hex
                    )))
                }
            }
        }

        Ok(None)
    }

    /// Like [`find`](Self::find) but NotFound when absent.
    pub async fn get(&self, name: &str) -> Result<Image> {
        self.find(name)
            .await?
            .ok_or_else(|| AndockError::not_found("image", name))
    }

    /// All images, newest first.
    pub async fn list(&self) -> Result<Vec<Image>> {
        let mut images = self.images.list().await?;
        images.sort_by(|a, b| b.created.cmp(&a.created).then(a.id.cmp(&b.id)));
        Ok(images)
    }

    /// Drop one tag. Returns the updated image.
    pub async fn untag(&self, image: &Image, tag: &str) -> Result<Image> {
        let _guard = self.write_lock.lock().await;
        let mut updated = self
            .images
            .get(&image.id)
            .await?
            .ok_or_else(|| AndockError::not_found("image", image.id.clone()))?;
        updated.repo_tags.retain(|t| t != tag);
        self.images.put(&updated).await?;
        tracing::info!(id = %updated.id, tag, "Image untagged");
        Ok(updated)
    }

    /// Delete the record, then release each distinct layer once.
    pub async fn remove(&self, image: &Image) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if !self.images.delete(&image.id).await? {
            return Err(AndockError::not_found("image", image.id.clone()));
        }

        let mut seen = HashSet::new();
        for digest in &image.layers {
            if seen.insert(digest.as_str()) {
                if let Err(e) = self.layers.release(digest).await {
                    tracing::warn!(digest = %digest, error = %e, "Failed to release layer");
                }
            }
        }

        tracing::info!(id = %image.id, "Image removed");
        Ok(())
    }
}
