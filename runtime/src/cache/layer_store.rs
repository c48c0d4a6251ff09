//! Content-addressed store for layer blobs and their extracted trees.
//!
//! Layout under the data directory:
//!
//! ```text
//! blobs/sha256_{hex}                 compressed layer blob
//! blobs/.tmp-{uuid}                  download in progress
//! layers/sha256_{hex}/               extracted tree
//! layers/sha256_{hex}.complete       extraction finished
//! layers/sha256_{hex}.meta.json      layer record and reference count
//! ```
//!
//! Identical layers shared across images are stored once. Operations on one
//! digest are serialized by a per-digest lock; different digests proceed in
//! parallel.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use andock_core::digest::{digest_dirname, parse_sha256};
use andock_core::error::{AndockError, Result};
use andock_core::image::Layer;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Marker name for an opaque directory inside a layer tar.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
/// Prefix for a whiteout file inside a layer tar.
const WHITEOUT_PREFIX: &str = ".wh.";

/// Persisted per-layer metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerMeta {
    #[serde(flatten)]
    pub layer: Layer,
    /// Paths (relative to the rootfs) this layer deletes from lower layers.
    #[serde(default)]
    pub whiteouts: Vec<PathBuf>,
    /// Directories whose lower-layer contents this layer hides.
    #[serde(default)]
    pub opaque_dirs: Vec<PathBuf>,
}

/// Result of unpacking one archive.
#[derive(Debug, Default)]
struct Unpacked {
    size: u64,
    whiteouts: Vec<PathBuf>,
    opaque_dirs: Vec<PathBuf>,
}

pub struct LayerStore {
    blobs_dir: PathBuf,
    layers_dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LayerStore {
    /// Open the store, creating directories and discarding leftovers of
    /// interrupted downloads and extractions.
    pub fn open(blobs_dir: &Path, layers_dir: &Path) -> Result<Self> {
        for dir in [blobs_dir, layers_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                AndockError::Disk(format!(
                    "Failed to create store directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            remove_temp_entries(dir)?;
        }

        Ok(Self {
            blobs_dir: blobs_dir.to_path_buf(),
            layers_dir: layers_dir.to_path_buf(),
            locks: DashMap::new(),
        })
    }

    pub fn blobs_dir(&self) -> &Path {
        &self.blobs_dir
    }

    fn lock_for(&self, digest: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(digest.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn blob_path(&self, digest: &str) -> PathBuf {
        self.blobs_dir.join(digest_dirname(digest))
    }

    pub fn tree_path(&self, digest: &str) -> PathBuf {
        self.layers_dir.join(digest_dirname(digest))
    }

    fn marker_path(&self, digest: &str) -> PathBuf {
        self.layers_dir
            .join(format!("{}.complete", digest_dirname(digest)))
    }

    fn meta_path(&self, digest: &str) -> PathBuf {
        self.layers_dir
            .join(format!("{}.meta.json", digest_dirname(digest)))
    }

    /// Whether the compressed blob is stored.
    pub fn has(&self, digest: &str) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Whether the extracted tree is complete.
    pub fn is_extracted(&self, digest: &str) -> bool {
        self.marker_path(digest).is_file() && self.tree_path(digest).is_dir()
    }

    /// Stream a blob into the store, verifying its sha256 on the way.
    ///
    /// Nothing appears under the final blob name unless the content hashes
    /// to `digest`. `on_progress` receives the running byte count.
    pub async fn put<F>(
        &self,
        digest: &str,
        media_type: &str,
        mut stream: BoxStream<'_, Result<Bytes>>,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<PathBuf>
    where
        F: FnMut(u64) + Send,
    {
        parse_sha256(digest)?;
        let lock = self.lock_for(digest);
        let _guard = lock.lock().await;

        let blob_path = self.blob_path(digest);
        if blob_path.is_file() {
            return Ok(blob_path);
        }

        let tmp_path = self
            .blobs_dir
            .join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));

        let written = match self
            .write_verified(digest, &tmp_path, &mut stream, cancel, &mut on_progress)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&tmp_path, &blob_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(AndockError::Disk(format!(
                "Failed to move blob into place {}: {}",
                blob_path.display(),
                e
            )));
        }

        let meta = match self.read_meta(digest)? {
            Some(mut meta) => {
                meta.layer.compressed_size = written;
                meta
            }
            None => LayerMeta {
                layer: Layer {
                    digest: digest.to_string(),
                    media_type: media_type.to_string(),
                    compressed_size: written,
                    uncompressed_size: None,
                    blob_path: blob_path.clone(),
                    tree_path: self.tree_path(digest),
                    ref_count: 0,
                },
                whiteouts: Vec::new(),
                opaque_dirs: Vec::new(),
            },
        };
        self.write_meta(&meta)?;

        tracing::debug!(digest, bytes = written, "Stored layer blob");
        Ok(blob_path)
    }

    async fn write_verified<F>(
        &self,
        digest: &str,
        tmp_path: &Path,
        stream: &mut BoxStream<'_, Result<Bytes>>,
        cancel: &CancellationToken,
        on_progress: &mut F,
    ) -> Result<u64>
    where
        F: FnMut(u64) + Send,
    {
        let mut file = tokio::fs::File::create(tmp_path).await.map_err(|e| {
            AndockError::Disk(format!("Failed to create {}: {}", tmp_path.display(), e))
        })?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(AndockError::Cancelled(format!("download of {}", digest)));
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(|e| {
                AndockError::Disk(format!("Failed to write {}: {}", tmp_path.display(), e))
            })?;
            written += chunk.len() as u64;
            on_progress(written);
        }

        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
        if actual != digest {
            return Err(AndockError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }

        file.flush().await?;
        file.sync_all().await.map_err(|e| {
            AndockError::Disk(format!("Failed to sync {}: {}", tmp_path.display(), e))
        })?;
        Ok(written)
    }

    /// Extract the stored blob into its tree. Idempotent.
    pub async fn extract(&self, digest: &str) -> Result<PathBuf> {
        parse_sha256(digest)?;
        let lock = self.lock_for(digest);
        let _guard = lock.lock().await;
        self.extract_locked(digest).await
    }

    /// Extract if needed and take a reference, under one hold of the
    /// digest lock so a concurrent release cannot delete the tree between
    /// the two.
    pub async fn acquire(&self, digest: &str) -> Result<PathBuf> {
        parse_sha256(digest)?;
        let lock = self.lock_for(digest);
        let _guard = lock.lock().await;
        let tree = self.extract_locked(digest).await?;
        self.retain_locked(digest)?;
        Ok(tree)
    }

    /// Take a reference only if the tree is already complete.
    pub async fn retain_extracted(&self, digest: &str) -> Result<bool> {
        let lock = self.lock_for(digest);
        let _guard = lock.lock().await;
        if !self.is_extracted(digest) {
            return Ok(false);
        }
        self.retain_locked(digest)?;
        Ok(true)
    }

    async fn extract_locked(&self, digest: &str) -> Result<PathBuf> {
        let tree = self.tree_path(digest);
        if self.is_extracted(digest) {
            return Ok(tree);
        }

        let blob = self.blob_path(digest);
        if !blob.is_file() {
            return Err(AndockError::not_found("layer blob", digest));
        }

        let tmp_dir = self
            .layers_dir
            .join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
        let blob_for_task = blob.clone();
        let tmp_for_task = tmp_dir.clone();
        let unpacked = tokio::task::spawn_blocking(move || {
            unpack_archive(&blob_for_task, &tmp_for_task)
        })
        .await
        .map_err(|e| AndockError::Disk(format!("Extraction task failed: {}", e)))?;

        let unpacked = match unpacked {
            Ok(u) => u,
            Err(e) => {
                let _ = remove_tree(&tmp_dir);
                return Err(e);
            }
        };

        if tree.exists() {
            remove_tree(&tree)?;
        }
        std::fs::rename(&tmp_dir, &tree).map_err(|e| {
            let _ = remove_tree(&tmp_dir);
            AndockError::Disk(format!(
                "Failed to move extracted layer into place {}: {}",
                tree.display(),
                e
            ))
        })?;

        let mut meta = match self.read_meta(digest)? {
            Some(meta) => meta,
            None => LayerMeta {
                layer: Layer {
                    digest: digest.to_string(),
                    media_type: String::new(),
                    compressed_size: std::fs::metadata(&blob).map(|m| m.len()).unwrap_or(0),
                    uncompressed_size: None,
                    blob_path: blob.clone(),
                    tree_path: tree.clone(),
                    ref_count: 0,
                },
                whiteouts: Vec::new(),
                opaque_dirs: Vec::new(),
            },
        };
        meta.layer.uncompressed_size = Some(unpacked.size);
        meta.whiteouts = unpacked.whiteouts;
        meta.opaque_dirs = unpacked.opaque_dirs;
        self.write_meta(&meta)?;

        std::fs::write(self.marker_path(digest), b"").map_err(|e| {
            AndockError::Disk(format!("Failed to write extraction marker: {}", e))
        })?;

        tracing::debug!(digest, size = unpacked.size, path = %tree.display(), "Extracted layer");
        Ok(tree)
    }

    /// Increment the reference count. The layer must be stored.
    pub async fn retain(&self, digest: &str) -> Result<u32> {
        let lock = self.lock_for(digest);
        let _guard = lock.lock().await;
        self.retain_locked(digest)
    }

    fn retain_locked(&self, digest: &str) -> Result<u32> {
        let mut meta = self
            .read_meta(digest)?
            .ok_or_else(|| AndockError::not_found("layer", digest))?;
        meta.layer.ref_count += 1;
        self.write_meta(&meta)?;
        Ok(meta.layer.ref_count)
    }

    /// Decrement the reference count, deleting blob and tree at zero.
    /// Releasing an unreferenced or unknown layer does nothing.
    pub async fn release(&self, digest: &str) -> Result<u32> {
        let lock = self.lock_for(digest);
        let _guard = lock.lock().await;

        let Some(mut meta) = self.read_meta(digest)? else {
            return Ok(0);
        };
        if meta.layer.ref_count == 0 {
            return Ok(0);
        }

        meta.layer.ref_count -= 1;
        if meta.layer.ref_count > 0 {
            self.write_meta(&meta)?;
            return Ok(meta.layer.ref_count);
        }

        self.delete_files(digest)?;
        tracing::info!(digest, "Deleted unreferenced layer");
        Ok(0)
    }

    fn delete_files(&self, digest: &str) -> Result<()> {
        // Marker first so a crash mid-delete never leaves a "complete" partial tree
        for file in [self.marker_path(digest), self.blob_path(digest)] {
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(AndockError::Disk(format!(
                        "Failed to remove {}: {}",
                        file.display(),
                        e
                    )))
                }
            }
        }
        let tree = self.tree_path(digest);
        if tree.exists() {
            remove_tree(&tree)?;
        }
        let meta = self.meta_path(digest);
        if meta.exists() {
            std::fs::remove_file(&meta).map_err(|e| {
                AndockError::Disk(format!("Failed to remove {}: {}", meta.display(), e))
            })?;
        }
        Ok(())
    }

    /// Current reference count, 0 for unknown layers.
    pub fn refcount(&self, digest: &str) -> Result<u32> {
        Ok(self
            .read_meta(digest)?
            .map(|m| m.layer.ref_count)
            .unwrap_or(0))
    }

    pub fn get(&self, digest: &str) -> Result<Option<LayerMeta>> {
        self.read_meta(digest)
    }

    /// Every stored layer record.
    pub fn list(&self) -> Result<Vec<Layer>> {
        let mut layers = Vec::new();
        let entries = std::fs::read_dir(&self.layers_dir).map_err(|e| {
            AndockError::Disk(format!(
                "Failed to read {}: {}",
                self.layers_dir.display(),
                e
            ))
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            let is_meta = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with(".meta.json"));
            if !is_meta {
                continue;
            }
            match std::fs::read(&path)
                .map_err(AndockError::from)
                .and_then(|data| Ok(serde_json::from_slice::<LayerMeta>(&data)?))
            {
                Ok(meta) => layers.push(meta.layer),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable layer metadata");
                }
            }
        }

        layers.sort_by(|a, b| a.digest.cmp(&b.digest));
        Ok(layers)
    }

    fn read_meta(&self, digest: &str) -> Result<Option<LayerMeta>> {
        let path = self.meta_path(digest);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AndockError::Disk(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Atomic write: tmp file then rename.
    fn write_meta(&self, meta: &LayerMeta) -> Result<()> {
        let path = self.meta_path(&meta.layer.digest);
        let tmp = self
            .layers_dir
            .join(format!(".tmp-{}.json", uuid::Uuid::new_v4().simple()));
        std::fs::write(&tmp, serde_json::to_vec_pretty(meta)?).map_err(|e| {
            AndockError::Disk(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            AndockError::Disk(format!("Failed to write {}: {}", path.display(), e))
        })
    }
}

/// Remove `.tmp-*` leftovers from an interrupted run.
fn remove_temp_entries(dir: &Path) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| AndockError::Disk(format!("Failed to read {}: {}", dir.display(), e)))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(".tmp-") {
            continue;
        }
        let path = entry.path();
        let result = if path.is_dir() {
            remove_tree(&path)
        } else {
            std::fs::remove_file(&path).map_err(AndockError::from)
        };
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Failed to clean temp entry");
        } else {
            tracing::debug!(path = %path.display(), "Removed stale temp entry");
        }
    }
    Ok(())
}

/// Remove a directory tree, making read-only directories writable first.
pub(crate) fn remove_tree(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(_) => {
            let mut stack = vec![path.to_path_buf()];
            while let Some(dir) = stack.pop() {
                if let Ok(meta) = std::fs::symlink_metadata(&dir) {
                    if meta.is_dir() {
                        let mode = meta.permissions().mode() | 0o700;
                        let _ = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(mode));
                        if let Ok(entries) = std::fs::read_dir(&dir) {
                            stack.extend(entries.flatten().map(|e| e.path()));
                        }
                    }
                }
            }
            std::fs::remove_dir_all(path).map_err(|e| {
                AndockError::Disk(format!("Failed to remove {}: {}", path.display(), e))
            })
        }
    }
}

/// Unpack a gzip or plain tar archive into `dest`, recording whiteouts
/// instead of writing them.
fn unpack_archive(blob: &Path, dest: &Path) -> Result<Unpacked> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(dest)
        .map_err(|e| AndockError::Disk(format!("Failed to create {}: {}", dest.display(), e)))?;

    let mut magic = [0u8; 2];
    let read = std::fs::File::open(blob)
        .and_then(|mut f| f.read(&mut magic))
        .map_err(|e| AndockError::Disk(format!("Failed to open {}: {}", blob.display(), e)))?;
    let gzipped = read == 2 && magic == [0x1f, 0x8b];

    let file = std::fs::File::open(blob)
        .map_err(|e| AndockError::Disk(format!("Failed to open {}: {}", blob.display(), e)))?;
    let reader: Box<dyn Read> = if gzipped {
        Box::new(flate2::read::GzDecoder::new(std::io::BufReader::new(file)))
    } else {
        Box::new(std::io::BufReader::new(file))
    };

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);

    let extract_err =
        |e: std::io::Error| AndockError::Disk(format!("Failed to extract {}: {}", blob.display(), e));

    let mut unpacked = Unpacked::default();
    for entry in archive.entries().map_err(extract_err)? {
        let mut entry = entry.map_err(extract_err)?;
        let path = entry.path().map_err(extract_err)?.into_owned();
        let rel: PathBuf = path
            .components()
            .filter(|c| matches!(c, std::path::Component::Normal(_)))
            .collect();
        let Some(name) = rel.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        let parent = rel.parent().map(Path::to_path_buf).unwrap_or_default();

        if name == OPAQUE_WHITEOUT {
            unpacked.opaque_dirs.push(parent);
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            unpacked.whiteouts.push(parent.join(hidden));
            continue;
        }

        let entry_type = entry.header().entry_type();
        if entry_type.is_block_special() || entry_type.is_character_special() || entry_type.is_fifo() {
            tracing::trace!(path = %rel.display(), "Skipping device node");
            continue;
        }

        unpacked.size += entry.header().size().unwrap_or(0);
        entry.unpack_in(dest).map_err(extract_err)?;

        // Keep directories writable so later entries can land inside them
        if entry_type.is_dir() {
            let target = dest.join(&rel);
            if let Ok(meta) = std::fs::metadata(&target) {
                let mode = meta.permissions().mode() | 0o700;
                let _ = std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode));
            }
        }
    }

    Ok(unpacked)
}
