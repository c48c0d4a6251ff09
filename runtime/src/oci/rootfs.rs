//! Container rootfs materialization.
//!
//! Copies an image's extracted layer trees into a private directory, base
//! layer first, applying each layer's whiteouts to everything below it.

use std::path::{Path, PathBuf};

use andock_core::error::{AndockError, Result};

use crate::cache::layer_store::{remove_tree, LayerMeta};

/// Directories every container rootfs gets.
const BASE_DIRS: &[&str] = &["dev", "proc", "sys", "tmp", "etc", "root", "run"];

/// Builds one container rootfs from a layer stack.
pub struct RootfsBuilder {
    rootfs_path: PathBuf,
}

impl RootfsBuilder {
    pub fn new(rootfs_path: impl Into<PathBuf>) -> Self {
        Self {
            rootfs_path: rootfs_path.into(),
        }
    }

    /// Materialize `layers` (base first). Blocking.
    pub fn build(&self, layers: &[LayerMeta]) -> Result<()> {
        std::fs::create_dir_all(&self.rootfs_path).map_err(|e| {
            AndockError::Disk(format!(
                "Failed to create rootfs {}: {}",
                self.rootfs_path.display(),
                e
            ))
        })?;

        for meta in layers {
            self.apply_layer(meta)?;
        }

        for dir in BASE_DIRS {
            let path = self.rootfs_path.join(dir);
            if !path.exists() {
                std::fs::create_dir_all(&path).map_err(|e| {
                    AndockError::Disk(format!("Failed to create {}: {}", path.display(), e))
                })?;
            }
        }
        self.create_essential_files()?;

        tracing::debug!(rootfs = %self.rootfs_path.display(), layers = layers.len(), "Rootfs materialized");
        Ok(())
    }

    fn apply_layer(&self, meta: &LayerMeta) -> Result<()> {
        for dir in &meta.opaque_dirs {
            let target = self.rootfs_path.join(dir);
            if target.is_dir() {
                clear_dir(&target)?;
            }
        }

        for path in &meta.whiteouts {
            let target = self.rootfs_path.join(path);
            remove_path(&target)?;
        }

        let tree = &meta.layer.tree_path;
        if !tree.is_dir() {
            return Err(AndockError::not_found("layer tree", meta.layer.digest.clone()));
        }
        copy_tree(tree, &self.rootfs_path)
    }

    /// `/etc/resolv.conf` and `/etc/hosts`, only where the image has none.
    fn create_essential_files(&self) -> Result<()> {
        self.write_if_missing("etc/hosts", "127.0.0.1\tlocalhost\n::1\t\tlocalhost\n")?;

        let resolv = std::fs::read_to_string("/etc/resolv.conf")
            .ok()
            .filter(|s| s.lines().any(|l| l.trim_start().starts_with("nameserver")))
            .unwrap_or_else(|| "nameserver 8.8.8.8\nnameserver 8.8.4.4\n".to_string());
        self.write_if_missing("etc/resolv.conf", &resolv)
    }

    fn write_if_missing(&self, relative_path: &str, content: &str) -> Result<()> {
        let full_path = self.rootfs_path.join(relative_path);
        // A dangling symlink counts as missing
        if full_path.exists() {
            return Ok(());
        }
        if std::fs::symlink_metadata(&full_path).is_ok() {
            let _ = std::fs::remove_file(&full_path);
        }

        std::fs::write(&full_path, content).map_err(|e| {
            AndockError::Disk(format!("Failed to write {}: {}", full_path.display(), e))
        })?;
        tracing::trace!(path = %full_path.display(), "Created file");
        Ok(())
    }
}

fn remove_path(target: &Path) -> Result<()> {
    match std::fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => remove_tree(target),
        Ok(_) => std::fs::remove_file(target).map_err(|e| {
            AndockError::Disk(format!("Failed to remove {}: {}", target.display(), e))
        }),
        Err(_) => Ok(()),
    }
}

fn clear_dir(dir: &Path) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| AndockError::Disk(format!("Failed to read {}: {}", dir.display(), e)))?;
    for entry in entries.flatten() {
        remove_path(&entry.path())?;
    }
    Ok(())
}

/// Copy `src` over `dst`, replacing entries of a different kind and
/// preserving symlinks as links.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let copy_err = |path: &Path, e: std::io::Error| {
        AndockError::Disk(format!("Failed to copy {}: {}", path.display(), e))
    };

    for entry in std::fs::read_dir(src).map_err(|e| copy_err(src, e))? {
        let entry = entry.map_err(|e| copy_err(src, e))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let meta = std::fs::symlink_metadata(&src_path).map_err(|e| copy_err(&src_path, e))?;
        let existing = std::fs::symlink_metadata(&dst_path).ok();

        if meta.file_type().is_symlink() {
            if existing.is_some() {
                remove_path(&dst_path)?;
            }
            let target = std::fs::read_link(&src_path).map_err(|e| copy_err(&src_path, e))?;
            std::os::unix::fs::symlink(&target, &dst_path).map_err(|e| copy_err(&dst_path, e))?;
        } else if meta.is_dir() {
            if existing.as_ref().map_or(false, |m| !m.is_dir()) {
                remove_path(&dst_path)?;
            }
            std::fs::create_dir_all(&dst_path).map_err(|e| copy_err(&dst_path, e))?;
            let mode = meta.permissions().mode() | 0o700;
            let _ = std::fs::set_permissions(&dst_path, std::fs::Permissions::from_mode(mode));
            copy_tree(&src_path, &dst_path)?;
        } else if meta.is_file() {
            if existing.is_some() {
                remove_path(&dst_path)?;
            }
            std::fs::copy(&src_path, &dst_path).map_err(|e| copy_err(&src_path, e))?;
        }
    }

    Ok(())
}
