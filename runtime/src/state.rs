//! JSON-file entity store.
//!
//! One `{key}.json` file per record under a directory. Writes go to a
//! temp file which is then renamed over the target, so each record write
//! is atomic.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use andock_core::error::{AndockError, Result};
use andock_core::store::{Entity, EntityStore};
use async_trait::async_trait;

/// Directory-backed store for one entity kind.
pub struct JsonStore<T> {
    dir: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> JsonStore<T> {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            AndockError::Disk(format!(
                "Failed to create state directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        Ok(Self {
            dir: dir.to_path_buf(),
            _marker: PhantomData,
        })
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(key)))
    }
}

/// Replace characters that are not safe in file names.
pub fn sanitize_key(key: &str) -> String {
    key.replace([':', '/'], "_")
}

#[async_trait]
impl<T: Entity> EntityStore<T> for JsonStore<T> {
    async fn get(&self, key: &str) -> Result<Option<T>> {
        let path = self.record_path(key);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AndockError::Disk(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn put(&self, value: &T) -> Result<()> {
        let path = self.record_path(&value.key());
        let json = serde_json::to_vec_pretty(value)?;

        // Atomic write: write to tmp, then rename
        let tmp_path = self
            .dir
            .join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp_path, &json).await.map_err(|e| {
            AndockError::Disk(format!(
                "Failed to write tmp file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(AndockError::Disk(format!(
                "Failed to rename {} → {}: {}",
                tmp_path.display(),
                path.display(),
                e
            )));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.record_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AndockError::Disk(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn list(&self) -> Result<Vec<T>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            AndockError::Disk(format!(
                "Failed to read state directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with(".json") && !n.starts_with('.'));
            if !is_record {
                continue;
            }
            let data = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<T>(&data) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable record");
                }
            }
        }

        records.sort_by_key(|r| r.key());
        Ok(records)
    }
}
