//! Entity store contract.
//!
//! Images, containers and mirrors are persisted through [`EntityStore`].
//! Each `put`/`delete` is individually atomic; callers never rely on
//! multi-record transactions.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::container::Container;
use crate::error::Result;
use crate::image::Image;
use crate::mirror::Mirror;

/// A persisted record with a stable key.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn key(&self) -> String;
}

impl Entity for Image {
    fn key(&self) -> String {
        self.id.clone()
    }
}

impl Entity for Container {
    fn key(&self) -> String {
        self.id.clone()
    }
}

impl Entity for Mirror {
    fn key(&self) -> String {
        self.url.clone()
    }
}

/// CRUD access to one kind of record.
#[async_trait]
pub trait EntityStore<T: Entity>: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<T>>;

    /// Insert or replace the record under `value.key()`.
    async fn put(&self, value: &T) -> Result<()>;

    /// Returns whether a record was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<T>>;
}

/// In-memory store, ordered by key. Used by tests and ephemeral setups.
pub struct MemoryStore<T> {
    records: RwLock<BTreeMap<String, T>>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Entity> EntityStore<T> for MemoryStore<T> {
    async fn get(&self, key: &str) -> Result<Option<T>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put(&self, value: &T) -> Result<()> {
        self.records
            .write()
            .await
            .insert(value.key(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn list(&self) -> Result<Vec<T>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}
