//! On-disk content caches.

pub mod layer_store;

pub use layer_store::{LayerMeta, LayerStore};
