//! Flat key-addressed blob storage.
//!
//! The store has no native directories: a workspace's file tree exists only
//! as key paths like `u1/vb1/src/index.js`. Folders are implied by their
//! descendant keys (and kept alive by `.placeholder` markers when empty).

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

pub mod memory;
pub mod remote;

pub use memory::MemoryStore;
pub use remote::RemoteStore;

/// One entry of a prefix listing. `is_leaf` entries are real objects;
/// the rest are sub-prefixes to recurse into.
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub name: String,
    pub is_leaf: bool,
    pub size: Option<u64>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// List the immediate children of a prefix (no trailing slash).
    async fn list(&self, prefix: &str) -> Result<Vec<ListEntry>>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Upload a blob. With `upsert` false, an existing key is an error.
    async fn put(&self, key: &str, bytes: &[u8], upsert: bool) -> Result<()>;

    /// Delete keys. Missing keys are ignored.
    async fn remove(&self, keys: &[String]) -> Result<()>;

    /// Time-limited public URL for a key.
    async fn signed_url(&self, key: &str, ttl_secs: u64) -> Result<String>;
}

pub type SharedStore = Arc<dyn BlobStore>;
