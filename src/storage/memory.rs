//! In-memory blob store. Default backend when no remote store is configured,
//! and the backend every unit test runs against.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

use super::{BlobStore, ListEntry};

#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with `(key, content)` pairs.
    pub async fn seed<I, K, V>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let mut blobs = self.blobs.write().await;
        for (k, v) in entries {
            blobs.insert(k.into(), v.into());
        }
    }

    pub async fn keys(&self) -> Vec<String> {
        self.blobs.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ListEntry>> {
        let needle = format!("{}/", prefix.trim_end_matches('/'));
        let blobs = self.blobs.read().await;

        let mut entries: Vec<ListEntry> = Vec::new();
        // dedup against the last folder specifically: a leaf and a
        // sub-prefix may legitimately share a name
        let mut last_dir: Option<&str> = None;
        for (key, bytes) in blobs.range(needle.clone()..) {
            let Some(rest) = key.strip_prefix(&needle) else {
                break; // past the prefix range
            };
            match rest.split_once('/') {
                None => entries.push(ListEntry {
                    name: rest.to_string(),
                    is_leaf: true,
                    size: Some(bytes.len() as u64),
                }),
                Some((dir, _)) => {
                    if last_dir != Some(dir) {
                        last_dir = Some(dir);
                        entries.push(ListEntry {
                            name: dir.to_string(),
                            is_leaf: false,
                            size: None,
                        });
                    }
                }
            }
        }
        Ok(entries)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("blob {key}")))
    }

    async fn put(&self, key: &str, bytes: &[u8], upsert: bool) -> Result<()> {
        let mut blobs = self.blobs.write().await;
        if !upsert && blobs.contains_key(key) {
            return Err(Error::StorageIo(format!("blob {key} already exists")));
        }
        blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        let mut blobs = self.blobs.write().await;
        for key in keys {
            blobs.remove(key);
        }
        Ok(())
    }

    async fn signed_url(&self, key: &str, ttl_secs: u64) -> Result<String> {
        Ok(format!("memory://{key}?ttl={ttl_secs}"))
    }
}
