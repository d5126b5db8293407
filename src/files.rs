//! Path mutator: save/create/rename/delete over the flat blob store.
//!
//! The store has no move or transactional-rename primitive, so rename and
//! recursive delete are sequences of get/put/remove. A failure partway
//! leaves the already-processed keys in their new state; the partial path
//! map is carried out through `Error::PartialMutation` instead of being
//! silently dropped.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{Error, PathMap, Result};
use crate::storage::BlobStore;
use crate::tree::PLACEHOLDER;

/// Hard per-call ceiling on saved file content, checked before any rate-limit
/// token is consumed.
pub const MAX_SAVE_BYTES: usize = 5 * 1024 * 1024;

/// Ceiling on a workspace's total stored bytes; creating new entries in a
/// workspace at or over this is refused.
pub const MAX_WORKSPACE_BYTES: u64 = 200 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

/// A path addresses a file when its final segment carries an extension-like
/// separator; everything else is treated as a folder prefix.
pub fn is_file_path(path: &str) -> bool {
    path.rsplit('/').next().is_some_and(|seg| seg.contains('.'))
}

pub fn check_save_size(content: &str) -> Result<()> {
    let size = content.len();
    if size > MAX_SAVE_BYTES {
        return Err(Error::PayloadTooLarge { size, max: MAX_SAVE_BYTES });
    }
    Ok(())
}

/// Overwrite a file's content (last writer wins).
pub async fn save_file(store: &dyn BlobStore, path: &str, content: &str) -> Result<()> {
    check_save_size(content)?;
    store.put(path, content.as_bytes(), true).await
}

/// Create an empty file, or a folder represented by its placeholder marker.
pub async fn create_entry(
    store: &dyn BlobStore,
    name: &str,
    kind: EntryKind,
    parent_path: &str,
) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(Error::Validation(format!("invalid entry name {name:?}")));
    }
    match kind {
        EntryKind::File => store.put(&format!("{parent_path}/{name}"), b"", true).await,
        EntryKind::Folder => {
            store
                .put(
                    &format!("{parent_path}/{name}/{PLACEHOLDER}"),
                    b".folder",
                    true,
                )
                .await
        }
    }
}

/// Total bytes of every leaf under `prefix`, from the store's listing sizes.
pub fn workspace_size(store: &dyn BlobStore, prefix: String) -> BoxFuture<'_, Result<u64>> {
    Box::pin(async move {
        let mut total = 0;
        for entry in store.list(&prefix).await? {
            if entry.is_leaf {
                total += entry.size.unwrap_or(0);
            } else {
                total += workspace_size(store, format!("{prefix}/{}", entry.name)).await?;
            }
        }
        Ok(total)
    })
}

/// Refuse further entry creation once a workspace has reached its storage
/// ceiling.
pub async fn check_workspace_size(store: &dyn BlobStore, root_prefix: &str) -> Result<()> {
    ensure_size_below(store, root_prefix, MAX_WORKSPACE_BYTES).await
}

async fn ensure_size_below(store: &dyn BlobStore, root_prefix: &str, max: u64) -> Result<()> {
    let size = workspace_size(store, root_prefix.to_string()).await?;
    if size >= max {
        return Err(Error::PayloadTooLarge {
            size: size as usize,
            max: max as usize,
        });
    }
    Ok(())
}

/// Every descendant leaf key under `prefix`, in listing order.
pub fn collect_leaves(store: &dyn BlobStore, prefix: String) -> BoxFuture<'_, Result<Vec<String>>> {
    Box::pin(async move {
        let mut out = Vec::new();
        for entry in store.list(&prefix).await? {
            let full = format!("{prefix}/{}", entry.name);
            if entry.is_leaf {
                out.push(full);
            } else {
                out.extend(collect_leaves(store, full).await?);
            }
        }
        Ok(out)
    })
}

/// Rename/move `path` to `new_name` within its parent.
///
/// Returns the old-key to new-key map. Folders move every descendant leaf
/// individually and finish with a synthetic `old -> new` top-level mapping
/// for client bookkeeping; the folder prefix itself is not a real object.
pub async fn rename_entry(store: &dyn BlobStore, path: &str, new_name: &str) -> Result<PathMap> {
    if new_name.is_empty() || new_name.contains('/') {
        return Err(Error::Validation(format!("invalid name {new_name:?}")));
    }
    let new_path = match path.rsplit_once('/') {
        Some((base, _)) => format!("{base}/{new_name}"),
        None => new_name.to_string(),
    };

    let mut path_map = PathMap::new();

    if is_file_path(path) {
        move_blob(store, path, &new_path, &path_map).await?;
        path_map.insert(path.to_string(), new_path);
        return Ok(path_map);
    }

    let leaves = collect_leaves(store, path.to_string()).await?;
    for old_key in leaves {
        // skip prefix + "/"
        let relative = &old_key[path.len() + 1..];
        let new_key = format!("{new_path}/{relative}");
        move_blob(store, &old_key, &new_key, &path_map).await?;
        path_map.insert(old_key, new_key);
    }
    path_map.insert(path.to_string(), new_path);
    Ok(path_map)
}

/// Copy-then-delete for a single key. On failure the mappings completed so
/// far ride out in the error.
async fn move_blob(
    store: &dyn BlobStore,
    old_key: &str,
    new_key: &str,
    completed: &PathMap,
) -> Result<()> {
    let step = async {
        let bytes = store.get(old_key).await?;
        store.put(new_key, &bytes, true).await?;
        store.remove(std::slice::from_ref(&old_key.to_string())).await
    };
    step.await.map_err(|err| Error::PartialMutation {
        completed: completed.clone(),
        reason: format!("moving {old_key}: {err}"),
    })
}

/// Delete a file, or recursively delete a folder's descendants and its
/// placeholder marker. Siblings already processed stay deleted when a later
/// step fails.
pub fn delete_entry<'a>(store: &'a dyn BlobStore, path: &'a str) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        if is_file_path(path) {
            return store.remove(std::slice::from_ref(&path.to_string())).await;
        }

        let mut keys = Vec::new();
        for entry in store.list(path).await? {
            let full = format!("{path}/{}", entry.name);
            if entry.is_leaf {
                keys.push(full);
            } else {
                delete_entry(store, &full).await?;
            }
        }
        let marker = format!("{path}/{PLACEHOLDER}");
        if !keys.contains(&marker) {
            keys.push(marker);
        }
        store.remove(&keys).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .seed([
                ("u1/vb1/src/index.js", "a"),
                ("u1/vb1/src/utils/a.js", "b"),
                ("u1/vb1/.placeholder", ".folder"),
            ])
            .await;
        store
    }

    #[test]
    fn file_paths_are_detected_by_extension() {
        assert!(is_file_path("u1/vb1/src/index.js"));
        assert!(is_file_path("u1/vb1/.placeholder"));
        assert!(!is_file_path("u1/vb1/src"));
        assert!(!is_file_path("src"));
    }

    #[tokio::test]
    async fn rename_file_moves_blob_and_maps_path() {
        let store = seeded().await;
        let map = rename_entry(&store, "u1/vb1/src/index.js", "main.js")
            .await
            .unwrap();
        assert_eq!(map.get("u1/vb1/src/index.js").unwrap(), "u1/vb1/src/main.js");
        assert_eq!(store.get("u1/vb1/src/main.js").await.unwrap(), b"a");
        assert!(store.get("u1/vb1/src/index.js").await.is_err());
    }

    #[tokio::test]
    async fn rename_folder_remaps_every_descendant() {
        let store = seeded().await;
        let map = rename_entry(&store, "u1/vb1/src", "lib").await.unwrap();

        assert_eq!(map.get("u1/vb1/src/index.js").unwrap(), "u1/vb1/lib/index.js");
        assert_eq!(
            map.get("u1/vb1/src/utils/a.js").unwrap(),
            "u1/vb1/lib/utils/a.js"
        );
        // synthetic top-level mapping
        assert_eq!(map.get("u1/vb1/src").unwrap(), "u1/vb1/lib");
        assert_eq!(map.len(), 3);

        let entries = crate::tree::workspace_entries(&store, "u1/vb1")
            .await
            .unwrap();
        assert!(entries.iter().all(|e| e.name() != "src"));
        assert!(entries.iter().any(|e| e.name() == "lib"));
    }

    #[tokio::test]
    async fn rename_missing_file_reports_partial_mutation() {
        let store = MemoryStore::new();
        let err = rename_entry(&store, "u1/vb1/gone.js", "x.js")
            .await
            .unwrap_err();
        match err {
            Error::PartialMutation { completed, .. } => assert!(completed.is_empty()),
            other => panic!("expected PartialMutation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_folder_removes_all_descendants() {
        let store = seeded().await;
        delete_entry(&store, "u1/vb1/src").await.unwrap();

        let keys = store.keys().await;
        assert!(keys.iter().all(|k| !k.starts_with("u1/vb1/src")));
        // the rest of the workspace is untouched
        assert!(keys.contains(&"u1/vb1/.placeholder".to_string()));
    }

    #[tokio::test]
    async fn delete_file_removes_single_key() {
        let store = seeded().await;
        delete_entry(&store, "u1/vb1/src/index.js").await.unwrap();
        assert!(store.get("u1/vb1/src/index.js").await.is_err());
        assert!(store.get("u1/vb1/src/utils/a.js").await.is_ok());
    }

    #[tokio::test]
    async fn create_folder_writes_placeholder_marker() {
        let store = seeded().await;
        create_entry(&store, "docs", EntryKind::Folder, "u1/vb1")
            .await
            .unwrap();
        assert!(store.get("u1/vb1/docs/.placeholder").await.is_ok());

        create_entry(&store, "notes.md", EntryKind::File, "u1/vb1")
            .await
            .unwrap();
        assert_eq!(store.get("u1/vb1/notes.md").await.unwrap(), b"");
    }

    #[tokio::test]
    async fn workspace_size_sums_every_descendant_leaf() {
        let store = seeded().await;
        // "a" (1) + "b" (1) + ".folder" (7)
        assert_eq!(
            workspace_size(&store, "u1/vb1".to_string()).await.unwrap(),
            9
        );
        assert_eq!(
            workspace_size(&store, "u1/none".to_string()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn full_workspace_refuses_new_entries() {
        let store = seeded().await;
        let err = ensure_size_below(&store, "u1/vb1", 9).await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { size: 9, max: 9 }));
        ensure_size_below(&store, "u1/vb1", 10).await.unwrap();
    }

    #[tokio::test]
    async fn save_file_enforces_byte_ceiling() {
        let store = seeded().await;
        let big = "x".repeat(MAX_SAVE_BYTES + 1);
        let err = save_file(&store, "u1/vb1/big.txt", &big).await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));
        assert!(store.get("u1/vb1/big.txt").await.is_err());
    }
}
