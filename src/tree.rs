//! Tree projector: builds a hierarchical view over the flat blob store.
//!
//! The tree is derived fresh from a prefix listing on every read and never
//! mutated in place, so clients always observe a consistent post-mutation
//! view. Folder-existence markers (`.placeholder`) are folded into folder
//! existence rather than shown as files.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::storage::BlobStore;

/// Marker blob that keeps an otherwise-empty folder alive in the store.
pub const PLACEHOLDER: &str = ".placeholder";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum PathEntry {
    Folder {
        id: String,
        name: String,
        full_path: String,
        children: Vec<PathEntry>,
    },
    File {
        id: String,
        name: String,
        full_path: String,
    },
}

impl PathEntry {
    pub fn name(&self) -> &str {
        match self {
            PathEntry::Folder { name, .. } | PathEntry::File { name, .. } => name,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, PathEntry::Folder { .. })
    }
}

/// Project the subtree rooted at `prefix` into a Folder node named `name`.
///
/// Leaves in the listing become File nodes, everything else recurses as a
/// sub-prefix. Recursion is bounded by the key depth actually present in the
/// store; listing failures propagate as storage errors.
pub fn build_tree(store: &dyn BlobStore, prefix: String, name: String) -> BoxFuture<'_, Result<PathEntry>> {
    Box::pin(async move {
        let mut children = Vec::new();
        for entry in store.list(&prefix).await? {
            let full_path = format!("{prefix}/{}", entry.name);
            if entry.is_leaf {
                if entry.name == PLACEHOLDER {
                    continue;
                }
                children.push(PathEntry::File {
                    id: Uuid::new_v4().to_string(),
                    name: entry.name,
                    full_path,
                });
            } else {
                children.push(build_tree(store, full_path, entry.name).await?);
            }
        }
        Ok(PathEntry::Folder {
            id: Uuid::new_v4().to_string(),
            name,
            full_path: prefix,
            children,
        })
    })
}

/// The entries a client sees when it loads a workspace: the children of the
/// workspace's root prefix.
pub async fn workspace_entries(store: &dyn BlobStore, root_prefix: &str) -> Result<Vec<PathEntry>> {
    let root = build_tree(store, root_prefix.to_string(), String::new()).await?;
    match root {
        PathEntry::Folder { children, .. } => Ok(children),
        PathEntry::File { .. } => unreachable!("root is always projected as a folder"),
    }
}
