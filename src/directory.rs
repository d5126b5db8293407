//! Typed in-memory store of users, workspaces, and sharing records.
//!
//! Plain CRUD over typed maps; the real-time layer consults it only for the
//! admission check on connect.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceKind {
    Node,
    React,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub kind: WorkspaceKind,
    pub visibility: Visibility,
    pub owner_id: String,
}

impl Workspace {
    /// All of a workspace's file keys live under this prefix.
    pub fn root_prefix(&self) -> String {
        format!("{}/{}", self.owner_id, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Share {
    pub workspace_id: String,
    pub shared_to: String,
    pub shared_by: String,
    pub shared_on: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Shared,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    workspaces: HashMap<String, Workspace>,
    shares: Vec<Share>,
}

#[derive(Default)]
pub struct Directory {
    inner: RwLock<Inner>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    // --- users ---

    pub fn create_user(&self, id: Option<String>, name: String, email: String) -> Result<User> {
        let mut inner = self.inner.write().expect("directory lock poisoned");
        if inner.users.values().any(|u| u.email == email) {
            return Err(Error::Validation(format!("email {email} already registered")));
        }
        let user = User {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name,
            email,
        };
        inner.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    pub fn user(&self, id: &str) -> Result<User> {
        self.inner
            .read()
            .expect("directory lock poisoned")
            .users
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("user {id}")))
    }

    pub fn delete_user(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().expect("directory lock poisoned");
        inner
            .users
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
        inner.workspaces.retain(|_, w| w.owner_id != id);
        inner.shares.retain(|s| s.shared_to != id && s.shared_by != id);
        Ok(())
    }

    // --- workspaces ---

    pub fn create_workspace(
        &self,
        name: String,
        kind: WorkspaceKind,
        visibility: Visibility,
        owner_id: String,
    ) -> Result<Workspace> {
        let mut inner = self.inner.write().expect("directory lock poisoned");
        if !inner.users.contains_key(&owner_id) {
            return Err(Error::NotFound(format!("user {owner_id}")));
        }
        // workspace names are globally unique
        if inner.workspaces.values().any(|w| w.name == name) {
            return Err(Error::Validation(format!("workspace name {name:?} already taken")));
        }
        let workspace = Workspace {
            id: Uuid::new_v4().to_string(),
            name,
            kind,
            visibility,
            owner_id,
        };
        inner.workspaces.insert(workspace.id.clone(), workspace.clone());
        Ok(workspace)
    }

    pub fn workspace(&self, id: &str) -> Result<Workspace> {
        self.inner
            .read()
            .expect("directory lock poisoned")
            .workspaces
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("workspace {id}")))
    }

    pub fn workspaces_for(&self, owner_id: &str) -> Vec<Workspace> {
        self.inner
            .read()
            .expect("directory lock poisoned")
            .workspaces
            .values()
            .filter(|w| w.owner_id == owner_id)
            .cloned()
            .collect()
    }

    pub fn update_workspace(
        &self,
        id: &str,
        owner_id: &str,
        name: Option<String>,
        visibility: Option<Visibility>,
    ) -> Result<Workspace> {
        let mut inner = self.inner.write().expect("directory lock poisoned");
        if let Some(new_name) = &name {
            if inner
                .workspaces
                .values()
                .any(|w| w.name == *new_name && w.id != id)
            {
                return Err(Error::Validation(format!("workspace name {new_name:?} already taken")));
            }
        }
        let workspace = inner
            .workspaces
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("workspace {id}")))?;
        if workspace.owner_id != owner_id {
            return Err(Error::Unauthorized("only the owner may update a workspace".to_string()));
        }
        if let Some(name) = name {
            workspace.name = name;
        }
        if let Some(visibility) = visibility {
            workspace.visibility = visibility;
        }
        Ok(workspace.clone())
    }

    pub fn delete_workspace(&self, id: &str, owner_id: &str) -> Result<()> {
        let mut inner = self.inner.write().expect("directory lock poisoned");
        let workspace = inner
            .workspaces
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("workspace {id}")))?;
        if workspace.owner_id != owner_id {
            return Err(Error::Unauthorized("only the owner may delete a workspace".to_string()));
        }
        inner.workspaces.remove(id);
        inner.shares.retain(|s| s.workspace_id != id);
        Ok(())
    }

    // --- sharing ---

    pub fn share(&self, workspace_id: &str, shared_by: &str, shared_to: &str) -> Result<Share> {
        if shared_by == shared_to {
            return Err(Error::Validation("cannot share a workspace with yourself".to_string()));
        }
        let mut inner = self.inner.write().expect("directory lock poisoned");
        let workspace = inner
            .workspaces
            .get(workspace_id)
            .ok_or_else(|| Error::NotFound(format!("workspace {workspace_id}")))?;
        if workspace.owner_id != shared_by {
            return Err(Error::Unauthorized("only the owner may share a workspace".to_string()));
        }
        if !inner.users.contains_key(shared_to) {
            return Err(Error::NotFound(format!("user {shared_to}")));
        }
        if inner
            .shares
            .iter()
            .any(|s| s.workspace_id == workspace_id && s.shared_to == shared_to)
        {
            return Err(Error::Validation("user already has access".to_string()));
        }
        let share = Share {
            workspace_id: workspace_id.to_string(),
            shared_to: shared_to.to_string(),
            shared_by: shared_by.to_string(),
            shared_on: now_secs(),
        };
        inner.shares.push(share.clone());
        Ok(share)
    }

    pub fn unshare(&self, workspace_id: &str, shared_by: &str, shared_to: &str) -> Result<()> {
        let mut inner = self.inner.write().expect("directory lock poisoned");
        let before = inner.shares.len();
        inner.shares.retain(|s| {
            !(s.workspace_id == workspace_id && s.shared_to == shared_to && s.shared_by == shared_by)
        });
        if inner.shares.len() == before {
            return Err(Error::NotFound("workspace not shared with user".to_string()));
        }
        Ok(())
    }

    pub fn shared_with(&self, user_id: &str) -> Vec<Workspace> {
        let inner = self.inner.read().expect("directory lock poisoned");
        inner
            .shares
            .iter()
            .filter(|s| s.shared_to == user_id)
            .filter_map(|s| inner.workspaces.get(&s.workspace_id).cloned())
            .collect()
    }

    /// Admission check: the user must be the recorded owner or present in the
    /// workspace's shared-access list.
    pub fn role_for(&self, user_id: &str, workspace_id: &str) -> Result<Role> {
        let inner = self.inner.read().expect("directory lock poisoned");
        if !inner.users.contains_key(user_id) {
            return Err(Error::NotFound(format!("user {user_id}")));
        }
        let workspace = inner
            .workspaces
            .get(workspace_id)
            .ok_or_else(|| Error::NotFound(format!("workspace {workspace_id}")))?;
        if workspace.owner_id == user_id {
            return Ok(Role::Owner);
        }
        if inner
            .shares
            .iter()
            .any(|s| s.workspace_id == workspace_id && s.shared_to == user_id)
        {
            return Ok(Role::Shared);
        }
        Err(Error::Unauthorized(format!(
            "user {user_id} has no access to workspace {workspace_id}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Directory, User, User, Workspace) {
        let dir = Directory::new();
        let owner = dir
            .create_user(None, "Ada".into(), "ada@example.com".into())
            .unwrap();
        let guest = dir
            .create_user(None, "Lin".into(), "lin@example.com".into())
            .unwrap();
        let ws = dir
            .create_workspace(
                "proj".into(),
                WorkspaceKind::Node,
                Visibility::Private,
                owner.id.clone(),
            )
            .unwrap();
        (dir, owner, guest, ws)
    }

    #[test]
    fn workspace_names_are_globally_unique() {
        let (dir, owner, _, _) = setup();
        let err = dir
            .create_workspace(
                "proj".into(),
                WorkspaceKind::React,
                Visibility::Public,
                owner.id,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn role_resolution_covers_owner_shared_and_denied() {
        let (dir, owner, guest, ws) = setup();
        assert_eq!(dir.role_for(&owner.id, &ws.id).unwrap(), Role::Owner);
        assert!(matches!(
            dir.role_for(&guest.id, &ws.id),
            Err(Error::Unauthorized(_))
        ));

        dir.share(&ws.id, &owner.id, &guest.id).unwrap();
        assert_eq!(dir.role_for(&guest.id, &ws.id).unwrap(), Role::Shared);

        assert!(matches!(
            dir.role_for("nobody", &ws.id),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn sharing_rejects_self_and_duplicates() {
        let (dir, owner, guest, ws) = setup();
        assert!(dir.share(&ws.id, &owner.id, &owner.id).is_err());
        dir.share(&ws.id, &owner.id, &guest.id).unwrap();
        assert!(dir.share(&ws.id, &owner.id, &guest.id).is_err());

        assert_eq!(dir.shared_with(&guest.id).len(), 1);
        dir.unshare(&ws.id, &owner.id, &guest.id).unwrap();
        assert!(dir.shared_with(&guest.id).is_empty());
    }

    #[test]
    fn deleting_a_workspace_drops_its_shares() {
        let (dir, owner, guest, ws) = setup();
        dir.share(&ws.id, &owner.id, &guest.id).unwrap();
        // non-owner cannot delete
        assert!(dir.delete_workspace(&ws.id, &guest.id).is_err());
        dir.delete_workspace(&ws.id, &owner.id).unwrap();
        assert!(dir.workspace(&ws.id).is_err());
        assert!(dir.shared_with(&guest.id).is_empty());
    }
}
