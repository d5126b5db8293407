//! Container engine interface and per-workspace environment provisioning.
//!
//! Provisioning is an explicit get-or-create state machine driven off what
//! the engine actually reports (image missing, container absent/stopped/
//! running), single-flighted per workspace id so concurrent terminal creates
//! for the same workspace never race a duplicate build.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{Error, Result};
use crate::files;
use crate::storage::SharedStore;
use crate::tree::PLACEHOLDER;

/// Container port forwarded to the host for workspace previews.
pub const PREVIEW_PORT: u16 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub name: String,
    pub status: ContainerStatus,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub workdir: String,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn image_exists(&self, tag: &str) -> Result<bool>;
    async fn build_image(&self, tag: &str, context_dir: &Path) -> Result<()>;
    async fn get_container(&self, name: &str) -> Result<Option<ContainerInfo>>;
    async fn create_container(&self, spec: &ContainerSpec) -> Result<()>;
    async fn start(&self, name: &str) -> Result<()>;
    async fn stop(&self, name: &str) -> Result<()>;
    /// Host port the preview port is published on, once the container runs.
    async fn host_port(&self, name: &str) -> Result<Option<u16>>;
}

/// Engine backed by the `docker` CLI.
pub struct DockerCli;

impl DockerCli {
    pub fn new() -> Self {
        Self
    }

    async fn run(args: &[&str]) -> Result<Output> {
        Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::ContainerProvisioning(format!("docker {}: {e}", args[0])))
    }

    fn stderr(output: &Output) -> String {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn image_exists(&self, tag: &str) -> Result<bool> {
        let output = Self::run(&["image", "inspect", tag]).await?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = Self::stderr(&output);
        if stderr.contains("No such image") {
            Ok(false)
        } else {
            Err(Error::ContainerProvisioning(format!("image inspect {tag}: {stderr}")))
        }
    }

    async fn build_image(&self, tag: &str, context_dir: &Path) -> Result<()> {
        let context = context_dir.to_string_lossy();
        let output = Self::run(&["build", "-t", tag, &context]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::ContainerProvisioning(format!("build {tag}: {}", Self::stderr(&output))))
        }
    }

    async fn get_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let output = Self::run(&["inspect", "--format", "{{.State.Running}}", name]).await?;
        if !output.status.success() {
            let stderr = Self::stderr(&output);
            if stderr.contains("No such") {
                return Ok(None);
            }
            return Err(Error::ContainerProvisioning(format!("inspect {name}: {stderr}")));
        }
        let running = String::from_utf8_lossy(&output.stdout).trim() == "true";
        Ok(Some(ContainerInfo {
            name: name.to_string(),
            status: if running { ContainerStatus::Running } else { ContainerStatus::Stopped },
        }))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<()> {
        let port = PREVIEW_PORT.to_string();
        let output = Self::run(&[
            "create", "--name", &spec.name, "-w", &spec.workdir, "-p", &port, &spec.image,
        ])
        .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::ContainerProvisioning(format!(
                "create {}: {}",
                spec.name,
                Self::stderr(&output)
            )))
        }
    }

    async fn start(&self, name: &str) -> Result<()> {
        let output = Self::run(&["start", name]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::ContainerProvisioning(format!("start {name}: {}", Self::stderr(&output))))
        }
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let output = Self::run(&["stop", name]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::ContainerProvisioning(format!("stop {name}: {}", Self::stderr(&output))))
        }
    }

    async fn host_port(&self, name: &str) -> Result<Option<u16>> {
        let spec = format!("{PREVIEW_PORT}/tcp");
        let output = Self::run(&["port", name, &spec]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .next()
            .and_then(|line| line.rsplit(':').next())
            .and_then(|port| port.trim().parse().ok()))
    }
}

/// What the engine reports for a workspace's environment; each step of
/// `ensure_running` advances exactly one transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProvisionState {
    /// No image built yet.
    Absent,
    /// Image built, container not created.
    ImageBuilt,
    /// Container created but stopped.
    Created,
    Running,
}

/// A runnable per-workspace environment.
#[derive(Debug, Clone)]
pub struct Environment {
    pub container: String,
    pub preview_url: Option<String>,
}

pub struct Provisioner {
    engine: Arc<dyn ContainerEngine>,
    store: SharedStore,
    projects_dir: PathBuf,
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Provisioner {
    pub fn new(engine: Arc<dyn ContainerEngine>, store: SharedStore, projects_dir: PathBuf) -> Self {
        Self {
            engine,
            store,
            projects_dir,
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Get-or-create the workspace's environment, idempotent under
    /// concurrent calls for the same workspace.
    pub async fn ensure_running(&self, workspace_id: &str, root_prefix: &str) -> Result<Environment> {
        let flight = {
            let mut flights = self.flights.lock().await;
            flights
                .entry(workspace_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = flight.lock().await;

        let image = format!("workbox/{workspace_id}");
        let name = format!("workbox-{workspace_id}");

        loop {
            match self.observe(&image, &name).await? {
                ProvisionState::Absent => {
                    info!(workspace = workspace_id, image = %image, "building workspace image");
                    let context = self.materialize_snapshot(workspace_id, root_prefix).await?;
                    self.engine.build_image(&image, &context).await?;
                }
                ProvisionState::ImageBuilt => {
                    self.engine
                        .create_container(&ContainerSpec {
                            name: name.clone(),
                            image: image.clone(),
                            workdir: "/workspace".to_string(),
                        })
                        .await?;
                }
                ProvisionState::Created => {
                    self.engine.start(&name).await?;
                }
                ProvisionState::Running => break,
            }
        }

        let preview_url = self
            .engine
            .host_port(&name)
            .await?
            .map(|port| format!("http://localhost:{port}"));
        Ok(Environment { container: name, preview_url })
    }

    pub async fn stop(&self, container: &str) -> Result<()> {
        self.engine.stop(container).await
    }

    async fn observe(&self, image: &str, name: &str) -> Result<ProvisionState> {
        if !self.engine.image_exists(image).await? {
            return Ok(ProvisionState::Absent);
        }
        Ok(match self.engine.get_container(name).await? {
            None => ProvisionState::ImageBuilt,
            Some(info) if info.status == ContainerStatus::Stopped => ProvisionState::Created,
            Some(_) => ProvisionState::Running,
        })
    }

    /// Write the workspace's current file snapshot into a build context
    /// directory, with a Dockerfile that keeps the container alive for
    /// interactive exec sessions.
    async fn materialize_snapshot(&self, workspace_id: &str, root_prefix: &str) -> Result<PathBuf> {
        let context = self.projects_dir.join(workspace_id);
        tokio::fs::create_dir_all(&context)
            .await
            .map_err(|e| Error::ContainerProvisioning(format!("create context dir: {e}")))?;

        let leaves = files::collect_leaves(self.store.as_ref(), root_prefix.to_string()).await?;
        for key in leaves {
            let relative = &key[root_prefix.len() + 1..];
            if relative.rsplit('/').next() == Some(PLACEHOLDER) {
                continue;
            }
            let dest = context.join(relative);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::ContainerProvisioning(format!("snapshot dir: {e}")))?;
            }
            let bytes = self.store.get(&key).await?;
            tokio::fs::write(&dest, bytes)
                .await
                .map_err(|e| Error::ContainerProvisioning(format!("snapshot write {relative}: {e}")))?;
        }

        let dockerfile = format!(
            "FROM node:20-slim\nWORKDIR /workspace\nCOPY . /workspace\nEXPOSE {PREVIEW_PORT}\nCMD [\"sleep\", \"infinity\"]\n"
        );
        tokio::fs::write(context.join("Dockerfile"), dockerfile)
            .await
            .map_err(|e| Error::ContainerProvisioning(format!("write Dockerfile: {e}")))?;
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct FakeEngine {
        images: StdMutex<HashSet<String>>,
        containers: StdMutex<HashMap<String, ContainerStatus>>,
        builds: AtomicUsize,
    }

    impl FakeEngine {
        fn new() -> Self {
            Self {
                images: StdMutex::new(HashSet::new()),
                containers: StdMutex::new(HashMap::new()),
                builds: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn image_exists(&self, tag: &str) -> Result<bool> {
            Ok(self.images.lock().unwrap().contains(tag))
        }

        async fn build_image(&self, tag: &str, _context_dir: &Path) -> Result<()> {
            // long enough for a concurrent caller to pile up behind the flight
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.builds.fetch_add(1, Ordering::SeqCst);
            self.images.lock().unwrap().insert(tag.to_string());
            Ok(())
        }

        async fn get_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
            Ok(self.containers.lock().unwrap().get(name).map(|status| ContainerInfo {
                name: name.to_string(),
                status: *status,
            }))
        }

        async fn create_container(&self, spec: &ContainerSpec) -> Result<()> {
            self.containers
                .lock()
                .unwrap()
                .insert(spec.name.clone(), ContainerStatus::Stopped);
            Ok(())
        }

        async fn start(&self, name: &str) -> Result<()> {
            self.containers
                .lock()
                .unwrap()
                .insert(name.to_string(), ContainerStatus::Running);
            Ok(())
        }

        async fn stop(&self, name: &str) -> Result<()> {
            self.containers
                .lock()
                .unwrap()
                .insert(name.to_string(), ContainerStatus::Stopped);
            Ok(())
        }

        async fn host_port(&self, _name: &str) -> Result<Option<u16>> {
            Ok(Some(49_000))
        }
    }

    fn temp_projects_dir() -> PathBuf {
        std::env::temp_dir().join(format!("workbox-prov-{}", uuid::Uuid::new_v4()))
    }

    async fn provisioner() -> (Provisioner, Arc<FakeEngine>, PathBuf) {
        let store = MemoryStore::new();
        store
            .seed([("u1/ws1/index.js", "x"), ("u1/ws1/sub/.placeholder", ".folder")])
            .await;
        let engine = Arc::new(FakeEngine::new());
        let dir = temp_projects_dir();
        let prov = Provisioner::new(engine.clone(), Arc::new(store), dir.clone());
        (prov, engine, dir)
    }

    #[tokio::test]
    async fn ensure_running_builds_once_and_is_idempotent() {
        let (prov, engine, dir) = provisioner().await;

        let env = prov.ensure_running("ws1", "u1/ws1").await.unwrap();
        assert_eq!(env.container, "workbox-ws1");
        assert_eq!(env.preview_url.as_deref(), Some("http://localhost:49000"));
        assert_eq!(engine.builds.load(Ordering::SeqCst), 1);

        // snapshot was materialized, markers excluded
        assert!(dir.join("ws1/index.js").exists());
        assert!(dir.join("ws1/Dockerfile").exists());
        assert!(!dir.join("ws1/sub/.placeholder").exists());

        prov.ensure_running("ws1", "u1/ws1").await.unwrap();
        assert_eq!(engine.builds.load(Ordering::SeqCst), 1);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn concurrent_provisioning_is_single_flighted() {
        let (prov, engine, dir) = provisioner().await;
        let prov = Arc::new(prov);

        let a = {
            let prov = prov.clone();
            tokio::spawn(async move { prov.ensure_running("ws1", "u1/ws1").await })
        };
        let b = {
            let prov = prov.clone();
            tokio::spawn(async move { prov.ensure_running("ws1", "u1/ws1").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(engine.builds.load(Ordering::SeqCst), 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn stopped_container_is_restarted_not_recreated() {
        let (prov, engine, dir) = provisioner().await;

        prov.ensure_running("ws1", "u1/ws1").await.unwrap();
        prov.stop("workbox-ws1").await.unwrap();

        prov.ensure_running("ws1", "u1/ws1").await.unwrap();
        assert_eq!(engine.builds.load(Ordering::SeqCst), 1);
        assert_eq!(
            *engine.containers.lock().unwrap().get("workbox-ws1").unwrap(),
            ContainerStatus::Running
        );
        let _ = std::fs::remove_dir_all(dir);
    }
}
