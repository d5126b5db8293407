//! Terminal session manager: capped interactive shells per workspace,
//! optionally exec'd inside the workspace's container.
//!
//! The manager is the only owner of session handles; every exit path
//! (explicit close, owner disconnect, manager drop of the registry entry)
//! goes through the same disposal.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::thread;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::container::Provisioner;
use crate::error::{Error, Result};
use crate::tree::PLACEHOLDER;
use crate::ws::ServerEvent;

pub const DEFAULT_TERMINAL_CAP: usize = 4;

enum TerminalMode {
    /// Shells run directly on the host, one project dir per workspace.
    Local { projects_dir: PathBuf },
    /// Shells exec into the workspace's provisioned container.
    Container { provisioner: Arc<Provisioner> },
}

struct TerminalSession {
    workspace_id: String,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send>,
    container: Option<String>,
    #[allow(dead_code)]
    created_at: Instant,
}

pub struct TerminalManager {
    cap: usize,
    mode: TerminalMode,
    sessions: Mutex<HashMap<String, TerminalSession>>,
    /// Slots held by in-flight creates, keyed by session id with the
    /// workspace the slot counts against. Keeps the capacity check honest
    /// without holding the registry lock across provisioning.
    reservations: StdMutex<HashMap<String, String>>,
}

impl TerminalManager {
    pub fn local(cap: usize, projects_dir: PathBuf) -> Self {
        Self {
            cap,
            mode: TerminalMode::Local { projects_dir },
            sessions: Mutex::new(HashMap::new()),
            reservations: StdMutex::new(HashMap::new()),
        }
    }

    pub fn container(cap: usize, provisioner: Arc<Provisioner>) -> Self {
        Self {
            cap,
            mode: TerminalMode::Container { provisioner },
            sessions: Mutex::new(HashMap::new()),
            reservations: StdMutex::new(HashMap::new()),
        }
    }

    /// Spawn an interactive shell for the workspace and wire its output to
    /// `events` (the owning connection's event sender). Returns the preview
    /// URL when the environment is container-backed.
    ///
    /// Provisioning can take a long time (an image build on first use), so
    /// the registry lock is not held across it; the slot is reserved up
    /// front and the finished session inserted afterwards.
    pub async fn create(
        &self,
        session_id: &str,
        workspace_id: &str,
        root_prefix: &str,
        events: UnboundedSender<ServerEvent>,
    ) -> Result<Option<String>> {
        self.reserve(session_id, workspace_id).await?;

        let spawned = self
            .provision_and_spawn(session_id, workspace_id, root_prefix, events)
            .await;

        let mut sessions = self.sessions.lock().await;
        self.reservations
            .lock()
            .expect("reservations lock poisoned")
            .remove(session_id);
        let (session, preview_url) = spawned?;
        info!(
            terminal = session_id,
            workspace = workspace_id,
            container = session.container.as_deref().unwrap_or("-"),
            "terminal created"
        );
        sessions.insert(session_id.to_string(), session);
        Ok(preview_url)
    }

    /// Claim a session id and a capacity slot, or fail fast. Lock order is
    /// sessions then reservations, here and in `create`.
    async fn reserve(&self, session_id: &str, workspace_id: &str) -> Result<()> {
        let sessions = self.sessions.lock().await;
        let mut reservations = self
            .reservations
            .lock()
            .expect("reservations lock poisoned");
        if sessions.contains_key(session_id) || reservations.contains_key(session_id) {
            return Err(Error::Validation(format!("terminal {session_id} already exists")));
        }
        let active = sessions
            .values()
            .filter(|s| s.workspace_id == workspace_id)
            .count()
            + reservations
                .values()
                .filter(|w| w.as_str() == workspace_id)
                .count();
        if active >= self.cap {
            return Err(Error::TerminalCapacity(self.cap));
        }
        reservations.insert(session_id.to_string(), workspace_id.to_string());
        Ok(())
    }

    async fn provision_and_spawn(
        &self,
        session_id: &str,
        workspace_id: &str,
        root_prefix: &str,
        events: UnboundedSender<ServerEvent>,
    ) -> Result<(TerminalSession, Option<String>)> {
        let (cmd, container, preview_url) = match &self.mode {
            TerminalMode::Local { projects_dir } => {
                let dir = projects_dir.join(workspace_id);
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| Error::ContainerProvisioning(format!("project dir: {e}")))?;
                seed_if_empty(&dir).await?;
                let mut cmd = CommandBuilder::new(if cfg!(windows) { "cmd.exe" } else { "bash" });
                cmd.cwd(&dir);
                (cmd, None, None)
            }
            TerminalMode::Container { provisioner } => {
                let env = provisioner.ensure_running(workspace_id, root_prefix).await?;
                let mut cmd = CommandBuilder::new("docker");
                cmd.arg("exec");
                cmd.arg("-it");
                cmd.arg(&env.container);
                cmd.arg("bash");
                (cmd, Some(env.container), env.preview_url)
            }
        };

        let session = spawn_shell(session_id, workspace_id, cmd, container, events)?;
        Ok((session, preview_url))
    }

    /// Forward raw input to the shell. Unknown session ids are a silent
    /// no-op; a dead writer is best-effort.
    pub async fn write(&self, session_id: &str, data: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(session_id) {
            let _ = session
                .writer
                .write_all(data.as_bytes())
                .and_then(|_| session.writer.flush());
        }
    }

    /// Resize every active session of the workspace.
    pub async fn resize(&self, workspace_id: &str, cols: u16, rows: u16) {
        let sessions = self.sessions.lock().await;
        for session in sessions.values().filter(|s| s.workspace_id == workspace_id) {
            let _ = session.master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            });
        }
    }

    pub async fn close(&self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(|| Error::NotFound(format!("terminal {session_id}")))?;
        self.dispose(session_id, session).await;
        Ok(())
    }

    /// Close every session of a workspace; part of the owner-disconnect
    /// transition.
    pub async fn close_workspace(&self, workspace_id: &str) {
        let removed: Vec<(String, TerminalSession)> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.workspace_id == workspace_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|s| (id, s)))
                .collect()
        };
        for (id, session) in removed {
            self.dispose(&id, session).await;
        }
    }

    pub async fn active(&self, workspace_id: &str) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.workspace_id == workspace_id)
            .count()
    }

    async fn dispose(&self, session_id: &str, mut session: TerminalSession) {
        let _ = session.child.kill();
        let _ = session.child.wait();
        if let (Some(container), TerminalMode::Container { provisioner }) =
            (&session.container, &self.mode)
        {
            if let Err(err) = provisioner.stop(container).await {
                warn!(terminal = session_id, %container, %err, "failed to stop container");
            }
        }
        info!(terminal = session_id, workspace = %session.workspace_id, "terminal closed");
    }
}

/// Open a pty, spawn the shell, and start the reader thread that pumps
/// output (base64, since pty bytes are not guaranteed UTF-8) to the owning
/// connection. The thread exits when the pty closes or the connection goes
/// away.
fn spawn_shell(
    session_id: &str,
    workspace_id: &str,
    mut cmd: CommandBuilder,
    container: Option<String>,
    events: UnboundedSender<ServerEvent>,
) -> Result<TerminalSession> {
    cmd.env("TERM", "xterm-256color");

    let pty = native_pty_system();
    let pair = pty
        .openpty(PtySize {
            rows: 24,
            cols: 100,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| Error::ContainerProvisioning(format!("openpty: {e}")))?;

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| Error::ContainerProvisioning(format!("spawn shell: {e}")))?;
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| Error::ContainerProvisioning(format!("pty reader: {e}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| Error::ContainerProvisioning(format!("pty writer: {e}")))?;

    let sid = session_id.to_string();
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let event = ServerEvent::TerminalOutput {
                        session_id: sid.clone(),
                        data: BASE64.encode(&buf[..n]),
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
            }
        }
    });

    Ok(TerminalSession {
        workspace_id: workspace_id.to_string(),
        master: pair.master,
        writer,
        child,
        container,
        created_at: Instant::now(),
    })
}

async fn seed_if_empty(dir: &PathBuf) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::ContainerProvisioning(format!("read project dir: {e}")))?;
    let empty = entries
        .next_entry()
        .await
        .map_err(|e| Error::ContainerProvisioning(format!("read project dir: {e}")))?
        .is_none();
    if empty {
        tokio::fs::write(dir.join(PLACEHOLDER), b"")
            .await
            .map_err(|e| Error::ContainerProvisioning(format!("seed project dir: {e}")))?;
    }
    Ok(())
}
