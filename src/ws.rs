//! Real-time protocol: handshake, request/reply envelopes, and server
//! events over WebSocket.
//!
//! Every request carries a client sequence number and gets exactly one
//! reply; server-initiated traffic (gate changes, terminal output, rate
//! limit advisories) arrives as tagged events.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{info, warn};
use uuid::Uuid;

use crate::directory::Role;
use crate::error::Error;
use crate::files::{self, EntryKind};
use crate::http::error_status;
use crate::limiter::OpClass;
use crate::room::Room;
use crate::state::AppState;
use crate::tree::{self, PathEntry};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub user_id: String,
    pub workspace_id: String,
}

/// Immutable per-connection context, established once at admission and
/// passed to every handler.
#[derive(Debug, Clone)]
pub struct Participant {
    pub conn_id: String,
    pub user_id: String,
    pub workspace_id: String,
    pub role: Role,
    pub root_prefix: String,
}

#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    seq: u64,
    #[serde(flatten)]
    op: ClientOp,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum ClientOp {
    GetFileTree,
    GetFile { path: String },
    SaveFile { path: String, content: String },
    CreateEntry { name: String, kind: EntryKind, parent_path: String },
    RenameEntry { path: String, new_name: String },
    DeleteEntry { path: String },
    CreateTerminal { session_id: String },
    TerminalInput { session_id: String, data: String },
    TerminalResize { cols: u16, rows: u16 },
    CloseTerminal { session_id: String },
}

#[derive(Debug, Serialize)]
struct Reply {
    reply: u64,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    WorkspaceLoaded { entries: Vec<PathEntry> },
    AccessDisabled { reason: String },
    OwnerDisconnected,
    /// `data` is base64: raw pty bytes are not guaranteed UTF-8.
    TerminalOutput { session_id: String, data: String },
    RateLimited { reason: String },
}

/// Handshake and admission. Unknown users/workspaces and users with neither
/// owner nor shared access are rejected here, before any state is created.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(handshake): Query<Handshake>,
    State(state): State<AppState>,
) -> Response {
    let role = match state
        .directory
        .role_for(&handshake.user_id, &handshake.workspace_id)
    {
        Ok(role) => role,
        Err(err) => {
            info!(user = %handshake.user_id, workspace = %handshake.workspace_id, %err, "connection rejected");
            return (error_status(&err), err.to_string()).into_response();
        }
    };
    let workspace = match state.directory.workspace(&handshake.workspace_id) {
        Ok(ws) => ws,
        Err(err) => return (error_status(&err), err.to_string()).into_response(),
    };

    let participant = Participant {
        conn_id: Uuid::new_v4().to_string(),
        user_id: handshake.user_id,
        workspace_id: handshake.workspace_id,
        role,
        root_prefix: workspace.root_prefix(),
    };
    ws.on_upgrade(move |socket| handle_socket(state, socket, participant))
}

async fn handle_socket(state: AppState, socket: WebSocket, participant: Participant) {
    let admission = state.rooms.connect(&participant.workspace_id, participant.role);
    let room = admission.room.clone();
    let mut room_events = admission.events;

    // terminal reader threads push output here, point-to-point to this
    // connection
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ServerEvent>();

    let (mut sink, mut stream) = socket.split();

    info!(
        conn = %participant.conn_id,
        user = %participant.user_id,
        workspace = %participant.workspace_id,
        role = ?participant.role,
        granted = admission.granted,
        "participant connected"
    );

    let opening = if admission.granted {
        match tree::workspace_entries(state.store.as_ref(), &participant.root_prefix).await {
            Ok(entries) => Some(ServerEvent::WorkspaceLoaded { entries }),
            Err(err) => {
                warn!(workspace = %participant.workspace_id, %err, "failed to load workspace tree");
                Some(ServerEvent::AccessDisabled { reason: err.to_string() })
            }
        }
    } else {
        Some(ServerEvent::AccessDisabled {
            reason: "the workspace owner is not connected".to_string(),
        })
    };
    if let Some(event) = opening {
        if send_event(&mut sink, &event).await.is_err() {
            state.rooms.disconnect(&participant.workspace_id, participant.role).await;
            return;
        }
    }

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let reply = dispatch(&state, &participant, &room, &events_tx, &text).await;
                    let body = serde_json::to_string(&reply).unwrap_or_default();
                    if sink.send(Message::Text(body)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {} // ping/pong/binary
            },
            event = room_events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(conn = %participant.conn_id, skipped, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = events_rx.recv() => {
                // we hold a sender, so this never yields None
                if let Some(event) = event {
                    if send_event(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    state.rooms.disconnect(&participant.workspace_id, participant.role).await;
    info!(conn = %participant.conn_id, user = %participant.user_id, "participant disconnected");
}

type WsSink = SplitSink<WebSocket, Message>;

async fn send_event(sink: &mut WsSink, event: &ServerEvent) -> Result<(), axum::Error> {
    let body = serde_json::to_string(event).unwrap_or_default();
    sink.send(Message::Text(body)).await
}

async fn dispatch(
    state: &AppState,
    participant: &Participant,
    room: &Room,
    events_tx: &UnboundedSender<ServerEvent>,
    text: &str,
) -> Reply {
    let envelope: RequestEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            return Reply {
                reply: 0,
                ok: false,
                payload: None,
                error: Some(Error::Validation(err.to_string()).to_string()),
            }
        }
    };

    match handle_op(state, participant, room, events_tx, envelope.op).await {
        Ok(payload) => Reply {
            reply: envelope.seq,
            ok: true,
            payload: Some(payload),
            error: None,
        },
        Err(err) => {
            // retry is the expected remedy for throttling, so advise the
            // whole room rather than just failing one call
            if matches!(err, Error::RateLimited(_)) {
                room.publish(ServerEvent::RateLimited { reason: err.to_string() });
            }
            let payload = match &err {
                Error::PartialMutation { completed, .. } => Some(json!({ "pathMap": completed })),
                _ => None,
            };
            Reply {
                reply: envelope.seq,
                ok: false,
                payload,
                error: Some(err.to_string()),
            }
        }
    }
}

/// Shared participants may act only while an owner is connected.
fn ensure_access(participant: &Participant, room: &Room) -> Result<(), Error> {
    if participant.role == Role::Shared && !room.owner_present() {
        return Err(Error::Unauthorized(
            "the workspace owner is not connected".to_string(),
        ));
    }
    Ok(())
}

/// File operations may only address keys under the participant's workspace
/// prefix; admission to one workspace grants nothing elsewhere in the store.
fn ensure_scoped(participant: &Participant, path: &str) -> Result<(), Error> {
    match path.strip_prefix(&participant.root_prefix) {
        Some("") => Ok(()),
        Some(rest) if rest.starts_with('/') => Ok(()),
        _ => Err(Error::Unauthorized(format!(
            "path {path} is outside the workspace"
        ))),
    }
}

async fn handle_op(
    state: &AppState,
    participant: &Participant,
    room: &Room,
    events_tx: &UnboundedSender<ServerEvent>,
    op: ClientOp,
) -> Result<Value, Error> {
    ensure_access(participant, room)?;
    let store = state.store.as_ref();
    let prefix = &participant.root_prefix;

    match op {
        ClientOp::GetFileTree => {
            let entries = tree::workspace_entries(store, prefix).await?;
            Ok(json!({ "entries": entries }))
        }
        ClientOp::GetFile { path } => {
            ensure_scoped(participant, &path)?;
            let bytes = store.get(&path).await?;
            Ok(json!({ "content": String::from_utf8_lossy(&bytes) }))
        }
        ClientOp::SaveFile { path, content } => {
            ensure_scoped(participant, &path)?;
            // size ceiling applies before any token is consumed
            files::check_save_size(&content)?;
            state.limiter.consume(&participant.user_id, OpClass::SaveFile)?;
            files::save_file(store, &path, &content).await?;
            Ok(json!({ "saved": true }))
        }
        ClientOp::CreateEntry { name, kind, parent_path } => {
            ensure_scoped(participant, &parent_path)?;
            files::check_workspace_size(store, prefix).await?;
            let class = match kind {
                EntryKind::File => OpClass::CreateFile,
                EntryKind::Folder => OpClass::CreateFolder,
            };
            state.limiter.consume(&participant.user_id, class)?;
            files::create_entry(store, &name, kind, &parent_path).await?;
            let entries = tree::workspace_entries(store, prefix).await?;
            Ok(json!({ "entries": entries }))
        }
        ClientOp::RenameEntry { path, new_name } => {
            ensure_scoped(participant, &path)?;
            state.limiter.consume(&participant.user_id, OpClass::Rename)?;
            let path_map = files::rename_entry(store, &path, &new_name).await?;
            let entries = tree::workspace_entries(store, prefix).await?;
            Ok(json!({ "pathMap": path_map, "entries": entries }))
        }
        ClientOp::DeleteEntry { path } => {
            ensure_scoped(participant, &path)?;
            let class = if files::is_file_path(&path) {
                OpClass::DeleteFile
            } else {
                OpClass::DeleteFolder
            };
            state.limiter.consume(&participant.user_id, class)?;
            files::delete_entry(store, &path).await?;
            let entries = tree::workspace_entries(store, prefix).await?;
            Ok(json!({ "entries": entries }))
        }
        ClientOp::CreateTerminal { session_id } => {
            let preview_url = state
                .terminals
                .create(&session_id, &participant.workspace_id, prefix, events_tx.clone())
                .await?;
            Ok(json!({ "previewUrl": preview_url }))
        }
        ClientOp::TerminalInput { session_id, data } => {
            state.terminals.write(&session_id, &data).await;
            Ok(json!({}))
        }
        ClientOp::TerminalResize { cols, rows } => {
            state.terminals.resize(&participant.workspace_id, cols, rows).await;
            Ok(json!({}))
        }
        ClientOp::CloseTerminal { session_id } => {
            state.terminals.close(&session_id).await?;
            Ok(json!({ "closed": true }))
        }
    }
}
