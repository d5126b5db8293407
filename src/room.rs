//! Session coordinator: per-workspace presence, the owner gate, and idle
//! tracking.
//!
//! Each workspace is a `Room` in one of two states, `NoOwnerConnected` or
//! `OwnerConnected`, derived from the count of connected owner-role
//! participants. Gate-state changes fan out over the room's broadcast
//! channel so every connection of the workspace observes them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::directory::Role;
use crate::terminal::TerminalManager;
use crate::ws::ServerEvent;

/// How long a workspace must stay empty before it is considered idle.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(15);

const EVENT_CAPACITY: usize = 64;

#[derive(Default)]
struct RoomState {
    owners: usize,
    shared: usize,
    idle: bool,
    idle_timer: Option<JoinHandle<()>>,
}

pub struct Room {
    workspace_id: String,
    tx: broadcast::Sender<ServerEvent>,
    state: Mutex<RoomState>,
}

impl Room {
    fn new(workspace_id: String) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            workspace_id,
            tx,
            state: Mutex::new(RoomState::default()),
        }
    }

    pub fn publish(&self, event: ServerEvent) {
        // no receivers is fine: nobody is connected to hear it
        let _ = self.tx.send(event);
    }

    pub fn owner_present(&self) -> bool {
        self.state.lock().expect("room lock poisoned").owners > 0
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().expect("room lock poisoned").idle
    }
}

/// The result of admitting a connection to a room. `granted` is false for a
/// shared-role participant joining while no owner is connected: the
/// transport stays open but workspace access is denied.
pub struct Admission {
    pub room: Arc<Room>,
    pub events: broadcast::Receiver<ServerEvent>,
    pub granted: bool,
}

pub struct Rooms {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    terminals: Arc<TerminalManager>,
}

impl Rooms {
    pub fn new(terminals: Arc<TerminalManager>) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            terminals,
        }
    }

    fn room(&self, workspace_id: &str) -> Arc<Room> {
        self.rooms
            .lock()
            .expect("rooms lock poisoned")
            .entry(workspace_id.to_string())
            .or_insert_with(|| Arc::new(Room::new(workspace_id.to_string())))
            .clone()
    }

    /// Register an admitted participant. The caller has already passed the
    /// directory admission check; this only tracks presence and applies the
    /// owner gate.
    pub fn connect(&self, workspace_id: &str, role: Role) -> Admission {
        let room = self.room(workspace_id);
        let events = room.tx.subscribe();
        let granted = {
            let mut state = room.state.lock().expect("room lock poisoned");
            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
            }
            state.idle = false;
            match role {
                Role::Owner => {
                    state.owners += 1;
                    true
                }
                Role::Shared => {
                    state.shared += 1;
                    state.owners > 0
                }
            }
        };
        Admission { room, events, granted }
    }

    /// Unregister a participant. The last owner leaving disables access for
    /// everyone and tears down the workspace's terminal sessions; a room
    /// reaching zero participants arms the idle timer.
    pub async fn disconnect(&self, workspace_id: &str, role: Role) {
        let room = self.room(workspace_id);
        let (last_owner, empty) = {
            let mut state = room.state.lock().expect("room lock poisoned");
            match role {
                Role::Owner => state.owners = state.owners.saturating_sub(1),
                Role::Shared => state.shared = state.shared.saturating_sub(1),
            }
            (
                role == Role::Owner && state.owners == 0,
                state.owners + state.shared == 0,
            )
        };

        if last_owner {
            info!(workspace = workspace_id, "owner disconnected, closing terminals");
            self.terminals.close_workspace(workspace_id).await;
            room.publish(ServerEvent::OwnerDisconnected);
            room.publish(ServerEvent::AccessDisabled {
                reason: "the workspace owner has disconnected".to_string(),
            });
        }

        if empty {
            let timer_room = room.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(IDLE_TIMEOUT).await;
                let mut state = timer_room.state.lock().expect("room lock poisoned");
                if state.owners + state.shared == 0 {
                    state.idle = true;
                    info!(workspace = %timer_room.workspace_id, "workspace idle");
                }
            });
            room.state.lock().expect("room lock poisoned").idle_timer = Some(handle);
        }
    }
}
