//! End-to-end owner-gate and rate-limit behavior over real WebSockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use workbox::directory::{User, Visibility, Workspace, WorkspaceKind};
use workbox::http;
use workbox::state::AppState;
use workbox::storage::{MemoryStore, SharedStore};
use workbox::terminal::TerminalManager;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    owner: User,
    guest: User,
    workspace: Workspace,
}

async fn start() -> TestServer {
    let memory = MemoryStore::new();
    let store: SharedStore = Arc::new(memory);

    let projects = std::env::temp_dir().join(format!("workbox-gate-{}", uuid::Uuid::new_v4()));
    let terminals = Arc::new(TerminalManager::local(4, projects));
    let state = AppState::new(store, terminals);

    let owner = state
        .directory
        .create_user(None, "Ada".into(), "ada@example.com".into())
        .unwrap();
    let guest = state
        .directory
        .create_user(None, "Lin".into(), "lin@example.com".into())
        .unwrap();
    let workspace = state
        .directory
        .create_workspace(
            "gate-proj".into(),
            WorkspaceKind::Node,
            Visibility::Private,
            owner.id.clone(),
        )
        .unwrap();
    state.directory.share(&workspace.id, &owner.id, &guest.id).unwrap();

    let prefix = workspace.root_prefix();
    state
        .store
        .put(&format!("{prefix}/src/index.js"), b"console.log(1)", true)
        .await
        .unwrap();
    state
        .store
        .put(&format!("{prefix}/.placeholder"), b".folder", true)
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = http::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, state, owner, guest, workspace }
}

impl TestServer {
    async fn connect(&self, user_id: &str) -> WsClient {
        let url = format!(
            "ws://{}/ws?userId={}&workspaceId={}",
            self.addr, user_id, self.workspace.id
        );
        let (client, _) = connect_async(url).await.expect("handshake failed");
        client
    }
}

/// Next JSON text frame, skipping pings.
async fn next_json(client: &mut WsClient) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for message")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("invalid JSON frame");
        }
    }
}

async fn send_op(client: &mut WsClient, body: Value) {
    client
        .send(Message::Text(body.to_string()))
        .await
        .expect("send failed");
}

#[tokio::test]
async fn owner_gate_admits_and_revokes_shared_access() {
    let server = start().await;

    // shared participant before any owner: transport open, access denied
    let mut early_shared = server.connect(&server.guest.id).await;
    let ev = next_json(&mut early_shared).await;
    assert_eq!(ev["event"], "accessDisabled");

    // owner connects and is served the projected tree
    let mut owner = server.connect(&server.owner.id).await;
    let ev = next_json(&mut owner).await;
    assert_eq!(ev["event"], "workspaceLoaded");
    let entries = ev["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["name"], "src");
    assert_eq!(entries[0]["type"], "folder");

    // with the owner present, a new shared connection is admitted
    let mut shared = server.connect(&server.guest.id).await;
    let ev = next_json(&mut shared).await;
    assert_eq!(ev["event"], "workspaceLoaded");

    // a file round trip for the owner
    let path = format!("{}/src/index.js", server.workspace.root_prefix());
    send_op(&mut owner, json!({"seq": 1, "op": "getFile", "path": path})).await;
    let reply = next_json(&mut owner).await;
    assert_eq!(reply["reply"], 1);
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["payload"]["content"], "console.log(1)");

    // owner disconnects: shared participants are told the gate closed
    owner.close(None).await.unwrap();
    let ev = next_json(&mut shared).await;
    assert_eq!(ev["event"], "ownerDisconnected");
    let ev = next_json(&mut shared).await;
    assert_eq!(ev["event"], "accessDisabled");

    // and further file ops from shared are refused
    send_op(&mut shared, json!({"seq": 2, "op": "getFileTree"})).await;
    let reply = next_json(&mut shared).await;
    assert_eq!(reply["reply"], 2);
    assert_eq!(reply["ok"], false);
}

#[tokio::test]
async fn unknown_users_are_rejected_at_the_handshake() {
    let server = start().await;

    let url = format!(
        "ws://{}/ws?userId=nobody&workspaceId={}",
        server.addr, server.workspace.id
    );
    assert!(connect_async(url).await.is_err());

    // a real user without owner or shared access is rejected too
    let outsider = server
        .state
        .directory
        .create_user(None, "Sam".into(), "sam@example.com".into())
        .unwrap();
    let url = format!(
        "ws://{}/ws?userId={}&workspaceId={}",
        server.addr, outsider.id, server.workspace.id
    );
    assert!(connect_async(url).await.is_err());
}

#[tokio::test]
async fn save_file_is_rate_limited_per_window() {
    let server = start().await;
    let mut owner = server.connect(&server.owner.id).await;
    let loaded = next_json(&mut owner).await;
    assert_eq!(loaded["event"], "workspaceLoaded");

    let path = format!("{}/notes.txt", server.workspace.root_prefix());
    for seq in 1..=4u64 {
        send_op(
            &mut owner,
            json!({"seq": seq, "op": "saveFile", "path": path, "content": format!("v{seq}")}),
        )
        .await;
    }

    // 3 saves succeed inside the window; the 4th fails and the room gets a
    // rateLimited advisory
    let mut ok = 0;
    let mut rejected = 0;
    let mut advised = false;
    while ok + rejected < 4 {
        let msg = next_json(&mut owner).await;
        if msg["event"] == "rateLimited" {
            advised = true;
        } else if msg["ok"] == true {
            ok += 1;
        } else {
            rejected += 1;
            assert!(msg["error"].as_str().unwrap().contains("rate limited"));
        }
    }
    assert_eq!(ok, 3);
    assert_eq!(rejected, 1);

    // the broadcast advisory may trail the failing reply
    if !advised {
        let msg = next_json(&mut owner).await;
        assert_eq!(msg["event"], "rateLimited");
    }
}

#[tokio::test]
async fn file_ops_cannot_escape_the_workspace_prefix() {
    let server = start().await;
    server
        .state
        .store
        .put("elsewhere/secret.txt", b"top", true)
        .await
        .unwrap();

    let mut owner = server.connect(&server.owner.id).await;
    next_json(&mut owner).await; // workspaceLoaded

    send_op(
        &mut owner,
        json!({"seq": 1, "op": "getFile", "path": "elsewhere/secret.txt"}),
    )
    .await;
    let reply = next_json(&mut owner).await;
    assert_eq!(reply["ok"], false);

    send_op(
        &mut owner,
        json!({"seq": 2, "op": "saveFile", "path": "elsewhere/secret.txt", "content": "clobbered"}),
    )
    .await;
    let reply = next_json(&mut owner).await;
    assert_eq!(reply["ok"], false);
    assert_eq!(
        server.state.store.get("elsewhere/secret.txt").await.unwrap(),
        b"top"
    );

    send_op(
        &mut owner,
        json!({"seq": 3, "op": "deleteEntry", "path": "elsewhere/secret.txt"}),
    )
    .await;
    let reply = next_json(&mut owner).await;
    assert_eq!(reply["ok"], false);
    assert!(server.state.store.get("elsewhere/secret.txt").await.is_ok());
}

#[tokio::test]
async fn mutations_refresh_the_projected_tree() {
    let server = start().await;
    let mut owner = server.connect(&server.owner.id).await;
    next_json(&mut owner).await; // workspaceLoaded

    let prefix = server.workspace.root_prefix();

    // rename the src folder and check the remap and refreshed tree
    send_op(
        &mut owner,
        json!({"seq": 1, "op": "renameEntry", "path": format!("{prefix}/src"), "newName": "lib"}),
    )
    .await;
    let reply = next_json(&mut owner).await;
    assert_eq!(reply["ok"], true);
    let path_map = reply["payload"]["pathMap"].as_object().unwrap();
    assert_eq!(
        path_map[&format!("{prefix}/src/index.js")],
        format!("{prefix}/lib/index.js")
    );
    assert_eq!(path_map[&format!("{prefix}/src")], format!("{prefix}/lib"));
    let entries = reply["payload"]["entries"].as_array().unwrap();
    assert!(entries.iter().all(|e| e["name"] != "src"));
    assert!(entries.iter().any(|e| e["name"] == "lib"));

    // delete it and the tree empties out
    send_op(
        &mut owner,
        json!({"seq": 2, "op": "deleteEntry", "path": format!("{prefix}/lib")}),
    )
    .await;
    let reply = next_json(&mut owner).await;
    assert_eq!(reply["ok"], true);
    assert!(reply["payload"]["entries"].as_array().unwrap().is_empty());
}
