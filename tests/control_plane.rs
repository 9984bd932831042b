//! Agents talking to a real control-plane listener over WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use fleet_control::agent::{AgentClient, AgentIdentity, ArtifactHandler, StoredArtifact};
use fleet_control::api::{control_router, AppState};
use fleet_control::artifacts::ArtifactLibrary;
use fleet_control::dispatch::{Dispatcher, Target};
use fleet_control::error::AgentError;
use fleet_control::protocol::ScriptKind;
use fleet_control::reassembly::{ArtifactKind, CompletedArtifact};
use fleet_control::registry::AgentRegistry;
use fleet_control::store::SqliteStore;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_control_plane() -> (SocketAddr, Arc<AgentRegistry>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let registry = Arc::new(AgentRegistry::new());
    let state = AppState::new(
        store,
        registry.clone(),
        ArtifactLibrary::new("scriptfile"),
        4000,
        1 << 20,
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = control_router(state).into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, registry)
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("control plane accepts connections");
    ws
}

async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame before timeout")
            .expect("socket still open")
            .expect("frame reads cleanly");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("server sends json");
        }
    }
}

/// Skip command frames until the next reply.
async fn recv_reply(ws: &mut Ws) -> Value {
    loop {
        let value = recv_json(ws).await;
        if value.get("status").is_some() {
            return value;
        }
    }
}

async fn register(ws: &mut Ws, id: &str, hostname: &str) {
    let frame = json!({"action": "register", "client_id": id, "hostname": hostname, "ip": "10.0.0.9"});
    ws.send(Message::Text(frame.to_string())).await.unwrap();
    assert_eq!(recv_reply(ws).await, json!({"status": "registered"}));
}

#[derive(Default)]
struct Recorder {
    artifacts: Mutex<Vec<CompletedArtifact>>,
}

impl ArtifactHandler for Recorder {
    fn handle(&self, artifact: &CompletedArtifact) -> Result<StoredArtifact, AgentError> {
        self.artifacts.lock().push(artifact.clone());
        Ok(StoredArtifact {
            path: artifact.name.clone().into(),
            pid: None,
        })
    }
}

#[tokio::test]
async fn protocol_errors_are_reported_without_registering() {
    let (addr, registry) = start_control_plane().await;
    let mut ws = connect(addr).await;

    ws.send(Message::Text("{not json".into())).await.unwrap();
    assert_eq!(
        recv_reply(&mut ws).await,
        json!({"status": "error", "message": "Invalid JSON"})
    );

    ws.send(Message::Text(json!({"action": "dance"}).to_string()))
        .await
        .unwrap();
    assert_eq!(
        recv_reply(&mut ws).await,
        json!({"status": "error", "message": "Unknown action"})
    );

    let incomplete = json!({"action": "register", "client_id": "a1", "hostname": "", "ip": "x"});
    ws.send(Message::Text(incomplete.to_string())).await.unwrap();
    assert_eq!(
        recv_reply(&mut ws).await,
        json!({"status": "error", "message": "Invalid registration data"})
    );
    assert!(registry.snapshot().is_empty());

    register(&mut ws, "a1", "ws-01").await;
    assert!(registry.contains("a1"));
}

#[tokio::test]
async fn disconnect_evicts_only_the_owning_connection() {
    let (addr, registry) = start_control_plane().await;
    let dispatcher = Dispatcher::new(registry.clone(), 4000);

    let mut first = connect(addr).await;
    register(&mut first, "dup", "ws-01").await;
    let mut second = connect(addr).await;
    register(&mut second, "dup", "ws-01").await;
    assert_eq!(registry.snapshot().len(), 1);

    first.close(None).await.unwrap();
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(registry.contains("dup"));

    dispatcher
        .send_text(Target::Agent("dup".into()), "still here")
        .await
        .expect("second connection is live");
    loop {
        let value = recv_json(&mut second).await;
        if value["action"] == "message" {
            assert_eq!(value["content"], "still here");
            break;
        }
    }

    second.close(None).await.unwrap();
    drop(second);
    assert!(eventually(|| !registry.contains("dup")).await);
}

#[tokio::test]
async fn agent_client_receives_chunked_script_and_stops() {
    let (addr, registry) = start_control_plane().await;
    let dispatcher = Dispatcher::new(registry.clone(), 16);

    let recorder = Arc::new(Recorder::default());
    let identity = AgentIdentity {
        agent_id: "agent-7".into(),
        hostname: "ws-07".into(),
        address: "127.0.0.1".into(),
    };
    let client = Arc::new(AgentClient::new(
        format!("ws://{addr}/ws"),
        identity,
        recorder.clone(),
    ));
    let cancel = CancellationToken::new();
    let running = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { client.run(cancel).await })
    };

    assert!(eventually(|| registry.contains("agent-7")).await);
    let roster = registry.snapshot();
    assert_eq!(roster[0].hostname, "ws-07");

    let script = b"#!/bin/sh\nfor u in $(getent passwd | cut -d: -f1); do echo $u; done\n";
    let delivery = dispatcher
        .push_script(Target::Agent("agent-7".into()), "users.sh", ScriptKind::LinuxShell, script)
        .await
        .unwrap();
    assert!(delivery.frames > 1);

    assert!(eventually(|| !recorder.artifacts.lock().is_empty()).await);
    {
        let artifacts = recorder.artifacts.lock();
        assert_eq!(artifacts.len(), 1);
        assert!(artifacts[0].name.ends_with("_users.sh"));
        assert_eq!(artifacts[0].kind, ArtifactKind::Script(ScriptKind::LinuxShell));
        assert_eq!(artifacts[0].payload, script.to_vec());
    }

    dispatcher
        .send_text(Target::All, "STOP")
        .await
        .expect("broadcast reaches the agent");
    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("agent stops on STOP")
        .unwrap();
    assert!(result.is_ok());
    assert!(eventually(|| !registry.contains("agent-7")).await);
    assert!(!cancel.is_cancelled());
}
