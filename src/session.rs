//! Per-connection agent session.
//!
//! Every accepted control-plane socket gets one read loop (this module's
//! [`serve_socket`]) and one writer task. The read loop owns the
//! [`AgentSession`] state machine and processes frames strictly in arrival
//! order. Everything else talks to the socket through a cloneable
//! [`SessionHandle`], which waits for the writer's result so callers learn
//! about failed writes.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{AgentToServer, ServerReply};
use crate::registry::AgentRegistry;
use crate::store::AssetStore;

const OUTBOUND_QUEUE: usize = 64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("write failed: {0}")]
    Write(String),
}

/// One text frame queued for the writer, with a slot for the write result.
#[derive(Debug)]
pub struct OutboundFrame {
    pub text: String,
    pub ack: oneshot::Sender<Result<(), SendError>>,
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    conn_id: u64,
    tx: mpsc::Sender<OutboundFrame>,
}

impl SessionHandle {
    /// New handle with a fresh connection id, plus the queue its writer
    /// drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        (Self { conn_id, tx }, rx)
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Queue `text` and wait until the writer has flushed it.
    pub async fn send_text(&self, text: String) -> Result<(), SendError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(OutboundFrame { text, ack })
            .await
            .map_err(|_| SendError::Closed)?;
        done.await.map_err(|_| SendError::Closed)?
    }
}

/// Drain `rx` into `sink` until the queue closes or a write fails.
///
/// After a failed write the queue is dropped, so every pending and future
/// send on the matching handles resolves to [`SendError::Closed`].
pub async fn drive_writer<S, M, F>(mut sink: S, mut rx: mpsc::Receiver<OutboundFrame>, wrap: F)
where
    S: Sink<M> + Unpin,
    S::Error: Display,
    F: Fn(String) -> M,
{
    while let Some(frame) = rx.recv().await {
        match sink.send(wrap(frame.text)).await {
            Ok(()) => {
                let _ = frame.ack.send(Ok(()));
            }
            Err(error) => {
                let _ = frame.ack.send(Err(SendError::Write(error.to_string())));
                break;
            }
        }
    }
    drop(rx);
    let _ = sink.close().await;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Registered { agent_id: String },
    Closed,
}

pub struct AgentSession {
    state: SessionState,
    handle: SessionHandle,
    registry: Arc<AgentRegistry>,
    assets: Arc<dyn AssetStore>,
}

impl AgentSession {
    pub fn new(
        handle: SessionHandle,
        registry: Arc<AgentRegistry>,
        assets: Arc<dyn AssetStore>,
    ) -> Self {
        Self {
            state: SessionState::Connecting,
            handle,
            registry,
            assets,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Handle one inbound text frame and produce the reply for the agent.
    /// Protocol errors never close the session.
    pub fn handle_text(&mut self, text: &str) -> ServerReply {
        if self.state == SessionState::Closed {
            return ServerReply::error("Session closed");
        }
        match AgentToServer::parse(text) {
            Ok(AgentToServer::Register {
                client_id,
                hostname,
                ip,
            }) => self.register(client_id, hostname, ip),
            Err(error) => {
                tracing::warn!(
                    target = "fleet_control::session",
                    conn_id = self.handle.conn_id(),
                    error = error.message(),
                    "rejected agent frame"
                );
                error.reply()
            }
        }
    }

    fn register(&mut self, agent_id: String, hostname: String, ip: String) -> ServerReply {
        if let SessionState::Registered { agent_id: previous } = &self.state {
            if *previous != agent_id {
                let previous = previous.clone();
                self.release(&previous);
            }
        }

        let replaced = self
            .registry
            .register(&agent_id, &hostname, &ip, self.handle.clone());
        tracing::info!(
            target = "fleet_control::session",
            conn_id = self.handle.conn_id(),
            agent_id = %agent_id,
            hostname = %hostname,
            ip = %ip,
            replaced,
            "agent registered"
        );

        if let Err(error) = self.assets.upsert_asset(&agent_id, &hostname, &ip, Utc::now()) {
            tracing::warn!(
                target = "fleet_control::session",
                agent_id = %agent_id,
                error = %error,
                "failed to record asset"
            );
        }

        self.state = SessionState::Registered { agent_id };
        ServerReply::Registered
    }

    /// Evict `agent_id` if this connection still owns it and drop its asset.
    /// The entry may already be gone after a failed send; the asset still
    /// goes. Only a newer connection holding the id keeps it.
    fn release(&self, agent_id: &str) {
        let evicted = self
            .registry
            .evict(agent_id, Some(self.handle.conn_id()));
        if !evicted && self.registry.contains(agent_id) {
            return;
        }
        if let Err(error) = self.assets.remove_asset(agent_id) {
            tracing::warn!(
                target = "fleet_control::session",
                agent_id = %agent_id,
                error = %error,
                "failed to remove asset"
            );
        }
    }

    /// Move to `Closed`. Safe to call more than once.
    pub fn close(&mut self) {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        if let SessionState::Registered { agent_id } = state {
            self.release(&agent_id);
            tracing::info!(
                target = "fleet_control::session",
                conn_id = self.handle.conn_id(),
                agent_id = %agent_id,
                "agent disconnected"
            );
        }
    }
}

/// Run one agent connection to completion.
pub async fn serve_socket(
    socket: WebSocket,
    peer: Option<SocketAddr>,
    registry: Arc<AgentRegistry>,
    assets: Arc<dyn AssetStore>,
) {
    let (sink, mut stream) = socket.split();
    let (handle, rx) = SessionHandle::channel(OUTBOUND_QUEUE);
    let writer = tokio::spawn(drive_writer(sink, rx, |text: String| {
        Message::Text(text.into())
    }));
    let conn_id = handle.conn_id();
    let peer = peer.map(|addr| addr.to_string()).unwrap_or_default();
    tracing::info!(target = "fleet_control::session", conn_id, peer = %peer, "agent connection opened");

    let mut session = AgentSession::new(handle.clone(), registry, assets);
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let reply = session.handle_text(text.as_str());
                let encoded = match reply.encode() {
                    Ok(encoded) => encoded,
                    Err(error) => {
                        tracing::warn!(target = "fleet_control::session", conn_id, error = %error, "failed to encode reply");
                        continue;
                    }
                };
                if let Err(error) = handle.send_text(encoded).await {
                    tracing::warn!(target = "fleet_control::session", conn_id, error = %error, "reply write failed");
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(target = "fleet_control::session", conn_id, error = %error, "ws read error");
                break;
            }
        }
    }

    session.close();
    writer.abort();
    tracing::info!(target = "fleet_control::session", conn_id, peer = %peer, "agent connection closed");
}
