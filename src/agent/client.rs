//! Agent side of the control channel.
//!
//! One connection at a time: register, wait for the reply, then act on
//! commands until the socket drops. Every connection gets a fresh
//! [`ReassemblyTracker`], so a transfer cut off by a disconnect is dropped.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::identity::AgentIdentity;
use super::runner::{sanitize_name, ArtifactHandler};
use crate::error::AgentError;
use crate::protocol::{AgentInbound, ScriptKind, ServerReply, ServerToAgent};
use crate::reassembly::{ArtifactKind, ReassemblyTracker};

/// Message content that shuts the agent down.
pub const STOP_COMMAND: &str = "STOP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registered,
}

/// How a connection that got past the handshake ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Lost,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub fn reconnect_delay(attempt: u32) -> Duration {
    let base_ms = 1_000u64.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let bounded = base_ms.min(30_000);
    let jitter = rand::thread_rng().gen_range(0..=250);
    Duration::from_millis(bounded + jitter)
}

pub struct AgentClient {
    url: String,
    identity: AgentIdentity,
    handler: Arc<dyn ArtifactHandler>,
    max_attempts: Option<u32>,
    state: Mutex<ConnectionState>,
}

impl AgentClient {
    pub fn new(
        url: impl Into<String>,
        identity: AgentIdentity,
        handler: Arc<dyn ArtifactHandler>,
    ) -> Self {
        Self {
            url: url.into(),
            identity,
            handler,
            max_attempts: None,
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    /// Give up after this many consecutive failed connections.
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        let previous = *state;
        if previous != next {
            tracing::debug!(target = "fleet_control::agent", from = ?previous, to = ?next, "connection state");
            *state = next;
        }
    }

    /// Connect and reconnect until cancelled, told to stop, or out of
    /// attempts.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AgentError> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            match self.connect_once(&cancel).await {
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::Lost) => {
                    tracing::warn!(target = "fleet_control::agent", url = %self.url, "connection lost");
                    attempt = 0;
                }
                Err(error) => {
                    tracing::warn!(target = "fleet_control::agent", url = %self.url, error = %error, "connection failed");
                }
            }
            self.set_state(ConnectionState::Disconnected);

            attempt += 1;
            if self.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(AgentError::AttemptsExhausted(attempt));
            }
            let delay = reconnect_delay(attempt);
            tracing::info!(
                target = "fleet_control::agent",
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn connect_once(&self, cancel: &CancellationToken) -> Result<SessionEnd, AgentError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|source| AgentError::Connect {
                url: self.url.clone(),
                source,
            })?;
        let (mut write, mut read) = ws.split();
        write
            .send(Message::Text(self.identity.register_frame()?))
            .await?;

        let mut tracker = ReassemblyTracker::new();
        let mut registered = false;
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.close().await;
                    return Ok(SessionEnd::Stopped);
                }
                frame = read.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => match AgentInbound::parse(&text) {
                    Ok(AgentInbound::Reply(ServerReply::Registered)) => {
                        if !registered {
                            registered = true;
                            self.set_state(ConnectionState::Registered);
                            tracing::info!(
                                target = "fleet_control::agent",
                                agent_id = %self.identity.agent_id,
                                url = %self.url,
                                "registered"
                            );
                        }
                    }
                    Ok(AgentInbound::Reply(ServerReply::Error { message })) if !registered => {
                        return Err(AgentError::Rejected(message));
                    }
                    Ok(AgentInbound::Reply(ServerReply::Error { message })) => {
                        tracing::warn!(target = "fleet_control::agent", message = %message, "server reported an error");
                    }
                    Ok(AgentInbound::Command(command)) => {
                        if self.handle_command(command, &mut tracker) == Flow::Stop {
                            let _ = write.close().await;
                            return Ok(SessionEnd::Stopped);
                        }
                    }
                    Err(error) => {
                        tracing::debug!(target = "fleet_control::agent", error = %error, raw = %text, "ignoring unrecognised frame");
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    if tracker.in_flight() > 0 {
                        tracing::debug!(
                            target = "fleet_control::agent",
                            partial = tracker.in_flight(),
                            "connection closed with transfers incomplete"
                        );
                    }
                    return if registered {
                        Ok(SessionEnd::Lost)
                    } else {
                        Err(AgentError::ClosedBeforeRegistration)
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(error)) if registered => {
                    tracing::warn!(target = "fleet_control::agent", error = %error, "ws read error");
                    return Ok(SessionEnd::Lost);
                }
                Some(Err(error)) => return Err(AgentError::Transport(error)),
            }
        }
    }

    fn handle_command(&self, command: ServerToAgent, tracker: &mut ReassemblyTracker) -> Flow {
        match command {
            ServerToAgent::Message { content } => {
                tracing::info!(target = "fleet_control::agent", content = %content, "message received");
                if content.trim() == STOP_COMMAND {
                    tracing::info!(target = "fleet_control::agent", "stop requested by server");
                    return Flow::Stop;
                }
            }
            ServerToAgent::Refresh => {
                tracing::debug!(target = "fleet_control::agent", "roster refresh");
            }
            ServerToAgent::UploadScriptChunk {
                script_name,
                chunk_index,
                total_chunks,
                script_chunk,
                script_type,
            } => match script_type.parse::<ScriptKind>() {
                Ok(kind) => self.accept_chunk(
                    tracker,
                    &script_name,
                    ArtifactKind::Script(kind),
                    chunk_index,
                    total_chunks,
                    script_chunk,
                ),
                Err(error) => {
                    tracing::warn!(target = "fleet_control::agent", artifact = %script_name, error = %error, "dropping chunk");
                }
            },
            ServerToAgent::UploadBinaryChunk {
                binary_name,
                chunk_index,
                total_chunks,
                binary_chunk,
            } => self.accept_chunk(
                tracker,
                &binary_name,
                ArtifactKind::Binary,
                chunk_index,
                total_chunks,
                binary_chunk,
            ),
        }
        Flow::Continue
    }

    fn accept_chunk(
        &self,
        tracker: &mut ReassemblyTracker,
        raw_name: &str,
        kind: ArtifactKind,
        index: u32,
        total: u32,
        payload: String,
    ) {
        let name = sanitize_name(raw_name);
        match tracker.accept(&name, kind, index, total, payload) {
            Ok(Some(artifact)) => match self.handler.handle(&artifact) {
                Ok(stored) => {
                    tracing::info!(
                        target = "fleet_control::agent",
                        artifact = %artifact.name,
                        path = %stored.path.display(),
                        "artifact received"
                    );
                }
                Err(error) => {
                    tracing::error!(target = "fleet_control::agent", artifact = %artifact.name, error = %error, "artifact handling failed");
                }
            },
            Ok(None) => {
                tracing::debug!(target = "fleet_control::agent", artifact = %name, index, total, "chunk received");
            }
            Err(error) => {
                tracing::warn!(target = "fleet_control::agent", artifact = %name, error = %error, "dropping chunk");
            }
        }
    }
}
