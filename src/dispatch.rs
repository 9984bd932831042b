//! Operator-facing dispatch: text messages and chunked artifact pushes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::protocol::{ScriptKind, ServerToAgent};
use crate::registry::{AgentRegistry, BroadcastReport, RegistryError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("missing required parameter `{0}`")]
    MissingField(&'static str),
    #[error("artifact `{0}` is empty")]
    EmptyArtifact(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Agent(String),
    All,
}

/// What a dispatch call sent. For a single agent, `report.delivered` is 1;
/// a failed unicast is an error instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub artifact: Option<String>,
    pub frames: usize,
    pub report: BroadcastReport,
}

pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
    chunk_size: usize,
}

impl Dispatcher {
    pub fn new(registry: Arc<AgentRegistry>, chunk_size: usize) -> Self {
        Self {
            registry,
            chunk_size,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub async fn send_text(&self, target: Target, text: &str) -> Result<Delivery, DispatchError> {
        let target = validate_target(target)?;
        if text.trim().is_empty() {
            return Err(DispatchError::MissingField("message"));
        }
        let frame = ServerToAgent::Message {
            content: text.to_string(),
        }
        .encode()?;
        self.deliver(&target, None, vec![frame]).await
    }

    /// Base64-chunk `payload` and send the chunks in index order.
    pub async fn push_script(
        &self,
        target: Target,
        name: &str,
        kind: ScriptKind,
        payload: &[u8],
    ) -> Result<Delivery, DispatchError> {
        let target = validate_target(target)?;
        let name = validate_artifact(name, payload)?;
        let artifact = stamped_name(Utc::now(), name);
        let chunks = codec::split(payload, self.chunk_size)?;
        let total = chunks.len() as u32;
        let frames = chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                ServerToAgent::UploadScriptChunk {
                    script_name: artifact.clone(),
                    chunk_index: index as u32,
                    total_chunks: total,
                    script_chunk: chunk,
                    script_type: kind.as_str().to_string(),
                }
                .encode()
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            target = "fleet_control::dispatch",
            artifact = %artifact,
            kind = %kind,
            chunks = total,
            broadcast = target == Target::All,
            "pushing script"
        );
        self.deliver(&target, Some(artifact), frames).await
    }

    /// Binary pushes are unicast only.
    pub async fn push_binary(
        &self,
        agent_id: &str,
        name: &str,
        payload: &[u8],
    ) -> Result<Delivery, DispatchError> {
        let target = validate_target(Target::Agent(agent_id.to_string()))?;
        let name = validate_artifact(name, payload)?;
        let artifact = stamped_name(Utc::now(), name);
        let chunks = codec::split(payload, self.chunk_size)?;
        let total = chunks.len() as u32;
        let frames = chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                ServerToAgent::UploadBinaryChunk {
                    binary_name: artifact.clone(),
                    chunk_index: index as u32,
                    total_chunks: total,
                    binary_chunk: chunk,
                }
                .encode()
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(
            target = "fleet_control::dispatch",
            agent_id = %agent_id,
            artifact = %artifact,
            chunks = total,
            "pushing binary"
        );
        self.deliver(&target, Some(artifact), frames).await
    }

    /// Tell every agent to refresh, whether or not the roster changed.
    pub async fn refresh_all(&self) -> Result<Delivery, DispatchError> {
        let frame = ServerToAgent::Refresh.encode()?;
        self.deliver(&Target::All, None, vec![frame]).await
    }

    async fn deliver(
        &self,
        target: &Target,
        artifact: Option<String>,
        frames: Vec<String>,
    ) -> Result<Delivery, DispatchError> {
        let report = match target {
            Target::Agent(id) => {
                self.registry.unicast_sequence(id, &frames).await?;
                BroadcastReport {
                    delivered: 1,
                    failed: Vec::new(),
                }
            }
            Target::All => self.registry.broadcast_sequence(&frames).await,
        };
        Ok(Delivery {
            artifact,
            frames: frames.len(),
            report,
        })
    }
}

fn validate_target(target: Target) -> Result<Target, DispatchError> {
    match target {
        Target::Agent(id) => {
            let id = id.trim();
            if id.is_empty() {
                Err(DispatchError::MissingField("client_id"))
            } else {
                Ok(Target::Agent(id.to_string()))
            }
        }
        Target::All => Ok(Target::All),
    }
}

fn validate_artifact<'a>(name: &'a str, payload: &[u8]) -> Result<&'a str, DispatchError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(DispatchError::MissingField("name"));
    }
    if payload.is_empty() {
        return Err(DispatchError::EmptyArtifact(name.to_string()));
    }
    Ok(name)
}

/// `YYYYmmdd_HHMMSS_mmm_<file name>`; directories in `name` are dropped.
pub fn stamped_name(now: DateTime<Utc>, name: &str) -> String {
    let file = name.rsplit(['/', '\\']).next().unwrap_or(name);
    format!("{}_{}", now.format("%Y%m%d_%H%M%S_%3f"), file)
}
