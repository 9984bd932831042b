//! Error types of every concern, re-exported in one place.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use crate::artifacts::ArtifactError;
pub use crate::codec::CodecError;
pub use crate::dispatch::DispatchError;
pub use crate::ingest::{IngestError, MappingError};
pub use crate::protocol::{ProtocolError, UnknownScriptKind};
pub use crate::reassembly::ReassemblyError;
pub use crate::registry::RegistryError;
pub use crate::session::SendError;
pub use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid server url `{0}`")]
    InvalidUrl(String),
    #[error("failed to connect to `{url}`: {source}")]
    Connect {
        url: String,
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("connection lost: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("server closed the connection before registration completed")]
    ClosedBeforeRegistration,
    #[error("registration rejected: {0}")]
    Rejected(String),
    #[error("failed to encode registration: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("gave up after {0} connection attempts")]
    AttemptsExhausted(u32),
    #[error("i/o error on `{path}`: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("identity file `{path}` is corrupt: {detail}")]
    CorruptIdentity { path: PathBuf, detail: String },
}
