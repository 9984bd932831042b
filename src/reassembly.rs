//! Per-connection reassembly of chunked artifacts.
//!
//! A tracker is owned by exactly one connection's read loop, so it needs no
//! locking. Each artifact name has at most one tracking cycle in flight; a
//! completed cycle is removed before the payload is returned, so a later
//! chunk for the same name starts a fresh cycle.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::protocol::ScriptKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Script(ScriptKind),
    Binary,
}

/// A fully received artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedArtifact {
    pub name: String,
    pub kind: ArtifactKind,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("artifact `{name}` declares zero chunks")]
    EmptyTransfer { name: String },
    #[error("chunk {index} of artifact `{name}` is outside 0..{total}")]
    IndexOutOfRange { name: String, index: u32, total: u32 },
    #[error("artifact `{name}` could not be decoded: {source}")]
    Decode { name: String, source: CodecError },
}

#[derive(Debug)]
struct Transfer {
    total: u32,
    kind: ArtifactKind,
    chunks: BTreeMap<u32, String>,
}

#[derive(Debug, Default)]
pub struct ReassemblyTracker {
    transfers: HashMap<String, Transfer>,
}

impl ReassemblyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one chunk. Returns the artifact once every index in
    /// `0..total` has been seen.
    ///
    /// The total from the first chunk of a cycle is authoritative; later
    /// chunks that disagree are checked against it. Re-sending an index
    /// replaces the stored chunk.
    pub fn accept(
        &mut self,
        name: &str,
        kind: ArtifactKind,
        index: u32,
        total: u32,
        payload: String,
    ) -> Result<Option<CompletedArtifact>, ReassemblyError> {
        let declared = self
            .transfers
            .get(name)
            .map(|transfer| transfer.total)
            .unwrap_or(total);

        if declared == 0 {
            return Err(ReassemblyError::EmptyTransfer {
                name: name.to_string(),
            });
        }
        if index >= declared {
            return Err(ReassemblyError::IndexOutOfRange {
                name: name.to_string(),
                index,
                total: declared,
            });
        }
        if declared != total {
            tracing::warn!(
                target = "fleet_control::reassembly",
                artifact = %name,
                declared,
                received = total,
                "chunk disagrees with declared total; keeping the first"
            );
        }

        let transfer = self
            .transfers
            .entry(name.to_string())
            .or_insert_with(|| Transfer {
                total: declared,
                kind,
                chunks: BTreeMap::new(),
            });
        transfer.chunks.insert(index, payload);

        if transfer.chunks.len() < transfer.total as usize {
            return Ok(None);
        }

        let Some(transfer) = self.transfers.remove(name) else {
            return Ok(None);
        };
        let payload = codec::join(transfer.chunks.values()).map_err(|source| {
            ReassemblyError::Decode {
                name: name.to_string(),
                source,
            }
        })?;
        Ok(Some(CompletedArtifact {
            name: name.to_string(),
            kind: transfer.kind,
            payload,
        }))
    }

    /// Number of artifacts currently partially received.
    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }
}
