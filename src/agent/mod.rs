//! Endpoint agent runtime: identity, the reconnecting control-channel
//! client, and storage/launch of received artifacts.

pub mod client;
pub mod identity;
pub mod runner;

pub use client::{reconnect_delay, AgentClient, ConnectionState, STOP_COMMAND};
pub use identity::AgentIdentity;
pub use runner::{
    ArtifactHandler, DiskArtifactHandler, LaunchPlan, ProcessLauncher, ScriptLauncher,
    StoredArtifact,
};
