pub mod agent;
pub mod api;
pub mod artifacts;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod inbox;
pub mod ingest;
pub mod logging;
pub mod protocol;
pub mod reassembly;
pub mod registry;
pub mod session;
pub mod store;
