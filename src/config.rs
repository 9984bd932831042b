use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(name = "fleet-server")]
#[command(about = "Controls a fleet of endpoint agents and ingests inbox submissions")]
pub struct ServerConfig {
    #[arg(long, env = "FLEET_HTTP_PORT", default_value_t = 5001)]
    pub http_port: u16,

    #[arg(long, env = "FLEET_CONTROL_PORT", default_value_t = 8765)]
    pub control_port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(long, env = "FLEET_DATABASE", default_value = "fleet.db")]
    pub database: PathBuf,

    #[arg(long, default_value = "scriptfile")]
    pub artifact_dir: PathBuf,

    #[arg(long, default_value_t = 4000)]
    pub chunk_size: usize,

    #[arg(long, default_value_t = 10)]
    pub inbox_interval_secs: u64,

    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    pub max_inbox_bytes: usize,

    #[arg(long, default_value_t = 10)]
    pub db_connect_attempts: u32,

    #[arg(long, default_value_t = 5000)]
    pub db_retry_delay_ms: u64,

    /// SQL applied after the built-in tables are created.
    #[arg(long)]
    pub schema_file: Option<PathBuf>,

    #[arg(long, env = "FLEET_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl ServerConfig {
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.bind, self.http_port)
    }

    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.bind, self.control_port)
    }

    pub fn inbox_interval(&self) -> Duration {
        Duration::from_secs(self.inbox_interval_secs.max(1))
    }

    pub fn db_retry_delay(&self) -> Duration {
        Duration::from_millis(self.db_retry_delay_ms)
    }
}

#[derive(Debug, Parser, Clone)]
#[command(name = "fleet-agent")]
#[command(about = "Connects to a fleet server and receives messages, scripts and binaries")]
pub struct AgentConfig {
    #[arg(long, env = "FLEET_SERVER_URL", default_value = "ws://127.0.0.1:8765/ws")]
    pub server_url: String,

    /// Working directory for identity, received artifacts and logs.
    #[arg(long)]
    pub workplace: Option<PathBuf>,

    /// Launch received scripts and binaries instead of only storing them.
    #[arg(long, default_value_t = false)]
    pub execute: bool,

    #[arg(long)]
    pub hostname: Option<String>,

    #[arg(long)]
    pub max_reconnect_attempts: Option<u32>,

    #[arg(long, env = "FLEET_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl AgentConfig {
    pub fn workplace_dir(&self) -> PathBuf {
        self.workplace.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .or_else(dirs::home_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("fleet-agent")
        })
    }
}
