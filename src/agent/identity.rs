//! Who this agent is: a persisted id plus the hostname and address it
//! reports on registration.

use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::AgentError;
use crate::protocol::AgentToServer;

pub const IDENTITY_FILE: &str = "agent.json";
pub const UNKNOWN: &str = "Unknown";

#[derive(Debug, Serialize, Deserialize)]
struct StoredIdentity {
    client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub hostname: String,
    pub address: String,
}

impl AgentIdentity {
    pub fn resolve(
        workplace: &Path,
        server: &Url,
        hostname_override: Option<&str>,
    ) -> Result<Self, AgentError> {
        let hostname = hostname_override
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(local_hostname);
        Ok(Self {
            agent_id: load_or_create_agent_id(workplace)?,
            hostname,
            address: local_address(server),
        })
    }

    pub fn register_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&AgentToServer::Register {
            client_id: self.agent_id.clone(),
            hostname: self.hostname.clone(),
            ip: self.address.clone(),
        })
    }
}

/// Read the id from `<workplace>/agent.json`, creating it on first start.
pub fn load_or_create_agent_id(workplace: &Path) -> Result<String, AgentError> {
    let path = workplace.join(IDENTITY_FILE);
    match fs::read_to_string(&path) {
        Ok(raw) => {
            let stored: StoredIdentity =
                serde_json::from_str(&raw).map_err(|error| AgentError::CorruptIdentity {
                    path: path.clone(),
                    detail: error.to_string(),
                })?;
            let id = stored.client_id.trim();
            if id.is_empty() {
                return Err(AgentError::CorruptIdentity {
                    path,
                    detail: "empty client_id".into(),
                });
            }
            return Ok(id.to_string());
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(source) => return Err(AgentError::Io { path, source }),
    }

    fs::create_dir_all(workplace).map_err(|source| AgentError::Io {
        path: workplace.to_path_buf(),
        source,
    })?;
    let id = Uuid::new_v4().to_string();
    let body = serde_json::to_string_pretty(&StoredIdentity {
        client_id: id.clone(),
    })?;
    fs::write(&path, body).map_err(|source| AgentError::Io {
        path: path.clone(),
        source,
    })?;
    tracing::info!(target = "fleet_control::agent", agent_id = %id, path = %path.display(), "generated agent id");
    Ok(id)
}

pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .map(|name| name.to_string_lossy().trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Local address of the interface that routes toward `server`. Connecting a
/// UDP socket picks the route without sending anything.
pub fn local_address(server: &Url) -> String {
    match route_local_ip(server) {
        Ok(ip) => ip.to_string(),
        Err(error) => {
            tracing::debug!(target = "fleet_control::agent", error = %error, "could not determine local address");
            UNKNOWN.to_string()
        }
    }
}

fn route_local_ip(server: &Url) -> io::Result<IpAddr> {
    let host = server
        .host_str()
        .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "server url has no host"))?;
    let port = server.port_or_known_default().unwrap_or(80);
    let target: SocketAddr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "server host did not resolve"))?;
    let bind = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind)?;
    socket.connect(target)?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::{json, Value};
    use url::Url;

    use super::{load_or_create_agent_id, local_address, AgentIdentity, IDENTITY_FILE, UNKNOWN};
    use crate::error::AgentError;

    #[test]
    fn agent_id_survives_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let workplace = dir.path().join("nested");
        let first = load_or_create_agent_id(&workplace).unwrap();
        let second = load_or_create_agent_id(&workplace).unwrap();
        assert_eq!(first, second);
        assert!(uuid::Uuid::parse_str(&first).is_ok());

        let stored: Value =
            serde_json::from_str(&fs::read_to_string(workplace.join(IDENTITY_FILE)).unwrap()).unwrap();
        assert_eq!(stored["client_id"], first);
    }

    #[test]
    fn corrupt_identity_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(IDENTITY_FILE), "not json").unwrap();
        assert!(matches!(
            load_or_create_agent_id(dir.path()),
            Err(AgentError::CorruptIdentity { .. })
        ));
    }

    #[test]
    fn address_routes_toward_server_or_falls_back() {
        let loopback = Url::parse("ws://127.0.0.1:8765/ws").unwrap();
        assert_eq!(local_address(&loopback), "127.0.0.1");
        let hostless = Url::parse("data:text/plain,hello").unwrap();
        assert_eq!(local_address(&hostless), UNKNOWN);
    }

    #[test]
    fn register_frame_carries_identity() {
        let dir = tempfile::tempdir().unwrap();
        let server = Url::parse("ws://127.0.0.1:8765/ws").unwrap();
        let identity = AgentIdentity::resolve(dir.path(), &server, Some("ws-01")).unwrap();
        let frame: Value = serde_json::from_str(&identity.register_frame().unwrap()).unwrap();
        assert_eq!(
            frame,
            json!({
                "action": "register",
                "client_id": identity.agent_id,
                "hostname": "ws-01",
                "ip": "127.0.0.1",
            })
        );
    }
}
