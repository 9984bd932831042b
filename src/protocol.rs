use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames the control plane sends to agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ServerToAgent {
    Message {
        content: String,
    },
    UploadScriptChunk {
        script_name: String,
        chunk_index: u32,
        total_chunks: u32,
        script_chunk: String,
        script_type: String,
    },
    UploadBinaryChunk {
        binary_name: String,
        chunk_index: u32,
        total_chunks: u32,
        binary_chunk: String,
    },
    Refresh,
}

impl ServerToAgent {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Replies the control plane sends in answer to an agent frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServerReply {
    Registered,
    Error { message: String },
}

impl ServerReply {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Frames agents send to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentToServer {
    Register {
        client_id: String,
        hostname: String,
        ip: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    InvalidJson,
    UnknownAction,
    InvalidRegistration,
}

impl ProtocolError {
    pub fn message(self) -> &'static str {
        match self {
            ProtocolError::InvalidJson => "Invalid JSON",
            ProtocolError::UnknownAction => "Unknown action",
            ProtocolError::InvalidRegistration => "Invalid registration data",
        }
    }

    pub fn reply(self) -> ServerReply {
        ServerReply::error(self.message())
    }
}

impl AgentToServer {
    /// Parse an inbound agent text frame.
    ///
    /// Registration fields are trimmed and must all be non-empty.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::UnknownAction)?;

        match action {
            "register" => {
                let field = |name: &str| {
                    value
                        .get(name)
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .unwrap_or_default()
                        .to_string()
                };
                let client_id = field("client_id");
                let hostname = field("hostname");
                let ip = field("ip");
                if client_id.is_empty() || hostname.is_empty() || ip.is_empty() {
                    return Err(ProtocolError::InvalidRegistration);
                }
                Ok(AgentToServer::Register {
                    client_id,
                    hostname,
                    ip,
                })
            }
            _ => Err(ProtocolError::UnknownAction),
        }
    }
}

/// What an agent receives: either a command frame or a reply to its own frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentInbound {
    Command(ServerToAgent),
    Reply(ServerReply),
}

impl AgentInbound {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("status").is_some() {
            serde_json::from_value(value).map(AgentInbound::Reply)
        } else {
            serde_json::from_value(value).map(AgentInbound::Command)
        }
    }
}

/// Interpreter a script artifact is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    PowerShell,
    PowerShellBase64,
    Bat,
    Python,
    LinuxShell,
    Text,
}

impl ScriptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptKind::PowerShell => "powershell",
            ScriptKind::PowerShellBase64 => "powershell-base64",
            ScriptKind::Bat => "bat",
            ScriptKind::Python => "python",
            ScriptKind::LinuxShell => "linuxshell",
            ScriptKind::Text => "text",
        }
    }

    /// Kind implied by a file extension in the artifact library.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "ps1" => Some(ScriptKind::PowerShell),
            "bat" => Some(ScriptKind::Bat),
            "py" => Some(ScriptKind::Python),
            "sh" => Some(ScriptKind::LinuxShell),
            "txt" => Some(ScriptKind::Text),
            _ => None,
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownScriptKind(pub String);

impl fmt::Display for UnknownScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown script type `{}`", self.0)
    }
}

impl std::error::Error for UnknownScriptKind {}

impl FromStr for ScriptKind {
    type Err = UnknownScriptKind;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "powershell" => Ok(ScriptKind::PowerShell),
            "powershell-base64" => Ok(ScriptKind::PowerShellBase64),
            "bat" => Ok(ScriptKind::Bat),
            "python" => Ok(ScriptKind::Python),
            "linuxshell" => Ok(ScriptKind::LinuxShell),
            "text" => Ok(ScriptKind::Text),
            other => Err(UnknownScriptKind(other.to_string())),
        }
    }
}
