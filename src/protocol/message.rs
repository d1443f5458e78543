//! Request and response messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Commands a peer may send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Command {
    Get,
    Put,
    Close,
    /// Any command this daemon does not implement; answered with an error
    Unknown(String),
}

impl Command {
    /// Commands advertised in the handshake
    pub fn known() -> Vec<Command> {
        vec![Command::Get, Command::Put, Command::Close]
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "get",
            Self::Put => "put",
            Self::Close => "close",
            Self::Unknown(name) => name,
        }
    }
}

impl From<String> for Command {
    fn from(value: String) -> Self {
        match value.as_str() {
            "get" => Self::Get,
            "put" => Self::Put,
            "close" => Self::Close,
            _ => Self::Unknown(value),
        }
    }
}

impl From<Command> for String {
    fn from(value: Command) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A request read from the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "ID", default)]
    pub id: i64,

    #[serde(rename = "Command")]
    pub command: Command,

    /// Cache key material
    #[serde(rename = "ActionID", with = "crate::protocol::encoding", default)]
    pub action_id: Vec<u8>,

    /// Opaque value stored next to the body (put only)
    #[serde(rename = "OutputID", with = "crate::protocol::encoding", default)]
    pub output_id: Vec<u8>,

    /// Length of the body frame that follows a put; 0 means no frame
    #[serde(rename = "BodySize", default)]
    pub body_size: i64,
}

/// A response written to the peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    /// Absent only on the handshake
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub miss: bool,

    #[serde(
        rename = "OutputID",
        with = "crate::protocol::encoding",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub output_id: Vec<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_path: Option<String>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: i64,

    /// When a hit was stored locally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub known_commands: Vec<Command>,
}

impl Response {
    /// The unconditional first line written by the daemon
    pub fn handshake() -> Self {
        Self {
            known_commands: Command::known(),
            ..Self::default()
        }
    }

    /// An empty response answering request `id`
    pub fn answering(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    /// A response carrying an error for request `id`
    pub fn failed(id: i64, err: impl fmt::Display) -> Self {
        Self {
            id: Some(id),
            err: Some(err.to_string()),
            ..Self::default()
        }
    }

    /// A miss for request `id`
    pub fn miss(id: i64) -> Self {
        Self {
            id: Some(id),
            miss: true,
            ..Self::default()
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}
