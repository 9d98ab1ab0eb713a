use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Server id used for records about the monitor itself.
pub const MONITOR_SERVER_ID: i64 = 0;

/// Class of control-plane messages.
pub const MONITOR_CLASS: &str = "Monitor";
/// Class of control-plane failures.
pub const ERROR_CLASS: &str = "Monitor Error";
/// Class announcing a server (or the monitor) to a dashboard.
pub const INIT_CLASS: &str = "Monitor Init";

/// Release channel a server follows when updated without an explicit version.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    #[default]
    Stable,
    Unstable,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Unstable => "unstable",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stable" => Ok(Self::Stable),
            "unstable" => Ok(Self::Unstable),
            _ => Err(format!("Invalid channel: {}", s)),
        }
    }
}

/// Install state of one server version on disk.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BinaryStatus {
    #[default]
    NotInstalled,
    Ok,
    /// An install started and never finished.
    Corrupted,
}

/// Persisted description of one supervised server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub id: i64,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub channel: Channel,
    /// Set when the version was chosen explicitly instead of tracking `channel`
    #[serde(default)]
    pub pinned: bool,
}

/// An operator account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub servers: BTreeSet<i64>,
}

impl User {
    pub fn new(name: &str, is_admin: bool) -> Self {
        Self {
            name: name.to_string(),
            is_admin,
            servers: BTreeSet::new(),
        }
    }

    /// Implicit admin used while no users exist.
    pub fn bootstrap_root() -> Self {
        Self::new("root", true)
    }

    /// Whether messages addressed to `server_id` are allowed. Records about
    /// the monitor itself are visible to everyone.
    pub fn can_access(&self, server_id: i64) -> bool {
        self.is_admin || server_id == MONITOR_SERVER_ID || self.servers.contains(&server_id)
    }
}

/// A permission granted to or revoked from a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Admin,
    Server(i64),
}

/// The unit of information sent to operators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    #[serde(rename = "ServerID")]
    pub server_id: i64,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Local>,
    #[serde(rename = "Class")]
    pub class: String,
    #[serde(rename = "Message")]
    pub message: String,
}

impl LogRecord {
    pub fn new(server_id: i64, class: &str, message: impl Into<String>) -> Self {
        Self::at(server_id, Local::now(), class, message)
    }

    pub fn at(
        server_id: i64,
        timestamp: DateTime<Local>,
        class: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            server_id,
            timestamp,
            class: class.to_string(),
            message: message.into(),
        }
    }

    pub fn monitor(server_id: i64, message: impl Into<String>) -> Self {
        Self::new(server_id, MONITOR_CLASS, message)
    }

    pub fn error(server_id: i64, message: impl Into<String>) -> Self {
        Self::new(server_id, ERROR_CLASS, message)
    }

    pub fn init(server_id: i64, message: impl Into<String>) -> Self {
        Self::new(server_id, INIT_CLASS, message)
    }
}

/// Inbound operator message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperatorMessage {
    #[serde(rename = "ServerID", default)]
    pub server_id: i64,
    #[serde(rename = "Token", default)]
    pub token: String,
    #[serde(rename = "Command")]
    pub command: String,
}
