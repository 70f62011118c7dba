//! Control channel protocol between the master and its workers.
//!
//! Messages are JSON objects tagged by `cmd`, one per newline-terminated line.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Stable identifier for one position in the pool.
pub type Slot = u16;

/// Severity of a relayed log line.
///
/// Accepts the full syslog-style range that application loggers emit and
/// folds it onto tracing's levels when relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Emergency,
    Alert,
    Critical,
    Error,
    #[serde(alias = "warn")]
    Warning,
    Notice,
    Info,
    Debug,
}

impl LogLevel {
    /// Map onto the tracing level used when relaying.
    pub fn as_tracing(self) -> tracing::Level {
        match self {
            Self::Emergency | Self::Alert | Self::Critical | Self::Error => tracing::Level::ERROR,
            Self::Warning => tracing::Level::WARN,
            Self::Notice | Self::Info => tracing::Level::INFO,
            Self::Debug => tracing::Level::DEBUG,
        }
    }
}

/// A message on the control channel, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Worker → master: attach this process to its slot.
    Register { pid: u32, slot: Slot },

    /// Worker → master: application bootstrapped, accepting connections.
    Ready,

    /// Worker → master: relay a line to the operator log.
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<LogLevel>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<serde_json::Value>,
    },

    /// Client → master: reply with a status snapshot, then close.
    Status,

    /// Client → master: acknowledge, then shut the pool down.
    Stop,

    /// Client → master: acknowledge, then gracefully reload every worker.
    Reload,

    /// Master → worker: bootstrap the application, then send `ready`.
    Bootstrap,
}

impl ControlMessage {
    /// Create a relayed log message.
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log {
            level: Some(level),
            message: message.into(),
            context: None,
        }
    }

    /// Name of the command, as it appears on the wire.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Ready => "ready",
            Self::Log { .. } => "log",
            Self::Status => "status",
            Self::Stop => "stop",
            Self::Reload => "reload",
            Self::Bootstrap => "bootstrap",
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("ControlMessage serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// Pool health as reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolHealth {
    Starting,
    Healthy,
    Offline,
    Unknown,
}

impl std::fmt::Display for PoolHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Healthy => write!(f, "healthy"),
            Self::Offline => write!(f, "offline"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Reply to a `status` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: PoolHealth,
    /// Configured pool size.
    pub workers: usize,
    /// Requests completed since the master started.
    pub handled_requests: u64,
    /// Requests completed by the current record of each slot.
    pub handled_requests_per_worker: BTreeMap<Slot, u64>,
}
