//! Error types for prefork.

use std::path::PathBuf;

use thiserror::Error;

use crate::pool::bridge::BridgeError;
use crate::pool::protocol::Slot;
use crate::pool::record::WorkerStatus;

/// Main error type for prefork.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Cannot {action} worker #{slot}: it is {status}")]
    IllegalTransition {
        slot: Slot,
        action: &'static str,
        status: WorkerStatus,
    },

    #[error("No worker registered for slot #{0}")]
    SlotNotFound(Slot),

    #[error("No worker owns control connection {0}")]
    ConnectionNotFound(u64),

    #[error("Slot #{0} is already occupied")]
    DuplicateSlot(Slot),

    #[error("Failed to spawn worker #{slot}: {source}")]
    Spawn {
        slot: Slot,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not create socket directory {}: {source}", .path.display())]
    SocketDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not bind {what} at {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker #{slot} failed to bootstrap: {source}")]
    Bootstrap {
        slot: Slot,
        #[source]
        source: BridgeError,
    },

    #[error("Unknown bridge '{0}'. Valid options: echo, static")]
    UnknownBridge(String),

    #[error("Invalid launch command: {0}")]
    LaunchCommand(String),

    #[error("Invalid configuration: {0}")]
    ConfigValue(String),

    #[error("Config file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("Invalid config file {}: {source}", .path.display())]
    ConfigInvalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Could not reach the master at {}: {source}. Is it running?", .path.display())]
    MasterUnreachable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for prefork operations.
pub type Result<T> = std::result::Result<T, PoolError>;
