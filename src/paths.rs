//! Socket path layout.
//!
//! One directory holds the master's control socket and one socket per slot:
//!
//! ```text
//! <socket-path>/controller.sock
//! <socket-path>/1.sock
//! <socket-path>/2.sock
//! ```

use std::path::{Path, PathBuf};

use crate::error::{PoolError, Result};
use crate::pool::protocol::Slot;

/// File name of the master's control socket.
pub const CONTROLLER_SOCKET: &str = "controller.sock";

/// Paths derived from the configured socket directory.
#[derive(Debug, Clone)]
pub struct SocketPaths {
    dir: PathBuf,
}

impl SocketPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn controller(&self) -> PathBuf {
        self.dir.join(CONTROLLER_SOCKET)
    }

    /// Private socket of the worker in `slot`.
    pub fn worker(&self, slot: Slot) -> PathBuf {
        self.dir.join(format!("{}.sock", slot))
    }

    /// Create the socket directory if needed.
    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|source| PoolError::SocketDir {
            path: self.dir.clone(),
            source,
        })
    }

    /// Remove a socket file left behind by a previous run.
    pub fn remove_stale(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Removed stale socket");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
