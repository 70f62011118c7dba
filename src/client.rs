//! Blocking client for a running master's control socket.
//!
//! Each command opens a fresh connection, writes one line and reads the reply
//! until the master closes the connection.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PoolError, Result};
use crate::pool::protocol::{ControlMessage, StatusReport};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for the master's control socket.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Fetch a status snapshot.
    pub fn status(&self) -> Result<StatusReport> {
        let reply = self.request(&ControlMessage::Status)?;
        Ok(serde_json::from_str(&reply)?)
    }

    /// Ask the master to shut down. Returns once it has acknowledged.
    pub fn stop(&self) -> Result<()> {
        self.acknowledged(&ControlMessage::Stop)
    }

    /// Ask the master to reload every worker.
    pub fn reload(&self) -> Result<()> {
        self.acknowledged(&ControlMessage::Reload)
    }

    fn acknowledged(&self, message: &ControlMessage) -> Result<()> {
        let reply = self.request(message)?;
        let value: serde_json::Value = serde_json::from_str(&reply)?;
        if value.is_object() {
            Ok(())
        } else {
            Err(PoolError::Protocol(format!(
                "Unexpected reply to {}: {}",
                message.command(),
                reply
            )))
        }
    }

    /// Send one message and read everything up to EOF.
    fn request(&self, message: &ControlMessage) -> Result<String> {
        let mut stream =
            UnixStream::connect(&self.socket).map_err(|source| PoolError::MasterUnreachable {
                path: self.socket.clone(),
                source,
            })?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        stream.write_all(message.to_line().as_bytes())?;
        stream.flush()?;

        let mut reply = String::new();
        stream.read_to_string(&mut reply)?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(PoolError::Protocol(format!(
                "Master closed the connection without answering {}",
                message.command()
            )));
        }
        tracing::debug!(cmd = message.command(), reply, "Control reply");
        Ok(reply.to_string())
    }
}
