//! Process handle for worker subprocesses.
//!
//! The child itself is owned by a supervisor task. The [`WorkerProcess`] kept
//! in the worker record is the only way to reach it: it carries the pid and a
//! one-shot terminate request. Dropping the handle also terminates the child.

use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::signals::{TerminationReason, analyze_exit_status};

/// How long a terminated worker gets before SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Handle to a supervised worker subprocess.
#[derive(Debug)]
pub struct WorkerProcess {
    pid: Option<u32>,
    terminate: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl WorkerProcess {
    /// Create a handle from its parts.
    pub fn new(
        pid: Option<u32>,
        terminate: oneshot::Sender<()>,
        supervisor: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            pid,
            terminate: Some(terminate),
            supervisor,
        }
    }

    /// OS process id, if the process was started.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the supervisor to stop the process. Idempotent and non-blocking.
    pub fn terminate(&mut self) {
        if let Some(tx) = self.terminate.take() {
            let _ = tx.send(());
        }
    }

    /// Take the supervisor task so the caller can wait for the reap.
    pub fn take_supervisor(&mut self) -> Option<JoinHandle<()>> {
        self.supervisor.take()
    }
}

/// Send SIGTERM to `pid`.
pub fn send_terminate(pid: u32) -> nix::Result<()> {
    signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
}

/// Wait for `child` to exit, or stop it when `terminate` fires (or its sender
/// is dropped). Always reaps.
pub async fn supervise(mut child: Child, terminate: oneshot::Receiver<()>) -> TerminationReason {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => analyze_exit_status(status),
            Err(e) => TerminationReason::Unknown(e.to_string()),
        },
        _ = terminate => stop(&mut child, TERMINATE_GRACE).await,
    }
}

/// Gracefully stop the child: SIGTERM, wait `grace`, then SIGKILL.
pub async fn stop(child: &mut Child, grace: Duration) -> TerminationReason {
    if let Some(pid) = child.id()
        && let Err(e) = send_terminate(pid)
    {
        tracing::debug!(pid, error = %e, "Failed to send SIGTERM");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => analyze_exit_status(status),
        Ok(Err(e)) => TerminationReason::Unknown(e.to_string()),
        Err(_) => {
            // Still running: SIGKILL, which also waits.
            if let Err(e) = child.kill().await {
                return TerminationReason::Unknown(e.to_string());
            }
            match child.wait().await {
                Ok(status) => analyze_exit_status(status),
                Err(e) => TerminationReason::Unknown(e.to_string()),
            }
        }
    }
}
