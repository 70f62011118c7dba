//! Per-slot worker record and its lifecycle state machine.
//!
//! ```text
//!  CREATED ──register──▶ REGISTERED ──ready──▶ READY ◀──release── BUSY
//!                                                │                 ▲ │
//!                                                └─────occupy──────┘ │
//!                                                                  lock
//!                                                                    ▼
//!  (any) ──close──▶ CLOSED                                        LOCKED
//! ```

use super::proc::WorkerProcess;
use super::protocol::Slot;
use crate::error::{PoolError, Result};

/// Identity of one record instance. A respawned slot gets a new id.
pub type RecordId = u64;

/// Identity of one accepted control connection.
pub type ConnId = u64;

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkerStatus {
    /// Process started, pid not yet known.
    Created,
    /// Connected and identified, bootstrapping the application.
    Registered,
    /// Idle and assignable.
    Ready,
    /// Serving exactly one forwarded connection.
    Busy,
    /// Serving its last connection; closed instead of released.
    Locked,
    /// Accepts nothing; awaiting process termination.
    Closed,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Registered => "registered",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Locked => "locked",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One pool slot's current worker.
#[derive(Debug)]
pub struct WorkerRecord {
    id: RecordId,
    slot: Slot,
    process: Option<WorkerProcess>,
    pid: Option<u32>,
    connection: Option<ConnId>,
    handled_requests: u64,
    max_requests: Option<u64>,
    status: WorkerStatus,
}

impl WorkerRecord {
    pub fn new(id: RecordId, slot: Slot, max_requests: Option<u64>) -> Self {
        Self {
            id,
            slot,
            process: None,
            pid: None,
            connection: None,
            handled_requests: 0,
            max_requests: max_requests.filter(|&max| max > 0),
            status: WorkerStatus::Created,
        }
    }

    /// Hand the spawned process over to this record.
    pub fn attach(&mut self, process: WorkerProcess) {
        self.process = Some(process);
    }

    fn expect(&self, expected: WorkerStatus, action: &'static str) -> Result<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(PoolError::IllegalTransition {
                slot: self.slot,
                action,
                status: self.status,
            })
        }
    }

    /// CREATED → REGISTERED.
    pub fn register(&mut self, pid: u32, connection: ConnId) -> Result<()> {
        self.expect(WorkerStatus::Created, "register")?;
        self.pid = Some(pid);
        self.connection = Some(connection);
        self.status = WorkerStatus::Registered;
        Ok(())
    }

    /// REGISTERED → READY.
    pub fn ready(&mut self) -> Result<()> {
        self.expect(WorkerStatus::Registered, "ready")?;
        self.status = WorkerStatus::Ready;
        Ok(())
    }

    /// READY → BUSY.
    pub fn occupy(&mut self) -> Result<()> {
        self.expect(WorkerStatus::Ready, "occupy")?;
        self.status = WorkerStatus::Busy;
        Ok(())
    }

    /// BUSY → READY, counting the finished request.
    pub fn release(&mut self) -> Result<()> {
        self.expect(WorkerStatus::Busy, "release")?;
        self.status = WorkerStatus::Ready;
        self.handled_requests += 1;
        Ok(())
    }

    /// BUSY → LOCKED.
    pub fn lock(&mut self) -> Result<()> {
        self.expect(WorkerStatus::Busy, "lock")?;
        self.status = WorkerStatus::Locked;
        Ok(())
    }

    /// ANY → CLOSED.
    pub fn close(&mut self) {
        self.status = WorkerStatus::Closed;
    }

    /// Whether the request limit has been reached.
    pub fn should_recycle(&self) -> bool {
        self.max_requests
            .is_some_and(|max| self.handled_requests >= max)
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.or_else(|| self.process.as_ref().and_then(WorkerProcess::pid))
    }

    pub fn connection(&self) -> Option<ConnId> {
        self.connection
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn handled_requests(&self) -> u64 {
        self.handled_requests
    }

    pub fn take_process(&mut self) -> Option<WorkerProcess> {
        self.process.take()
    }
}
