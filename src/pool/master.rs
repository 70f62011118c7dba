//! The master process: owns the pool and runs the event loop.
//!
//! Every piece of orchestrator state lives in [`ProcessManager`] and is only
//! touched from the loop in [`run`]. Listeners, connection readers, proxies,
//! timers, signal handlers and process supervisors are separate tasks that
//! report back as [`Event`]s, so handlers never race each other.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::net::unix::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::forwarder::{self, OverflowPolicy, PendingQueue};
use super::ipc::{FrameReader, Outbox, Outgoing, write_loop};
use super::protocol::{ControlMessage, LogLevel, PoolHealth, Slot, StatusReport};
use super::record::{ConnId, RecordId, WorkerRecord, WorkerStatus};
use super::registry::WorkerRegistry;
use super::signals::TerminationReason;
use super::spawn::{CommandLauncher, LaunchSpec, Launcher};
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::paths::SocketPaths;
use crate::pidfile::PidFile;

/// Delay before retrying a worker that failed to launch.
const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

/// How long shutdown waits for writers and worker reaps.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(3);

/// Sending side of the master's event loop.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Orchestrator-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterStatus {
    Starting,
    Running,
    /// Debug mode only: a worker failed to bootstrap and the pool is frozen
    /// until a reload.
    Emergency,
    /// Terminal. No further spawns.
    Shutdown,
}

impl MasterStatus {
    pub fn health(self) -> PoolHealth {
        match self {
            Self::Starting => PoolHealth::Starting,
            Self::Running => PoolHealth::Healthy,
            Self::Emergency => PoolHealth::Offline,
            Self::Shutdown => PoolHealth::Unknown,
        }
    }
}

/// What an OS signal asks the master to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Shutdown,
    Reload,
}

/// Everything the event loop reacts to.
#[derive(Debug)]
pub enum Event {
    /// New connection on the control socket.
    ControlAccepted(UnixStream),
    ControlMessage {
        conn: ConnId,
        message: ControlMessage,
    },
    /// A frame on `conn` could not be parsed. The reader stops afterwards.
    ControlInvalid {
        conn: ConnId,
        error: String,
    },
    ControlClosed {
        conn: ConnId,
    },
    /// New client connection on the public listener.
    Inbound(TcpStream),
    /// A forwarded connection finished, successfully or not.
    ExchangeFinished {
        slot: Slot,
        record: RecordId,
        outcome: std::result::Result<(u64, u64), String>,
    },
    ProcessExited {
        slot: Slot,
        record: RecordId,
        reason: TerminationReason,
    },
    ReloadTimeout {
        generation: u64,
    },
    QueueExpired,
    RespawnDue {
        slot: Slot,
    },
    Signal(SignalAction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Has not said anything yet.
    Pending,
    /// A `status`, `stop` or `reload` client.
    Client,
    Worker(Slot),
}

#[derive(Debug)]
struct Connection {
    outbox: Outbox,
    reader: Option<JoinHandle<()>>,
    role: Role,
}

#[derive(Debug, Default)]
struct ReloadState {
    /// Slots still serving the exchange they had when the reload began.
    pending: BTreeSet<Slot>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// The orchestrator.
pub struct ProcessManager<L: Launcher> {
    config: PoolConfig,
    paths: SocketPaths,
    launcher: L,
    events: EventSender,
    registry: WorkerRegistry,
    connections: HashMap<ConnId, Connection>,
    next_conn: ConnId,
    next_record: RecordId,
    status: MasterStatus,
    handled_requests: u64,
    reload: ReloadState,
    overflow: OverflowPolicy,
    queue: PendingQueue<TcpStream>,
    writers: Vec<JoinHandle<()>>,
    reaping: Vec<JoinHandle<()>>,
    ready_announcements: u64,
}

impl<L: Launcher> ProcessManager<L> {
    pub fn new(config: PoolConfig, launcher: L, events: EventSender) -> Self {
        let overflow = config.overflow_policy();
        let capacity = match overflow {
            OverflowPolicy::Queue { capacity, .. } => capacity,
            OverflowPolicy::Reject => 0,
        };
        Self {
            paths: SocketPaths::new(&config.socket_path),
            config,
            launcher,
            events,
            registry: WorkerRegistry::new(),
            connections: HashMap::new(),
            next_conn: 1,
            next_record: 1,
            status: MasterStatus::Starting,
            handled_requests: 0,
            reload: ReloadState::default(),
            overflow,
            queue: PendingQueue::new(capacity),
            writers: Vec::new(),
            reaping: Vec::new(),
            ready_announcements: 0,
        }
    }

    pub fn status(&self) -> MasterStatus {
        self.status
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn handled_requests(&self) -> u64 {
        self.handled_requests
    }

    /// How many times the pool announced it was fully up.
    pub fn ready_announcements(&self) -> u64 {
        self.ready_announcements
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            status: self.status.health(),
            workers: usize::from(self.config.workers),
            handled_requests: self.handled_requests,
            handled_requests_per_worker: self
                .registry
                .iter()
                .map(|r| (r.slot(), r.handled_requests()))
                .collect(),
        }
    }

    /// Spawn a worker for every slot.
    pub fn populate(&mut self) {
        for slot in 1..=self.config.workers {
            self.spawn_worker(slot);
        }
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::ControlAccepted(stream) => self.accept_control(stream),
            Event::ControlMessage { conn, message } => self.handle_message(conn, message),
            Event::ControlInvalid { conn, error } => {
                tracing::warn!(conn, error = %error, "Protocol error on control connection");
                self.close_connection(conn);
            }
            Event::ControlClosed { conn } => self.connection_closed(conn),
            Event::Inbound(stream) => self.forward(stream),
            Event::ExchangeFinished {
                slot,
                record,
                outcome,
            } => self.exchange_finished(slot, record, outcome),
            Event::ProcessExited {
                slot,
                record,
                reason,
            } => self.process_exited(slot, record, reason),
            Event::ReloadTimeout { generation } => self.reload_timeout(generation),
            Event::QueueExpired => self.expire_queue(),
            Event::RespawnDue { slot } => self.spawn_worker(slot),
            Event::Signal(SignalAction::Shutdown) => self.shutdown(),
            Event::Signal(SignalAction::Reload) => self.reload(),
        }
    }

    // ---- control connections ----

    fn accept_control(&mut self, stream: UnixStream) {
        let conn = self.allocate_conn();
        let (read, write) = stream.into_split();
        let (outbox, rx) = mpsc::unbounded_channel();
        self.writers.retain(|w| !w.is_finished());
        self.writers.push(tokio::spawn(write_loop(write, rx)));
        let reader = tokio::spawn(read_loop(conn, read, self.events.clone()));
        self.insert_connection(conn, outbox, Some(reader));
    }

    /// Track a control connection whose messages arrive through some other
    /// means than [`Event::ControlAccepted`].
    pub fn attach_connection(&mut self, outbox: Outbox, reader: Option<JoinHandle<()>>) -> ConnId {
        let conn = self.allocate_conn();
        self.insert_connection(conn, outbox, reader);
        conn
    }

    fn allocate_conn(&mut self) -> ConnId {
        let conn = self.next_conn;
        self.next_conn += 1;
        conn
    }

    fn insert_connection(&mut self, conn: ConnId, outbox: Outbox, reader: Option<JoinHandle<()>>) {
        self.connections.insert(
            conn,
            Connection {
                outbox,
                reader,
                role: Role::Pending,
            },
        );
    }

    fn send(&self, conn: ConnId, item: Outgoing) {
        if let Some(connection) = self.connections.get(&conn) {
            let _ = connection.outbox.send(item);
        }
    }

    /// Close our side. The reader stays, so the peer's close still reaches
    /// the crash path.
    fn close_connection(&self, conn: ConnId) {
        self.send(conn, Outgoing::Close);
    }

    /// Forget a connection entirely; its close is no longer of interest.
    fn retire_connection(&mut self, conn: ConnId) {
        if let Some(connection) = self.connections.remove(&conn) {
            let _ = connection.outbox.send(Outgoing::Close);
            if let Some(reader) = connection.reader {
                reader.abort();
            }
        }
    }

    fn handle_message(&mut self, conn: ConnId, message: ControlMessage) {
        let Some(role) = self.connections.get(&conn).map(|c| c.role) else {
            tracing::debug!(conn, cmd = message.command(), "Message on retired connection");
            return;
        };
        tracing::trace!(conn, cmd = message.command(), "Control message");

        match message {
            ControlMessage::Register { pid, slot } => self.handle_register(conn, role, pid, slot),
            ControlMessage::Ready => self.handle_ready(conn),
            ControlMessage::Log {
                level,
                message,
                context,
            } => {
                let slot = match role {
                    Role::Worker(slot) => Some(slot),
                    _ => None,
                };
                relay_log(slot, level.unwrap_or(LogLevel::Info), &message, context.as_ref());
            }
            ControlMessage::Status => {
                self.mark_client(conn, role);
                match serde_json::to_value(self.status_report()) {
                    Ok(value) => self.send(conn, Outgoing::Reply(value)),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize status");
                        self.close_connection(conn);
                    }
                }
            }
            ControlMessage::Stop => {
                self.mark_client(conn, role);
                self.send(conn, Outgoing::Reply(serde_json::json!({})));
                self.shutdown();
            }
            ControlMessage::Reload => {
                self.mark_client(conn, role);
                self.send(conn, Outgoing::Reply(serde_json::json!({})));
                self.reload();
            }
            ControlMessage::Bootstrap => {
                tracing::warn!(conn, "Received bootstrap, which only workers accept");
                self.close_connection(conn);
            }
        }
    }

    fn mark_client(&mut self, conn: ConnId, role: Role) {
        if role == Role::Pending
            && let Some(connection) = self.connections.get_mut(&conn)
        {
            connection.role = Role::Client;
        }
    }

    fn handle_register(&mut self, conn: ConnId, role: Role, pid: u32, slot: Slot) {
        let result = if role == Role::Pending {
            self.registry
                .by_slot_mut(slot)
                .and_then(|record| record.register(pid, conn))
        } else {
            Err(PoolError::Protocol(format!(
                "connection {} is already in use",
                conn
            )))
        };

        match result {
            Ok(()) => {
                if let Some(connection) = self.connections.get_mut(&conn) {
                    connection.role = Role::Worker(slot);
                }
                tracing::debug!(slot, pid, "Worker registered");
                self.send(conn, Outgoing::Message(ControlMessage::Bootstrap));
            }
            Err(e) => {
                tracing::error!(
                    slot,
                    pid,
                    error = %e,
                    "Worker wanted to register but was not expected; closing connection"
                );
                self.close_connection(conn);
            }
        }
    }

    fn handle_ready(&mut self, conn: ConnId) {
        let result = self
            .registry
            .by_connection(conn)
            .map(WorkerRecord::slot)
            .and_then(|slot| {
                self.registry.by_slot_mut(slot)?.ready()?;
                Ok(slot)
            });

        match result {
            Ok(slot) => {
                tracing::debug!(slot, "Worker ready");
                self.check_quorum();
                self.dispatch_queued();
            }
            Err(e) => {
                tracing::error!(conn, error = %e, "Rejected ready; closing connection");
                self.close_connection(conn);
            }
        }
    }

    /// Announce the pool once every slot is Ready or Busy.
    fn check_quorum(&mut self) {
        if !matches!(self.status, MasterStatus::Starting | MasterStatus::Emergency) {
            return;
        }
        if self.registry.count_available() != usize::from(self.config.workers) {
            return;
        }

        if self.status == MasterStatus::Emergency {
            tracing::info!("Emergency survived. Workers up and running again");
        } else {
            tracing::info!(
                workers = self.config.workers,
                "{} workers up and ready to serve at {}",
                self.config.workers,
                self.config.listen_addr()
            );
        }
        self.status = MasterStatus::Running;
        self.ready_announcements += 1;
    }

    fn connection_closed(&mut self, conn: ConnId) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        if self.status == MasterStatus::Shutdown || connection.role == Role::Client {
            return;
        }

        match self.registry.by_connection(conn) {
            Ok(record) => {
                let (slot, id) = (record.slot(), record.id());
                self.worker_lost(slot, id, "control connection closed");
            }
            Err(_) => {
                // No slot is known, so there is nothing safe to respawn.
                tracing::info!(conn, "Unregistered control connection closed");
            }
        }
    }

    // ---- worker lifecycle ----

    fn launch_spec(&self, slot: Slot, record: RecordId) -> LaunchSpec {
        LaunchSpec {
            slot,
            record,
            host: self.config.host.clone(),
            socket_dir: self.paths.dir().to_path_buf(),
            bridge: self.config.bridge.clone(),
            static_directory: self.config.static_directory.clone(),
            debug: self.config.debug,
            logging: self.config.logging,
            log_transport: self.config.log_transport,
        }
    }

    fn spawn_worker(&mut self, slot: Slot) {
        if self.status == MasterStatus::Shutdown {
            tracing::debug!(slot, "Not spawning during shutdown");
            return;
        }
        if self.registry.contains(slot) {
            tracing::debug!(slot, "Slot already has a worker");
            return;
        }

        let id = self.next_record;
        self.next_record += 1;
        let spec = self.launch_spec(slot, id);

        match self.launcher.launch(&spec, &self.events) {
            Ok(process) => {
                let pid = process.pid();
                let max_requests = Some(self.config.max_requests);
                let mut record = WorkerRecord::new(id, slot, max_requests);
                record.attach(process);
                if let Err(e) = self.registry.add(record) {
                    tracing::error!(slot, error = %e, "Failed to track spawned worker");
                    return;
                }
                tracing::debug!(slot, pid, "Spawned worker");
            }
            Err(e) => {
                tracing::error!(
                    slot,
                    error = %e,
                    "Failed to start worker; retrying in {:?}",
                    RESPAWN_BACKOFF
                );
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(RESPAWN_BACKOFF).await;
                    let _ = events.send(Event::RespawnDue { slot });
                });
            }
        }
    }

    /// Close record `id` in `slot`, drop its connection and stop its process.
    fn terminate_worker(&mut self, slot: Slot, id: RecordId) {
        let Some(mut record) = self.registry.remove(slot, id) else {
            return;
        };
        record.close();
        self.reload.pending.remove(&slot);

        if let Some(conn) = record.connection() {
            self.retire_connection(conn);
        }
        if let Some(mut process) = record.take_process() {
            process.terminate();
            self.reaping.retain(|h| !h.is_finished());
            if let Some(supervisor) = process.take_supervisor() {
                self.reaping.push(supervisor);
            }
        }
        tracing::debug!(slot, pid = record.pid(), "Worker closed");
    }

    fn worker_lost(&mut self, slot: Slot, id: RecordId, cause: &str) {
        let status = match self.registry.by_slot(slot) {
            Ok(record) if record.id() == id => record.status(),
            _ => return,
        };
        self.terminate_worker(slot, id);

        match status {
            WorkerStatus::Created | WorkerStatus::Registered => self.bootstrap_failed(slot, cause),
            WorkerStatus::Ready | WorkerStatus::Busy | WorkerStatus::Locked | WorkerStatus::Closed => {
                tracing::warn!(slot, cause, was = %status, "Worker died; respawning");
                self.spawn_worker(slot);
                self.finish_reload_if_done();
            }
        }
    }

    fn bootstrap_failed(&mut self, slot: Slot, cause: &str) {
        if self.config.debug {
            tracing::error!(
                slot,
                cause,
                "Worker failed to bootstrap. Pool is frozen in emergency mode until reload"
            );
            self.status = MasterStatus::Emergency;
            for (other, id) in self.live_records() {
                self.terminate_worker(other, id);
            }
        } else {
            tracing::warn!(slot, cause, "Worker died during bootstrap; respawning");
            self.spawn_worker(slot);
        }
    }

    fn process_exited(&mut self, slot: Slot, record: RecordId, reason: TerminationReason) {
        if self.status == MasterStatus::Shutdown {
            return;
        }
        match self.registry.by_slot(slot) {
            Ok(current) if current.id() == record => {}
            _ => {
                tracing::debug!(slot, reason = %reason, "Reaped closed worker");
                return;
            }
        }
        let cause = format!("process {}", reason);
        self.worker_lost(slot, record, &cause);
    }

    fn live_records(&self) -> Vec<(Slot, RecordId)> {
        self.registry.iter().map(|r| (r.slot(), r.id())).collect()
    }

    // ---- forwarding ----

    /// Occupy the lowest Ready slot.
    pub fn claim_worker(&mut self) -> Option<(Slot, RecordId)> {
        let slot = self.registry.first_ready()?;
        let record = self.registry.by_slot_mut(slot).ok()?;
        match record.occupy() {
            Ok(()) => Some((slot, record.id())),
            Err(e) => {
                tracing::error!(slot, error = %e, "Failed to occupy worker");
                None
            }
        }
    }

    fn forward(&mut self, stream: TcpStream) {
        if self.status == MasterStatus::Shutdown {
            tokio::spawn(forwarder::reject(stream));
            return;
        }
        match self.claim_worker() {
            Some(claim) => self.start_exchange(claim, stream),
            None => self.overflow(stream),
        }
    }

    fn start_exchange(&self, (slot, record): (Slot, RecordId), stream: TcpStream) {
        let socket = self.paths.worker(slot);
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = forwarder::proxy(stream, &socket)
                .await
                .map_err(|e| e.to_string());
            let _ = events.send(Event::ExchangeFinished {
                slot,
                record,
                outcome,
            });
        });
    }

    fn overflow(&mut self, stream: TcpStream) {
        match self.overflow {
            OverflowPolicy::Reject => {
                tracing::warn!("No worker available; rejecting connection");
                tokio::spawn(forwarder::reject(stream));
            }
            OverflowPolicy::Queue { timeout, .. } => {
                match self.queue.push(stream, Instant::now() + timeout) {
                    Ok(()) => {
                        tracing::debug!(queued = self.queue.len(), "No worker available; queued connection");
                        let events = self.events.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(timeout).await;
                            let _ = events.send(Event::QueueExpired);
                        });
                    }
                    Err(stream) => {
                        tracing::warn!("Connection queue is full; rejecting connection");
                        tokio::spawn(forwarder::reject(stream));
                    }
                }
            }
        }
    }

    fn dispatch_queued(&mut self) {
        while !self.queue.is_empty() && self.registry.first_ready().is_some() {
            let (live, expired) = self.queue.pop_live(Instant::now());
            for stream in expired {
                tokio::spawn(forwarder::reject(stream));
            }
            let Some(stream) = live else {
                break;
            };
            match self.claim_worker() {
                Some(claim) => self.start_exchange(claim, stream),
                None => {
                    tokio::spawn(forwarder::reject(stream));
                    break;
                }
            }
        }
    }

    fn expire_queue(&mut self) {
        let expired = self.queue.expire(Instant::now());
        if !expired.is_empty() {
            tracing::warn!(count = expired.len(), "Queued connections timed out");
        }
        for stream in expired {
            tokio::spawn(forwarder::reject(stream));
        }
    }

    fn exchange_finished(
        &mut self,
        slot: Slot,
        id: RecordId,
        outcome: std::result::Result<(u64, u64), String>,
    ) {
        if let Err(e) = &outcome {
            tracing::debug!(slot, error = %e, "Forwarded connection ended with an error");
        }
        let Ok(record) = self.registry.by_slot_mut(slot) else {
            return;
        };
        if record.id() != id {
            tracing::debug!(slot, "Exchange finished on a replaced worker");
            return;
        }

        match record.status() {
            WorkerStatus::Busy => {
                if let Err(e) = record.release() {
                    tracing::error!(slot, error = %e, "Failed to release worker");
                    return;
                }
                self.handled_requests += 1;
                if record.should_recycle() {
                    tracing::info!(
                        slot,
                        handled = record.handled_requests(),
                        "Worker reached its request limit; restarting"
                    );
                    self.terminate_worker(slot, id);
                    self.spawn_worker(slot);
                }
                self.dispatch_queued();
            }
            WorkerStatus::Locked => {
                self.handled_requests += 1;
                tracing::debug!(slot, "Locked worker finished its exchange; replacing");
                self.terminate_worker(slot, id);
                self.spawn_worker(slot);
                self.finish_reload_if_done();
            }
            other => {
                tracing::debug!(slot, status = %other, "Exchange finished on a worker that is not serving");
            }
        }
    }

    // ---- reload & shutdown ----

    /// Replace every worker without dropping in-flight exchanges.
    pub fn reload(&mut self) {
        if self.status == MasterStatus::Shutdown {
            return;
        }
        tracing::info!("Reloading all workers");

        for (slot, id) in self.live_records() {
            let Ok(record) = self.registry.by_slot_mut(slot) else {
                continue;
            };
            match record.status() {
                WorkerStatus::Busy => {
                    if record.lock().is_ok() {
                        self.reload.pending.insert(slot);
                    }
                }
                WorkerStatus::Locked => {
                    self.reload.pending.insert(slot);
                }
                WorkerStatus::Created
                | WorkerStatus::Registered
                | WorkerStatus::Ready
                | WorkerStatus::Closed => {
                    self.terminate_worker(slot, id);
                    self.spawn_worker(slot);
                }
            }
        }

        // Refill slots emptied by an emergency or a failed spawn.
        for slot in 1..=self.config.workers {
            self.spawn_worker(slot);
        }

        if !self.reload.pending.is_empty()
            && let Some(timeout) = self.config.reload_timeout
        {
            self.arm_reload_timer(timeout);
        }
    }

    /// Start the shared grace timer, replacing any earlier one.
    fn arm_reload_timer(&mut self, timeout: Duration) {
        if let Some(previous) = self.reload.timer.take() {
            previous.abort();
        }
        self.reload.generation += 1;
        let generation = self.reload.generation;
        let events = self.events.clone();
        self.reload.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(Event::ReloadTimeout { generation });
        }));
    }

    fn finish_reload_if_done(&mut self) {
        if self.reload.pending.is_empty()
            && let Some(timer) = self.reload.timer.take()
        {
            timer.abort();
            tracing::info!("Reload complete");
        }
    }

    fn reload_timeout(&mut self, generation: u64) {
        if generation != self.reload.generation || self.status == MasterStatus::Shutdown {
            return;
        }
        self.reload.timer = None;
        let pending = std::mem::take(&mut self.reload.pending);
        if pending.is_empty() {
            return;
        }

        tracing::warn!(
            workers = pending.len(),
            "Reload timeout reached; force-closing workers still serving"
        );
        for slot in pending {
            let id = match self.registry.by_slot(slot) {
                Ok(record) => record.id(),
                Err(_) => continue,
            };
            self.terminate_worker(slot, id);
            self.spawn_worker(slot);
        }
    }

    /// Terminate every worker and stop accepting work. Idempotent.
    pub fn shutdown(&mut self) {
        if self.status == MasterStatus::Shutdown {
            return;
        }
        tracing::info!("Shutting down");
        self.status = MasterStatus::Shutdown;

        if let Some(timer) = self.reload.timer.take() {
            timer.abort();
        }
        self.reload.pending.clear();
        for stream in self.queue.drain() {
            tokio::spawn(forwarder::reject(stream));
        }
        for (slot, id) in self.live_records() {
            self.terminate_worker(slot, id);
        }
    }

    /// Drop every connection, then wait for pending writes and worker reaps.
    pub async fn finish(mut self) {
        for (_, connection) in self.connections.drain() {
            if let Some(reader) = connection.reader {
                reader.abort();
            }
        }
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
        for handle in self.writers.drain(..).chain(self.reaping.drain(..)) {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                tracing::warn!("Timed out waiting for workers to exit");
                break;
            }
        }
    }
}

pub(super) fn relay_log(slot: Option<Slot>, level: LogLevel, message: &str, context: Option<&serde_json::Value>) {
    let context = context.map(|c| c.to_string());
    match level.as_tracing() {
        tracing::Level::ERROR => tracing::error!(slot, context, "{}", message),
        tracing::Level::WARN => tracing::warn!(slot, context, "{}", message),
        tracing::Level::INFO => tracing::info!(slot, context, "{}", message),
        tracing::Level::DEBUG => tracing::debug!(slot, context, "{}", message),
        _ => tracing::trace!(slot, context, "{}", message),
    }
}

async fn read_loop(conn: ConnId, read: OwnedReadHalf, events: EventSender) {
    let mut reader = FrameReader::new(read);
    loop {
        match reader.next_message().await {
            Ok(Some(message)) => {
                if events.send(Event::ControlMessage { conn, message }).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = events.send(Event::ControlInvalid {
                    conn,
                    error: e.to_string(),
                });
                break;
            }
        }
    }
    let _ = events.send(Event::ControlClosed { conn });
}

async fn accept_control(listener: UnixListener, events: EventSender) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                if events.send(Event::ControlAccepted(stream)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Control accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept_public(listener: TcpListener, events: EventSender) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::trace!(%peer, "Inbound connection");
                if events.send(Event::Inbound(stream)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Public accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Deliver SIGTERM/SIGINT as shutdown and SIGUSR1/SIGHUP as reload.
async fn forward_signals(events: EventSender) {
    use tokio::signal::unix::{SignalKind, signal};

    let streams = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::user_defined1()),
        signal(SignalKind::hangup()),
    );
    let (Ok(mut term), Ok(mut int), Ok(mut usr1), Ok(mut hup)) = streams else {
        tracing::warn!("Could not install signal handlers");
        return;
    };

    loop {
        let action = tokio::select! {
            _ = term.recv() => SignalAction::Shutdown,
            _ = int.recv() => SignalAction::Shutdown,
            _ = usr1.recv() => SignalAction::Reload,
            _ = hup.recv() => SignalAction::Reload,
        };
        tracing::debug!(?action, "Received signal");
        if events.send(Event::Signal(action)).is_err() {
            break;
        }
    }
}

/// Run the master until shutdown.
pub async fn run(config: PoolConfig) -> Result<()> {
    let mut launcher = CommandLauncher::current_exe(&config.working_dir)?;
    if let Some(template) = &config.launch_command {
        launcher = launcher.with_template(template)?;
    }

    let paths = SocketPaths::new(&config.socket_path);
    paths.ensure_dir()?;
    let controller = paths.controller();
    paths.remove_stale(&controller)?;
    let control = UnixListener::bind(&controller).map_err(|source| PoolError::Bind {
        what: "control socket",
        addr: controller.display().to_string(),
        source,
    })?;

    let addr = config.listen_addr();
    let public = TcpListener::bind(&addr)
        .await
        .map_err(|source| PoolError::Bind {
            what: "public listener",
            addr: addr.clone(),
            source,
        })?;
    let mut pidfile = PidFile::create(&config.pidfile)?;

    tracing::info!(
        addr = %addr,
        workers = config.workers,
        debug = config.debug,
        bridge = %config.bridge,
        "Starting process manager"
    );

    let (events, mut rx) = mpsc::unbounded_channel();
    let tasks = [
        tokio::spawn(accept_control(control, events.clone())),
        tokio::spawn(accept_public(public, events.clone())),
        tokio::spawn(forward_signals(events.clone())),
    ];

    let mut manager = ProcessManager::new(config, launcher, events);
    manager.populate();
    while let Some(event) = rx.recv().await {
        manager.handle_event(event);
        if manager.status() == MasterStatus::Shutdown {
            break;
        }
    }

    for task in tasks {
        task.abort();
    }
    if let Err(e) = std::fs::remove_file(&controller) {
        tracing::debug!(error = %e, "Control socket already gone");
    }
    manager.finish().await;
    pidfile.remove()?;
    tracing::info!("Process manager stopped");
    Ok(())
}
