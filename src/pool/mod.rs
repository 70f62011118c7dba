//! Process pool: the master orchestrator and the worker runtime.
//!
//! The master accepts public TCP connections and hands each one to an idle
//! worker process over that worker's private Unix socket. Workers report their
//! lifecycle over a shared control socket.
//!
//! # Architecture
//!
//! ```text
//!           clients (TCP)              prefork status/stop/reload
//!                │                               │
//!         ┌──────▼───────────────────────────────▼──────┐
//!         │                  Master                     │
//!         │  ProcessManager (registry, queue, reload)   │
//!         └──────┬──────────────┬──────────────┬────────┘
//!      <slot>.sock│   controller.sock (register/ready/log)
//!         ┌──────▼────┐  ┌──────▼────┐  ┌──────▼────┐
//!         │ Worker 1  │  │ Worker 2  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         │  Bridge   │  │  Bridge   │  │  Bridge   │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Features
//!
//! - **Process isolation**: each worker runs its application in its own address space
//! - **Request recycling**: workers are replaced after `max-requests` exchanges
//! - **Crash recovery**: dead workers are respawned in their slot
//! - **Graceful reload**: busy workers finish their exchange before restarting

pub mod bridge;
pub mod forwarder;
pub mod ipc;
pub mod master;
pub mod proc;
pub mod protocol;
pub mod record;
pub mod registry;
pub mod runtime;
pub mod signals;
pub mod spawn;

pub use master::{ProcessManager, run};
pub use runtime::WorkerOptions;
