//! Worker pool for parallel page interpretation.
//!
//! Page interpretation is CPU-bound and may crash on malformed scans, so the
//! pool runs it in child processes, each hosting one entry point. A crashed
//! worker fails only the job it was running and is replaced. When process
//! workers are unwanted (debugging, single-page runs) the same pool runs the
//! entry point inline on one thread.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!          submit ───►│   Dispatcher    │  pending FIFO + idle set
//!                     └────────┬────────┘
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │  Slot 0   │  │  Slot 1   │  │  Slot N   │  one thread each
//!         └─────┬─────┘  └─────┬─────┘  └─────┬─────┘
//!               │ JSON lines   │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 0  │  │ Worker 1  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Features
//!
//! - **Bounded parallelism**: at most one job per worker at any time
//! - **Crash recovery**: failed workers are respawned, the job fails
//! - **Graceful shutdown**: drains within a grace period, then kills

mod ipc;
mod ops;
mod pool;
mod proc;
mod protocol;
mod signals;
mod spawn;
pub mod worker_main;

pub use ops::{InlineWorkerOps, ProcessWorkerOps, WorkerHandle, WorkerOps};
pub use pool::{
    JobHandle, ShutdownHandle, WorkerPool, WorkerPoolConfig, WorkerPoolStats, host_parallelism,
};
pub(crate) use pool::wait_blocking;
pub use protocol::{WorkRequest, WorkResponse};
pub use signals::TerminationReason;
pub use spawn::{WORKER_ID_ENV, WorkerCommand};
pub use worker_main::{EntryPoint, run_worker_main};
