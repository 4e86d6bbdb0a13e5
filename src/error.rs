//! Error types for ballot-interp.

use crate::codec::SerializedError;
use crate::worker::TerminationReason;
use thiserror::Error;

/// Main error type for pool setup and I/O plumbing.
#[derive(Error, Debug)]
pub enum InterpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Worker error: {0}")]
    Worker(String),
}

/// Result type alias for ballot-interp operations.
pub type Result<T> = std::result::Result<T, InterpError>;

/// A value could not be carried across the worker boundary.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to encode {type_name}: {source}")]
    Encode {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {type_name}: {source}")]
    Decode {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Why a submitted job did not produce an output.
///
/// Every variant is terminal for the job. The pool never retries on the
/// caller's behalf.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    /// The entry point returned an error or panicked while handling the job.
    #[error("{0}")]
    Application(SerializedError),

    /// The worker process died before replying.
    #[error("worker {worker_id} {reason} while running job {job_id}")]
    Worker {
        worker_id: usize,
        job_id: u64,
        reason: TerminationReason,
    },

    /// The job's input or output could not cross the process boundary.
    #[error("codec failure: {0}")]
    Codec(String),

    /// The worker answered with something other than a reply to this job.
    #[error("protocol violation from worker {worker_id}: {message}")]
    Protocol { worker_id: usize, message: String },

    /// The pool was shut down before the job could run.
    #[error("worker pool is shut down")]
    PoolClosed,
}

impl JobError {
    /// True when the failure came from the worker process rather than the job itself.
    pub fn is_worker_failure(&self) -> bool {
        matches!(self, Self::Worker { .. } | Self::Protocol { .. })
    }
}

impl From<CodecError> for JobError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err.to_string())
    }
}
