//! IPC protocol between the pool and a worker process.
//!
//! Messages are JSON, one per line. The worker announces `ready` once after
//! startup; afterwards each `job` gets exactly one `reply` with the same id.
//! Payloads are codec wire values (see [`crate::codec`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request from pool to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkRequest {
    /// Run the entry point once on the encoded input.
    Job { id: u64, payload: Value },

    /// Graceful shutdown request.
    Exit,
}

/// Response from worker to pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkResponse {
    /// Worker finished startup and can take a job.
    Ready,

    /// Outcome of job `id`, an encoded [`crate::codec::Envelope`].
    Reply { id: u64, envelope: Value },

    /// The worker could not parse the last request line.
    Invalid { message: String },
}

impl WorkRequest {
    pub fn job(id: u64, payload: Value) -> Self {
        Self::Job { id, payload }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        to_line(self)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl WorkResponse {
    pub fn reply(id: u64, envelope: Value) -> Self {
        Self::Reply { id, envelope }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        to_line(self)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

fn to_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut json = serde_json::to_string(message)?;
    json.push('\n');
    Ok(json)
}
