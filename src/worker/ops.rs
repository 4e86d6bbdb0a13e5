//! How a pool slot executes a job.
//!
//! [`WorkerOps`] is the capability the pool is generic over. The pool never
//! knows whether a job runs in a child process ([`ProcessWorkerOps`]) or on
//! the slot's own thread ([`InlineWorkerOps`]).

use super::proc::Proc;
use super::protocol::{WorkRequest, WorkResponse};
use super::signals::TerminationReason;
use super::spawn::{WorkerCommand, spawn_worker};
use crate::codec::{self, Envelope, SerializedError};
use crate::error::{InterpError, JobError, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Time a worker gets to finish exiting after its stdout closes.
const EXIT_DIAGNOSIS_GRACE: Duration = Duration::from_secs(1);

/// Factory for the workers behind each pool slot.
pub trait WorkerOps<I, O>: Send + Sync + 'static {
    /// Upper bound this implementation places on pool size.
    fn max_workers(&self) -> Option<usize> {
        None
    }

    /// Start the worker for `worker_id`; returns once it can accept a job.
    fn start(&self, worker_id: usize) -> Result<Box<dyn WorkerHandle<I, O>>>;

    /// Kill every live worker immediately. Jobs in flight fail with a worker error.
    fn terminate_all(&self) {}

    fn describe(&self) -> String;
}

/// One started worker, driven by its slot thread one job at a time.
pub trait WorkerHandle<I, O>: Send {
    fn execute(&mut self, job_id: u64, input: I) -> std::result::Result<O, JobError>;

    /// Replace the worker after it failed.
    fn restart(&mut self) -> Result<()>;

    fn stop(&mut self, grace: Duration);
}

type InlineFn<I, O> = dyn Fn(I) -> anyhow::Result<O> + Send + Sync;

/// Runs the entry point in the calling process. Pool size is always 1.
pub struct InlineWorkerOps<I, O> {
    call: Arc<InlineFn<I, O>>,
}

impl<I, O> InlineWorkerOps<I, O> {
    pub fn new<F>(call: F) -> Self
    where
        F: Fn(I) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        Self {
            call: Arc::new(call),
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> WorkerOps<I, O> for InlineWorkerOps<I, O> {
    fn max_workers(&self) -> Option<usize> {
        Some(1)
    }

    fn start(&self, _worker_id: usize) -> Result<Box<dyn WorkerHandle<I, O>>> {
        Ok(Box::new(InlineWorker {
            call: Arc::clone(&self.call),
        }))
    }

    fn describe(&self) -> String {
        "inline".to_string()
    }
}

struct InlineWorker<I, O> {
    call: Arc<InlineFn<I, O>>,
}

impl<I: Send, O: Send> WorkerHandle<I, O> for InlineWorker<I, O> {
    fn execute(&mut self, _job_id: u64, input: I) -> std::result::Result<O, JobError> {
        let call = &self.call;
        match catch_unwind(AssertUnwindSafe(|| call(input))) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(JobError::Application(SerializedError::from_anyhow(&err))),
            Err(panic) => Err(JobError::Application(SerializedError::from_panic(
                panic.as_ref(),
            ))),
        }
    }

    fn restart(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self, _grace: Duration) {}
}

/// PIDs of live workers, shared so shutdown can kill busy ones.
type LiveWorkers = Arc<Mutex<HashMap<usize, Pid>>>;

/// Runs each slot's jobs in its own child process.
pub struct ProcessWorkerOps<I, O> {
    command: WorkerCommand,
    stop_grace: Duration,
    live: LiveWorkers,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> ProcessWorkerOps<I, O> {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            stop_grace: Duration::from_secs(5),
            live: Arc::new(Mutex::new(HashMap::new())),
            _types: PhantomData,
        }
    }

    /// How long a worker gets to honour `exit` before it is signalled.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }
}

impl<I, O> WorkerOps<I, O> for ProcessWorkerOps<I, O>
where
    I: Serialize + Send + 'static,
    O: DeserializeOwned + Send + 'static,
{
    fn start(&self, worker_id: usize) -> Result<Box<dyn WorkerHandle<I, O>>> {
        let mut worker = ProcessWorker {
            id: worker_id,
            command: self.command.clone(),
            stop_grace: self.stop_grace,
            live: Arc::clone(&self.live),
            proc: None,
            jobs_completed: 0,
            restarts: 0,
            _types: PhantomData,
        };
        worker.spawn()?;
        Ok(Box::new(worker))
    }

    fn terminate_all(&self) {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        for (worker_id, pid) in live.iter() {
            warn!(worker_id, pid = pid.as_raw(), "Force-terminating worker");
            let _ = signal::kill(*pid, Signal::SIGKILL);
        }
    }

    fn describe(&self) -> String {
        self.command.describe()
    }
}

struct ProcessWorker<I, O> {
    id: usize,
    command: WorkerCommand,
    stop_grace: Duration,
    live: LiveWorkers,
    /// None when the worker needs a respawn.
    proc: Option<Proc>,
    jobs_completed: usize,
    restarts: usize,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> ProcessWorker<I, O>
where
    I: Serialize,
    O: DeserializeOwned,
{
    /// Spawn the subprocess and consume its `ready` announcement.
    fn spawn(&mut self) -> Result<()> {
        let mut proc = spawn_worker(&self.command, self.id)?;
        match proc.recv()? {
            Some(WorkResponse::Ready) => {}
            Some(other) => {
                return Err(InterpError::Worker(format!(
                    "Worker {} sent unexpected response instead of Ready: {:?}",
                    self.id, other
                )));
            }
            None => {
                let reason = proc.diagnose_exit(EXIT_DIAGNOSIS_GRACE);
                return Err(InterpError::Worker(format!(
                    "Worker {} {} before Ready",
                    self.id, reason
                )));
            }
        }
        self.live_workers().insert(self.id, proc.pid());
        debug!(worker_id = self.id, pid = proc.pid().as_raw(), "Worker ready");
        self.proc = Some(proc);
        Ok(())
    }

    fn live_workers(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Pid>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn discard_proc(&mut self) -> Option<Proc> {
        self.live_workers().remove(&self.id);
        self.proc.take()
    }

    /// The worker died mid-job. Reap it and describe why.
    fn handle_death(&mut self, job_id: u64) -> JobError {
        let reason = match self.discard_proc() {
            Some(mut proc) => proc.diagnose_exit(EXIT_DIAGNOSIS_GRACE),
            None => TerminationReason::Unknown,
        };
        warn!(
            worker_id = self.id,
            job_id,
            reason = %reason,
            jobs_completed = self.jobs_completed,
            "Worker died unexpectedly"
        );
        JobError::Worker {
            worker_id: self.id,
            job_id,
            reason,
        }
    }

    fn protocol_violation(&mut self, message: String) -> JobError {
        warn!(worker_id = self.id, %message, "Worker protocol violation");
        if let Some(mut proc) = self.discard_proc() {
            let _ = proc.kill();
        }
        JobError::Protocol {
            worker_id: self.id,
            message,
        }
    }
}

impl<I, O> WorkerHandle<I, O> for ProcessWorker<I, O>
where
    I: Serialize + Send,
    O: DeserializeOwned + Send,
{
    fn execute(&mut self, job_id: u64, input: I) -> std::result::Result<O, JobError> {
        let request_start = Instant::now();

        // Encoding failures are the job's problem, not the worker's.
        let payload = codec::encode(&input)?;

        if self.proc.is_none() {
            self.spawn().map_err(|e| JobError::Worker {
                worker_id: self.id,
                job_id,
                reason: TerminationReason::Unavailable(e.to_string()),
            })?;
        }
        let Some(proc) = self.proc.as_mut() else {
            return Err(self.handle_death(job_id));
        };

        if proc.send(&WorkRequest::job(job_id, payload)).is_err() {
            return Err(self.handle_death(job_id));
        }

        let response = match proc.recv() {
            Ok(response) => response,
            Err(e) => return Err(self.protocol_violation(e.to_string())),
        };

        trace!(
            worker_id = self.id,
            job_id,
            round_trip_ms = request_start.elapsed().as_millis(),
            "Worker IPC request/response"
        );

        match response {
            Some(WorkResponse::Reply { id, envelope }) if id == job_id => {
                self.jobs_completed += 1;
                let envelope: Envelope<O> = codec::decode(envelope)?;
                envelope.into_result().map_err(JobError::Application)
            }
            Some(WorkResponse::Reply { id, .. }) => Err(self.protocol_violation(format!(
                "reply for job {} while job {} was in flight",
                id, job_id
            ))),
            Some(WorkResponse::Invalid { message }) => Err(self.protocol_violation(format!(
                "worker rejected request: {}",
                message
            ))),
            Some(WorkResponse::Ready) => {
                Err(self.protocol_violation("unexpected ready while a job was in flight".into()))
            }
            None => Err(self.handle_death(job_id)),
        }
    }

    fn restart(&mut self) -> Result<()> {
        if let Some(mut proc) = self.discard_proc() {
            let _ = proc.stop(self.stop_grace);
        }
        self.restarts += 1;
        info!(
            worker_id = self.id,
            restart_count = self.restarts,
            "Respawning worker"
        );
        self.spawn()
    }

    fn stop(&mut self, grace: Duration) {
        if let Some(mut proc) = self.discard_proc() {
            if let Err(e) = proc.stop(grace) {
                warn!(worker_id = self.id, error = %e, "Worker did not stop cleanly");
            }
        }
    }
}
