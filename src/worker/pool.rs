//! Worker pool for parallel page interpretation.
//!
//! One dispatcher thread owns the pending queue and the idle-worker set and is
//! the only code that touches them. It reacts to three events: a submission,
//! a worker becoming idle, and a shutdown request. Each pool slot has its own
//! thread that drives one worker through one job at a time, resolves the
//! job's future, and reports back as idle.
//!
//! Jobs are assigned in submission order; completion order is unspecified.

use super::ops::{InlineWorkerOps, ProcessWorkerOps, WorkerHandle, WorkerOps};
use super::spawn::WorkerCommand;
use crate::error::{InterpError, JobError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;
use futures::task::{ArcWake, waker};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Number of CPUs available to this process, at least 1.
pub fn host_parallelism() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

struct ThreadWaker(Thread);

impl ArcWake for ThreadWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.unpark();
    }
}

/// Poll `future` on the current thread, parking between wakeups.
///
/// Unlike `futures::executor::block_on` this may be called from inside
/// another executor, including from `Drop` of a value owned by a task.
pub(crate) fn wait_blocking<F: Future>(future: F) -> F::Output {
    let mut future = std::pin::pin!(future);
    let waker = waker(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(output) => return output,
            Poll::Pending => thread::park(),
        }
    }
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of workers. `None` means one per available CPU.
    pub pool_size: Option<usize>,
    /// CPU count used when `pool_size` is `None`.
    pub host_parallelism: usize,
    /// How long `shutdown` waits for queued and in-flight jobs before
    /// killing workers.
    pub shutdown_grace: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: None,
            host_parallelism: host_parallelism(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Effective pool size under an implementation's cap.
    pub fn resolve_size(&self, cap: Option<usize>) -> usize {
        let wanted = self.pool_size.unwrap_or(self.host_parallelism).max(1);
        match cap {
            Some(cap) => wanted.min(cap.max(1)),
            None => wanted,
        }
    }
}

/// Statistics about the worker pool.
///
/// Every call to [`WorkerPool::submit`] counts as submitted, and every
/// submitted job is counted exactly once as succeeded or failed when it
/// resolves. Jobs rejected with [`JobError::PoolClosed`] count as failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerPoolStats {
    pub worker_count: usize,
    pub jobs_submitted: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub worker_restarts: u64,
    /// Dispatched to a worker and not yet resolved.
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub queued: usize,
}

#[derive(Default)]
struct PoolCounters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    restarts: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    queued: AtomicUsize,
}

struct Job<I, O> {
    id: u64,
    input: I,
    reply: oneshot::Sender<std::result::Result<O, JobError>>,
}

impl<I, O> Job<I, O> {
    fn reject(self, err: JobError) {
        let _ = self.reply.send(Err(err));
    }
}

enum PoolEvent<I, O> {
    Submit(Job<I, O>),
    Idle { worker_id: usize },
    Shutdown,
}

/// Future for one job's outcome. Can also be waited on synchronously.
#[must_use = "dropping a JobHandle discards the job's outcome, not the job"]
pub struct JobHandle<O> {
    id: u64,
    rx: oneshot::Receiver<std::result::Result<O, JobError>>,
}

impl<O> JobHandle<O> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block the current thread until the job resolves.
    pub fn wait(self) -> std::result::Result<O, JobError> {
        wait_blocking(self)
    }
}

impl<O> Future for JobHandle<O> {
    type Output = std::result::Result<O, JobError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.poll_unpin(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Sender dropped without an answer: the pool went away.
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(JobError::PoolClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future that resolves once the pool has stopped every worker.
pub struct ShutdownHandle {
    done: Shared<oneshot::Receiver<()>>,
}

impl ShutdownHandle {
    pub fn wait(self) {
        wait_blocking(self)
    }
}

impl Future for ShutdownHandle {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.done.poll_unpin(cx).map(|_| ())
    }
}

/// A fixed-size pool of workers executing jobs of type `I` into `O`.
pub struct WorkerPool<I, O> {
    events: Sender<PoolEvent<I, O>>,
    accepting: Arc<AtomicBool>,
    size: usize,
    next_job_id: AtomicU64,
    counters: Arc<PoolCounters>,
    done: Shared<oneshot::Receiver<()>>,
}

impl<I, O> WorkerPool<I, O>
where
    I: Serialize + Send + 'static,
    O: DeserializeOwned + Send + 'static,
{
    /// Pool of child processes started from `command`.
    pub fn spawn(command: WorkerCommand, config: WorkerPoolConfig) -> Result<Self> {
        Self::with_ops(ProcessWorkerOps::new(command), config)
    }
}

impl<I, O> WorkerPool<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Single-slot pool that runs `call` in this process.
    pub fn inline<F>(call: F, config: WorkerPoolConfig) -> Result<Self>
    where
        F: Fn(I) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        Self::with_ops(InlineWorkerOps::new(call), config)
    }

    /// Start every worker, then the dispatcher.
    ///
    /// Fails if any worker cannot start; workers already started are stopped.
    pub fn with_ops<W>(ops: W, config: WorkerPoolConfig) -> Result<Self>
    where
        W: WorkerOps<I, O>,
    {
        let size = config.resolve_size(ops.max_workers());
        let ops: Arc<dyn WorkerOps<I, O>> = Arc::new(ops);
        info!(workers = size, ops = %ops.describe(), "Initializing worker pool");

        let mut handles = Vec::with_capacity(size);
        for worker_id in 0..size {
            match ops.start(worker_id) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for mut started in handles {
                        started.stop(config.shutdown_grace);
                    }
                    return Err(InterpError::Worker(format!(
                        "Worker {} failed to initialize: {}",
                        worker_id, e
                    )));
                }
            }
        }

        let (events_tx, events_rx) = unbounded();
        let (done_tx, done_rx) = oneshot::channel();
        let counters = Arc::new(PoolCounters::default());
        let closing = Arc::new(AtomicBool::new(false));

        let mut slots = Vec::with_capacity(size);
        for (worker_id, handle) in handles.into_iter().enumerate() {
            let (assign_tx, assign_rx) = bounded(1);
            let slot_thread = SlotThread {
                worker_id,
                handle,
                jobs: assign_rx,
                events: events_tx.clone(),
                closing: Arc::clone(&closing),
                counters: Arc::clone(&counters),
                stop_grace: config.shutdown_grace,
            };
            let thread = thread::Builder::new()
                .name(format!("pool-worker-{}", worker_id))
                .spawn(move || slot_thread.run())?;
            slots.push(Slot {
                assign: Some(assign_tx),
                thread: Some(thread),
                busy_with: None,
            });
        }

        let dispatcher = Dispatcher {
            events: events_rx,
            slots,
            idle: (0..size).collect(),
            pending: VecDeque::new(),
            ops,
            counters: Arc::clone(&counters),
            closing,
            grace: config.shutdown_grace,
            drain_deadline: None,
        };
        thread::Builder::new()
            .name("pool-dispatcher".to_string())
            .spawn(move || {
                dispatcher.run();
                let _ = done_tx.send(());
            })?;

        info!(workers = size, "All workers ready");

        Ok(Self {
            events: events_tx,
            accepting: Arc::new(AtomicBool::new(true)),
            size,
            next_job_id: AtomicU64::new(1),
            counters,
            done: done_rx.shared(),
        })
    }

    /// Number of workers in the pool.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job. The returned handle resolves with the entry point's
    /// output, the entry point's error, or the reason the worker failed.
    pub fn submit(&self, input: I) -> JobHandle<O> {
        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        let job = Job { id, input, reply };

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if !self.accepting.load(Ordering::Acquire) {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            job.reject(JobError::PoolClosed);
        } else if let Err(crossbeam_channel::SendError(PoolEvent::Submit(job))) =
            self.events.send(PoolEvent::Submit(job))
        {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            job.reject(JobError::PoolClosed);
        }

        JobHandle { id, rx }
    }

    /// Stop accepting jobs, let queued and in-flight jobs finish within the
    /// grace period, then stop every worker.
    ///
    /// Calling it again returns a handle to the same shutdown.
    pub fn shutdown(&self) -> ShutdownHandle {
        if self.accepting.swap(false, Ordering::AcqRel) {
            info!(workers = self.size, "Shutting down worker pool");
            let _ = self.events.send(PoolEvent::Shutdown);
        }
        ShutdownHandle {
            done: self.done.clone(),
        }
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let c = &self.counters;
        WorkerPoolStats {
            worker_count: self.size,
            jobs_submitted: c.submitted.load(Ordering::Relaxed),
            jobs_succeeded: c.succeeded.load(Ordering::Relaxed),
            jobs_failed: c.failed.load(Ordering::Relaxed),
            worker_restarts: c.restarts.load(Ordering::Relaxed),
            in_flight: c.in_flight.load(Ordering::Relaxed),
            peak_in_flight: c.peak_in_flight.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
        }
    }
}

impl<I, O> Drop for WorkerPool<I, O> {
    fn drop(&mut self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            let _ = self.events.send(PoolEvent::Shutdown);
        }
        wait_blocking(self.done.clone().map(|_| ()));
    }
}

struct Slot<I, O> {
    /// Dropped to tell the slot thread to stop its worker and exit.
    assign: Option<Sender<Job<I, O>>>,
    thread: Option<JoinHandle<()>>,
    busy_with: Option<u64>,
}

struct Dispatcher<I, O> {
    events: Receiver<PoolEvent<I, O>>,
    slots: Vec<Slot<I, O>>,
    idle: VecDeque<usize>,
    pending: VecDeque<Job<I, O>>,
    ops: Arc<dyn WorkerOps<I, O>>,
    counters: Arc<PoolCounters>,
    closing: Arc<AtomicBool>,
    grace: Duration,
    /// Set once shutdown starts; `None` again after workers were force-killed.
    drain_deadline: Option<Instant>,
}

impl<I: Send + 'static, O: Send + 'static> Dispatcher<I, O> {
    fn run(mut self) {
        loop {
            let event = match self.drain_deadline {
                Some(deadline) => match self.events.recv_deadline(deadline) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => {
                        self.force_terminate();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.events.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };

            match event {
                PoolEvent::Submit(job) => {
                    if self.closing.load(Ordering::Acquire) {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        job.reject(JobError::PoolClosed);
                    } else {
                        self.enqueue(job);
                    }
                }
                PoolEvent::Idle { worker_id } => self.on_idle(worker_id),
                PoolEvent::Shutdown => {
                    self.closing.store(true, Ordering::Release);
                    self.drain_deadline = Some(Instant::now() + self.grace);
                    debug!(
                        queued = self.pending.len(),
                        busy = self.slots.len() - self.idle.len(),
                        "Draining worker pool"
                    );
                }
            }

            if self.closing.load(Ordering::Acquire) && self.is_quiescent() {
                break;
            }
        }

        self.stop_workers();
    }

    fn enqueue(&mut self, job: Job<I, O>) {
        match self.idle.pop_front() {
            Some(worker_id) => self.assign(worker_id, job),
            None => {
                trace!(job_id = job.id, queued = self.pending.len() + 1, "All workers busy, queueing job");
                self.pending.push_back(job);
                self.counters.queued.store(self.pending.len(), Ordering::Relaxed);
            }
        }
    }

    fn on_idle(&mut self, worker_id: usize) {
        self.slots[worker_id].busy_with = None;
        match self.pending.pop_front() {
            Some(job) => {
                self.counters.queued.store(self.pending.len(), Ordering::Relaxed);
                self.assign(worker_id, job);
            }
            None => self.idle.push_back(worker_id),
        }
    }

    fn assign(&mut self, worker_id: usize, job: Job<I, O>) {
        let in_flight = self.counters.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters
            .peak_in_flight
            .fetch_max(in_flight, Ordering::Relaxed);

        let job_id = job.id;
        let slot = &mut self.slots[worker_id];
        let sent = match slot.assign.as_ref() {
            Some(assign) => assign.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        };
        match sent {
            Ok(()) => {
                slot.busy_with = Some(job_id);
                trace!(job_id, worker_id, "Assigned job to worker");
            }
            Err(job) => {
                // Slot thread is gone; it can never report idle again.
                error!(worker_id, job_id, "Worker slot thread exited unexpectedly");
                self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                slot.assign = None;
                job.reject(JobError::Protocol {
                    worker_id,
                    message: "worker slot is no longer running".to_string(),
                });
            }
        }
    }

    fn is_quiescent(&self) -> bool {
        self.pending.is_empty() && self.slots.iter().all(|slot| slot.busy_with.is_none())
    }

    /// Grace period over: fail what never started, kill what is running.
    fn force_terminate(&mut self) {
        self.drain_deadline = None;
        let abandoned = self.pending.len();
        for job in self.pending.drain(..) {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            job.reject(JobError::PoolClosed);
        }
        self.counters.queued.store(0, Ordering::Relaxed);
        let busy: Vec<u64> = self.slots.iter().filter_map(|s| s.busy_with).collect();
        warn!(
            abandoned,
            busy = busy.len(),
            "Shutdown grace period elapsed, terminating workers"
        );
        self.ops.terminate_all();
    }

    fn stop_workers(&mut self) {
        for slot in &mut self.slots {
            slot.assign = None;
        }
        for (worker_id, slot) in self.slots.iter_mut().enumerate() {
            if let Some(thread) = slot.thread.take()
                && thread.join().is_err()
            {
                error!(worker_id, "Worker slot thread panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

struct SlotThread<I, O> {
    worker_id: usize,
    handle: Box<dyn WorkerHandle<I, O>>,
    jobs: Receiver<Job<I, O>>,
    events: Sender<PoolEvent<I, O>>,
    closing: Arc<AtomicBool>,
    counters: Arc<PoolCounters>,
    stop_grace: Duration,
}

impl<I, O> SlotThread<I, O> {
    fn run(mut self) {
        while let Ok(job) = self.jobs.recv() {
            let job_id = job.id;
            let outcome = self.handle.execute(job_id, job.input);

            let worker_failed = matches!(&outcome, Err(e) if e.is_worker_failure());
            match &outcome {
                Ok(_) => {
                    self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    debug!(worker_id = self.worker_id, job_id, error = %e, "Job failed");
                }
            }

            // Restart precedes the reply: stats read after a failed job
            // include its restart.
            if worker_failed && !self.closing.load(Ordering::Acquire) {
                match self.handle.restart() {
                    Ok(()) => {
                        self.counters.restarts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        // The next job retries the spawn.
                        error!(worker_id = self.worker_id, error = %e, "Failed to respawn worker");
                    }
                }
            }

            self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
            // The caller may have dropped its handle; the outcome is still counted.
            let _ = job.reply.send(outcome);

            if self
                .events
                .send(PoolEvent::Idle {
                    worker_id: self.worker_id,
                })
                .is_err()
            {
                break;
            }
        }

        self.handle.stop(self.stop_grace);
    }
}
