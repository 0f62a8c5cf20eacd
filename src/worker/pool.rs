//! Supervised pool of analysis worker threads.
//!
//! The pool owns a fixed number of slots. Each slot runs one long-lived OS
//! thread that executes at most one task at a time. When a worker crashes
//! (the analyzer panics) or overruns its deadline, the supervisor puts a
//! fresh thread in the same slot, so the pool always has exactly
//! `max_workers` slots until it is closed.
//!
//! Dispatch order: an idle worker if there is one; otherwise inline
//! execution on the caller's thread for payloads under `inline_threshold`;
//! otherwise a bounded wait for a worker, covered by the task deadline.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use super::task::{Analyzer, WorkerResponse, WorkerTask};
use crate::config::WorkerConfig;
use crate::error::InfraError;

struct WorkerMessage<O> {
    task: WorkerTask,
    reply: oneshot::Sender<WorkerResponse<O>>,
}

struct Slot<O> {
    generation: u64,
    sender: Option<mpsc::Sender<WorkerMessage<O>>>,
}

/// Counters and gauges reported by [`WorkerPool::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerPoolStats {
    /// Worker slots; equals `max_workers` until the pool is closed.
    pub size: usize,
    /// Slots running a task.
    pub busy: usize,
    /// Slots waiting for a task.
    pub idle: usize,
    /// Dispatches waiting for a free slot.
    pub queued: usize,
    /// Tasks answered by a worker.
    pub completed: u64,
    /// Tasks run inline on the caller's thread.
    pub inline: u64,
    /// Workers replaced after a crash.
    pub crashed: u64,
    /// Tasks rejected by their deadline.
    pub timed_out: u64,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    inline: AtomicU64,
    crashed: AtomicU64,
    timed_out: AtomicU64,
}

struct Inner<A: Analyzer> {
    analyzer: Arc<A>,
    config: WorkerConfig,
    slots: Mutex<Vec<Slot<A::Output>>>,
    idle: Mutex<Vec<usize>>,
    available: Arc<Semaphore>,
    queued: AtomicUsize,
    closed: AtomicBool,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn spawn_worker<A: Analyzer>(
    analyzer: Arc<A>,
    slot: usize,
    generation: u64,
) -> std::io::Result<mpsc::Sender<WorkerMessage<A::Output>>> {
    let (sender, receiver) = mpsc::channel::<WorkerMessage<A::Output>>();
    std::thread::Builder::new()
        .name(format!("analysis-worker-{slot}"))
        .spawn(move || {
            while let Ok(WorkerMessage { task, reply }) = receiver.recv() {
                let output = analyzer.analyze(&task.content, &task.options);
                // The dispatcher is gone if the task timed out.
                let _ = reply.send(WorkerResponse {
                    task_id: task.task_id,
                    output,
                });
            }
            tracing::debug!(slot, generation, "analysis worker exited");
        })?;
    Ok(sender)
}

impl<A: Analyzer> Inner<A> {
    /// Puts a fresh worker in `slot`. The old thread, if still running,
    /// exits after its current task because its channel is closed.
    fn respawn(&self, slot: usize) {
        let mut slots = lock(&self.slots);
        let Some(entry) = slots.get_mut(slot) else {
            return;
        };
        entry.generation += 1;
        entry.sender = match spawn_worker(Arc::clone(&self.analyzer), slot, entry.generation) {
            Ok(sender) => Some(sender),
            Err(e) => {
                tracing::error!(slot, error = %e, "failed to spawn replacement worker");
                None
            }
        };
    }

    fn checkin(&self, slot: usize) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        lock(&self.idle).push(slot);
        self.available.add_permits(1);
    }

    /// Hands `message` to the worker in `slot`; `false` if it is gone.
    fn send(&self, slot: usize, message: WorkerMessage<A::Output>) -> bool {
        let slots = lock(&self.slots);
        slots
            .get(slot)
            .and_then(|entry| entry.sender.as_ref())
            .is_some_and(|sender| sender.send(message).is_ok())
    }
}

/// A claimed slot. Dropping it without [`Claim::finish`] replaces the
/// worker, so a cancelled or failed dispatch never leaves a slot stuck busy.
struct Claim<'a, A: Analyzer> {
    inner: &'a Inner<A>,
    slot: usize,
    healthy: bool,
}

impl<A: Analyzer> Claim<'_, A> {
    fn finish(mut self) {
        self.healthy = true;
    }
}

impl<A: Analyzer> Drop for Claim<'_, A> {
    fn drop(&mut self) {
        if !self.healthy {
            self.inner.respawn(self.slot);
        }
        self.inner.checkin(self.slot);
    }
}

/// Fixed-size pool of supervised analysis workers.
///
/// Cheap to clone; clones share the same workers.
pub struct WorkerPool<A: Analyzer> {
    inner: Arc<Inner<A>>,
}

impl<A: Analyzer> Clone for WorkerPool<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Analyzer> fmt::Debug for WorkerPool<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<A: Analyzer> WorkerPool<A> {
    /// Starts `config.max_workers` worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::InitializationFailure`] if a thread cannot be
    /// spawned.
    pub fn new(analyzer: A, config: WorkerConfig) -> Result<Self, InfraError> {
        let analyzer = Arc::new(analyzer);
        let size = config.max_workers.max(1);
        let mut slots = Vec::with_capacity(size);
        for slot in 0..size {
            let sender = spawn_worker(Arc::clone(&analyzer), slot, 0).map_err(|e| {
                InfraError::InitializationFailure(format!("cannot spawn analysis worker: {e}"))
            })?;
            slots.push(Slot {
                generation: 0,
                sender: Some(sender),
            });
        }
        tracing::info!(
            workers = size,
            queue_capacity = config.queue_capacity,
            inline_threshold = config.inline_threshold,
            task_timeout_ms = millis(config.task_timeout),
            "worker pool started"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                analyzer,
                config,
                slots: Mutex::new(slots),
                idle: Mutex::new((0..size).rev().collect()),
                available: Arc::new(Semaphore::new(size)),
                queued: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        })
    }

    /// Runs `task` and returns its response.
    ///
    /// `timeout` (default: the configured task timeout) is a deadline
    /// covering both the wait for a worker and the execution itself.
    ///
    /// # Errors
    ///
    /// - [`InfraError::WorkerTimeout`] if the deadline passes; the worker
    ///   is replaced and other tasks are unaffected.
    /// - [`InfraError::WorkerCrash`] if the analyzer panicked; the worker
    ///   is replaced.
    /// - [`InfraError::WorkerQueueFull`] if every worker is busy and the
    ///   wait queue is full.
    /// - [`InfraError::WorkerPoolClosed`] after [`WorkerPool::close`].
    pub async fn dispatch(
        &self,
        task: WorkerTask,
        timeout: Option<Duration>,
    ) -> Result<WorkerResponse<A::Output>, InfraError> {
        let inner = &*self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(InfraError::WorkerPoolClosed);
        }
        let timeout = timeout.unwrap_or(inner.config.task_timeout);
        let deadline = Instant::now() + timeout;
        let task_id = task.task_id;
        let timed_out = || {
            inner.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            InfraError::WorkerTimeout {
                task_id,
                timeout_ms: millis(timeout),
            }
        };

        let permit = match Arc::clone(&inner.available).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) if task.content.len() < inner.config.inline_threshold => {
                return self.run_inline(task);
            }
            Err(_) => self.wait_for_worker(deadline, task_id).await.map_err(|e| match e {
                WaitError::Deadline => timed_out(),
                WaitError::Other(e) => e,
            })?,
        };
        permit.forget();
        let Some(slot) = lock(&inner.idle).pop() else {
            // Permits track idle slots one to one.
            inner.available.add_permits(1);
            return Err(InfraError::Internal("idle permit without idle slot".to_string()));
        };
        let claim = Claim {
            inner,
            slot,
            healthy: false,
        };

        let (reply, response) = oneshot::channel();
        if !inner.send(slot, WorkerMessage { task, reply }) {
            tracing::warn!(slot, %task_id, "worker unavailable, replacing");
            inner.counters.crashed.fetch_add(1, Ordering::Relaxed);
            return Err(InfraError::WorkerCrash { task_id });
        }

        match tokio::time::timeout_at(deadline, response).await {
            Ok(Ok(answer)) if answer.task_id == task_id => {
                inner.counters.completed.fetch_add(1, Ordering::Relaxed);
                claim.finish();
                Ok(answer)
            }
            Ok(Ok(answer)) => {
                tracing::warn!(slot, expected = %task_id, got = %answer.task_id, "discarding mismatched worker response");
                Err(InfraError::Internal(format!(
                    "worker answered {} for task {task_id}",
                    answer.task_id
                )))
            }
            Ok(Err(_)) => {
                inner.counters.crashed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(slot, %task_id, "analysis worker crashed, replacing");
                Err(InfraError::WorkerCrash { task_id })
            }
            Err(_) => {
                tracing::warn!(slot, %task_id, timeout_ms = millis(timeout), "analysis task timed out, replacing worker");
                Err(timed_out())
            }
        }
    }

    fn run_inline(&self, task: WorkerTask) -> Result<WorkerResponse<A::Output>, InfraError> {
        let inner = &*self.inner;
        let analyzer = &inner.analyzer;
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            analyzer.analyze(&task.content, &task.options)
        }));
        match outcome {
            Ok(output) => {
                inner.counters.inline.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(task_id = %task.task_id, bytes = task.content.len(), "ran task inline");
                Ok(WorkerResponse {
                    task_id: task.task_id,
                    output,
                })
            }
            Err(_) => {
                tracing::warn!(task_id = %task.task_id, "inline analysis panicked");
                Err(InfraError::WorkerCrash {
                    task_id: task.task_id,
                })
            }
        }
    }

    async fn wait_for_worker(
        &self,
        deadline: Instant,
        task_id: Uuid,
    ) -> Result<OwnedSemaphorePermit, WaitError> {
        let inner = &*self.inner;
        let capacity = inner.config.queue_capacity;
        let reserved = inner
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                (queued < capacity).then_some(queued + 1)
            });
        if reserved.is_err() {
            tracing::warn!(%task_id, capacity, "worker queue full");
            return Err(WaitError::Other(InfraError::WorkerQueueFull { capacity }));
        }
        let _queued = Queued(&inner.queued);
        let waited =
            tokio::time::timeout_at(deadline, Arc::clone(&inner.available).acquire_owned()).await;
        match waited {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(WaitError::Other(InfraError::WorkerPoolClosed)),
            Err(_) => Err(WaitError::Deadline),
        }
    }

    /// Current gauges and counters.
    #[must_use]
    pub fn stats(&self) -> WorkerPoolStats {
        let inner = &*self.inner;
        let size = lock(&inner.slots).len();
        let idle = lock(&inner.idle).len().min(size);
        WorkerPoolStats {
            size,
            busy: size - idle,
            idle,
            queued: inner.queued.load(Ordering::SeqCst),
            completed: inner.counters.completed.load(Ordering::Relaxed),
            inline: inner.counters.inline.load(Ordering::Relaxed),
            crashed: inner.counters.crashed.load(Ordering::Relaxed),
            timed_out: inner.counters.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Generation of each slot's current worker; bumped on every
    /// replacement.
    #[must_use]
    pub fn generations(&self) -> Vec<u64> {
        lock(&self.inner.slots)
            .iter()
            .map(|slot| slot.generation)
            .collect()
    }

    /// Returns `true` once [`WorkerPool::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stops accepting tasks, wakes queued dispatches with
    /// [`InfraError::WorkerPoolClosed`] and drops every worker. Threads
    /// running a task exit when it completes.
    pub fn close(&self) {
        let inner = &*self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.available.close();
        let workers = std::mem::take(&mut *lock(&inner.slots));
        lock(&inner.idle).clear();
        tracing::info!(workers = workers.len(), "worker pool closed");
    }
}

enum WaitError {
    Deadline,
    Other(InfraError),
}

/// Leaves the wait queue on drop, including when the dispatch is cancelled.
struct Queued<'a>(&'a AtomicUsize);

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
