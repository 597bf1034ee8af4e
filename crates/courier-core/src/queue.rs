//! Asynchronous backend command queue.
//!
//! Callers submit a callback that needs a backend connection. The callback
//! is appended to a FIFO pending list and picked up by one of a fixed set of
//! worker tasks, which borrows a pooled connection, runs the callback and
//! sends the result back through a one-shot channel owned by the caller.
//!
//! ```text
//! caller ──submit──▶ pending list (FIFO) ──pop──▶ worker ──acquire──▶ pool
//!   ▲                                               │
//!   └──────────────── oneshot result ◀──────────────┘
//! ```
//!
//! Every command carries the caller's deadline. A worker drops commands
//! whose caller already gave up, and abandons a command that overruns its
//! deadline, discarding the connection it was using.

use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::backend::{BackendError, BackendResult, Connection};
use crate::pool::Pool;
use crate::telemetry::SharedTelemetry;

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No result arrived before the deadline.
    #[error("Timed out waiting for the backend")]
    Timeout,

    /// The queue has been shut down.
    #[error("Command queue is closed")]
    Closed,

    /// The command itself failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// A unit of work waiting for a connection.
trait QueuedCommand: Send {
    fn deadline(&self) -> Instant;

    /// Whether the caller stopped waiting for the result.
    fn is_abandoned(&self) -> bool;

    fn run<'c>(self: Box<Self>, conn: &'c mut Connection) -> BoxFuture<'c, ()>;
}

struct Pending<F, T> {
    callback: F,
    result: oneshot::Sender<Result<T, QueueError>>,
    deadline: Instant,
}

impl<F, T> QueuedCommand for Pending<F, T>
where
    F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, BackendResult<T>> + Send + 'static,
    T: Send + 'static,
{
    fn deadline(&self) -> Instant {
        self.deadline
    }

    fn is_abandoned(&self) -> bool {
        self.result.is_closed()
    }

    fn run<'c>(self: Box<Self>, conn: &'c mut Connection) -> BoxFuture<'c, ()> {
        let Pending {
            callback, result, ..
        } = *self;
        Box::pin(async move {
            let outcome = callback(conn).await.map_err(QueueError::from);
            // The caller may have timed out; the late result is dropped
            let _ = result.send(outcome);
        })
    }
}

/// FIFO of pending commands with a wakeup for idle workers.
#[derive(Default)]
struct PendingList {
    items: Mutex<VecDeque<Box<dyn QueuedCommand>>>,
    available: Notify,
}

impl PendingList {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Box<dyn QueuedCommand>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, command: Box<dyn QueuedCommand>) -> usize {
        let depth = {
            let mut items = self.lock();
            items.push_back(command);
            items.len()
        };
        self.available.notify_one();
        depth
    }

    async fn pop(&self) -> (Box<dyn QueuedCommand>, usize) {
        loop {
            let mut notified = pin!(self.available.notified());
            notified.as_mut().enable();

            {
                let mut items = self.lock();
                if let Some(command) = items.pop_front() {
                    return (command, items.len());
                }
            }

            notified.await;
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

/// Runs backend commands on a fixed set of workers.
pub struct CommandQueue {
    pending: Arc<PendingList>,
    workers: Vec<JoinHandle<()>>,
    closed: AtomicBool,
    default_timeout: Duration,
    pool: Pool,
}

impl CommandQueue {
    /// Start `workers` worker tasks drawing connections from `pool`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(
        pool: Pool,
        workers: usize,
        default_timeout: Duration,
        telemetry: SharedTelemetry,
    ) -> Self {
        let workers = workers.max(1);
        if workers > pool.capacity() {
            warn!(
                workers,
                pool_size = pool.capacity(),
                "More queue workers than pooled connections; workers will wait for handles"
            );
        }

        let pending = Arc::new(PendingList::default());
        let handles = (0..workers)
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    Arc::clone(&pending),
                    pool.clone(),
                    Arc::clone(&telemetry),
                ))
            })
            .collect();

        info!(workers, pool_size = pool.capacity(), "Command queue started");

        Self {
            pending,
            workers: handles,
            closed: AtomicBool::new(false),
            default_timeout,
            pool,
        }
    }

    /// Run `callback` with the default timeout.
    ///
    /// # Errors
    ///
    /// See [`run_with_timeout`](Self::run_with_timeout).
    pub async fn run<F, T>(&self, callback: F) -> Result<T, QueueError>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, BackendResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.run_with_timeout(self.default_timeout, callback).await
    }

    /// Queue `callback` and wait at most `timeout` for its result.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Timeout`] if no result arrived in time, which
    /// includes the case where no connection could be acquired;
    /// [`QueueError::Closed`] after shutdown; or the callback's own error.
    pub async fn run_with_timeout<F, T>(&self, timeout: Duration, callback: F) -> Result<T, QueueError>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, BackendResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        self.pending.push(Box::new(Pending {
            callback,
            result: tx,
            deadline,
        }));

        match timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            // The worker dropped the command
            Ok(Err(_)) if self.is_closed() => Err(QueueError::Closed),
            Ok(Err(_)) | Err(_) => Err(QueueError::Timeout),
        }
    }

    /// Commands waiting for a worker.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// The pool the workers draw from.
    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the workers and fail everything still pending.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for worker in &self.workers {
            worker.abort();
        }
        self.pending.clear();
        debug!("Command queue shut down");
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn worker(id: usize, pending: Arc<PendingList>, pool: Pool, telemetry: SharedTelemetry) {
    loop {
        let (command, depth) = pending.pop().await;
        telemetry.pending_commands(depth);

        if command.is_abandoned() {
            trace!(worker = id, "Skipping abandoned command");
            continue;
        }

        let deadline = command.deadline();
        let mut conn = match timeout_at(deadline, pool.acquire()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(worker = id, error = %e, "Dropping queued command: no backend connection");
                continue;
            }
            Err(_) => {
                warn!(worker = id, "Dropping queued command: timed out waiting for a connection");
                continue;
            }
        };

        if timeout_at(deadline, command.run(&mut conn)).await.is_err() {
            debug!(worker = id, "Queued command overran its deadline");
            conn.discard();
        }
    }
}
