//! Bounded backend connection pool.
//!
//! Connections are dialed lazily and probed with a ping before reuse. A
//! semaphore sized to the pool capacity bounds how many handles are checked
//! out at once; a caller that finds no permit waits until a handle is
//! returned.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::backend::{BackendError, BackendResult, Connection, Connector};

struct PoolInner {
    connector: Arc<dyn Connector>,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, conn: Connection) {
        let mut idle = self.idle();
        if idle.len() < self.capacity {
            idle.push(conn);
        } else {
            trace!("Idle set full, closing connection");
        }
    }
}

/// A pool of backend connections. Clones share the pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool holding at most `capacity` connections.
    ///
    /// A capacity of zero is treated as one.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                idle: Mutex::new(Vec::with_capacity(capacity)),
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
            }),
        }
    }

    /// The connector the pool dials with.
    #[must_use]
    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.inner.connector
    }

    /// Check out a connection, waiting for one to be returned if the pool is
    /// at capacity.
    ///
    /// Idle connections that fail their ping are discarded and the next one
    /// is tried; when none are left a new connection is dialed.
    ///
    /// # Errors
    ///
    /// Returns an error if a new connection could not be dialed.
    pub async fn acquire(&self) -> BackendResult<PooledConnection> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| BackendError::Unavailable("pool closed".into()))?;

        loop {
            let candidate = self.inner.idle().pop();
            let conn = match candidate {
                Some(mut conn) => match conn.ping().await {
                    Ok(()) => conn,
                    Err(e) => {
                        debug!(error = %e, "Discarding dead pooled connection");
                        continue;
                    }
                },
                None => self.inner.connector.connect().await?,
            };

            return Ok(PooledConnection {
                conn: Some(conn),
                pool: Arc::clone(&self.inner),
                _permit: permit,
            });
        }
    }

    /// Maximum number of live connections.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Connections currently checked out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.capacity - self.inner.permits.available_permits()
    }

    /// Connections waiting in the idle set.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.inner.idle().len()
    }
}

/// A checked-out connection. Returned to the idle set on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Close the connection instead of returning it.
    pub fn discard(mut self) {
        self.conn = None;
    }

    /// Return the connection to the pool.
    pub fn release(self) {}
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `None` after `discard`, which consumes `self`
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
