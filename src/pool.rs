//! Bounded connection pool
//!
//! A semaphore caps how many connections can be lent at once; idle
//! connections wait on a LIFO stack. Every checkout validates what it hands
//! out: an idle connection that reports itself closed or fails the liveness
//! ping is closed and discarded, the next idle one is tried, and a fresh
//! connection is opened as a last resort. Callers never receive a
//! connection that failed its ping.
//!
//! Borrowed connections go back to the pool when their [`PooledConnection`]
//! guard is dropped, on every exit path. Use [`PooledConnection::discard`]
//! to close one instead.
//!
//! ```ignore
//! let pool = ConnectionPool::open(factory, PoolSettings::from(&config)).await?;
//!
//! let mut conn = pool.checkout().await?;
//! let rows = conn.query("SELECT 1", &[]).await?;
//! drop(conn); // returned for reuse
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::DatabaseConfig;
use crate::connection::{Connection, ConnectionFactory, Param, Row};
use crate::error::DatabaseError;
use crate::observability::SecurityEvent;

/// Size and timing limits for one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Connections opened eagerly by [`ConnectionPool::open`]
    pub min_size: u32,
    /// Connections that may be lent at once
    pub max_size: u32,
    /// How long a checkout waits for a free slot
    pub acquire_timeout: Duration,
}

impl From<&DatabaseConfig> for PoolSettings {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            min_size: config.min_connections,
            max_size: config.max_connections,
            acquire_timeout: config.acquire_timeout,
        }
    }
}

/// A bounded pool of validated connections.
pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    settings: PoolSettings,
    idle: Mutex<Vec<Box<dyn Connection>>>,
    slots: Arc<Semaphore>,
    open: AtomicU32,
    closed: AtomicBool,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.factory.describe())
            .field("settings", &self.settings)
            .field("open", &self.size())
            .field("idle", &self.idle_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool and open `min_size` connections.
    ///
    /// Fails with the first connection error; any connections already
    /// opened are closed again.
    pub async fn open(
        factory: Arc<dyn ConnectionFactory>,
        settings: PoolSettings,
    ) -> Result<Arc<Self>, DatabaseError> {
        let pool = Arc::new(Self {
            factory,
            settings,
            idle: Mutex::new(Vec::with_capacity(settings.max_size as usize)),
            slots: Arc::new(Semaphore::new(settings.max_size as usize)),
            open: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        });

        for _ in 0..settings.min_size {
            match pool.factory.connect().await {
                Ok(conn) => {
                    pool.open.fetch_add(1, Ordering::SeqCst);
                    pool.idle.lock().push(conn);
                }
                Err(e) => {
                    pool.close().await;
                    return Err(e);
                }
            }
        }

        Ok(pool)
    }

    /// Borrow a validated connection.
    ///
    /// Waits up to the acquire timeout for a free slot. Fails with the
    /// connect error if no idle connection passes its ping and a fresh one
    /// cannot be opened.
    pub async fn checkout(self: &Arc<Self>) -> Result<PooledConnection, DatabaseError> {
        if self.is_closed() {
            return Err(DatabaseError::PoolClosed);
        }

        let acquire = Arc::clone(&self.slots).acquire_owned();
        let permit = match tokio::time::timeout(self.settings.acquire_timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DatabaseError::PoolClosed),
            Err(_) => {
                warn!(
                    timeout = ?self.settings.acquire_timeout,
                    max_size = self.settings.max_size,
                    "Timed out waiting for a pooled connection"
                );
                return Err(DatabaseError::AcquireTimeout(self.settings.acquire_timeout));
            }
        };

        loop {
            // The guard must not live across the ping below
            let candidate = self.idle.lock().pop();
            let Some(mut conn) = candidate else { break };
            let counted = OpenCount::new(&self.open);

            if !conn.is_closed() {
                match Self::revalidate(&mut *conn).await {
                    Ok(()) => {
                        counted.keep();
                        return Ok(PooledConnection::new(conn, Arc::clone(self), permit));
                    }
                    Err(e) => debug!(error = %e, "Idle connection failed liveness ping"),
                }
            }
            counted.keep();
            self.discard(conn).await;
        }

        let mut conn = self.factory.connect().await?;
        self.open.fetch_add(1, Ordering::SeqCst);
        let counted = OpenCount::new(&self.open);
        let pinged = conn.ping().await;
        counted.keep();
        if let Err(e) = pinged {
            self.discard(conn).await;
            return Err(e);
        }

        Ok(PooledConnection::new(conn, Arc::clone(self), permit))
    }

    /// Clear what the previous borrower left behind, then ping.
    async fn revalidate(conn: &mut dyn Connection) -> Result<(), DatabaseError> {
        conn.reset().await?;
        conn.ping().await
    }

    /// Put a connection back on the idle stack, or drop it if it is closed,
    /// the pool is closed, or the pool is over capacity.
    fn release(&self, conn: Box<dyn Connection>) {
        if !conn.is_closed() && self.open.load(Ordering::SeqCst) <= self.settings.max_size {
            let mut idle = self.idle.lock();
            // Checked under the lock so close() cannot miss this push
            if !self.is_closed() {
                idle.push(conn);
                return;
            }
        }

        self.open.fetch_sub(1, Ordering::SeqCst);
        debug!("Dropping connection instead of returning it to the pool");
        drop(conn);
    }

    /// Forget a connection and close it. The count drops before the close
    /// is awaited, so a cancelled discard cannot leave it behind.
    async fn discard(&self, mut conn: Box<dyn Connection>) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        if let Err(e) = conn.close().await {
            debug!(error = %e, "Error while closing discarded connection");
        }
        crate::security_event!(
            SecurityEvent::ConnectionDiscarded,
            database = %self.factory.describe(),
            "Discarded unusable database connection"
        );
    }

    /// Close every idle connection and refuse further checkouts.
    ///
    /// Connections still lent out are dropped when returned. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.slots.close();

        let drained = std::mem::take(&mut *self.idle.lock());
        self.open.fetch_sub(drained.len() as u32, Ordering::SeqCst);
        for mut conn in drained {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "Error while closing idle connection");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Open connections, idle and lent
    pub fn size(&self) -> u32 {
        self.open.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Connections currently lent out
    pub fn in_use(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        (self.settings.max_size as usize).saturating_sub(self.slots.available_permits())
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }
}

/// Holds one unit of the open count while checkout awaits on a connection
/// that is neither idle nor lent. Dropped without [`keep`](Self::keep),
/// i.e. the checkout future was cancelled, it gives the unit back; the
/// connection itself is dropped alongside it.
struct OpenCount<'a> {
    open: &'a AtomicU32,
    armed: bool,
}

impl<'a> OpenCount<'a> {
    fn new(open: &'a AtomicU32) -> Self {
        Self { open, armed: true }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for OpenCount<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A connection borrowed from a [`ConnectionPool`].
///
/// Dropping the guard returns the connection; [`discard`](Self::discard)
/// closes it instead. Either way the pool slot is freed.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<ConnectionPool>,
    // Declared last: the slot is freed only after the connection is back
    _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn new(conn: Box<dyn Connection>, pool: Arc<ConnectionPool>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            pool,
            _permit: permit,
        }
    }

    fn session(&mut self) -> Result<&mut Box<dyn Connection>, DatabaseError> {
        self.conn
            .as_mut()
            .ok_or_else(|| DatabaseError::ConnectionLost("connection already released".into()))
    }

    /// True once the session is known to be unusable
    pub fn is_closed(&self) -> bool {
        self.conn.as_ref().map_or(true, |c| c.is_closed())
    }

    /// Round-trip liveness ping
    pub async fn ping(&mut self) -> Result<(), DatabaseError> {
        self.session()?.ping().await
    }

    /// Run one statement and fetch all rows
    pub async fn query(&mut self, sql: &str, params: &[Param]) -> Result<Vec<Row>, DatabaseError> {
        self.session()?.query(sql, params).await
    }

    /// Return the connection for reuse. Same as dropping the guard.
    pub fn release(self) {}

    /// Close the connection instead of returning it.
    pub async fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn).await;
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
