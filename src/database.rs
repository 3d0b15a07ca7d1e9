//! Connection Pool Manager
//!
//! [`DatabaseManager`] owns the process's connection pool. It creates the
//! pool lazily with retry and exponential backoff, lends validated
//! connections, takes them back, checks pool health, and periodically
//! rebuilds the pool to shed long-idle sessions.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized --create_pool ok--> Active
//! Active --close_pool / idle reclamation / unreachable--> Uninitialized
//! any --shutdown--> Closed (terminal)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use ordem::{DatabaseConfig, DatabaseManager};
//! use std::sync::Arc;
//!
//! let manager = Arc::new(DatabaseManager::postgres(DatabaseConfig::from_env())?);
//!
//! // Convenience: errors are logged and become None
//! let rows = manager.execute_query("SELECT 1", &[]).await;
//!
//! // Manual borrow: errors propagate
//! let mut conn = manager.get_connection().await?;
//! let rows = conn.query("SELECT nome FROM usuarios", &[]).await?;
//! manager.put_connection(conn);
//!
//! manager.shutdown().await;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::DatabaseConfig;
use crate::connection::{ConnectionFactory, Param, Row};
use crate::error::DatabaseError;
use crate::health::HealthStatus;
use crate::observability::SecurityEvent;
use crate::pool::{ConnectionPool, PoolSettings, PooledConnection};

const HEALTH_CHECK_SQL: &str = "SELECT 1";

enum PoolState {
    Uninitialized,
    Active(Arc<ConnectionPool>),
    Closed,
}

/// Lifecycle phase reported by [`DatabaseManager::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolPhase {
    Uninitialized,
    Active,
    Closed,
}

/// Snapshot of the pool for status displays
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub status: PoolPhase,
    pub min_size: u32,
    pub max_size: u32,
    /// True unless a live pool exists
    pub closed: bool,
    pub open_connections: u32,
    pub idle_connections: usize,
    pub in_use: usize,
}

/// Owns the connection pool and its lifecycle.
///
/// Share it behind an `Arc`; every method takes `&self`.
pub struct DatabaseManager {
    config: DatabaseConfig,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
    last_cleanup: parking_lot::Mutex<Instant>,
}

impl fmt::Debug for DatabaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseManager")
            .field("target", &self.factory.describe())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DatabaseManager {
    /// Create a manager over any connection backend. No connection is
    /// opened until the first [`create_pool`](Self::create_pool) or
    /// [`get_connection`](Self::get_connection).
    pub fn new(
        config: DatabaseConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, DatabaseError> {
        config.validate()?;

        info!(
            target_db = %factory.describe(),
            min_connections = config.min_connections,
            max_connections = config.max_connections,
            max_retries = config.max_retries,
            "Database manager configured"
        );

        Ok(Self {
            config,
            factory,
            state: Mutex::new(PoolState::Uninitialized),
            last_cleanup: parking_lot::Mutex::new(Instant::now()),
        })
    }

    /// Create a manager backed by PostgreSQL.
    #[cfg(feature = "postgres")]
    pub fn postgres(config: DatabaseConfig) -> Result<Self, DatabaseError> {
        let factory = crate::postgres::PgConnectionFactory::new(&config)?;
        Self::new(config, Arc::new(factory))
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Return the active pool, creating it if necessary.
    ///
    /// Makes up to `max_retries` attempts, sleeping `retry_base_delay`
    /// doubled after each failure between attempts. Concurrent callers
    /// wait for the same creation instead of racing.
    pub async fn create_pool(&self) -> Result<Arc<ConnectionPool>, DatabaseError> {
        let attempts = self.config.max_retries;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            {
                let mut state = self.state.lock().await;
                match &*state {
                    PoolState::Active(pool) if !pool.is_closed() => return Ok(Arc::clone(pool)),
                    PoolState::Closed => return Err(DatabaseError::ShutDown),
                    _ => {}
                }

                let settings = PoolSettings::from(&self.config);
                match ConnectionPool::open(Arc::clone(&self.factory), settings).await {
                    Ok(pool) => {
                        *state = PoolState::Active(Arc::clone(&pool));
                        *self.last_cleanup.lock() = Instant::now();
                        crate::security_event!(
                            SecurityEvent::DatabaseConnected,
                            database = %self.factory.describe(),
                            attempt = attempt,
                            min_connections = settings.min_size,
                            max_connections = settings.max_size,
                            "Connection pool created"
                        );
                        return Ok(pool);
                    }
                    Err(e) => {
                        warn!(
                            attempt = attempt,
                            max_attempts = attempts,
                            error = %e,
                            "Connection pool creation failed"
                        );
                        last_error = e.to_string();
                    }
                }
            }

            if attempt < attempts {
                tokio::time::sleep(backoff_delay(self.config.retry_base_delay, attempt)).await;
            }
        }

        crate::security_event!(
            SecurityEvent::DatabaseDisconnected,
            database = %self.factory.describe(),
            attempts = attempts,
            error = %last_error,
            "Database unreachable, giving up on pool creation"
        );
        Err(DatabaseError::Unavailable {
            attempts,
            last_error,
        })
    }

    /// The active pool, without creating one.
    async fn current_pool(&self) -> Option<Arc<ConnectionPool>> {
        match &*self.state.lock().await {
            PoolState::Active(pool) if !pool.is_closed() => Some(Arc::clone(pool)),
            _ => None,
        }
    }

    /// Forget `pool` if it is still the active one, then close it.
    async fn discard_pool(&self, pool: &Arc<ConnectionPool>) {
        {
            let mut state = self.state.lock().await;
            if let PoolState::Active(current) = &*state {
                if Arc::ptr_eq(current, pool) {
                    *state = PoolState::Uninitialized;
                }
            }
        }
        pool.close().await;
    }

    /// Borrow a validated connection, creating the pool if needed.
    ///
    /// If the pool cannot open a replacement connection the database is
    /// considered gone: the pool is discarded and the next call starts over
    /// with a fresh creation cycle.
    pub async fn get_connection(&self) -> Result<PooledConnection, DatabaseError> {
        let pool = self.create_pool().await?;

        match pool.checkout().await {
            Ok(conn) => Ok(conn),
            Err(e) if e.is_connectivity() => {
                crate::security_event!(
                    SecurityEvent::DatabaseDisconnected,
                    database = %self.factory.describe(),
                    error = %e,
                    "Could not open a connection, discarding pool"
                );
                self.discard_pool(&pool).await;
                Err(e)
            }
            Err(DatabaseError::PoolClosed) => {
                // Replaced underneath us by reclamation or reconnect
                let pool = self.create_pool().await?;
                pool.checkout().await
            }
            Err(e) => Err(e),
        }
    }

    /// Return a connection for reuse. Never fails; if the pool is gone the
    /// connection is simply dropped.
    pub fn put_connection(&self, conn: PooledConnection) {
        conn.release();
    }

    /// Return a connection flagged for disposal: it is closed, not reused.
    pub async fn close_connection(&self, conn: PooledConnection) {
        conn.discard().await;
    }

    /// Close every idle connection and discard the pool. Idempotent; the
    /// next borrow creates a new pool.
    pub async fn close_pool(&self) {
        let pool = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, PoolState::Uninitialized) {
                PoolState::Active(pool) => Some(pool),
                PoolState::Closed => {
                    *state = PoolState::Closed;
                    None
                }
                PoolState::Uninitialized => None,
            }
        };

        if let Some(pool) = pool {
            pool.close().await;
            info!("Connection pool closed");
        }
    }

    /// Close the pool and create a new one.
    pub async fn reconnect(&self) -> Result<(), DatabaseError> {
        info!("Reconnecting to database");
        self.close_pool().await;
        self.create_pool().await.map(|_| ())
    }

    /// Close the pool for good. Later calls fail with
    /// [`DatabaseError::ShutDown`].
    pub async fn shutdown(&self) {
        let pool = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, PoolState::Closed) {
                PoolState::Active(pool) => Some(pool),
                _ => None,
            }
        };

        if let Some(pool) = pool {
            pool.close().await;
        }
        info!("Database manager shut down");
    }

    /// Check the active pool with `SELECT 1`.
    ///
    /// Never creates a pool and never tears one down: a failed check only
    /// disposes the connection it used.
    pub async fn health_check(&self) -> HealthStatus {
        let start = Instant::now();

        let Some(pool) = self.current_pool().await else {
            return HealthStatus::unhealthy("connection pool not initialized");
        };

        let mut conn = match pool.checkout().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Health check could not borrow a connection");
                return HealthStatus::unhealthy(format!("no connection available: {}", e))
                    .with_duration(start.elapsed());
            }
        };

        let outcome = conn.query(HEALTH_CHECK_SQL, &[]).await;
        let elapsed = start.elapsed();

        match outcome {
            Ok(rows) if !rows.is_empty() => {
                self.put_connection(conn);
                HealthStatus::healthy()
                    .with_duration(elapsed)
                    .with_detail("open_connections", pool.size().to_string())
                    .with_detail("idle_connections", pool.idle_count().to_string())
            }
            Ok(_) => {
                warn!("Health check returned no rows, disposing connection");
                self.close_connection(conn).await;
                HealthStatus::unhealthy("health check returned no rows").with_duration(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Health check failed, disposing checked connection");
                self.close_connection(conn).await;
                HealthStatus::unhealthy(format!("health check failed: {}", e))
                    .with_duration(elapsed)
            }
        }
    }

    /// Rebuild the pool if more than `idle_reclaim_after` has passed since
    /// the last rebuild. Returns whether a rebuild happened.
    ///
    /// Connections lent at the time are dropped when they come back.
    pub async fn cleanup_idle_connections(&self) -> bool {
        let now = Instant::now();
        {
            let mut last = self.last_cleanup.lock();
            if now.saturating_duration_since(*last) <= self.config.idle_reclaim_after {
                return false;
            }
            *last = now;
        }

        let old = {
            let mut state = self.state.lock().await;
            match &*state {
                PoolState::Active(pool) => {
                    let pool = Arc::clone(pool);
                    *state = PoolState::Uninitialized;
                    Some(pool)
                }
                _ => None,
            }
        };
        let Some(old) = old else {
            return false;
        };

        old.close().await;
        info!("Reclaimed idle connections, recreating pool");

        if let Err(e) = self.create_pool().await {
            error!(error = %e, "Failed to recreate pool after idle reclamation");
        }
        true
    }

    /// Run one statement and fetch its rows, propagating failures.
    ///
    /// The connection is returned afterwards, or disposed if the failure
    /// broke it.
    pub async fn try_execute(&self, sql: &str, params: &[Param]) -> Result<Vec<Row>, DatabaseError> {
        let mut conn = self.get_connection().await?;

        match conn.query(sql, params).await {
            Ok(rows) => {
                self.put_connection(conn);
                Ok(rows)
            }
            Err(e) => {
                if conn.is_closed() {
                    self.close_connection(conn).await;
                } else {
                    self.put_connection(conn);
                }
                Err(e)
            }
        }
    }

    /// Run one statement and fetch its rows. Any failure is logged and
    /// reported as `None`.
    pub async fn execute_query(&self, sql: &str, params: &[Param]) -> Option<Vec<Row>> {
        match self.try_execute(sql, params).await {
            Ok(rows) => Some(rows),
            Err(e) => {
                error!(error = %e, "Query execution failed");
                None
            }
        }
    }

    /// Run `f` with a borrowed connection and release it afterwards, on
    /// success and failure alike. Errors from `f` propagate.
    ///
    /// ```ignore
    /// let rows = manager
    ///     .with_connection(|conn| Box::pin(async move {
    ///         conn.query("SELECT nome FROM usuarios", &[]).await
    ///     }))
    ///     .await?;
    /// ```
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: for<'c> FnOnce(&'c mut PooledConnection) -> BoxFuture<'c, Result<T, DatabaseError>>,
    {
        let mut conn = self.get_connection().await?;
        let result = f(&mut conn).await;

        if let Err(e) = &result {
            error!(error = %e, "Operation failed while holding a connection");
        }
        if conn.is_closed() {
            self.close_connection(conn).await;
        } else {
            self.put_connection(conn);
        }
        result
    }

    /// Pool snapshot for status displays.
    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let (phase, pool) = match &*state {
            PoolState::Uninitialized => (PoolPhase::Uninitialized, None),
            PoolState::Active(pool) => (PoolPhase::Active, Some(Arc::clone(pool))),
            PoolState::Closed => (PoolPhase::Closed, None),
        };
        drop(state);

        PoolStatus {
            status: phase,
            min_size: self.config.min_connections,
            max_size: self.config.max_connections,
            closed: pool.as_ref().map_or(true, |p| p.is_closed()),
            open_connections: pool.as_ref().map_or(0, |p| p.size()),
            idle_connections: pool.as_ref().map_or(0, |p| p.idle_count()),
            in_use: pool.as_ref().map_or(0, |p| p.in_use()),
        }
    }

    /// True while an open pool exists.
    pub async fn is_connected(&self) -> bool {
        self.current_pool().await.is_some()
    }
}

/// Delay before retry number `attempt + 1`: `base * 2^(attempt - 1)`,
/// saturating at `Duration::MAX`.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    match 1u32.checked_shl(attempt.saturating_sub(1)) {
        Some(factor) => base.saturating_mul(factor),
        None => Duration::MAX,
    }
}
