//! In-memory connection backend for tests
//!
//! [`MemoryDatabase`] implements [`ConnectionFactory`] over shared in-process
//! state. It understands the handful of statements this crate issues (the
//! `usuarios` lookups, `SELECT 1`) plus a tiny key/value table with
//! session-local `BEGIN` / `COMMIT` / `ROLLBACK`, and lets a
//! test inject the failures the pool has to survive: an unreachable server,
//! sessions that fail their liveness ping, queries that break the session,
//! and server-side disconnects.
//!
//! ```ignore
//! use ordem::testing::MemoryDatabase;
//!
//! let db = MemoryDatabase::new().with_user("maria", "Maria", "tecnico", "secret");
//! let manager = DatabaseManager::new(config, Arc::new(db.clone()))?;
//!
//! db.fail_next_pings(1);
//! let conn = manager.get_connection().await?; // the failing session is skipped
//! assert_eq!(db.sessions_closed(), 1);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::connection::{Connection, ConnectionFactory, Param, Row};
use crate::credentials::{EXISTS_SQL, LOOKUP_SQL, PROFILE_SQL};
use crate::error::DatabaseError;

/// Insert into the key/value table: `$1` key, `$2` value.
pub const KV_INSERT_SQL: &str = "INSERT INTO kv (key, value) VALUES ($1, $2)";

/// Read from the key/value table: `$1` key.
pub const KV_SELECT_SQL: &str = "SELECT value FROM kv WHERE key = $1";

#[derive(Debug, Clone)]
struct StoredUser {
    name: String,
    role: String,
    secret: String,
}

#[derive(Debug, Default)]
struct State {
    reachable: AtomicBool,
    generation: AtomicU64,
    pending_ping_failures: AtomicU32,
    pending_query_failures: AtomicU32,
    opened: AtomicU32,
    rollbacks: AtomicU32,
    closed: AtomicU32,
    connect_log: Mutex<Vec<Instant>>,
    query_delay: Mutex<Option<Duration>>,
    ping_delay: Mutex<Option<Duration>>,
    users: Mutex<HashMap<String, StoredUser>>,
    kv: Mutex<HashMap<String, Value>>,
}

/// Shared in-memory database. Clones observe and control the same state.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    state: Arc<State>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    /// A reachable, empty database
    pub fn new() -> Self {
        let db = Self {
            state: Arc::new(State::default()),
        };
        db.state.reachable.store(true, Ordering::SeqCst);
        db
    }

    /// A database that refuses every connection attempt
    pub fn unreachable() -> Self {
        let db = Self::new();
        db.set_reachable(false);
        db
    }

    /// Add a row to `usuarios`. `stored_secret` is kept verbatim, so pass
    /// either a legacy plaintext value or a hex digest.
    pub fn with_user(self, login: &str, name: &str, role: &str, stored_secret: &str) -> Self {
        self.state.users.lock().insert(
            login.to_string(),
            StoredUser {
                name: name.to_string(),
                role: role.to_string(),
                secret: stored_secret.to_string(),
            },
        );
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// The next `n` liveness pings fail and break their session.
    pub fn fail_next_pings(&self, n: u32) {
        self.state.pending_ping_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` queries fail with a lost connection.
    pub fn fail_next_queries(&self, n: u32) {
        self.state.pending_query_failures.store(n, Ordering::SeqCst);
    }

    /// Simulate the server dropping every open session.
    pub fn disconnect_all(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Make every query take this long.
    pub fn set_query_delay(&self, delay: Duration) {
        *self.state.query_delay.lock() = Some(delay);
    }

    /// Make every liveness ping take this long.
    pub fn set_ping_delay(&self, delay: Duration) {
        *self.state.ping_delay.lock() = Some(delay);
    }

    /// Transactions rolled back by a session reset.
    pub fn reset_rollbacks(&self) -> u32 {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    /// Connection attempts so far, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.state.connect_log.lock().len()
    }

    /// When each connection attempt happened.
    pub fn connect_times(&self) -> Vec<Instant> {
        self.state.connect_log.lock().clone()
    }

    pub fn sessions_opened(&self) -> u32 {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Sessions closed explicitly or dropped.
    pub fn sessions_closed(&self) -> u32 {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Sessions currently open.
    pub fn live_sessions(&self) -> u32 {
        self.sessions_opened().saturating_sub(self.sessions_closed())
    }
}

#[async_trait]
impl ConnectionFactory for MemoryDatabase {
    async fn connect(&self) -> Result<Box<dyn Connection>, DatabaseError> {
        self.state.connect_log.lock().push(Instant::now());

        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(DatabaseError::Connect("connection refused".into()));
        }

        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            generation: self.state.generation.load(Ordering::SeqCst),
            broken: false,
            closed: false,
            transaction: None,
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemorySession {
    state: Arc<State>,
    generation: u64,
    broken: bool,
    closed: bool,
    /// Uncommitted key/value writes while a transaction is open
    transaction: Option<HashMap<String, Value>>,
}

impl MemorySession {
    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn mark_closed(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn execute(&mut self, sql: &str, params: &[Param]) -> Result<Vec<Row>, DatabaseError> {
        let text = |i: usize| text_param(params, i);

        let statement = sql.trim();
        if statement.eq_ignore_ascii_case("BEGIN") {
            self.transaction.get_or_insert_with(HashMap::new);
            return Ok(Vec::new());
        }
        if statement.eq_ignore_ascii_case("COMMIT") {
            if let Some(writes) = self.transaction.take() {
                self.state.kv.lock().extend(writes);
            }
            return Ok(Vec::new());
        }
        if statement.eq_ignore_ascii_case("ROLLBACK") {
            self.transaction = None;
            return Ok(Vec::new());
        }
        if statement.eq_ignore_ascii_case("SELECT 1") {
            return Ok(vec![row(json!({ "?column?": 1 }))]);
        }
        if statement == LOOKUP_SQL {
            let users = self.state.users.lock();
            return Ok(users
                .get(text(0)?)
                .map(|u| row(json!({ "nome": u.name, "cargo": u.role, "senha": u.secret })))
                .into_iter()
                .collect());
        }
        if statement == EXISTS_SQL {
            let users = self.state.users.lock();
            return Ok(users
                .contains_key(text(0)?)
                .then(|| row(json!({ "?column?": 1 })))
                .into_iter()
                .collect());
        }
        if statement == PROFILE_SQL {
            let login = text(0)?;
            let users = self.state.users.lock();
            return Ok(users
                .get(login)
                .map(|u| row(json!({ "usuario": login, "nome": u.name, "cargo": u.role })))
                .into_iter()
                .collect());
        }
        if statement == KV_INSERT_SQL {
            let key = text(0)?.to_string();
            let value = params.get(1).cloned().unwrap_or(Value::Null);
            match &mut self.transaction {
                Some(writes) => writes.insert(key, value),
                None => self.state.kv.lock().insert(key, value),
            };
            return Ok(Vec::new());
        }
        if statement == KV_SELECT_SQL {
            let key = text(0)?;
            let uncommitted = self.transaction.as_ref().and_then(|w| w.get(key)).cloned();
            let value = uncommitted.or_else(|| self.state.kv.lock().get(key).cloned());
            return Ok(value
                .map(|v| row(json!({ "value": v })))
                .into_iter()
                .collect());
        }

        Err(DatabaseError::Query(format!("unsupported statement: {}", statement)))
    }
}

fn text_param(params: &[Param], i: usize) -> Result<&str, DatabaseError> {
    params
        .get(i)
        .and_then(Value::as_str)
        .ok_or_else(|| DatabaseError::Query(format!("missing text parameter ${}", i + 1)))
}

fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

#[async_trait]
impl Connection for MemorySession {
    fn is_closed(&self) -> bool {
        self.closed
            || self.broken
            || self.generation != self.state.generation.load(Ordering::SeqCst)
    }

    async fn ping(&mut self) -> Result<(), DatabaseError> {
        let delay = *self.state.ping_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.is_closed() {
            return Err(DatabaseError::ConnectionLost("session closed".into()));
        }
        if Self::take_failure(&self.state.pending_ping_failures) {
            self.broken = true;
            return Err(DatabaseError::ConnectionLost("server closed the connection".into()));
        }
        Ok(())
    }

    async fn query(&mut self, sql: &str, params: &[Param]) -> Result<Vec<Row>, DatabaseError> {
        let delay = *self.state.query_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.is_closed() {
            return Err(DatabaseError::ConnectionLost("session closed".into()));
        }
        if Self::take_failure(&self.state.pending_query_failures) {
            self.broken = true;
            return Err(DatabaseError::ConnectionLost("server closed the connection".into()));
        }
        self.execute(sql, params)
    }

    async fn reset(&mut self) -> Result<(), DatabaseError> {
        if self.is_closed() {
            return Err(DatabaseError::ConnectionLost("session closed".into()));
        }
        if self.transaction.take().is_some() {
            self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DatabaseError> {
        self.mark_closed();
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_refuses_connections() {
        let db = MemoryDatabase::unreachable();
        assert!(matches!(db.connect().await, Err(DatabaseError::Connect(_))));
        assert_eq!(db.connect_attempts(), 1);
        assert_eq!(db.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_all_closes_existing_sessions() {
        let db = MemoryDatabase::new();
        let before = db.connect().await.unwrap();
        db.disconnect_all();
        let after = db.connect().await.unwrap();

        assert!(before.is_closed());
        assert!(!after.is_closed());
    }

    #[tokio::test]
    async fn test_session_accounting() {
        let db = MemoryDatabase::new();
        let mut a = db.connect().await.unwrap();
        let b = db.connect().await.unwrap();
        assert_eq!(db.live_sessions(), 2);

        a.close().await.unwrap();
        a.close().await.unwrap();
        drop(b);
        assert_eq!(db.sessions_closed(), 2);
        assert_eq!(db.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_unknown_statement_is_a_query_error() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect().await.unwrap();
        let err = conn.query("DROP TABLE usuarios", &[]).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Query(_)));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_transaction_writes_are_session_local_until_commit() {
        let db = MemoryDatabase::new();
        let mut writer = db.connect().await.unwrap();
        let mut reader = db.connect().await.unwrap();

        writer.query("BEGIN", &[]).await.unwrap();
        writer.query(KV_INSERT_SQL, &[json!("os:1"), json!("aberta")]).await.unwrap();
        assert_eq!(writer.query(KV_SELECT_SQL, &[json!("os:1")]).await.unwrap().len(), 1);
        assert!(reader.query(KV_SELECT_SQL, &[json!("os:1")]).await.unwrap().is_empty());

        writer.query("COMMIT", &[]).await.unwrap();
        assert_eq!(reader.query(KV_SELECT_SQL, &[json!("os:1")]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_rolls_back_open_transaction() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect().await.unwrap();

        conn.reset().await.unwrap();
        assert_eq!(db.reset_rollbacks(), 0);

        conn.query("BEGIN", &[]).await.unwrap();
        conn.query(KV_INSERT_SQL, &[json!("os:2"), json!("rascunho")]).await.unwrap();
        conn.reset().await.unwrap();

        assert_eq!(db.reset_rollbacks(), 1);
        assert!(conn.query(KV_SELECT_SQL, &[json!("os:2")]).await.unwrap().is_empty());
    }
}
