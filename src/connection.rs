//! Connection backend seam
//!
//! The pool and the manager only see these two traits. The PostgreSQL
//! backend lives in [`crate::postgres`]; tests use the in-memory backend in
//! [`crate::testing`].

use async_trait::async_trait;

use crate::error::DatabaseError;

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A positional statement parameter (`$1`, `$2`, ...).
pub type Param = serde_json::Value;

/// A single database session.
#[async_trait]
pub trait Connection: Send {
    /// Local check only: true once the session is known to be unusable.
    fn is_closed(&self) -> bool;

    /// Round-trip liveness ping.
    async fn ping(&mut self) -> Result<(), DatabaseError>;

    /// Run one statement and fetch every row it produces. Statements
    /// without a result set yield an empty vector.
    ///
    /// Errors that leave the session unusable must be reported as
    /// [`DatabaseError::ConnectionLost`] and make `is_closed` return true.
    async fn query(&mut self, sql: &str, params: &[Param]) -> Result<Vec<Row>, DatabaseError>;

    /// Undo whatever the previous borrower left behind, so the session can
    /// be lent again: an open transaction is rolled back.
    async fn reset(&mut self) -> Result<(), DatabaseError>;

    /// Terminate the session. Calling it twice is harmless.
    async fn close(&mut self) -> Result<(), DatabaseError>;
}

/// Opens new sessions from static configuration.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>, DatabaseError>;

    /// Target description for logs; must not contain credentials.
    fn describe(&self) -> String;
}
