//! PostgreSQL backend (sqlx)
//!
//! One [`PgSession`] wraps one `PgConnection`; pooling is done by
//! [`ConnectionPool`](crate::pool::ConnectionPool), not by sqlx.
//!
//! Result rows are converted to JSON by column type. Unrecognized types are
//! read as text when the driver allows it and become `null` otherwise.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Number, Value};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, Postgres, Row as _, TypeInfo};
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::connection::{Connection, ConnectionFactory, Param, Row};
use crate::error::DatabaseError;

/// Opens PostgreSQL sessions from [`DatabaseConfig`].
#[derive(Debug, Clone)]
pub struct PgConnectionFactory {
    options: PgConnectOptions,
    connect_timeout: Duration,
    description: String,
}

impl PgConnectionFactory {
    pub fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let options = match &config.url {
            Some(url) => PgConnectOptions::from_str(url)
                .map_err(|e| DatabaseError::Configuration(format!("Invalid DATABASE_URL: {}", e)))?,
            None => PgConnectOptions::new()
                .host(&config.host)
                .port(config.port)
                .database(&config.database)
                .username(&config.user)
                .password(&config.password),
        }
        .ssl_mode(config.ssl_mode.into())
        .disable_statement_logging();

        let description = format!(
            "postgres://{}:{}/{}",
            options.get_host(),
            options.get_port(),
            options.get_database().unwrap_or_default()
        );

        Ok(Self {
            options,
            connect_timeout: config.connect_timeout,
            description,
        })
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>, DatabaseError> {
        let connecting = <PgConnection as sqlx::Connection>::connect_with(&self.options);

        let conn = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| {
                DatabaseError::Connect(format!("timed out after {:?}", self.connect_timeout))
            })?
            .map_err(|e| DatabaseError::Connect(e.to_string()))?;

        debug!(database = %self.description, "Opened database session");
        Ok(Box::new(PgSession {
            conn: Some(conn),
            broken: false,
            in_transaction: false,
        }))
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

/// A single PostgreSQL session.
pub struct PgSession {
    conn: Option<PgConnection>,
    broken: bool,
    /// Set by a successful `BEGIN` / `START TRANSACTION`, cleared by
    /// `COMMIT` / `ROLLBACK` or a reset
    in_transaction: bool,
}

impl PgSession {
    fn live(&mut self) -> Result<&mut PgConnection, DatabaseError> {
        if self.broken {
            return Err(DatabaseError::ConnectionLost("session is broken".into()));
        }
        self.conn
            .as_mut()
            .ok_or_else(|| DatabaseError::ConnectionLost("session is closed".into()))
    }

    /// Classify a driver error, marking the session broken when the
    /// transport failed.
    fn fail(&mut self, err: sqlx::Error) -> DatabaseError {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed => {
                self.broken = true;
                DatabaseError::ConnectionLost(err.to_string())
            }
            other => DatabaseError::Query(other.to_string()),
        }
    }
}

#[async_trait]
impl Connection for PgSession {
    fn is_closed(&self) -> bool {
        self.broken || self.conn.is_none()
    }

    async fn ping(&mut self) -> Result<(), DatabaseError> {
        let result = sqlx::Connection::ping(self.live()?).await;
        result.map_err(|e| {
            self.broken = true;
            DatabaseError::ConnectionLost(e.to_string())
        })
    }

    async fn query(&mut self, sql: &str, params: &[Param]) -> Result<Vec<Row>, DatabaseError> {
        let query = params.iter().fold(sqlx::query(sql), bind_param);
        let result = query.fetch_all(self.live()?).await;

        match result {
            Ok(rows) => {
                if let Some(open) = transaction_effect(sql) {
                    self.in_transaction = open;
                }
                Ok(rows.iter().map(row_to_json).collect())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn reset(&mut self) -> Result<(), DatabaseError> {
        if !self.in_transaction {
            return Ok(());
        }
        let conn: &mut PgConnection = self.live()?;
        let result = sqlx::Executor::execute(conn, sqlx::raw_sql("ROLLBACK")).await;
        result.map_err(|e| self.fail(e))?;

        self.in_transaction = false;
        debug!("Rolled back transaction left open by the previous borrower");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DatabaseError> {
        match self.conn.take() {
            Some(conn) => sqlx::Connection::close(conn)
                .await
                .map_err(|e| DatabaseError::ConnectionLost(e.to_string())),
            None => Ok(()),
        }
    }
}

/// Whether a statement opens (`Some(true)`) or ends (`Some(false)`) a
/// transaction block. `ROLLBACK TO SAVEPOINT` keeps the block open.
fn transaction_effect(sql: &str) -> Option<bool> {
    let mut words = sql
        .split(|c: char| c.is_whitespace() || c == ';')
        .filter(|w| !w.is_empty());
    let first = words.next()?.to_ascii_uppercase();

    match first.as_str() {
        "BEGIN" => Some(true),
        "START" => words
            .next()
            .filter(|w| w.eq_ignore_ascii_case("TRANSACTION"))
            .map(|_| true),
        "COMMIT" | "END" | "ABORT" => Some(false),
        "ROLLBACK" => {
            if words.any(|w| w.eq_ignore_ascii_case("TO")) {
                None
            } else {
                Some(false)
            }
        }
        _ => None,
    }
}

fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: &Param,
) -> Query<'q, Postgres, PgArguments> {
    match param {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(sqlx::types::Json(other.clone())),
    }
}

fn row_to_json(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .map(|column| {
            let index = column.ordinal();
            let value = column_value(row, index, column.type_info().name());
            (column.name().to_string(), value)
        })
        .collect()
}

fn column_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name {
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::Bool),
        "INT2" => int_value(row.try_get::<Option<i16>, _>(index).ok().flatten().map(i64::from)),
        "INT4" => int_value(row.try_get::<Option<i32>, _>(index).ok().flatten().map(i64::from)),
        "INT8" => int_value(row.try_get::<Option<i64>, _>(index).ok().flatten()),
        "FLOAT4" => float_value(row.try_get::<Option<f32>, _>(index).ok().flatten().map(f64::from)),
        "FLOAT8" => float_value(row.try_get::<Option<f64>, _>(index).ok().flatten()),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(index)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
            .ok()
            .flatten()
            .map_or(Value::Null, |t| Value::String(t.to_rfc3339())),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .ok()
            .flatten()
            .map_or(Value::Null, |t| Value::String(t.to_string())),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(index)
            .ok()
            .flatten()
            .map_or(Value::Null, |d| Value::String(d.to_string())),
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::String),
    }
}

fn int_value(value: Option<i64>) -> Value {
    value.map_or(Value::Null, |i| Value::Number(Number::from(i)))
}

fn float_value(value: Option<f64>) -> Value {
    value
        .and_then(Number::from_f64)
        .map_or(Value::Null, Value::Number)
}
