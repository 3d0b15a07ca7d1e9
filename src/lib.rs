//! # ordem
//!
//! Database access core for the work-order service.
//!
//! ## Features
//!
//! - **Connection pool manager**: lazy creation with retry and exponential
//!   backoff, ping-validated checkout, periodic health checks and idle
//!   reclamation ([`DatabaseManager`])
//! - **Bounded pool**: semaphore-limited borrow/return, safe for concurrent
//!   borrowers ([`pool`])
//! - **Credential verification**: legacy plaintext or SHA-256 digests,
//!   constant-time comparison, bounded digest cache ([`CredentialVerifier`])
//! - **Login lockout** per (username, client address) ([`LoginTracker`])
//! - **Session tokens** (HS256 JWT) and a small HTTP API ([`api`])
//! - **Structured logging** with security events ([`observability`])
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use ordem::{api, AuthConfig, DatabaseConfig, DatabaseManager};
//! use ordem::observability::{init, ObservabilityConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init(ObservabilityConfig::from_env())?;
//!
//!     let manager = Arc::new(DatabaseManager::postgres(DatabaseConfig::from_env())?);
//!     let state = api::AppState::new(Arc::clone(&manager), &AuthConfig::from_env());
//!     let app = api::router(state, true);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:5000").await?;
//!     axum::serve(listener, app).await?;
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod api;
mod config;
pub mod connection;
pub mod credentials;
mod crypto;
pub mod database;
pub mod error;
pub mod hash_cache;
pub mod health;
pub mod login;
pub mod observability;
mod parse;
pub mod pool;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-exports
pub use config::{AuthConfig, DatabaseConfig, DatabaseConfigBuilder, SslMode};
pub use connection::{Connection, ConnectionFactory, Param, Row};
pub use credentials::{CredentialVerifier, UserIdentity, UserProfile};
pub use crypto::{constant_time_eq, constant_time_str_eq, sha256_hex};
pub use database::{DatabaseManager, PoolPhase, PoolStatus};
pub use error::{AppError, DatabaseError, ErrorKind};
pub use health::{HealthMonitor, HealthStatus, MonitorConfig, Status};
pub use login::{LockoutPolicy, LoginKey, LoginTracker};
pub use observability::ObservabilityConfigBuilder;
pub use parse::parse_duration;
pub use pool::{ConnectionPool, PoolSettings, PooledConnection};
pub use session::{Claims, TokenError, TokenIssuer};

#[cfg(feature = "postgres")]
pub use postgres::PgConnectionFactory;
