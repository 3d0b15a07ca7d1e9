//! Runtime configuration
//!
//! [`DatabaseConfig`] describes how to reach PostgreSQL and how the pool
//! behaves; [`AuthConfig`] covers lockout, session tokens and the secret
//! hash cache. Both load from environment variables or a builder.
//!
//! ```ignore
//! use ordem::{DatabaseConfig, SslMode};
//! use std::time::Duration;
//!
//! // From the environment
//! let config = DatabaseConfig::from_env();
//!
//! // Or programmatically
//! let config = DatabaseConfig::builder()
//!     .host("db.internal")
//!     .database("ordem")
//!     .user("ordem_app")
//!     .password(secret)
//!     .pool_size(5, 20)
//!     .ssl_mode(SslMode::Require)
//!     .build();
//! ```

use std::fmt;
use std::time::Duration;

use crate::error::DatabaseError;
use crate::login::LockoutPolicy;
use crate::parse::{env_duration, env_flag, env_or};

// ============================================================================
// Database
// ============================================================================

/// Connection and pool settings.
///
/// The password never appears in `Debug` output or in
/// [`redacted_connection_string`](Self::redacted_connection_string).
#[derive(Clone)]
pub struct DatabaseConfig {
    /// Full connection URL; when set it takes precedence over the discrete fields
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,

    /// SSL mode for connections
    /// Default: Require
    pub ssl_mode: SslMode,

    /// Bound on a single connection attempt
    /// Default: 10 seconds
    pub connect_timeout: Duration,

    /// Connections opened when the pool is created
    /// Default: 5
    pub min_connections: u32,

    /// Maximum connections lent out at once
    /// Default: 20
    pub max_connections: u32,

    /// Maximum time to wait for a free slot
    /// Default: 30 seconds
    pub acquire_timeout: Duration,

    /// Pool creation attempts before giving up
    /// Default: 3
    pub max_retries: u32,

    /// First backoff delay; doubles after every failed attempt
    /// Default: 1 second
    pub retry_base_delay: Duration,

    /// Period of the background health check
    /// Default: 5 minutes
    pub health_check_interval: Duration,

    /// Age after which the pool is torn down and rebuilt by idle reclamation
    /// Default: 5 minutes
    pub idle_reclaim_after: Duration,
}

/// SSL/TLS mode for database connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Never use SSL (development only!)
    Disable,
    /// Use SSL if available, but don't require it
    Prefer,
    /// Require SSL connection
    #[default]
    Require,
    /// Require SSL and verify server certificate
    VerifyCa,
    /// Require SSL, verify certificate, and verify hostname
    VerifyFull,
}

impl SslMode {
    /// Parse a libpq-style mode name. Unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "disable" => Some(Self::Disable),
            "prefer" => Some(Self::Prefer),
            "require" => Some(Self::Require),
            "verify-ca" | "verifyca" => Some(Self::VerifyCa),
            "verify-full" | "verifyfull" => Some(Self::VerifyFull),
            _ => None,
        }
    }

    /// libpq keyword for this mode
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }
}

#[cfg(feature = "postgres")]
impl From<SslMode> for sqlx::postgres::PgSslMode {
    fn from(mode: SslMode) -> Self {
        use sqlx::postgres::PgSslMode;
        match mode {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Prefer => PgSslMode::Prefer,
            SslMode::Require => PgSslMode::Require,
            SslMode::VerifyCa => PgSslMode::VerifyCa,
            SslMode::VerifyFull => PgSslMode::VerifyFull,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            ssl_mode: SslMode::Require,
            connect_timeout: Duration::from_secs(10),
            min_connections: 5,
            max_connections: 20,
            acquire_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(5 * 60),
            idle_reclaim_after: Duration::from_secs(5 * 60),
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "[redacted]"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[redacted]")
            .field("ssl_mode", &self.ssl_mode)
            .field("connect_timeout", &self.connect_timeout)
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("health_check_interval", &self.health_check_interval)
            .field("idle_reclaim_after", &self.idle_reclaim_after)
            .finish()
    }
}

impl DatabaseConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: full connection URL (optional, overrides the fields below)
    /// - `DB_HOST`, `DB_PORT`, `DB_NAME`, `DB_USER`, `DB_PASSWORD`
    /// - `DB_SSL_MODE`: disable|prefer|require|verify-ca|verify-full (default: require)
    /// - `DB_CONNECT_TIMEOUT` (default: "10s")
    /// - `DB_MIN_CONNECTIONS` (default: 5), `DB_MAX_CONNECTIONS` (default: 20)
    /// - `DB_ACQUIRE_TIMEOUT` (default: "30s")
    /// - `DB_MAX_RETRIES` (default: 3), `DB_RETRY_DELAY` (default: "1s")
    /// - `DB_HEALTH_CHECK_INTERVAL` (default: "5m")
    /// - `DB_IDLE_RECLAIM` (default: "5m")
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let ssl_mode = std::env::var("DB_SSL_MODE")
            .ok()
            .and_then(|s| SslMode::parse(&s))
            .unwrap_or(defaults.ssl_mode);

        Self {
            url: std::env::var("DATABASE_URL").ok().filter(|s| !s.trim().is_empty()),
            host: std::env::var("DB_HOST").unwrap_or(defaults.host),
            port: env_or("DB_PORT", defaults.port),
            database: std::env::var("DB_NAME").unwrap_or(defaults.database),
            user: std::env::var("DB_USER").unwrap_or(defaults.user),
            password: std::env::var("DB_PASSWORD").unwrap_or(defaults.password),
            ssl_mode,
            connect_timeout: env_duration("DB_CONNECT_TIMEOUT", defaults.connect_timeout),
            min_connections: env_or("DB_MIN_CONNECTIONS", defaults.min_connections),
            max_connections: env_or("DB_MAX_CONNECTIONS", defaults.max_connections),
            acquire_timeout: env_duration("DB_ACQUIRE_TIMEOUT", defaults.acquire_timeout),
            max_retries: env_or("DB_MAX_RETRIES", defaults.max_retries),
            retry_base_delay: env_duration("DB_RETRY_DELAY", defaults.retry_base_delay),
            health_check_interval: env_duration(
                "DB_HEALTH_CHECK_INTERVAL",
                defaults.health_check_interval,
            ),
            idle_reclaim_after: env_duration("DB_IDLE_RECLAIM", defaults.idle_reclaim_after),
        }
    }

    /// Create a new builder for programmatic configuration.
    pub fn builder() -> DatabaseConfigBuilder {
        DatabaseConfigBuilder::default()
    }

    /// Reject settings the pool cannot honor.
    pub fn validate(&self) -> Result<(), DatabaseError> {
        if self.max_connections == 0 {
            return Err(DatabaseError::Configuration(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(DatabaseError::Configuration(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.max_retries == 0 {
            return Err(DatabaseError::Configuration(
                "max_retries must be at least 1".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(DatabaseError::Configuration(
                "connect_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// libpq keyword/value connection string.
    pub fn connection_string(&self) -> String {
        self.render_connection_string(&self.password)
    }

    /// Connection string safe to log.
    pub fn redacted_connection_string(&self) -> String {
        self.render_connection_string("***")
    }

    fn render_connection_string(&self, password: &str) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout={}",
            quote_conninfo(&self.host),
            self.port,
            quote_conninfo(&self.database),
            quote_conninfo(&self.user),
            quote_conninfo(password),
            self.ssl_mode.as_str(),
            self.connect_timeout.as_secs().max(1),
        )
    }

    /// Check if SSL is required for this configuration.
    pub fn requires_ssl(&self) -> bool {
        !matches!(self.ssl_mode, SslMode::Disable | SslMode::Prefer)
    }
}

/// Quote a conninfo value when it is empty or contains spaces, quotes or
/// backslashes.
fn quote_conninfo(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

/// Builder for DatabaseConfig
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfigBuilder {
    config: DatabaseConfig,
}

impl DatabaseConfigBuilder {
    /// Use a full connection URL instead of discrete fields
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = Some(url.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = database.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.config.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = password.into();
        self
    }

    /// Set SSL mode
    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.config.ssl_mode = mode;
        self
    }

    /// Set the per-attempt connect timeout (default: 10s)
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set minimum and maximum pool size (default: 5, 20)
    pub fn pool_size(mut self, min: u32, max: u32) -> Self {
        self.config.min_connections = min;
        self.config.max_connections = max;
        self
    }

    /// Set connection acquire timeout (default: 30s)
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    /// Set retry attempts and the first backoff delay (default: 3, 1s)
    pub fn retry(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.config.max_retries = max_retries;
        self.config.retry_base_delay = base_delay;
        self
    }

    /// Set the background health check period (default: 5m)
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    /// Set the idle reclamation age (default: 5m)
    pub fn idle_reclaim_after(mut self, age: Duration) -> Self {
        self.config.idle_reclaim_after = age;
        self
    }

    /// Build the configuration
    pub fn build(self) -> DatabaseConfig {
        self.config
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Login, session token and secret hashing settings.
#[derive(Clone)]
pub struct AuthConfig {
    /// Lockout thresholds
    pub lockout: LockoutPolicy,
    /// HMAC secret for session tokens
    pub token_secret: String,
    /// Session token lifetime
    /// Default: 1 hour
    pub token_lifetime: Duration,
    /// Entries kept by the secret hash cache
    /// Default: 64
    pub hash_cache_capacity: usize,
    /// Accept stored values that equal the submitted secret verbatim
    /// Default: true (legacy rows predate hashing)
    pub allow_plaintext_secrets: bool,
    /// Key lockouts on `X-Forwarded-For` / `X-Real-IP` instead of the socket
    /// address. Only enable behind a proxy that overwrites those headers.
    /// Default: false
    pub trust_proxy: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            lockout: LockoutPolicy::default(),
            token_secret: ephemeral_secret(),
            token_lifetime: Duration::from_secs(60 * 60),
            hash_cache_capacity: 64,
            allow_plaintext_secrets: true,
            trust_proxy: false,
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("lockout", &self.lockout)
            .field("token_secret", &"[redacted]")
            .field("token_lifetime", &self.token_lifetime)
            .field("hash_cache_capacity", &self.hash_cache_capacity)
            .field("allow_plaintext_secrets", &self.allow_plaintext_secrets)
            .field("trust_proxy", &self.trust_proxy)
            .finish()
    }
}

impl AuthConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `AUTH_MAX_ATTEMPTS` (default: 3)
    /// - `AUTH_LOCKOUT_WINDOW` (default: "5m")
    /// - `AUTH_TOKEN_SECRET`: token signing secret; a random per-process
    ///   secret is generated when unset, so tokens do not survive restarts
    /// - `AUTH_TOKEN_LIFETIME` (default: "1h")
    /// - `AUTH_HASH_CACHE_SIZE` (default: 64)
    /// - `AUTH_ALLOW_PLAINTEXT` (default: true)
    /// - `AUTH_TRUST_PROXY` (default: false)
    pub fn from_env() -> Self {
        let defaults = LockoutPolicy::default();
        let lockout = LockoutPolicy::builder()
            .max_attempts(env_or("AUTH_MAX_ATTEMPTS", defaults.max_attempts))
            .lockout_window(env_duration("AUTH_LOCKOUT_WINDOW", defaults.lockout_window))
            .build();

        let token_secret = match std::env::var("AUTH_TOKEN_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                tracing::warn!("AUTH_TOKEN_SECRET not set, using an ephemeral token secret");
                ephemeral_secret()
            }
        };

        Self {
            lockout,
            token_secret,
            token_lifetime: env_duration("AUTH_TOKEN_LIFETIME", Duration::from_secs(60 * 60)),
            hash_cache_capacity: env_or("AUTH_HASH_CACHE_SIZE", 64),
            allow_plaintext_secrets: env_flag("AUTH_ALLOW_PLAINTEXT", true),
            trust_proxy: env_flag("AUTH_TRUST_PROXY", false),
        }
    }
}

fn ephemeral_secret() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}
