//! Configuration file parsing for ordem.toml
//!
//! The file is optional. Settings start from the environment (see
//! `DatabaseConfig::from_env` and `AuthConfig::from_env`); any value present
//! in the file replaces the environment's. Durations are written as strings
//! such as `"30s"`, `"5m"` or `"1h"`.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:5000"
//!
//! [database]
//! host = "db.internal"
//! name = "ordem"
//! user = "app"
//! ssl_mode = "require"
//! max_connections = 20
//! retry_delay = "1s"
//!
//! [auth]
//! max_attempts = 3
//! lockout_window = "5m"
//!
//! [logging]
//! format = "json"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use ordem::observability::{LogFormat, ObservabilityConfig};
use ordem::{parse_duration, AuthConfig, DatabaseConfig, LockoutPolicy, SslMode};

use crate::error::{CliError, Result};

pub const DEFAULT_BIND: &str = "0.0.0.0:5000";

/// Root configuration structure for ordem.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrdemConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub database: DatabaseSection,

    #[serde(default)]
    pub auth: AuthSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// Listen address
    pub bind: Option<String>,
}

/// `[database]` overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSection {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub name: Option<String>,
    pub user: Option<String>,
    /// Prefer `DB_PASSWORD`; the file is usually not secret
    pub password: Option<String>,
    pub ssl_mode: Option<String>,
    pub connect_timeout: Option<String>,
    pub min_connections: Option<u32>,
    pub max_connections: Option<u32>,
    pub acquire_timeout: Option<String>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<String>,
    pub health_check_interval: Option<String>,
    pub idle_reclaim: Option<String>,
}

/// `[auth]` overrides. The token secret is only read from the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSection {
    pub max_attempts: Option<u32>,
    pub lockout_window: Option<String>,
    pub token_lifetime: Option<String>,
    pub hash_cache_size: Option<usize>,
    pub allow_plaintext: Option<bool>,
    /// Key lockouts on forwarded-for headers; only behind a reverse proxy
    pub trust_proxy: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    /// pretty, json or compact
    pub format: Option<String>,
    /// Filter directive, e.g. "info,sqlx=warn"
    pub filter: Option<String>,
    pub request_tracing: Option<bool>,
}

impl OrdemConfig {
    /// Load `path` if it exists; a missing file yields the defaults.
    pub fn load_optional(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    /// Load configuration from a file path
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| CliError::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::from_str(&content, path)
    }

    /// Parse configuration from a string
    pub fn from_str(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| CliError::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn bind_addr(&self, cli_override: Option<String>) -> String {
        cli_override
            .or_else(|| self.server.bind.clone())
            .unwrap_or_else(|| DEFAULT_BIND.to_string())
    }

    /// Database settings: environment, then file overrides.
    pub fn database_config(&self) -> Result<DatabaseConfig> {
        let mut config = DatabaseConfig::from_env();
        let db = &self.database;

        if let Some(url) = &db.url {
            config.url = Some(url.clone());
        }
        replace(&mut config.host, db.host.clone());
        replace(&mut config.port, db.port);
        replace(&mut config.database, db.name.clone());
        replace(&mut config.user, db.user.clone());
        replace(&mut config.password, db.password.clone());
        if let Some(mode) = &db.ssl_mode {
            config.ssl_mode = SslMode::parse(mode)
                .ok_or_else(|| CliError::invalid("database.ssl_mode", format!("unknown mode '{}'", mode)))?;
        }
        replace(&mut config.connect_timeout, duration("database.connect_timeout", &db.connect_timeout)?);
        replace(&mut config.min_connections, db.min_connections);
        replace(&mut config.max_connections, db.max_connections);
        replace(&mut config.acquire_timeout, duration("database.acquire_timeout", &db.acquire_timeout)?);
        replace(&mut config.max_retries, db.max_retries);
        replace(&mut config.retry_base_delay, duration("database.retry_delay", &db.retry_delay)?);
        replace(
            &mut config.health_check_interval,
            duration("database.health_check_interval", &db.health_check_interval)?,
        );
        replace(&mut config.idle_reclaim_after, duration("database.idle_reclaim", &db.idle_reclaim)?);

        config
            .validate()
            .map_err(|e| CliError::validation(e.to_string()))?;
        Ok(config)
    }

    /// Authentication settings: environment, then file overrides.
    pub fn auth_config(&self) -> Result<AuthConfig> {
        let mut config = AuthConfig::from_env();
        let auth = &self.auth;

        if auth.max_attempts.is_some() || auth.lockout_window.is_some() {
            let mut lockout = LockoutPolicy::builder()
                .max_attempts(auth.max_attempts.unwrap_or(config.lockout.max_attempts));
            let window = duration("auth.lockout_window", &auth.lockout_window)?;
            lockout = lockout.lockout_window(window.unwrap_or(config.lockout.lockout_window));
            config.lockout = lockout.build();
        }
        replace(&mut config.token_lifetime, duration("auth.token_lifetime", &auth.token_lifetime)?);
        replace(&mut config.hash_cache_capacity, auth.hash_cache_size);
        replace(&mut config.allow_plaintext_secrets, auth.allow_plaintext);
        replace(&mut config.trust_proxy, auth.trust_proxy);

        Ok(config)
    }

    /// Logging settings: environment, then file overrides. `verbose` forces
    /// a debug filter.
    pub fn observability_config(&self, verbose: bool) -> Result<ObservabilityConfig> {
        let mut config = ObservabilityConfig::from_env();
        let logging = &self.logging;

        if let Some(format) = &logging.format {
            config.log_format = LogFormat::parse(format)
                .ok_or_else(|| CliError::invalid("logging.format", format!("unknown format '{}'", format)))?;
        }
        replace(&mut config.log_filter, logging.filter.clone());
        replace(&mut config.enable_request_tracing, logging.request_tracing);

        if verbose {
            config.log_filter = "debug".to_string();
        }
        Ok(config)
    }
}

fn replace<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn duration(field: &str, value: &Option<String>) -> Result<Option<Duration>> {
    match value {
        None => Ok(None),
        Some(raw) => parse_duration(raw)
            .map(Some)
            .ok_or_else(|| CliError::invalid(field, format!("'{}' is not a duration", raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<OrdemConfig> {
        OrdemConfig::from_str(content, Path::new("ordem.toml"))
    }

    #[test]
    fn test_empty_file_is_default() {
        let config = parse("").unwrap();
        assert!(config.server.bind.is_none());
        assert_eq!(config.bind_addr(None), DEFAULT_BIND);
    }

    #[test]
    fn test_database_overrides() {
        let config = parse(
            r#"
            [database]
            host = "db.internal"
            port = 6543
            name = "ordem"
            ssl_mode = "disable"
            min_connections = 2
            max_connections = 8
            retry_delay = "250ms"
            idle_reclaim = "10m"
            "#,
        )
        .unwrap();

        let db = config.database_config().unwrap();
        assert_eq!(db.host, "db.internal");
        assert_eq!(db.port, 6543);
        assert_eq!(db.database, "ordem");
        assert_eq!(db.ssl_mode, SslMode::Disable);
        assert_eq!(db.min_connections, 2);
        assert_eq!(db.max_connections, 8);
        assert_eq!(db.retry_base_delay, Duration::from_millis(250));
        assert_eq!(db.idle_reclaim_after, Duration::from_secs(600));
    }

    #[test]
    fn test_bad_duration_is_reported() {
        let config = parse("[database]\nacquire_timeout = \"soon\"\n").unwrap();
        let err = config.database_config().unwrap_err();
        assert!(err.to_string().contains("database.acquire_timeout"));
    }

    #[test]
    fn test_inconsistent_pool_bounds_fail_validation() {
        let config = parse("[database]\nmin_connections = 9\nmax_connections = 3\n").unwrap();
        assert!(matches!(
            config.database_config(),
            Err(CliError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn test_auth_overrides() {
        let config = parse(
            r#"
            [auth]
            max_attempts = 5
            lockout_window = "15m"
            allow_plaintext = false
            trust_proxy = true
            "#,
        )
        .unwrap();

        let auth = config.auth_config().unwrap();
        assert!(auth.trust_proxy);
        assert_eq!(auth.lockout.max_attempts, 5);
        assert_eq!(auth.lockout.lockout_window, Duration::from_secs(900));
        assert!(!auth.allow_plaintext_secrets);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(parse("[database]\nhots = \"typo\"\n").is_err());
    }

    #[test]
    fn test_cli_bind_wins() {
        let config = parse("[server]\nbind = \"127.0.0.1:8080\"\n").unwrap();
        assert_eq!(config.bind_addr(None), "127.0.0.1:8080");
        assert_eq!(config.bind_addr(Some("0.0.0.0:9000".into())), "0.0.0.0:9000");
    }

    #[test]
    fn test_logging_overrides() {
        let config = parse("[logging]\nformat = \"json\"\nfilter = \"warn\"\n").unwrap();
        let logging = config.observability_config(false).unwrap();
        assert_eq!(logging.log_format, LogFormat::Json);
        assert_eq!(logging.log_filter, "warn");

        assert_eq!(config.observability_config(true).unwrap().log_filter, "debug");
    }
}
