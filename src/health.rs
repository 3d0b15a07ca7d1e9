//! Health Checks and Background Monitoring
//!
//! [`HealthStatus`] is the result of a single check, as returned by
//! [`DatabaseManager::health_check`](crate::DatabaseManager::health_check).
//! [`HealthMonitor`] runs that check on a fixed period together with idle
//! reclamation, and raises a critical event after repeated failures.
//!
//! # Usage
//!
//! ```ignore
//! use ordem::health::{HealthMonitor, MonitorConfig};
//!
//! let monitor = HealthMonitor::spawn(Arc::clone(&manager), MonitorConfig::from(manager.config()));
//! // ...
//! monitor.stop();
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::database::DatabaseManager;
use crate::observability::SecurityEvent;

// ============================================================================
// Health Status
// ============================================================================

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Functioning normally
    Healthy,
    /// Degraded but still functional
    Degraded,
    /// Not functioning
    Unhealthy,
}

impl Status {
    /// Check if status indicates the system is operational
    pub fn is_operational(&self) -> bool {
        matches!(self, Status::Healthy | Status::Degraded)
    }

    /// Get the worst status between two
    pub fn worst(self, other: Status) -> Status {
        match (self, other) {
            (Status::Unhealthy, _) | (_, Status::Unhealthy) => Status::Unhealthy,
            (Status::Degraded, _) | (_, Status::Degraded) => Status::Degraded,
            _ => Status::Healthy,
        }
    }
}

/// Result of a single health check
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub status: Status,
    pub message: Option<String>,
    /// Additional details as key-value pairs
    pub details: HashMap<String, String>,
    /// How long the check took
    pub duration: Duration,
    pub checked_at: Instant,
}

impl HealthStatus {
    fn with_status(status: Status, message: Option<String>) -> Self {
        Self {
            status,
            message,
            details: HashMap::new(),
            duration: Duration::ZERO,
            checked_at: Instant::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(Status::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(Status::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(Status::Unhealthy, Some(message.into()))
    }

    /// Add a detail to the status
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Set the duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status == Status::Healthy
    }

    /// Convert to a JSON-serializable format
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": self.status,
            "message": self.message,
            "details": self.details,
            "duration_ms": self.duration.as_millis() as u64,
        })
    }
}

// ============================================================================
// Background Monitor
// ============================================================================

/// Configuration for the background monitor
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Interval between checks
    pub interval: Duration,
    /// Consecutive failed checks before raising a critical event
    pub failure_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            failure_threshold: 3,
        }
    }
}

impl From<&DatabaseConfig> for MonitorConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            interval: config.health_check_interval,
            ..Self::default()
        }
    }
}

/// Periodic pool health check and idle reclamation.
///
/// The first check runs one interval after spawning. The task is aborted
/// by [`stop`](Self::stop) or when the monitor is dropped.
#[derive(Debug)]
pub struct HealthMonitor {
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    /// Start monitoring on the current tokio runtime.
    pub fn spawn(manager: Arc<DatabaseManager>, config: MonitorConfig) -> Self {
        info!(
            interval_secs = config.interval.as_secs(),
            failure_threshold = config.failure_threshold,
            "Starting database health monitor"
        );
        let handle = tokio::spawn(run(manager, config));
        Self { handle }
    }

    /// Stop the monitor. Any check in progress is abandoned.
    pub fn stop(self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(manager: Arc<DatabaseManager>, config: MonitorConfig) {
    let period = config.interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failures: u32 = 0;

    loop {
        ticker.tick().await;

        let health = manager.health_check().await;
        if health.is_healthy() {
            if failures > 0 {
                info!(previous_failures = failures, "Database health restored");
            }
            failures = 0;
            debug!(duration_ms = health.duration.as_millis() as u64, "Database health check passed");
        } else {
            failures = failures.saturating_add(1);
            warn!(
                consecutive_failures = failures,
                message = health.message.as_deref().unwrap_or(""),
                "Database health check failed"
            );
            if failures == config.failure_threshold {
                crate::security_event!(
                    SecurityEvent::DatabaseDisconnected,
                    consecutive_failures = failures,
                    "Database health check failing repeatedly"
                );
            }
        }

        manager.cleanup_idle_connections().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDatabase;

    #[test]
    fn test_status_worst() {
        assert_eq!(Status::Healthy.worst(Status::Healthy), Status::Healthy);
        assert_eq!(Status::Healthy.worst(Status::Degraded), Status::Degraded);
        assert_eq!(Status::Degraded.worst(Status::Unhealthy), Status::Unhealthy);
        assert!(Status::Degraded.is_operational());
        assert!(!Status::Unhealthy.is_operational());
    }

    #[test]
    fn test_health_status_to_json() {
        let status = HealthStatus::unhealthy("check failed")
            .with_detail("open_connections", "0")
            .with_duration(Duration::from_millis(12));
        let json = status.to_json();

        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["message"], "check failed");
        assert_eq!(json["details"]["open_connections"], "0");
        assert_eq!(json["duration_ms"], 12);
    }

    #[test]
    fn test_monitor_config_from_database_config() {
        let db = DatabaseConfig::builder()
            .health_check_interval(Duration::from_secs(60))
            .build();
        let config = MonitorConfig::from(&db);
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.failure_threshold, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reclaims_idle_pool() {
        let db = MemoryDatabase::new();
        let config = DatabaseConfig::builder()
            .pool_size(1, 4)
            .health_check_interval(Duration::from_secs(300))
            .idle_reclaim_after(Duration::from_secs(200))
            .build();
        let manager = Arc::new(DatabaseManager::new(config, Arc::new(db.clone())).unwrap());
        let original = manager.create_pool().await.unwrap();

        let monitor = HealthMonitor::spawn(Arc::clone(&manager), MonitorConfig::from(manager.config()));
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_secs(301)).await;

        assert!(original.is_closed());
        assert!(manager.is_connected().await);
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_does_not_create_missing_pool() {
        let db = MemoryDatabase::new();
        let config = DatabaseConfig::builder()
            .health_check_interval(Duration::from_secs(10))
            .build();
        let manager = Arc::new(DatabaseManager::new(config, Arc::new(db.clone())).unwrap());

        let monitor = HealthMonitor::spawn(Arc::clone(&manager), MonitorConfig::from(manager.config()));
        tokio::time::sleep(Duration::from_secs(35)).await;

        assert_eq!(db.connect_attempts(), 0);
        monitor.stop();
    }
}
