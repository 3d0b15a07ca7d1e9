//! Login Attempt Tracking
//!
//! Consecutive failed logins are counted per (username, client address).
//! Once a key reaches the policy threshold, further attempts from it are
//! rejected until the lockout window has passed since its last failure. A
//! successful login, or the window expiring, resets the count. Other clients
//! trying the same username are unaffected.
//!
//! Records live in memory and are never evicted; an expired record is
//! treated as reset the next time its key is checked.
//!
//! # Usage
//!
//! ```ignore
//! use ordem::login::{LoginKey, LoginTracker, LockoutPolicy};
//!
//! let tracker = LoginTracker::new(LockoutPolicy::default()); // 3 failures, 5 min
//! let key = LoginKey::new(&username, &client_ip);
//!
//! // Check BEFORE verifying credentials
//! if let Some(lockout) = tracker.check_lockout(&key) {
//!     return Err(AppError::locked_out(lockout.remaining_secs()));
//! }
//!
//! match verifier.verify_credentials(&username, &secret).await? {
//!     Some(identity) => tracker.record_success(&key),
//!     None => {
//!         tracker.record_failure(&key);
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use crate::observability::SecurityEvent;

// ============================================================================
// Lockout Policy
// ============================================================================

/// Lockout thresholds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockoutPolicy {
    /// Consecutive failures before the key is locked
    pub max_attempts: u32,

    /// How long a locked key stays locked after its last failure.
    /// Records idle for longer than this are treated as reset.
    pub lockout_window: Duration,
}

impl Default for LockoutPolicy {
    /// 3 failed attempts, 5 minute window
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lockout_window: Duration::from_secs(5 * 60),
        }
    }
}

impl LockoutPolicy {
    /// Create a new builder
    pub fn builder() -> LockoutPolicyBuilder {
        LockoutPolicyBuilder::default()
    }
}

/// Builder for LockoutPolicy
#[derive(Debug, Default)]
pub struct LockoutPolicyBuilder {
    policy: LockoutPolicy,
}

impl LockoutPolicyBuilder {
    /// Set failures before lockout (minimum 1)
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts.max(1);
        self
    }

    /// Set the lockout window
    pub fn lockout_window(mut self, window: Duration) -> Self {
        self.policy.lockout_window = window;
        self
    }

    /// Build the policy
    pub fn build(self) -> LockoutPolicy {
        self.policy
    }
}

// ============================================================================
// Records
// ============================================================================

/// Identifies who is attempting to log in and from where.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoginKey {
    pub username: String,
    pub client: String,
}

impl LoginKey {
    pub fn new(username: impl Into<String>, client: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            client: client.into(),
        }
    }
}

impl fmt::Display for LoginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.username, self.client)
    }
}

/// Failure history for one key
#[derive(Debug, Clone, Copy)]
pub struct AttemptRecord {
    /// Consecutive failures
    pub failures: u32,
    /// Time of the most recent failure (or of the last reset)
    pub last_attempt: Instant,
}

/// Result of recording a failed attempt
#[derive(Debug, Clone)]
pub struct AttemptResult {
    /// Consecutive failures, including this one
    pub failed_count: u32,
    /// Failures left before the key locks
    pub remaining_attempts: u32,
    /// Whether the key is now locked
    pub is_locked_out: bool,
}

/// Returned by [`LoginTracker::check_lockout`] while a key is locked
#[derive(Debug, Clone)]
pub struct LockoutInfo {
    /// Failures that caused the lockout
    pub failed_count: u32,
    /// Time left until the window closes
    pub remaining: Duration,
}

impl LockoutInfo {
    /// Remaining lockout time in whole seconds, rounded up.
    ///
    /// Always at least 1 while locked, never more than the window.
    pub fn remaining_secs(&self) -> u64 {
        let secs = self.remaining.as_secs();
        if self.remaining.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}

// ============================================================================
// Login Tracker
// ============================================================================

/// In-memory login attempt tracker.
///
/// Cloning is cheap; clones share the same records.
#[derive(Debug, Clone)]
pub struct LoginTracker {
    policy: LockoutPolicy,
    records: Arc<RwLock<HashMap<LoginKey, AttemptRecord>>>,
}

impl LoginTracker {
    /// Create a new login tracker with the given policy
    pub fn new(policy: LockoutPolicy) -> Self {
        Self {
            policy,
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a tracker with default policy
    pub fn with_default_policy() -> Self {
        Self::new(LockoutPolicy::default())
    }

    pub fn policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    /// Check whether a key is locked out.
    ///
    /// A record whose last failure is older than the window is reset here.
    pub fn check_lockout(&self, key: &LoginKey) -> Option<LockoutInfo> {
        self.check_lockout_at(key, Instant::now())
    }

    pub(crate) fn check_lockout_at(&self, key: &LoginKey, now: Instant) -> Option<LockoutInfo> {
        let mut records = self.records.write();
        let record = records.get_mut(key)?;

        let elapsed = now.saturating_duration_since(record.last_attempt);
        if elapsed >= self.policy.lockout_window {
            if record.failures > 0 {
                tracing::debug!(key = %key, "Lockout window expired, resetting attempts");
            }
            record.failures = 0;
            record.last_attempt = now;
            return None;
        }

        if record.failures >= self.policy.max_attempts {
            return Some(LockoutInfo {
                failed_count: record.failures,
                remaining: self.policy.lockout_window - elapsed,
            });
        }

        None
    }

    /// Record a failed login attempt
    pub fn record_failure(&self, key: &LoginKey) -> AttemptResult {
        self.record_failure_at(key, Instant::now())
    }

    pub(crate) fn record_failure_at(&self, key: &LoginKey, now: Instant) -> AttemptResult {
        let failed_count = {
            let mut records = self.records.write();
            let record = records.entry(key.clone()).or_insert(AttemptRecord {
                failures: 0,
                last_attempt: now,
            });
            record.failures = record.failures.saturating_add(1);
            record.last_attempt = now;
            record.failures
        };

        let remaining = self.policy.max_attempts.saturating_sub(failed_count);
        let is_locked_out = failed_count >= self.policy.max_attempts;

        log_login_failure(key, failed_count, remaining);
        if failed_count == self.policy.max_attempts {
            log_account_locked(key, failed_count, self.policy.lockout_window);
        }

        AttemptResult {
            failed_count,
            remaining_attempts: remaining,
            is_locked_out,
        }
    }

    /// Record a successful login; clears the key's history
    pub fn record_success(&self, key: &LoginKey) {
        self.records.write().remove(key);
        log_login_success(key);
    }

    /// Manually unlock a key (admin action)
    pub fn unlock(&self, key: &LoginKey) {
        if self.records.write().remove(key).is_some() {
            log_account_unlocked(key);
        }
    }

    /// Get attempt info for a key (for admin/debugging)
    pub fn attempt_info(&self, key: &LoginKey) -> Option<AttemptRecord> {
        self.records.read().get(key).copied()
    }

    /// Number of keys with a record
    pub fn tracked_keys(&self) -> usize {
        self.records.read().len()
    }
}

// ============================================================================
// Security Event Logging
// ============================================================================

fn log_login_success(key: &LoginKey) {
    crate::security_event!(
        SecurityEvent::AuthenticationSuccess,
        username = %key.username,
        client = %key.client,
        "Login successful"
    );
}

fn log_login_failure(key: &LoginKey, failed_count: u32, remaining: u32) {
    crate::security_event!(
        SecurityEvent::AuthenticationFailure,
        username = %key.username,
        client = %key.client,
        failed_count = failed_count,
        remaining_attempts = remaining,
        "Login failed"
    );
}

fn log_account_locked(key: &LoginKey, failed_count: u32, window: Duration) {
    crate::security_event!(
        SecurityEvent::AccountLocked,
        username = %key.username,
        client = %key.client,
        failed_count = failed_count,
        lockout_duration_secs = window.as_secs(),
        "Account locked due to failed login attempts"
    );
}

fn log_account_unlocked(key: &LoginKey) {
    crate::security_event!(
        SecurityEvent::AccountUnlocked,
        username = %key.username,
        client = %key.client,
        "Account unlocked"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(user: &str, client: &str) -> LoginKey {
        LoginKey::new(user, client)
    }

    #[test]
    fn test_default_policy() {
        let policy = LockoutPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.lockout_window, Duration::from_secs(300));
    }

    #[test]
    fn test_policy_builder() {
        let policy = LockoutPolicy::builder()
            .max_attempts(0)
            .lockout_window(Duration::from_secs(60))
            .build();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.lockout_window, Duration::from_secs(60));
    }

    #[test]
    fn test_login_tracker_success() {
        let tracker = LoginTracker::with_default_policy();
        let k = key("maria", "10.0.0.1");
        tracker.record_success(&k);

        assert!(tracker.check_lockout(&k).is_none());
        assert_eq!(tracker.tracked_keys(), 0);
    }

    #[test]
    fn test_login_tracker_failure() {
        let tracker = LoginTracker::with_default_policy();
        let k = key("maria", "10.0.0.1");
        let start = Instant::now();

        let first = tracker.record_failure_at(&k, start);
        assert_eq!(first.failed_count, 1);
        assert_eq!(first.remaining_attempts, 2);
        assert!(!first.is_locked_out);
        assert!(tracker.check_lockout_at(&k, start).is_none());

        tracker.record_failure_at(&k, start);
        let third = tracker.record_failure_at(&k, start);
        assert_eq!(third.remaining_attempts, 0);
        assert!(third.is_locked_out);
    }

    #[test]
    fn test_locked_after_threshold_reports_remaining_time() {
        let tracker = LoginTracker::with_default_policy();
        let k = key("maria", "10.0.0.1");
        let start = Instant::now();

        for _ in 0..3 {
            tracker.record_failure_at(&k, start);
        }

        let info = tracker
            .check_lockout_at(&k, start + Duration::from_secs(100))
            .expect("key should be locked");
        assert_eq!(info.failed_count, 3);
        assert_eq!(info.remaining, Duration::from_secs(200));
        assert_eq!(info.remaining_secs(), 200);

        let at_start = tracker.check_lockout_at(&k, start).unwrap();
        assert!(at_start.remaining_secs() > 0);
        assert!(at_start.remaining_secs() <= 300);
    }

    #[test]
    fn test_remaining_secs_rounds_up() {
        let info = LockoutInfo {
            failed_count: 3,
            remaining: Duration::from_millis(500),
        };
        assert_eq!(info.remaining_secs(), 1);

        let info = LockoutInfo {
            failed_count: 3,
            remaining: Duration::from_millis(299_001),
        };
        assert_eq!(info.remaining_secs(), 300);
    }

    #[test]
    fn test_window_expiry_resets_count() {
        let tracker = LoginTracker::with_default_policy();
        let k = key("maria", "10.0.0.1");
        let start = Instant::now();

        for _ in 0..3 {
            tracker.record_failure_at(&k, start);
        }
        let later = start + Duration::from_secs(300);
        assert!(tracker.check_lockout_at(&k, later).is_none());
        assert_eq!(tracker.attempt_info(&k).unwrap().failures, 0);

        // Counting starts over after the reset
        let result = tracker.record_failure_at(&k, later);
        assert_eq!(result.failed_count, 1);
        assert!(tracker.check_lockout_at(&k, later).is_none());
    }

    #[test]
    fn test_success_resets_count() {
        let tracker = LoginTracker::with_default_policy();
        let k = key("maria", "10.0.0.1");

        tracker.record_failure(&k);
        tracker.record_failure(&k);
        tracker.record_success(&k);

        let result = tracker.record_failure(&k);
        assert_eq!(result.failed_count, 1);
        assert!(tracker.check_lockout(&k).is_none());
    }

    #[test]
    fn test_other_client_not_penalized() {
        let tracker = LoginTracker::with_default_policy();
        let attacker = key("maria", "203.0.113.9");
        let office = key("maria", "10.0.0.1");

        for _ in 0..3 {
            tracker.record_failure(&attacker);
        }

        assert!(tracker.check_lockout(&attacker).is_some());
        assert!(tracker.check_lockout(&office).is_none());
    }

    #[test]
    fn test_unlock() {
        let tracker = LoginTracker::with_default_policy();
        let k = key("maria", "10.0.0.1");
        for _ in 0..3 {
            tracker.record_failure(&k);
        }
        assert!(tracker.check_lockout(&k).is_some());

        tracker.unlock(&k);
        assert!(tracker.check_lockout(&k).is_none());
        assert!(tracker.attempt_info(&k).is_none());
    }

    #[test]
    fn test_clones_share_records() {
        let tracker = LoginTracker::with_default_policy();
        let clone = tracker.clone();
        let k = key("maria", "10.0.0.1");

        clone.record_failure(&k);
        assert_eq!(tracker.attempt_info(&k).unwrap().failures, 1);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(key("maria", "10.0.0.1").to_string(), "maria_10.0.0.1");
    }
}
