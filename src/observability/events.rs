//! Security Event Logging
//!
//! Structured events for authentication outcomes and database availability.
//! Each event carries a stable name, a category and a severity; the
//! [`security_event!`] macro maps the severity to a tracing level.
//!
//! # Usage
//!
//! ```ignore
//! use ordem::observability::SecurityEvent;
//!
//! ordem::security_event!(
//!     SecurityEvent::AuthenticationFailure,
//!     username = %username,
//!     client = %client_ip,
//!     "Login failed"
//! );
//! ```

use std::fmt;

/// Security and availability events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEvent {
    // Authentication events
    /// Successful user authentication
    AuthenticationSuccess,
    /// Failed authentication attempt
    AuthenticationFailure,
    /// User logout
    Logout,
    /// Session token issued
    SessionCreated,
    /// A stored secret matched verbatim instead of by digest
    LegacyCredentialAccepted,

    // Authorization events
    /// Request rejected for a missing or invalid token
    AccessDenied,

    // Lockout events
    /// Key locked due to failed attempts
    AccountLocked,
    /// Key unlocked by an administrator
    AccountUnlocked,

    // System events
    /// Application started
    SystemStartup,
    /// Application shutdown
    SystemShutdown,
    /// Connection pool created
    DatabaseConnected,
    /// Connection pool lost or discarded
    DatabaseDisconnected,
    /// A broken connection was closed instead of reused
    ConnectionDiscarded,
}

impl SecurityEvent {
    /// Get the event category for filtering/grouping
    pub fn category(&self) -> &'static str {
        match self {
            Self::AuthenticationSuccess
            | Self::AuthenticationFailure
            | Self::Logout
            | Self::SessionCreated
            | Self::LegacyCredentialAccepted => "authentication",

            Self::AccessDenied => "authorization",

            Self::AccountLocked | Self::AccountUnlocked => "security",

            Self::SystemStartup
            | Self::SystemShutdown
            | Self::DatabaseConnected
            | Self::DatabaseDisconnected
            | Self::ConnectionDiscarded => "system",
        }
    }

    /// Get the severity level for the event
    pub fn severity(&self) -> Severity {
        match self {
            Self::DatabaseDisconnected => Severity::Critical,

            Self::AuthenticationFailure | Self::AccessDenied | Self::AccountLocked => {
                Severity::High
            }

            Self::AuthenticationSuccess
            | Self::AccountUnlocked
            | Self::LegacyCredentialAccepted
            | Self::ConnectionDiscarded => Severity::Medium,

            Self::Logout
            | Self::SessionCreated
            | Self::SystemStartup
            | Self::SystemShutdown
            | Self::DatabaseConnected => Severity::Low,
        }
    }

    /// Get the event name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::AuthenticationSuccess => "authentication_success",
            Self::AuthenticationFailure => "authentication_failure",
            Self::Logout => "logout",
            Self::SessionCreated => "session_created",
            Self::LegacyCredentialAccepted => "legacy_credential_accepted",
            Self::AccessDenied => "access_denied",
            Self::AccountLocked => "account_locked",
            Self::AccountUnlocked => "account_unlocked",
            Self::SystemStartup => "system_startup",
            Self::SystemShutdown => "system_shutdown",
            Self::DatabaseConnected => "database_connected",
            Self::DatabaseDisconnected => "database_disconnected",
            Self::ConnectionDiscarded => "connection_discarded",
        }
    }
}

impl fmt::Display for SecurityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Routine operations
    Low,
    /// Important state changes
    Medium,
    /// Security-relevant failures
    High,
    /// Immediate attention required
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Log a security event with structured fields.
///
/// The macro adds `security_event`, `category` and `severity` fields and
/// picks the level: critical -> error, high -> warn, medium -> info,
/// low -> debug.
///
/// ```ignore
/// security_event!(
///     SecurityEvent::DatabaseDisconnected,
///     attempts = 3,
///     error = %err,
///     "Database unreachable"
/// );
/// ```
#[macro_export]
macro_rules! security_event {
    ($event:expr, $($field:tt)*) => {{
        let event = $event;
        let severity = event.severity();
        let category = event.category();
        let event_name = event.name();

        match severity {
            $crate::observability::Severity::Critical => {
                ::tracing::error!(
                    security_event = event_name,
                    category = category,
                    severity = "critical",
                    $($field)*
                );
            }
            $crate::observability::Severity::High => {
                ::tracing::warn!(
                    security_event = event_name,
                    category = category,
                    severity = "high",
                    $($field)*
                );
            }
            $crate::observability::Severity::Medium => {
                ::tracing::info!(
                    security_event = event_name,
                    category = category,
                    severity = "medium",
                    $($field)*
                );
            }
            $crate::observability::Severity::Low => {
                ::tracing::debug!(
                    security_event = event_name,
                    category = category,
                    severity = "low",
                    $($field)*
                );
            }
        }
    }};
}

pub use security_event;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_categories() {
        assert_eq!(SecurityEvent::AuthenticationSuccess.category(), "authentication");
        assert_eq!(SecurityEvent::AccessDenied.category(), "authorization");
        assert_eq!(SecurityEvent::AccountLocked.category(), "security");
        assert_eq!(SecurityEvent::DatabaseConnected.category(), "system");
    }

    #[test]
    fn test_event_severity() {
        assert_eq!(SecurityEvent::DatabaseDisconnected.severity(), Severity::Critical);
        assert_eq!(SecurityEvent::AuthenticationFailure.severity(), Severity::High);
        assert_eq!(SecurityEvent::LegacyCredentialAccepted.severity(), Severity::Medium);
        assert_eq!(SecurityEvent::SessionCreated.severity(), Severity::Low);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_event_name() {
        assert_eq!(SecurityEvent::AccountLocked.name(), "account_locked");
        assert_eq!(SecurityEvent::ConnectionDiscarded.to_string(), "connection_discarded");
    }

    #[test]
    fn test_macro_expands_for_every_severity() {
        security_event!(SecurityEvent::DatabaseDisconnected, "critical");
        security_event!(SecurityEvent::AccountLocked, username = "maria", "high");
        security_event!(SecurityEvent::AccountUnlocked, "medium");
        security_event!(SecurityEvent::SystemStartup, "low");
    }
}
