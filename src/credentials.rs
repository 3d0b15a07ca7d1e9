//! Credential Verification
//!
//! Checks a username and secret against the `usuarios` table. A stored
//! value matches when it equals the submitted secret verbatim (rows that
//! predate hashing) or equals the lowercase hex SHA-256 of the secret. All
//! comparisons run in constant time.
//!
//! A mismatch and an unknown user look the same to the caller: both are
//! `Ok(None)`. Database failures are errors, so callers can tell "wrong
//! password" apart from "could not check".

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::AuthConfig;
use crate::connection::Row;
use crate::crypto::constant_time_str_eq;
use crate::database::DatabaseManager;
use crate::error::DatabaseError;
use crate::hash_cache::{CacheStats, SecretHashCache};
use crate::observability::SecurityEvent;

pub(crate) const LOOKUP_SQL: &str =
    "SELECT nome, cargo, senha FROM usuarios WHERE usuario = $1 LIMIT 1";
pub(crate) const EXISTS_SQL: &str = "SELECT 1 FROM usuarios WHERE usuario = $1 LIMIT 1";
pub(crate) const PROFILE_SQL: &str =
    "SELECT usuario, nome, cargo FROM usuarios WHERE usuario = $1 LIMIT 1";

/// Display name and role of a verified user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserIdentity {
    pub name: String,
    pub role: String,
}

/// Public profile of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub login: String,
    pub name: String,
    pub role: String,
}

/// Verifies login credentials through the shared [`DatabaseManager`].
#[derive(Debug)]
pub struct CredentialVerifier {
    db: Arc<DatabaseManager>,
    hashes: Mutex<SecretHashCache>,
    allow_plaintext: bool,
}

impl CredentialVerifier {
    pub fn new(db: Arc<DatabaseManager>, config: &AuthConfig) -> Self {
        Self {
            db,
            hashes: Mutex::new(SecretHashCache::new(config.hash_cache_capacity)),
            allow_plaintext: config.allow_plaintext_secrets,
        }
    }

    /// Check `secret` against the stored value for `username`.
    ///
    /// Returns the user's identity on a match and `None` on a mismatch or
    /// unknown user.
    pub async fn verify_credentials(
        &self,
        username: &str,
        secret: &str,
    ) -> Result<Option<UserIdentity>, DatabaseError> {
        let rows = self.lookup(LOOKUP_SQL, username).await?;
        let Some(row) = rows.first() else {
            debug!(username = %username, "No such user");
            return Ok(None);
        };

        let stored = text_column(row, "senha");

        if self.allow_plaintext && constant_time_str_eq(stored, secret) {
            crate::security_event!(
                SecurityEvent::LegacyCredentialAccepted,
                username = %username,
                "Stored secret is not hashed; re-hash it with `ordem hash`"
            );
            return Ok(Some(identity(row)));
        }

        let digest = self.hashes.lock().digest(secret);
        if constant_time_str_eq(stored, &digest) {
            return Ok(Some(identity(row)));
        }

        Ok(None)
    }

    pub async fn user_exists(&self, username: &str) -> Result<bool, DatabaseError> {
        Ok(!self.lookup(EXISTS_SQL, username).await?.is_empty())
    }

    pub async fn user_profile(&self, username: &str) -> Result<Option<UserProfile>, DatabaseError> {
        let rows = self.lookup(PROFILE_SQL, username).await?;
        Ok(rows.first().map(|row| UserProfile {
            login: text_column(row, "usuario").to_string(),
            name: text_column(row, "nome").to_string(),
            role: text_column(row, "cargo").to_string(),
        }))
    }

    /// Hash cache statistics
    pub fn cache_stats(&self) -> CacheStats {
        self.hashes.lock().stats()
    }

    async fn lookup(&self, sql: &str, username: &str) -> Result<Vec<Row>, DatabaseError> {
        self.db
            .try_execute(sql, &[Value::String(username.to_string())])
            .await
    }
}

fn identity(row: &Row) -> UserIdentity {
    UserIdentity {
        name: text_column(row, "nome").to_string(),
        role: text_column(row, "cargo").to_string(),
    }
}

fn text_column<'a>(row: &'a Row, column: &str) -> &'a str {
    row.get(column).and_then(Value::as_str).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::crypto::sha256_hex;
    use crate::testing::MemoryDatabase;
    use std::time::Duration;

    fn verifier(db: &MemoryDatabase, auth: AuthConfig) -> CredentialVerifier {
        let config = DatabaseConfig::builder()
            .pool_size(1, 4)
            .retry(1, Duration::from_millis(10))
            .build();
        let manager = DatabaseManager::new(config, Arc::new(db.clone())).unwrap();
        CredentialVerifier::new(Arc::new(manager), &auth)
    }

    fn users() -> MemoryDatabase {
        MemoryDatabase::new()
            .with_user("joao", "Joao Silva", "admin", "legacy-pass")
            .with_user("ana", "Ana Souza", "tecnico", &sha256_hex("s3nh@"))
    }

    #[tokio::test]
    async fn test_plaintext_secret_matches() {
        let verifier = verifier(&users(), AuthConfig::default());
        let identity = verifier.verify_credentials("joao", "legacy-pass").await.unwrap();
        assert_eq!(
            identity,
            Some(UserIdentity {
                name: "Joao Silva".into(),
                role: "admin".into()
            })
        );
    }

    #[tokio::test]
    async fn test_hashed_secret_matches() {
        let verifier = verifier(&users(), AuthConfig::default());
        let identity = verifier.verify_credentials("ana", "s3nh@").await.unwrap().unwrap();
        assert_eq!(identity.name, "Ana Souza");
        assert_eq!(identity.role, "tecnico");
    }

    #[tokio::test]
    async fn test_wrong_secret_and_unknown_user_look_alike() {
        let verifier = verifier(&users(), AuthConfig::default());
        assert_eq!(verifier.verify_credentials("ana", "wrong").await.unwrap(), None);
        assert_eq!(verifier.verify_credentials("nobody", "s3nh@").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_submitting_the_digest_itself_does_not_match() {
        let verifier = verifier(
            &users(),
            AuthConfig {
                allow_plaintext_secrets: false,
                ..AuthConfig::default()
            },
        );
        let digest = sha256_hex("s3nh@");
        assert_eq!(verifier.verify_credentials("ana", &digest).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_plaintext_can_be_disabled() {
        let verifier = verifier(
            &users(),
            AuthConfig {
                allow_plaintext_secrets: false,
                ..AuthConfig::default()
            },
        );
        assert_eq!(verifier.verify_credentials("joao", "legacy-pass").await.unwrap(), None);
        assert!(verifier.verify_credentials("ana", "s3nh@").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_repeated_attempts_hit_hash_cache() {
        let verifier = verifier(&users(), AuthConfig::default());
        verifier.verify_credentials("ana", "s3nh@").await.unwrap();
        verifier.verify_credentials("ana", "s3nh@").await.unwrap();

        let stats = verifier.cache_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_database_down_is_an_error() {
        let db = users();
        db.set_reachable(false);
        let verifier = verifier(&db, AuthConfig::default());

        let result = verifier.verify_credentials("ana", "s3nh@").await;
        assert!(matches!(result, Err(DatabaseError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_user_exists_and_profile() {
        let verifier = verifier(&users(), AuthConfig::default());

        assert!(verifier.user_exists("joao").await.unwrap());
        assert!(!verifier.user_exists("maria").await.unwrap());

        let profile = verifier.user_profile("ana").await.unwrap().unwrap();
        assert_eq!(profile.login, "ana");
        assert_eq!(profile.role, "tecnico");
        assert_eq!(verifier.user_profile("maria").await.unwrap(), None);
    }
}
