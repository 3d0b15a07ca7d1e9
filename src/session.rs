//! Session Tokens
//!
//! Signed bearer tokens handed out after a successful login. Tokens are
//! HS256 JWTs carrying the login, display name and role; they expire after
//! the configured lifetime (1 hour by default). There is no server-side
//! session store, so logout is the client discarding its token.
//!
//! # Usage
//!
//! ```ignore
//! use ordem::session::TokenIssuer;
//!
//! let issuer = TokenIssuer::from_config(&auth_config);
//! let token = issuer.issue("joao", &identity)?;
//!
//! let claims = issuer.validate(&token)?;
//! assert_eq!(claims.sub, "joao");
//! ```

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AuthConfig;
use crate::credentials::UserIdentity;

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Subject (login)
    pub sub: String,
    /// Display name
    pub name: String,
    pub role: String,
    /// Issued at timestamp
    pub iat: i64,
    /// Expiration timestamp
    pub exp: i64,
    /// Token ID
    pub jti: String,
}

impl Claims {
    /// Check if the token is expired
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// Token creation and validation failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid token")]
    Invalid,
    #[error("token creation failed: {0}")]
    Encoding(String),
}

/// Issues and validates session tokens with a shared secret.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    lifetime: Duration,
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(secret: &str, lifetime: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            lifetime,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(&config.token_secret, config.token_lifetime)
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Create a token for a verified user.
    pub fn issue(&self, login: &str, identity: &UserIdentity) -> Result<String, TokenError> {
        self.issue_at(login, identity, Utc::now())
    }

    pub(crate) fn issue_at(
        &self,
        login: &str,
        identity: &UserIdentity,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let lifetime = chrono::Duration::from_std(self.lifetime)
            .map_err(|e| TokenError::Encoding(e.to_string()))?;

        let claims = Claims {
            sub: login.to_string(),
            name: identity.name.clone(),
            role: identity.role.clone(),
            iat: now.timestamp(),
            exp: (now + lifetime).timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| TokenError::Encoding(e.to_string()))
    }

    /// Validate and decode a token
    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::default();
        validation.leeway = 0;

        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> UserIdentity {
        UserIdentity {
            name: "Ana Souza".into(),
            role: "tecnico".into(),
        }
    }

    fn issuer() -> TokenIssuer {
        TokenIssuer::new("test-secret-that-is-long-enough", Duration::from_secs(3600))
    }

    #[test]
    fn test_issue_and_validate() {
        let issuer = issuer();
        let token = issuer.issue("ana", &identity()).unwrap();
        let claims = issuer.validate(&token).unwrap();

        assert_eq!(claims.sub, "ana");
        assert_eq!(claims.name, "Ana Souza");
        assert_eq!(claims.role, "tecnico");
        assert_eq!(claims.exp - claims.iat, 3600);
        assert!(!claims.is_expired());
    }

    #[test]
    fn test_token_ids_are_unique() {
        let issuer = issuer();
        let a = issuer.validate(&issuer.issue("ana", &identity()).unwrap()).unwrap();
        let b = issuer.validate(&issuer.issue("ana", &identity()).unwrap()).unwrap();
        assert_ne!(a.jti, b.jti);
    }

    #[test]
    fn test_expired_token_rejected() {
        let issuer = issuer();
        let issued = Utc::now() - chrono::Duration::hours(2);
        let token = issuer.issue_at("ana", &identity(), issued).unwrap();

        assert_eq!(issuer.validate(&token), Err(TokenError::Expired));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let issuer = issuer();
        let token = issuer.issue("ana", &identity()).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = TokenIssuer::new("another-secret", Duration::from_secs(3600))
            .issue("ana", &identity())
            .unwrap();
        let forged_parts: Vec<&str> = forged.split('.').collect();
        parts[2] = forged_parts[2];

        assert_eq!(issuer.validate(&parts.join(".")), Err(TokenError::Invalid));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issuer().issue("ana", &identity()).unwrap();
        let other = TokenIssuer::new("different", Duration::from_secs(3600));
        assert_eq!(other.validate(&token), Err(TokenError::Invalid));
    }

    #[test]
    fn test_garbage_rejected() {
        assert_eq!(issuer().validate("not-a-token"), Err(TokenError::Invalid));
    }
}
