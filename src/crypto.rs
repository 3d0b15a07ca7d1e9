//! Cryptographic utilities for credential handling
//!
//! - **Constant-Time Comparison**: secret comparisons never exit early
//! - **Digests**: lowercase hex SHA-256, the format stored in `usuarios.senha`

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Performs constant-time comparison of two byte slices.
///
/// Slices of different length compare unequal; the length itself is not
/// treated as secret.
///
/// ```rust
/// use ordem::constant_time_eq;
///
/// assert!(constant_time_eq(b"abc123", b"abc123"));
/// assert!(!constant_time_eq(b"abc123", b"abc124"));
/// ```
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Constant-time comparison of two strings.
pub fn constant_time_str_eq(a: &str, b: &str) -> bool {
    constant_time_eq(a.as_bytes(), b.as_bytes())
}

/// Lowercase hex SHA-256 of a secret.
///
/// ```rust
/// assert_eq!(
///     ordem::sha256_hex("abc"),
///     "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
/// );
/// ```
pub fn sha256_hex(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_constant_time_str_eq() {
        assert!(constant_time_str_eq("admin", "admin"));
        assert!(!constant_time_str_eq("admin", "Admin"));
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        let digest = sha256_hex("secret");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }
}
