//! Bounded memoization of secret digests.
//!
//! Login verification hashes the submitted secret on every attempt. The
//! cache keeps the most recently used digests so repeated attempts with
//! the same secret skip the hash. Least recently used entries are evicted
//! once `capacity` is reached.
//!
//! The cache is not internally synchronized; wrap it in a `Mutex` to share.

use std::collections::HashMap;
use std::fmt;

use crate::crypto::sha256_hex;

struct CacheEntry {
    digest: String,
    /// Logical clock value of the last access
    last_used: u64,
}

/// Accumulated cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Fixed-capacity LRU map from secret to its SHA-256 hex digest.
pub struct SecretHashCache {
    entries: HashMap<String, CacheEntry>,
    capacity: usize,
    clock: u64,
    stats: CacheStats,
}

impl SecretHashCache {
    /// A capacity of zero disables caching; every lookup hashes.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    /// Lowercase hex SHA-256 of `secret`, from cache when possible.
    pub fn digest(&mut self, secret: &str) -> String {
        self.clock += 1;
        let now = self.clock;

        if let Some(entry) = self.entries.get_mut(secret) {
            entry.last_used = now;
            self.stats.hits += 1;
            return entry.digest.clone();
        }

        self.stats.misses += 1;
        let digest = sha256_hex(secret);
        if self.capacity == 0 {
            return digest;
        }

        if self.entries.len() >= self.capacity {
            self.evict_lru();
        }
        self.entries.insert(
            secret.to_string(),
            CacheEntry {
                digest: digest.clone(),
                last_used: now,
            },
        );
        digest
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.stats.evictions += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

// Keys are plaintext secrets
impl fmt::Debug for SecretHashCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretHashCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .field("stats", &self.stats)
            .finish()
    }
}
