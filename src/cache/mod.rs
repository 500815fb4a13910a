//! Expiring key-value cache.
//!
//! Every component that needs state (cached identities, trust scores,
//! corroboration records) goes through [`ExpiringCache`]. Values are opaque
//! bytes; serialization is the caller's job.
//!
//! Two backends:
//! - [`MemoryCache`]: moka-backed, per-entry TTL, single process
//! - [`RedisCache`]: pooled redis connections, shared across processes

#[cfg(test)]
pub(crate) mod failing;
pub mod memory;
pub mod redis;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

pub use self::memory::MemoryCache;
pub use self::redis::{RedisCache, RedisOptions};

/// Cache failure. A missing key is never an error: reads return `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The backing store could not be reached (connect, pool checkout, I/O, timeout).
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    /// Key exists but holds a different kind of value (plain value vs hash bucket).
    #[error("key '{0}' holds the wrong kind of value")]
    WrongType(String),
    /// `decr_by` on a value that does not parse as an integer.
    #[error("value at '{0}' is not an integer")]
    NotAnInteger(String),
    /// Any other error reported by the backend.
    #[error("cache backend error: {0}")]
    Backend(String),
}

impl CacheError {
    /// True when the failure means the store could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CacheError::Unavailable(_))
    }
}

/// Key-value and hash-bucket storage with expiry.
///
/// Every call reaches the backing store; there is no local caching layer.
#[async_trait]
pub trait ExpiringCache: Send + Sync {
    /// Read a plain value.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    /// Write a plain value. `None` TTL means the entry never expires.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Whether a live entry (value or bucket) exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Remove an entry. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Read one field of a hash bucket.
    async fn hash_get(&self, bucket: &str, field: &str) -> Result<Option<Bytes>, CacheError>;

    /// Create-or-update one field of a hash bucket.
    ///
    /// A fresh bucket gets the field and `ttl` applied together. An existing
    /// bucket only gets the field written; its other fields and its expiry
    /// are left as they are.
    async fn hash_set_with_expiry(
        &self,
        bucket: &str,
        field: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Atomically subtract `amount` from the integer stored at `key` and
    /// return the new value. A missing key counts as 0. The key's expiry is kept.
    async fn decr_by(&self, key: &str, amount: i64) -> Result<i64, CacheError>;

    /// Round-trip to the backend (health checks).
    async fn ping(&self) -> Result<(), CacheError>;
}

/// Parse a stored integer the way redis does: optional sign, ASCII digits.
pub(crate) fn parse_integer(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}
