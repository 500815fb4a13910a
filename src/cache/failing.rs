//! Backends that fail on every call, for exercising outage handling.

use super::{CacheError, ExpiringCache};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Every call reports the store as unreachable.
pub(crate) struct UnavailableCache;

fn down<T>() -> Result<T, CacheError> {
    Err(CacheError::Unavailable("connection refused".to_string()))
}

#[async_trait]
impl ExpiringCache for UnavailableCache {
    async fn get(&self, _key: &str) -> Result<Option<Bytes>, CacheError> {
        down()
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Option<Duration>) -> Result<(), CacheError> {
        down()
    }

    async fn exists(&self, _key: &str) -> Result<bool, CacheError> {
        down()
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        down()
    }

    async fn hash_get(&self, _bucket: &str, _field: &str) -> Result<Option<Bytes>, CacheError> {
        down()
    }

    async fn hash_set_with_expiry(
        &self,
        _bucket: &str,
        _field: &str,
        _value: Bytes,
        _ttl: Duration,
    ) -> Result<(), CacheError> {
        down()
    }

    async fn decr_by(&self, _key: &str, _amount: i64) -> Result<i64, CacheError> {
        down()
    }

    async fn ping(&self) -> Result<(), CacheError> {
        down()
    }
}

/// Every call panics.
pub(crate) struct PanickingCache;

#[async_trait]
impl ExpiringCache for PanickingCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        panic!("cache blew up reading {key}")
    }

    async fn set(&self, key: &str, _value: Bytes, _ttl: Option<Duration>) -> Result<(), CacheError> {
        panic!("cache blew up writing {key}")
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        panic!("cache blew up checking {key}")
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        panic!("cache blew up deleting {key}")
    }

    async fn hash_get(&self, bucket: &str, _field: &str) -> Result<Option<Bytes>, CacheError> {
        panic!("cache blew up reading {bucket}")
    }

    async fn hash_set_with_expiry(
        &self,
        bucket: &str,
        _field: &str,
        _value: Bytes,
        _ttl: Duration,
    ) -> Result<(), CacheError> {
        panic!("cache blew up writing {bucket}")
    }

    async fn decr_by(&self, key: &str, _amount: i64) -> Result<i64, CacheError> {
        panic!("cache blew up decrementing {key}")
    }

    async fn ping(&self) -> Result<(), CacheError> {
        panic!("cache blew up")
    }
}
