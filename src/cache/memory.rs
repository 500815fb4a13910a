//! In-process cache backend.
//!
//! Uses moka with a per-entry expiry policy: each slot carries its own
//! deadline, so plain values and hash buckets can have independent TTLs.
//! Read-modify-write operations (hash field writes, `decr_by`) go through
//! moka's entry API and are atomic per key.

use super::{parse_integer, CacheError, ExpiringCache};
use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use moka::Expiry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum SlotData {
    Value(Bytes),
    Hash(HashMap<String, Bytes>),
}

#[derive(Debug, Clone)]
struct Slot {
    data: SlotData,
    deadline: Option<Instant>,
}

impl Slot {
    fn new(data: SlotData, ttl: Option<Duration>) -> Self {
        Self {
            data,
            deadline: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self) -> bool {
        self.deadline.map_or(true, |deadline| deadline > Instant::now())
    }
}

/// Expires each slot at its own deadline, including after in-place updates.
struct DeadlineExpiry;

impl Expiry<String, Slot> for DeadlineExpiry {
    fn expire_after_create(&self, _key: &String, value: &Slot, created_at: Instant) -> Option<Duration> {
        value
            .deadline
            .map(|deadline| deadline.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Slot,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value
            .deadline
            .map(|deadline| deadline.saturating_duration_since(updated_at))
    }
}

/// moka-backed [`ExpiringCache`].
pub struct MemoryCache {
    inner: Cache<String, Slot>,
}

impl MemoryCache {
    /// Create a cache holding at most `max_capacity` keys.
    pub fn new(max_capacity: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(DeadlineExpiry)
            .name("trustgate_memory")
            .build();
        Self { inner }
    }

    async fn live_slot(&self, key: &str) -> Option<Slot> {
        self.inner.get(key).await.filter(Slot::is_live)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl ExpiringCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        match self.live_slot(key).await {
            None => Ok(None),
            Some(Slot {
                data: SlotData::Value(value),
                ..
            }) => Ok(Some(value)),
            Some(_) => Err(CacheError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.inner
            .insert(key.to_string(), Slot::new(SlotData::Value(value), ttl))
            .await;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.live_slot(key).await.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.inner.invalidate(key).await;
        Ok(())
    }

    async fn hash_get(&self, bucket: &str, field: &str) -> Result<Option<Bytes>, CacheError> {
        match self.live_slot(bucket).await {
            None => Ok(None),
            Some(Slot {
                data: SlotData::Hash(fields),
                ..
            }) => Ok(fields.get(field).cloned()),
            Some(_) => Err(CacheError::WrongType(bucket.to_string())),
        }
    }

    async fn hash_set_with_expiry(
        &self,
        bucket: &str,
        field: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut wrong_type = false;
        self.inner
            .entry(bucket.to_string())
            .and_upsert_with(|existing| {
                let slot = match existing.map(|entry| entry.into_value()).filter(Slot::is_live) {
                    None => {
                        let fields = HashMap::from([(field.to_string(), value)]);
                        Slot::new(SlotData::Hash(fields), Some(ttl))
                    }
                    Some(Slot {
                        data: SlotData::Hash(mut fields),
                        deadline,
                    }) => {
                        fields.insert(field.to_string(), value);
                        Slot {
                            data: SlotData::Hash(fields),
                            deadline,
                        }
                    }
                    Some(other) => {
                        wrong_type = true;
                        other
                    }
                };
                std::future::ready(slot)
            })
            .await;

        if wrong_type {
            return Err(CacheError::WrongType(bucket.to_string()));
        }
        Ok(())
    }

    async fn decr_by(&self, key: &str, amount: i64) -> Result<i64, CacheError> {
        let mut result = Ok(0);
        self.inner
            .entry(key.to_string())
            .and_upsert_with(|existing| {
                let (current, deadline, unchanged) =
                    match existing.map(|entry| entry.into_value()).filter(Slot::is_live) {
                        None => (Ok(0), None, None),
                        Some(slot) => {
                            let current = match &slot.data {
                                SlotData::Value(raw) => parse_integer(raw)
                                    .ok_or_else(|| CacheError::NotAnInteger(key.to_string())),
                                SlotData::Hash(_) => Err(CacheError::WrongType(key.to_string())),
                            };
                            (current, slot.deadline, Some(slot))
                        }
                    };

                let next = current.and_then(|current| {
                    current.checked_sub(amount).ok_or_else(|| {
                        CacheError::Backend(format!("decrement would overflow '{}'", key))
                    })
                });

                let slot = match (&next, unchanged) {
                    (Ok(next), _) => Slot {
                        data: SlotData::Value(Bytes::from(next.to_string())),
                        deadline,
                    },
                    (Err(_), Some(unchanged)) => unchanged,
                    // Only reachable when a missing key overflows; store the floor value.
                    (Err(_), None) => Slot::new(SlotData::Value(Bytes::from_static(b"0")), None),
                };
                result = next;
                std::future::ready(slot)
            })
            .await;
        result
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
