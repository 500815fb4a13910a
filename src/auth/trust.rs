//! Per-identity trust scores.
//!
//! A full (non-cached) login sets the score to `initial_score`. Each failed
//! corroboration takes points off. Once the score is below `threshold` the
//! fast path is closed for that identity and further decrements are skipped;
//! the score only comes back through another full login.

use crate::cache::{parse_integer, CacheError, ExpiringCache};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Trust scoring parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct TrustConfig {
    /// Key prefix for scores (`<namespace>:<identifier>`)
    #[serde(default = "default_weight_namespace")]
    pub namespace: String,
    /// Score given on every full login
    #[serde(default = "default_initial_score")]
    pub initial_score: i64,
    /// Minimum score for the fast path
    #[serde(default = "default_threshold")]
    pub threshold: i64,
    /// Optional expiry for scores; unset means scores never expire
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

fn default_weight_namespace() -> String {
    "openidweight".to_string()
}

fn default_initial_score() -> i64 {
    100
}

fn default_threshold() -> i64 {
    50
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            namespace: default_weight_namespace(),
            initial_score: default_initial_score(),
            threshold: default_threshold(),
            ttl_secs: None,
        }
    }
}

/// What a decrement call ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecrementOutcome {
    /// Score was lowered to the contained value.
    Applied(i64),
    /// Score was already below the threshold; left untouched.
    BelowFloor(i64),
    /// The store could not be read or written; nothing changed (logged).
    Failed,
}

/// Trust scores stored as decimal text in the shared cache.
pub struct TrustStore {
    cache: Arc<dyn ExpiringCache>,
    config: TrustConfig,
}

impl TrustStore {
    pub fn new(cache: Arc<dyn ExpiringCache>, config: TrustConfig) -> Self {
        Self { cache, config }
    }

    pub fn is_trusted(&self, score: i64) -> bool {
        score >= self.config.threshold
    }

    fn key(&self, identifier: &str) -> String {
        format!("{}:{}", self.config.namespace, identifier)
    }

    /// Reset the score after a full login.
    pub async fn initialize(&self, identifier: &str) -> Result<(), CacheError> {
        let ttl = self.config.ttl_secs.map(Duration::from_secs);
        self.cache
            .set(
                &self.key(identifier),
                Bytes::from(self.config.initial_score.to_string()),
                ttl,
            )
            .await?;
        debug!(
            "Trust score for {} initialized to {}",
            identifier, self.config.initial_score
        );
        Ok(())
    }

    /// Current score; 0 when absent, unparsable or unreadable.
    pub async fn read(&self, identifier: &str) -> i64 {
        match self.try_read(identifier).await {
            Ok(score) => score,
            Err(e) => {
                warn!("Trust score for {} unreadable, treating as 0: {}", identifier, e);
                0
            }
        }
    }

    async fn try_read(&self, identifier: &str) -> Result<i64, CacheError> {
        let key = self.key(identifier);
        match self.cache.get(&key).await? {
            None => Ok(0),
            Some(raw) => parse_integer(&raw).ok_or(CacheError::NotAnInteger(key)),
        }
    }

    /// Lower the score by `amount` unless it is already below the threshold.
    ///
    /// The threshold check and the decrement are two round trips, so two
    /// concurrent calls can both pass the check and push the score one
    /// penalty further below the threshold. That slack is accepted.
    pub async fn decrement(&self, identifier: &str, amount: i64) -> DecrementOutcome {
        let current = match self.try_read(identifier).await {
            Ok(score) => score,
            Err(e) => {
                warn!("Skipping trust decrement for {}: {}", identifier, e);
                return DecrementOutcome::Failed;
            }
        };

        if !self.is_trusted(current) {
            debug!(
                "Trust score for {} already below threshold ({}), not decrementing",
                identifier, current
            );
            return DecrementOutcome::BelowFloor(current);
        }

        match self.cache.decr_by(&self.key(identifier), amount).await {
            Ok(score) => {
                debug!("Trust score for {} lowered to {}", identifier, score);
                DecrementOutcome::Applied(score)
            }
            Err(e) => {
                warn!("Trust decrement for {} failed: {}", identifier, e);
                DecrementOutcome::Failed
            }
        }
    }
}
