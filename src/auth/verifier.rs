//! Deferred trust verification.
//!
//! Every fast-path accept schedules one detached check. After a fixed delay
//! the check looks for a corroboration record: a timestamp written by the
//! provider-callback side whenever it independently sees the same identity.
//! A missing or stale record costs the identity `penalty` trust points.
//!
//! Checks are fire-and-forget. They outlive the request that triggered them,
//! are never cancelled, and any failure (including a panic) stays inside the
//! task and is only logged.

use super::trust::{DecrementOutcome, TrustStore};
use crate::cache::{parse_integer, CacheError, ExpiringCache};
use bytes::Bytes;
use futures::FutureExt;
use serde::Deserialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Verification timing and penalty.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifierConfig {
    /// Seconds between the fast-path accept and the check
    #[serde(default = "default_delay")]
    pub delay_secs: u64,
    /// Largest accepted gap, in seconds, between now and the corroboration timestamp
    #[serde(default = "default_window")]
    pub window_secs: u64,
    /// Trust points removed when corroboration is missing or stale
    #[serde(default = "default_penalty")]
    pub penalty: i64,
    /// Key prefix for corroboration records
    #[serde(default = "default_corroboration_namespace")]
    pub namespace: String,
    /// Expiry of corroboration records, in seconds
    #[serde(default = "default_record_ttl")]
    pub record_ttl_secs: u64,
}

fn default_delay() -> u64 {
    5
}

fn default_window() -> u64 {
    10
}

fn default_penalty() -> i64 {
    20
}

fn default_corroboration_namespace() -> String {
    "wechatserver".to_string()
}

fn default_record_ttl() -> u64 {
    600
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            delay_secs: default_delay(),
            window_secs: default_window(),
            penalty: default_penalty(),
            namespace: default_corroboration_namespace(),
            record_ttl_secs: default_record_ttl(),
        }
    }
}

/// Corroboration records: `<namespace>:<identifier>` → unix seconds.
#[derive(Clone)]
pub struct Corroboration {
    cache: Arc<dyn ExpiringCache>,
    namespace: String,
    ttl: Duration,
}

impl Corroboration {
    pub fn new(cache: Arc<dyn ExpiringCache>, config: &VerifierConfig) -> Self {
        Self {
            cache,
            namespace: config.namespace.clone(),
            ttl: Duration::from_secs(config.record_ttl_secs),
        }
    }

    fn key(&self, identifier: &str) -> String {
        format!("{}:{}", self.namespace, identifier)
    }

    /// Record that `identifier` was just seen by the callback side.
    pub async fn record(&self, identifier: &str) -> Result<(), CacheError> {
        self.record_at(identifier, chrono::Utc::now().timestamp())
            .await
    }

    /// Record a sighting at an explicit unix timestamp.
    pub async fn record_at(&self, identifier: &str, unix_secs: i64) -> Result<(), CacheError> {
        self.cache
            .set(
                &self.key(identifier),
                Bytes::from(unix_secs.to_string()),
                Some(self.ttl),
            )
            .await
    }

    /// Last sighting, if any. Malformed records are an error, not a miss.
    pub async fn last_seen(&self, identifier: &str) -> Result<Option<i64>, CacheError> {
        let key = self.key(identifier);
        match self.cache.get(&key).await? {
            None => Ok(None),
            Some(raw) => parse_integer(&raw)
                .map(Some)
                .ok_or(CacheError::NotAnInteger(key)),
        }
    }
}

/// Seam between the gate and whatever runs the deferred check.
pub trait VerificationScheduler: Send + Sync {
    /// Queue a check for `identifier`. Must return without waiting on it.
    fn schedule(&self, identifier: &str);
}

/// Result of one verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// A recent enough record exists; `lag_secs` is `now - timestamp`.
    Corroborated { lag_secs: i64 },
    /// No record, or one outside the window; the trust store was asked to decrement.
    Penalized(DecrementOutcome),
    /// The record could not be read; nothing was decremented.
    Skipped,
}

/// Runs deferred checks on the tokio runtime. Cheap to clone.
#[derive(Clone)]
pub struct TrustVerifier {
    trust: Arc<TrustStore>,
    corroboration: Corroboration,
    delay: Duration,
    window_secs: i64,
    penalty: i64,
}

impl TrustVerifier {
    pub fn new(
        cache: Arc<dyn ExpiringCache>,
        trust: Arc<TrustStore>,
        config: &VerifierConfig,
    ) -> Self {
        Self {
            trust,
            corroboration: Corroboration::new(cache, config),
            delay: Duration::from_secs(config.delay_secs),
            window_secs: i64::try_from(config.window_secs).unwrap_or(i64::MAX),
            penalty: config.penalty,
        }
    }

    pub fn corroboration(&self) -> &Corroboration {
        &self.corroboration
    }

    /// Check corroboration for `identifier` now and penalize if it is missing or stale.
    pub async fn verify(&self, identifier: &str) -> Verdict {
        let seen = match self.corroboration.last_seen(identifier).await {
            Ok(seen) => seen,
            Err(e) => {
                warn!("Corroboration lookup for {} failed: {}", identifier, e);
                return Verdict::Skipped;
            }
        };

        let now = chrono::Utc::now().timestamp();
        let lag = seen.map(|ts| now.saturating_sub(ts));
        match lag {
            Some(lag) if lag.saturating_abs() <= self.window_secs => {
                debug!("Fast login of {} corroborated ({}s)", identifier, lag);
                Verdict::Corroborated { lag_secs: lag }
            }
            _ => {
                let outcome = self.trust.decrement(identifier, self.penalty).await;
                info!(
                    "Fast login of {} not corroborated (lag: {:?}), decrement: {:?}",
                    identifier, lag, outcome
                );
                Verdict::Penalized(outcome)
            }
        }
    }

    /// Spawn the delayed check as a detached task.
    ///
    /// The handle is returned for callers that want it (tests); dropping it
    /// leaves the task running.
    pub fn spawn(&self, identifier: &str) -> JoinHandle<()> {
        let verifier = self.clone();
        let identifier = identifier.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(verifier.delay).await;
            let check = AssertUnwindSafe(verifier.verify(&identifier)).catch_unwind();
            match check.await {
                Ok(verdict) => {
                    metrics::counter!("trustgate_verifications_total", "verdict" => verdict.label())
                        .increment(1);
                }
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!("Trust verification for {} panicked: {}", identifier, reason);
                }
            }
        })
    }
}

impl Verdict {
    fn label(&self) -> &'static str {
        match self {
            Verdict::Corroborated { .. } => "corroborated",
            Verdict::Penalized(_) => "penalized",
            Verdict::Skipped => "skipped",
        }
    }
}

impl VerificationScheduler for TrustVerifier {
    fn schedule(&self, identifier: &str) {
        // Detached: the handle is dropped, the task keeps running.
        drop(self.spawn(identifier));
    }
}
