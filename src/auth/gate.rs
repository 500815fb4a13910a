//! Fast-auth decision gate.
//!
//! Given a request's origin, decide whether a previously cached identity can
//! be trusted instead of sending the browser through the provider's full
//! authorization redirect. The checks run in a fixed order and any failure
//! falls back to the redirect:
//!
//! 1. fast path enabled
//! 2. request has a user-agent fingerprint
//! 3. identity cached under `(address, fingerprint)`
//! 4. cached identity deserializes and has a non-empty identifier
//! 5. trust score at or above the threshold
//!
//! On accept, exactly one deferred verification is scheduled and the
//! identity is returned immediately. The decision never waits on the
//! verification and never depends on its result.

use super::fingerprint::{ClientOrigin, Fingerprint};
use super::identity::UserIdentity;
use super::trust::{TrustConfig, TrustStore};
use super::verifier::{VerificationScheduler, VerifierConfig};
use crate::cache::{CacheError, ExpiringCache};
use axum::http::HeaderMap;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where to send the browser when the fast path is not taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Direction {
    /// Client network address
    pub origin: String,
    pub redirect_uri: String,
    pub scope: String,
    pub state: String,
}

/// Why the gate fell back to the full redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectReason {
    Disabled,
    NoFingerprint,
    CacheMiss,
    CacheUnavailable,
    MalformedIdentity,
    EmptyIdentifier,
    LowTrust(i64),
}

impl RedirectReason {
    pub fn label(&self) -> &'static str {
        match self {
            RedirectReason::Disabled => "disabled",
            RedirectReason::NoFingerprint => "no_fingerprint",
            RedirectReason::CacheMiss => "cache_miss",
            RedirectReason::CacheUnavailable => "cache_unavailable",
            RedirectReason::MalformedIdentity => "malformed_identity",
            RedirectReason::EmptyIdentifier => "empty_identifier",
            RedirectReason::LowTrust(_) => "low_trust",
        }
    }
}

/// Terminal outcome of the gate.
#[derive(Debug, Clone, PartialEq)]
pub enum FastAuthDecision<U> {
    /// Use the cached identity; a verification has been scheduled.
    Accept(U),
    /// Send the client through the provider's authorization flow.
    Redirect(RedirectReason),
}

impl<U> FastAuthDecision<U> {
    pub fn is_accept(&self) -> bool {
        matches!(self, FastAuthDecision::Accept(_))
    }
}

/// Cache lifetime rule: agents containing `agent_contains` get `ttl_secs`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TtlRule {
    pub agent_contains: String,
    pub ttl_secs: u64,
}

/// Fast-auth configuration (`[fast_auth]`).
#[derive(Debug, Clone, Deserialize)]
pub struct FastAuthConfig {
    /// Master switch; when off every request is redirected
    #[serde(default)]
    pub enabled: bool,
    /// Identity cache lifetime when no rule matches (default: 2 days)
    #[serde(default = "default_identity_ttl")]
    pub identity_ttl_secs: u64,
    /// First matching rule wins
    #[serde(default = "default_ttl_rules")]
    pub ttl_rules: Vec<TtlRule>,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
}

const DAY_SECS: u64 = 24 * 3600;

fn default_identity_ttl() -> u64 {
    2 * DAY_SECS
}

fn default_ttl_rules() -> Vec<TtlRule> {
    // WiFi addresses change far less often than cellular ones.
    vec![TtlRule {
        agent_contains: "NetType/WIFI".to_string(),
        ttl_secs: 60 * DAY_SECS,
    }]
}

impl Default for FastAuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            identity_ttl_secs: default_identity_ttl(),
            ttl_rules: default_ttl_rules(),
            trust: TrustConfig::default(),
            verifier: VerifierConfig::default(),
        }
    }
}

/// Picks the identity cache TTL from the client fingerprint.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    default: Duration,
    rules: Vec<TtlRule>,
}

impl TtlPolicy {
    pub fn new(default: Duration, rules: Vec<TtlRule>) -> Self {
        Self { default, rules }
    }

    pub fn from_config(config: &FastAuthConfig) -> Self {
        Self::new(
            Duration::from_secs(config.identity_ttl_secs),
            config.ttl_rules.clone(),
        )
    }

    pub fn ttl_for(&self, fingerprint: &Fingerprint) -> Duration {
        self.rules
            .iter()
            .find(|rule| fingerprint.contains(&rule.agent_contains))
            .map(|rule| Duration::from_secs(rule.ttl_secs))
            .unwrap_or(self.default)
    }
}

/// Failure while caching an identity after a full login.
#[derive(Debug, thiserror::Error)]
pub enum WriteBackError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("identity could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The fast-auth decision state machine.
pub struct FastAuthGate {
    enabled: bool,
    cache: Arc<dyn ExpiringCache>,
    trust: Arc<TrustStore>,
    scheduler: Arc<dyn VerificationScheduler>,
    ttl_policy: TtlPolicy,
}

impl FastAuthGate {
    pub fn new(
        enabled: bool,
        cache: Arc<dyn ExpiringCache>,
        trust: Arc<TrustStore>,
        scheduler: Arc<dyn VerificationScheduler>,
        ttl_policy: TtlPolicy,
    ) -> Self {
        Self {
            enabled,
            cache,
            trust,
            scheduler,
            ttl_policy,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Decide for a client address and its user-agent header values.
    pub async fn decide<U, I, S>(&self, address: &str, agents: I) -> FastAuthDecision<U>
    where
        U: UserIdentity + DeserializeOwned,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.enabled {
            return self.redirect(RedirectReason::Disabled);
        }
        self.decide_origin(ClientOrigin::derive(address, agents)).await
    }

    /// Same as [`decide`](Self::decide), reading `User-Agent` from request headers.
    pub async fn decide_headers<U>(&self, address: &str, headers: &HeaderMap) -> FastAuthDecision<U>
    where
        U: UserIdentity + DeserializeOwned,
    {
        if !self.enabled {
            return self.redirect(RedirectReason::Disabled);
        }
        self.decide_origin(ClientOrigin::from_headers(address, headers))
            .await
    }

    async fn decide_origin<U>(&self, origin: Option<ClientOrigin>) -> FastAuthDecision<U>
    where
        U: UserIdentity + DeserializeOwned,
    {
        let Some(origin) = origin else {
            return self.redirect(RedirectReason::NoFingerprint);
        };

        let raw = match self
            .cache
            .hash_get(&origin.address, origin.fingerprint.as_str())
            .await
        {
            Ok(Some(raw)) => raw,
            Ok(None) => return self.redirect(RedirectReason::CacheMiss),
            Err(e) => {
                warn!("Identity lookup for {} failed: {}", origin.address, e);
                return self.redirect(RedirectReason::CacheUnavailable);
            }
        };

        let user: U = match serde_json::from_slice(&raw) {
            Ok(user) => user,
            Err(e) => {
                debug!("Cached identity for {} is malformed: {}", origin.address, e);
                return self.redirect(RedirectReason::MalformedIdentity);
            }
        };

        let identifier = user.identifier();
        if identifier.is_empty() {
            return self.redirect(RedirectReason::EmptyIdentifier);
        }

        let score = self.trust.read(identifier).await;
        if !self.trust.is_trusted(score) {
            return self.redirect(RedirectReason::LowTrust(score));
        }

        // Non-blocking: returns as soon as the check is queued.
        self.scheduler.schedule(identifier);

        info!("Fast login accepted for {} (trust {})", identifier, score);
        metrics::counter!("trustgate_fast_auth_total", "outcome" => "accept").increment(1);
        FastAuthDecision::Accept(user)
    }

    fn redirect<U>(&self, reason: RedirectReason) -> FastAuthDecision<U> {
        debug!("Fast login declined: {:?}", reason);
        metrics::counter!("trustgate_fast_auth_total", "outcome" => reason.label()).increment(1);
        FastAuthDecision::Redirect(reason)
    }

    /// Write-back after a full login: reset the identity's trust score and
    /// cache the identity under `(address, fingerprint)`.
    ///
    /// Without a user-agent header only the trust score is reset. Does
    /// nothing when the fast path is disabled.
    pub async fn remember<U>(
        &self,
        address: &str,
        fingerprint: Option<&Fingerprint>,
        user: &U,
    ) -> Result<(), WriteBackError>
    where
        U: UserIdentity + Serialize,
    {
        if !self.enabled {
            return Ok(());
        }

        let identifier = user.identifier();
        self.trust.initialize(identifier).await?;

        let Some(fingerprint) = fingerprint else {
            warn!(
                "Request from {} has no user-agent; identity {} not cached",
                address, identifier
            );
            return Ok(());
        };

        let payload = Bytes::from(serde_json::to_vec(user)?);
        let ttl = self.ttl_policy.ttl_for(fingerprint);
        self.cache
            .hash_set_with_expiry(address, fingerprint.as_str(), payload, ttl)
            .await?;
        debug!(
            "Cached identity {} for {} (ttl {}s)",
            identifier,
            address,
            ttl.as_secs()
        );
        Ok(())
    }
}
