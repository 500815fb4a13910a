//! Client fingerprint derivation.
//!
//! A fingerprint is the user-agent string(s) of a request with all
//! whitespace removed, capped at [`MAX_FINGERPRINT_LEN`] characters. Together
//! with the client address it addresses a cached identity: the address is the
//! hash bucket, the fingerprint the field. It is best-effort, not unique.

use axum::http::{header::USER_AGENT, HeaderMap};
use std::fmt;

/// Longest fingerprint kept, in characters.
pub const MAX_FINGERPRINT_LEN: usize = 1024;

/// Normalized user-agent string used as a cache sub-key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive from user-agent values in header order.
    ///
    /// Returns `None` when there is no user-agent header at all. A present but
    /// empty header still yields a (empty) fingerprint.
    pub fn derive<I, S>(agents: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut present = false;
        let mut normalized = String::new();
        for agent in agents {
            present = true;
            normalized.extend(agent.as_ref().chars().filter(|c| !c.is_whitespace()));
        }
        if !present {
            return None;
        }

        if let Some((cut, _)) = normalized.char_indices().nth(MAX_FINGERPRINT_LEN) {
            normalized.truncate(cut);
        }
        Some(Self(normalized))
    }

    /// Derive from every `User-Agent` header of a request.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        Self::derive(
            headers
                .get_all(USER_AGENT)
                .iter()
                .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned()),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Substring match, used by TTL rules (e.g. `NetType/WIFI`).
    pub fn contains(&self, needle: &str) -> bool {
        self.0.contains(needle)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a request came from: network address plus agent fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientOrigin {
    pub address: String,
    pub fingerprint: Fingerprint,
}

impl ClientOrigin {
    /// `None` when the request carries no user-agent header.
    pub fn derive<I, S>(address: &str, agents: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Fingerprint::derive(agents).map(|fingerprint| Self {
            address: address.to_string(),
            fingerprint,
        })
    }

    pub fn from_headers(address: &str, headers: &HeaderMap) -> Option<Self> {
        Fingerprint::from_headers(headers).map(|fingerprint| Self {
            address: address.to_string(),
            fingerprint,
        })
    }
}
