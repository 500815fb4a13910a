use serde::{Deserialize, Serialize};

/// Anything the identity provider hands back that has a stable external id.
///
/// The gate and trust store only ever look at [`identifier`](Self::identifier);
/// richer identity shapes are the caller's business.
pub trait UserIdentity {
    fn identifier(&self) -> &str;
}

/// User profile as returned by the provider's userinfo endpoint.
///
/// Fields the provider sends that are not modelled here are kept in `extra`
/// so a cached identity round-trips without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderUser {
    /// Stable per-application user id
    pub openid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    /// Avatar URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headimgurl: Option<String>,
    /// Cross-application id, when the provider grants one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unionid: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProviderUser {
    pub fn new(openid: impl Into<String>) -> Self {
        Self {
            openid: openid.into(),
            nickname: None,
            headimgurl: None,
            unionid: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl UserIdentity for ProviderUser {
    fn identifier(&self) -> &str {
        &self.openid
    }
}
