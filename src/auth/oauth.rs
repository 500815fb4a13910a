//! Identity provider client.
//!
//! Only the two calls a login needs are implemented: exchanging the one-time
//! authorization code for an access grant, and fetching the user profile with
//! that grant. Both endpoints answer with JSON and report failures in-band as
//! `{"errcode": ..., "errmsg": ...}`.

use super::gate::Direction;
use super::identity::ProviderUser;
use async_trait::async_trait;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider rejected request ({code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),
    /// Caller input the provider would refuse anyway; nothing was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Provider settings (`[provider]`).
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub app_id: String,
    /// Supports `$ENV_VAR` indirection
    #[serde(default = "empty_secret")]
    pub app_secret: SecretString,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_userinfo_url")]
    pub userinfo_url: String,
    /// Appended to the authorization URL as `#fragment`
    #[serde(default = "default_fragment")]
    pub fragment: Option<String>,
    /// Used when a request does not name a scope
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Profile language requested from the userinfo endpoint
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn empty_secret() -> SecretString {
    SecretString::new(String::new())
}

fn default_authorize_url() -> String {
    "https://open.weixin.qq.com/connect/oauth2/authorize".to_string()
}

fn default_token_url() -> String {
    "https://api.weixin.qq.com/sns/oauth2/access_token".to_string()
}

fn default_userinfo_url() -> String {
    "https://api.weixin.qq.com/sns/userinfo".to_string()
}

fn default_fragment() -> Option<String> {
    Some("wechat_redirect".to_string())
}

fn default_scope() -> String {
    "snsapi_userinfo".to_string()
}

fn default_lang() -> String {
    "zh_CN".to_string()
}

fn default_provider_timeout() -> u64 {
    10
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: empty_secret(),
            authorize_url: default_authorize_url(),
            token_url: default_token_url(),
            userinfo_url: default_userinfo_url(),
            fragment: default_fragment(),
            scope: default_scope(),
            lang: default_lang(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

/// Result of exchanging an authorization code.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessGrant {
    pub access_token: SecretString,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub refresh_token: Option<SecretString>,
    pub openid: String,
    #[serde(default)]
    pub scope: String,
}

/// The provider calls a login flow depends on.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Browser redirect that starts the provider's authorization flow.
    fn authorize_url(&self, direction: &Direction) -> Result<String, ProviderError>;

    async fn exchange_code(&self, code: &str) -> Result<AccessGrant, ProviderError>;

    async fn fetch_user(&self, grant: &AccessGrant) -> Result<ProviderUser, ProviderError>;
}

/// HTTP client for the provider's OAuth endpoints.
pub struct OAuthClient {
    client: Client,
    config: ProviderConfig,
    authorize_url: Url,
    token_url: Url,
    userinfo_url: Url,
}

impl OAuthClient {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let parse = |name: &str, raw: &str| {
            Url::parse(raw)
                .map_err(|e| ProviderError::InvalidConfig(format!("{} '{}': {}", name, raw, e)))
        };
        let authorize_url = parse("authorize_url", &config.authorize_url)?;
        let token_url = parse("token_url", &config.token_url)?;
        let userinfo_url = parse("userinfo_url", &config.userinfo_url)?;

        let client = Client::builder()
            .tcp_nodelay(true)
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            config,
            authorize_url,
            token_url,
            userinfo_url,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ProviderError> {
        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        parse_provider_body(&body)
    }
}

#[async_trait]
impl IdentityProvider for OAuthClient {
    fn authorize_url(&self, direction: &Direction) -> Result<String, ProviderError> {
        let scope = if direction.scope.is_empty() {
            &self.config.scope
        } else {
            &direction.scope
        };

        let mut url = self.authorize_url.clone();
        // The provider expects this exact parameter order.
        url.query_pairs_mut()
            .clear()
            .append_pair("appid", &self.config.app_id)
            .append_pair("redirect_uri", &direction.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", scope)
            .append_pair("state", &direction.state);
        url.set_fragment(self.config.fragment.as_deref());
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> Result<AccessGrant, ProviderError> {
        if code.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "authorization code is empty".to_string(),
            ));
        }

        let mut url = self.token_url.clone();
        url.query_pairs_mut()
            .append_pair("appid", &self.config.app_id)
            .append_pair("secret", self.config.app_secret.expose_secret())
            .append_pair("code", code)
            .append_pair("grant_type", "authorization_code");

        let grant: AccessGrant = self.get_json(url).await?;
        debug!("Exchanged authorization code for {}", grant.openid);
        Ok(grant)
    }

    async fn fetch_user(&self, grant: &AccessGrant) -> Result<ProviderUser, ProviderError> {
        let mut url = self.userinfo_url.clone();
        url.query_pairs_mut()
            .append_pair("access_token", grant.access_token.expose_secret())
            .append_pair("openid", &grant.openid)
            .append_pair("lang", &self.config.lang);

        self.get_json(url).await
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

/// Decode a provider response, surfacing in-band `errcode` failures.
fn parse_provider_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProviderError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| ProviderError::InvalidResponse(format!("not JSON: {}", e)))?;

    if value.get("errcode").is_some() {
        let err: ErrorBody = serde_json::from_value(value.clone())
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        if err.errcode != 0 {
            return Err(ProviderError::Rejected {
                code: err.errcode,
                message: err.errmsg,
            });
        }
    }

    serde_json::from_value(value).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
}
