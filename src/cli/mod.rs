use crate::auth::{FastAuthConfig, ProviderConfig};
use crate::cache::RedisOptions;
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Top-level configuration, loaded from `~/.trustgate/config.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub fast_auth: FastAuthConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Required on `/api/*` routes when set. Supports `$ENV_VAR`.
    #[serde(default)]
    pub api_key: Option<SecretString>,
    /// Externally visible base URL, used to build the provider callback URL.
    /// Defaults to `http://<host>:<port>`.
    #[serde(default)]
    pub public_url: Option<String>,
    /// Reverse proxies whose `X-Forwarded-For` / `X-Real-IP` headers are
    /// believed. Headers from any other peer are ignored.
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            api_key: None,
            public_url: None,
            trusted_proxies: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8001
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServerConfig {
    pub fn base_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format_base_url(&self.host, self.port),
        }
    }
}

/// Which store backs the expiring cache.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// In-process; state is lost on restart and not shared between instances
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    /// Entry limit for the memory backend
    #[serde(default = "default_cache_max_capacity")]
    pub max_capacity: u64,
    #[serde(default)]
    pub redis: RedisOptions,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            max_capacity: default_cache_max_capacity(),
            redis: RedisOptions::default(),
        }
    }
}

fn default_cache_max_capacity() -> u64 {
    100_000
}

impl AppConfig {
    /// Get default config file path
    /// Returns ~/.trustgate/config.toml (cross-platform)
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".trustgate").join("config.toml"))
    }

    /// Load configuration from a TOML file, writing a default one first if missing
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            Self::create_default_config(path)?;
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_content(&content, &format!("{}", path.display()))
    }

    /// Parse configuration from TOML content string
    pub fn from_content(content: &str, source_label: &str) -> Result<Self> {
        let mut config: AppConfig = toml::from_str(content)
            .with_context(|| format!("Failed to parse config from {}", source_label))?;

        config.resolve_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for common errors
    pub fn validate(&self) -> Result<()> {
        let trust = &self.fast_auth.trust;
        let verifier = &self.fast_auth.verifier;

        if trust.namespace.is_empty() || verifier.namespace.is_empty() {
            anyhow::bail!("fast_auth namespaces must not be empty");
        }
        if trust.namespace == verifier.namespace {
            anyhow::bail!(
                "fast_auth.trust.namespace and fast_auth.verifier.namespace must differ (both '{}')",
                trust.namespace
            );
        }
        if trust.threshold > trust.initial_score {
            anyhow::bail!(
                "fast_auth.trust.threshold ({}) is above initial_score ({}); no identity could ever use the fast path",
                trust.threshold,
                trust.initial_score
            );
        }
        if verifier.penalty <= 0 {
            anyhow::bail!("fast_auth.verifier.penalty must be positive");
        }
        if self.fast_auth.identity_ttl_secs == 0
            || self.fast_auth.ttl_rules.iter().any(|rule| rule.ttl_secs == 0)
        {
            anyhow::bail!("fast_auth identity TTLs must be greater than zero");
        }

        if self.provider.app_id.is_empty() {
            anyhow::bail!("provider.app_id is not configured");
        }

        if self.cache.backend == CacheBackend::Redis && self.cache.redis.host.is_empty() {
            anyhow::bail!("cache.backend = \"redis\" but cache.redis.host is empty");
        }

        Ok(())
    }

    fn create_default_config(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        std::fs::write(path, Self::default_config_content())
            .with_context(|| format!("Failed to write default config file: {}", path.display()))?;

        eprintln!("Created default config file at: {}", path.display());
        eprintln!("Please edit [provider] with your application credentials.");
        Ok(())
    }

    /// Generate default configuration content as TOML string
    pub fn default_config_content() -> String {
        r#"# trustgate configuration

[server]
host = "127.0.0.1"
port = 8001
log_level = "info"
# public_url = "https://login.example.com"
# api_key = "$TRUSTGATE_API_KEY"
# trusted_proxies = ["127.0.0.1"]   # only these peers may set X-Forwarded-For

[cache]
backend = "memory"   # or "redis"
max_capacity = 100000

# [cache.redis]
# host = "127.0.0.1:6379"
# password = "$REDIS_PASSWORD"
# database = 0
# min_idle = 0                # connections kept open while idle
# max_active = 64
# idle_timeout_secs = 300

[fast_auth]
enabled = true
identity_ttl_secs = 172800      # 2 days

[[fast_auth.ttl_rules]]
agent_contains = "NetType/WIFI"
ttl_secs = 5184000              # 60 days

[fast_auth.trust]
initial_score = 100
threshold = 50

[fast_auth.verifier]
delay_secs = 5
window_secs = 10
penalty = 20

[provider]
app_id = "your-app-id"
app_secret = "your-app-secret"   # or "$TRUSTGATE_APP_SECRET"
"#
        .to_string()
    }

    /// Resolve `$ENV_VAR` references in secret fields
    fn resolve_env_vars(&mut self) -> Result<()> {
        if let Some(key) = &self.server.api_key {
            self.server.api_key = Some(resolve_secret(key, "server.api_key")?);
        }
        if let Some(password) = &self.cache.redis.password {
            self.cache.redis.password = Some(resolve_secret(password, "cache.redis.password")?);
        }
        self.provider.app_secret = resolve_secret(&self.provider.app_secret, "provider.app_secret")?;
        Ok(())
    }
}

fn resolve_secret(value: &SecretString, field: &str) -> Result<SecretString> {
    let Some(env_var) = value.expose_secret().strip_prefix('$') else {
        return Ok(value.clone());
    };
    match std::env::var(env_var) {
        Ok(resolved) => Ok(SecretString::new(resolved)),
        Err(_) => anyhow::bail!(
            "Environment variable ${} not set for {}\n\n\
             Fix with one of:\n  \
             export {}=...\n  \
             Put the value directly in config.toml",
            env_var,
            field,
            env_var
        ),
    }
}

/// Format a bind address with proper IPv6 bracket notation.
/// IPv6 hosts (containing `:`) are wrapped in brackets: `[::1]:8001`
pub fn format_bind_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Format a base URL with proper IPv6 bracket notation.
pub fn format_base_url(host: &str, port: u16) -> String {
    format!("http://{}", format_bind_addr(host, port))
}
