//! Redis cache backend.
//!
//! Connections come from an r2d2 pool (bounded active/idle counts, idle
//! timeout, `PING` before reuse). Each operation checks a connection out,
//! runs its commands and returns it; nothing is held between operations.
//! The redis client is blocking, so commands run on tokio's blocking pool.

use super::{CacheError, ExpiringCache};
use async_trait::async_trait;
use bytes::Bytes;
use redis::ConnectionLike;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

/// Connection settings for the redis backend.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisOptions {
    /// `host:port`
    #[serde(default = "default_host")]
    pub host: String,
    /// Optional AUTH password (`$ENV_VAR` indirection is resolved at config load)
    #[serde(default)]
    pub password: Option<SecretString>,
    /// Database selector
    #[serde(default)]
    pub database: i64,
    /// Idle connections the pool keeps open (r2d2 `min_idle`). The pool
    /// dials up to this many in the background as soon as it is built.
    #[serde(default)]
    pub min_idle: u32,
    /// Upper bound on open connections
    #[serde(default = "default_max_active")]
    pub max_active: u32,
    /// Seconds before an idle connection is closed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Milliseconds to wait for a pooled connection before reporting the store unavailable
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_max_active() -> u32 {
    64
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    5_000
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            host: default_host(),
            password: None,
            database: 0,
            min_idle: 0,
            max_active: default_max_active(),
            idle_timeout_secs: default_idle_timeout(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl RedisOptions {
    /// Build the `redis://` URL, percent-encoding the password.
    pub fn connection_url(&self) -> Result<String, CacheError> {
        let mut url = reqwest::Url::parse(&format!("redis://{}/{}", self.host, self.database))
            .map_err(|e| CacheError::Backend(format!("invalid redis host '{}': {}", self.host, e)))?;
        if let Some(ref password) = self.password {
            url.set_password(Some(password.expose_secret()))
                .map_err(|_| CacheError::Backend("cannot attach password to redis url".to_string()))?;
        }
        Ok(url.to_string())
    }
}

/// r2d2 manager for blocking redis connections.
pub struct RedisConnectionManager {
    client: redis::Client,
}

impl r2d2::ManageConnection for RedisConnectionManager {
    type Connection = redis::Connection;
    type Error = redis::RedisError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.client.get_connection()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        let _: String = redis::cmd("PING").query(conn)?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        !conn.is_open()
    }
}

/// Redis-backed [`ExpiringCache`].
#[derive(Clone)]
pub struct RedisCache {
    pool: r2d2::Pool<RedisConnectionManager>,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("state", &self.pool.state())
            .finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Build the pool. Beyond `min_idle`, connections are opened on demand,
    /// so an unreachable server surfaces on the first operation rather than here.
    pub fn connect(options: &RedisOptions) -> Result<Self, CacheError> {
        let client = redis::Client::open(options.connection_url()?)
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        let max_active = options.max_active.max(1);
        let pool = r2d2::Pool::builder()
            .max_size(max_active)
            .min_idle(Some(options.min_idle.min(max_active)))
            .idle_timeout(Some(Duration::from_secs(options.idle_timeout_secs)))
            .connection_timeout(Duration::from_millis(options.connect_timeout_ms.max(1)))
            .test_on_check_out(true)
            .build_unchecked(RedisConnectionManager { client });

        Ok(Self { pool })
    }

    async fn run<T, F>(&self, key: &str, op: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| CacheError::Unavailable(e.to_string()))?;
            op(&mut conn).map_err(|e| map_redis_error(&key, e))
        })
        .await
        .map_err(|e| CacheError::Backend(format!("cache task failed: {}", e)))?
    }
}

fn map_redis_error(key: &str, err: redis::RedisError) -> CacheError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        return CacheError::Unavailable(err.to_string());
    }
    if err.code() == Some("WRONGTYPE") {
        return CacheError::WrongType(key.to_string());
    }
    if err.to_string().contains("not an integer") {
        return CacheError::NotAnInteger(key.to_string());
    }
    CacheError::Backend(err.to_string())
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl ExpiringCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let owned = key.to_string();
        let raw: Option<Vec<u8>> = self
            .run(key, move |conn| redis::cmd("GET").arg(&owned).query(conn))
            .await?;
        Ok(raw.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError> {
        let owned = key.to_string();
        self.run(key, move |conn| {
            let mut cmd = redis::cmd("SET");
            cmd.arg(&owned).arg(value.as_ref());
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(millis(ttl));
            }
            cmd.query::<()>(conn)
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let owned = key.to_string();
        let count: i64 = self
            .run(key, move |conn| redis::cmd("EXISTS").arg(&owned).query(conn))
            .await?;
        Ok(count > 0)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let owned = key.to_string();
        self.run(key, move |conn| redis::cmd("DEL").arg(&owned).query::<()>(conn))
            .await
    }

    async fn hash_get(&self, bucket: &str, field: &str) -> Result<Option<Bytes>, CacheError> {
        let (owned_bucket, owned_field) = (bucket.to_string(), field.to_string());
        let raw: Option<Vec<u8>> = self
            .run(bucket, move |conn| {
                redis::cmd("HGET")
                    .arg(&owned_bucket)
                    .arg(&owned_field)
                    .query(conn)
            })
            .await?;
        Ok(raw.map(Bytes::from))
    }

    async fn hash_set_with_expiry(
        &self,
        bucket: &str,
        field: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let (owned_bucket, owned_field) = (bucket.to_string(), field.to_string());
        self.run(bucket, move |conn| {
            let exists: i64 = redis::cmd("EXISTS").arg(&owned_bucket).query(conn)?;
            if exists > 0 {
                return redis::cmd("HSET")
                    .arg(&owned_bucket)
                    .arg(&owned_field)
                    .arg(value.as_ref())
                    .query::<()>(conn);
            }
            // MULTI / HSET / PEXPIRE / EXEC
            redis::pipe()
                .atomic()
                .cmd("HSET")
                .arg(&owned_bucket)
                .arg(&owned_field)
                .arg(value.as_ref())
                .ignore()
                .cmd("PEXPIRE")
                .arg(&owned_bucket)
                .arg(millis(ttl))
                .ignore()
                .query::<()>(conn)
        })
        .await
    }

    async fn decr_by(&self, key: &str, amount: i64) -> Result<i64, CacheError> {
        let owned = key.to_string();
        self.run(key, move |conn| {
            redis::cmd("DECRBY").arg(&owned).arg(amount).query(conn)
        })
        .await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.run("PING", |conn| redis::cmd("PING").query::<String>(conn))
            .await
            .map(|_| ())
    }
}
