//! Redis connection management.
//!
//! [`Backend`] is the command surface the store, pub/sub channel and task
//! queue run against. [`Connector`] opens backends; [`RedisConnector`] is the
//! production implementation on top of `redis::aio::ConnectionManager`.

use async_trait::async_trait;
use futures::StreamExt;
use kvbus_core::config::RedisSettings;
use kvbus_core::KvError;
use redis::aio::{ConnectionManager, ConnectionManagerConfig, PubSub};
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

/// Redis error types.
#[derive(Error, Debug)]
pub enum RedisError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

/// Result type for Redis operations.
pub type RedisResult<T> = Result<T, RedisError>;

impl RedisError {
    /// Whether the error means the connection itself is unusable.
    ///
    /// Transport faults make the lifecycle drop and recreate the connection.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Connection(e) => {
                e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
            }
            Self::Timeout(_) | Self::Closed(_) => true,
            _ => false,
        }
    }
}

impl From<KvError> for RedisError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Config(msg) => Self::Config(msg),
            KvError::Json(e) => Self::Serialization(e),
            other => Self::OperationFailed(other.to_string()),
        }
    }
}

/// Commands issued against one live connection.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn ping(&self) -> RedisResult<()>;

    async fn get(&self, key: &str) -> RedisResult<Option<Vec<u8>>>;

    /// Write a value, with the expiry applied in the same command when `ttl` is set.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<u64>) -> RedisResult<()>;

    /// Returns the number of keys removed.
    async fn del(&self, keys: &[String]) -> RedisResult<u64>;

    async fn exists(&self, key: &str) -> RedisResult<bool>;

    async fn expire(&self, key: &str, seconds: i64) -> RedisResult<bool>;

    /// One `SCAN` step. A returned cursor of 0 ends the iteration.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize)
        -> RedisResult<(u64, Vec<String>)>;

    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, payload: &[u8]) -> RedisResult<usize>;

    /// Open a dedicated subscription connection on `channel`.
    async fn subscribe(&self, channel: &str) -> RedisResult<Box<dyn Subscription>>;

    /// Push onto the head of a list.
    async fn push(&self, list: &str, value: &[u8]) -> RedisResult<()>;

    /// Pop from the tail of a list, waiting at most `wait`.
    async fn pop(&self, list: &str, wait: Duration) -> RedisResult<Option<Vec<u8>>>;

    /// Release the connection. Later commands fail.
    async fn close(&self) {}
}

/// A live channel subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Next payload, or `None` when nothing arrived within `wait`.
    async fn next_message(&mut self, wait: Duration) -> RedisResult<Option<Vec<u8>>>;

    async fn unsubscribe(&mut self) -> RedisResult<()>;
}

/// Opens new backend connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> RedisResult<Arc<dyn Backend>>;

    /// Human readable target for logs.
    fn target(&self) -> String;
}

/// Transport tuning applied to every connection a [`RedisConnector`] opens.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub health_check_interval: Duration,
    /// Upper bound on in-flight commands per connection.
    pub max_connections: usize,
    pub retry_on_timeout: bool,
    pub retries: usize,
}

impl From<&RedisSettings> for ConnectionOptions {
    fn from(settings: &RedisSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            response_timeout: settings.response_timeout(),
            health_check_interval: settings.health_check_interval(),
            max_connections: settings.max_connections.max(1),
            retry_on_timeout: settings.retry_on_timeout,
            retries: settings.retries,
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from(&RedisSettings::default())
    }
}

/// Connector backed by `redis::Client`.
pub struct RedisConnector {
    client: redis::Client,
    options: ConnectionOptions,
}

impl RedisConnector {
    /// Validate the URL and prepare a client. Does not touch the network.
    ///
    /// Example URL: `redis://127.0.0.1:6379/0`
    pub fn new(redis_url: &str, options: ConnectionOptions) -> RedisResult<Self> {
        if redis_url.trim().is_empty() {
            return Err(RedisError::Config("redis url is empty".to_string()));
        }
        let client = redis::Client::open(redis_url)
            .map_err(|e| RedisError::Config(format!("invalid redis url: {}", e)))?;
        Ok(Self { client, options })
    }

    pub fn from_settings(settings: &RedisSettings) -> RedisResult<Self> {
        let url = settings.connection_url()?;
        Self::new(&url, ConnectionOptions::from(settings))
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> RedisResult<Arc<dyn Backend>> {
        let retries = if self.options.retry_on_timeout {
            self.options.retries
        } else {
            0
        };
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(self.options.connect_timeout)
            .set_response_timeout(self.options.response_timeout)
            .set_number_of_retries(retries);

        // The manager retries with its own backoff; the whole attempt is
        // bounded by the connect timeout.
        let manager = tokio::time::timeout(
            self.options.connect_timeout,
            ConnectionManager::new_with_config(self.client.clone(), config),
        )
        .await
        .map_err(|_| RedisError::Timeout(self.options.connect_timeout))??;
        debug!(target = %self.target(), "Redis connection established");

        Ok(Arc::new(RedisBackend {
            client: self.client.clone(),
            manager,
            limiter: Semaphore::new(self.options.max_connections),
            connect_timeout: self.options.connect_timeout,
            response_timeout: self.options.response_timeout,
        }))
    }

    fn target(&self) -> String {
        self.client.get_connection_info().addr.to_string()
    }
}

/// Backend over a multiplexed `ConnectionManager`.
///
/// The manager is Clone, so each command clones it for a mutable handle.
pub struct RedisBackend {
    client: redis::Client,
    manager: ConnectionManager,
    limiter: Semaphore,
    connect_timeout: Duration,
    response_timeout: Duration,
}

/// Server-side timeout for a blocking pop, in seconds.
///
/// Kept below the response timeout so the reply always beats it, and above
/// zero since a zero timeout blocks forever.
fn blocking_wait(wait: Duration, response_timeout: Duration) -> f64 {
    const MARGIN: Duration = Duration::from_millis(500);
    const FLOOR: Duration = Duration::from_millis(10);
    let ceiling = response_timeout.saturating_sub(MARGIN).max(FLOOR);
    wait.clamp(FLOOR, ceiling).as_secs_f64()
}

impl RedisBackend {
    async fn permit(&self) -> RedisResult<SemaphorePermit<'_>> {
        self.limiter
            .acquire()
            .await
            .map_err(|_| RedisError::Closed("connection pool disposed".to_string()))
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn ping(&self) -> RedisResult<()> {
        let _permit = self.permit().await?;
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> RedisResult<Option<Vec<u8>>> {
        let _permit = self.permit().await?;
        let mut conn = self.manager.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<u64>) -> RedisResult<()> {
        let _permit = self.permit().await?;
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(seconds) = ttl {
            cmd.arg("EX").arg(seconds);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> RedisResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let _permit = self.permit().await?;
        let mut conn = self.manager.clone();
        let removed: u64 = conn.del(keys).await?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> RedisResult<bool> {
        let _permit = self.permit().await?;
        let mut conn = self.manager.clone();
        let found: bool = conn.exists(key).await?;
        Ok(found)
    }

    async fn expire(&self, key: &str, seconds: i64) -> RedisResult<bool> {
        let _permit = self.permit().await?;
        let mut conn = self.manager.clone();
        let applied: bool = redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async(&mut conn)
            .await?;
        Ok(applied)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> RedisResult<(u64, Vec<String>)> {
        let _permit = self.permit().await?;
        let mut conn = self.manager.clone();
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok((next, keys))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> RedisResult<usize> {
        let _permit = self.permit().await?;
        let mut conn = self.manager.clone();
        let receivers: usize = conn.publish(channel, payload).await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> RedisResult<Box<dyn Subscription>> {
        if self.limiter.is_closed() {
            return Err(RedisError::Closed("connection pool disposed".to_string()));
        }
        let mut pubsub = tokio::time::timeout(self.connect_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| RedisError::Timeout(self.connect_timeout))??;
        pubsub.subscribe(channel).await?;
        debug!(channel = %channel, "Subscribed");

        Ok(Box::new(RedisSubscription {
            channel: channel.to_string(),
            pubsub,
        }))
    }

    async fn push(&self, list: &str, value: &[u8]) -> RedisResult<()> {
        let _permit = self.permit().await?;
        let mut conn = self.manager.clone();
        let _: () = conn.lpush(list, value).await?;
        Ok(())
    }

    async fn pop(&self, list: &str, wait: Duration) -> RedisResult<Option<Vec<u8>>> {
        let _permit = self.permit().await?;
        let mut conn = self.manager.clone();
        let popped: Option<(String, Vec<u8>)> = redis::cmd("BRPOP")
            .arg(list)
            .arg(blocking_wait(wait, self.response_timeout))
            .query_async(&mut conn)
            .await?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn close(&self) {
        self.limiter.close();
    }
}

/// Subscription on a dedicated `PubSub` connection.
struct RedisSubscription {
    channel: String,
    pubsub: PubSub,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self, wait: Duration) -> RedisResult<Option<Vec<u8>>> {
        let mut messages = self.pubsub.on_message();
        match tokio::time::timeout(wait, messages.next()).await {
            Ok(Some(msg)) => Ok(Some(msg.get_payload_bytes().to_vec())),
            Ok(None) => Err(RedisError::Closed(format!(
                "subscription to '{}' ended",
                self.channel
            ))),
            Err(_) => Ok(None),
        }
    }

    async fn unsubscribe(&mut self) -> RedisResult<()> {
        self.pubsub.unsubscribe(&self.channel).await?;
        debug!(channel = %self.channel, "Unsubscribed");
        Ok(())
    }
}
