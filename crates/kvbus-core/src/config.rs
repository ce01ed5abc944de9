//! Layered settings: defaults, optional TOML file, then environment.
//!
//! CLI flags are applied on top by the binary.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{KvError, KvResult};

/// Top-level settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub redis: RedisSettings,
    pub pubsub: PubSubSettings,
    pub worker: WorkerSettings,
    pub log: LogSettings,
}

/// Connection target and pool tuning for the shared Redis connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Full connection URL. Takes precedence over host/port/db/password.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub password: Option<String>,
    pub connect_timeout_secs: u64,
    pub response_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub max_connections: usize,
    pub retry_on_timeout: bool,
    pub retries: usize,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            password: None,
            connect_timeout_secs: 5,
            response_timeout_secs: 5,
            health_check_interval_secs: 30,
            max_connections: 20,
            retry_on_timeout: true,
            retries: 3,
        }
    }
}

impl RedisSettings {
    /// Resolve the connection URL.
    ///
    /// Fails when neither an explicit URL nor a host is configured.
    pub fn connection_url(&self) -> KvResult<String> {
        if let Some(url) = self.url.as_deref().map(str::trim) {
            if !url.is_empty() {
                return Ok(url.to_string());
            }
        }

        let host = self.host.trim();
        if host.is_empty() {
            return Err(KvError::config(
                "redis connection target is not configured (set redis.url or redis.host)",
            ));
        }

        let url = match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!("redis://:{}@{}:{}/{}", password, host, self.port, self.db),
            None => format!("redis://{}:{}/{}", host, self.port, self.db),
        };
        Ok(url)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Subscription polling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubSubSettings {
    pub poll_timeout_ms: u64,
    /// Messages buffered between the subscription task and its consumer.
    pub buffer: usize,
}

impl Default for PubSubSettings {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 1000,
            buffer: 64,
        }
    }
}

impl PubSubSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Background worker pool and its broker queue.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Broker URL. Defaults to the redis connection URL when unset.
    pub broker_url: Option<String>,
    pub queue: String,
    pub concurrency: usize,
    pub time_limit_secs: u64,
    pub soft_time_limit_secs: u64,
    pub max_retries: u32,
    pub poll_interval_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            broker_url: None,
            queue: "kvbus:tasks".to_string(),
            concurrency: 4,
            time_limit_secs: 300,
            soft_time_limit_secs: 240,
            max_retries: 0,
            poll_interval_ms: 1000,
        }
    }
}

impl WorkerSettings {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }

    pub fn soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.soft_time_limit_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    /// Directory for the daily rotated log file. Stdout only when unset.
    pub dir: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file and the process environment.
    pub fn load(path: Option<&Path>) -> KvResult<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|name| std::env::var(name).ok());
        Ok(settings)
    }

    /// Parse a TOML settings file.
    pub fn from_file(path: &Path) -> KvResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            KvError::config(format!("cannot read settings file {}: {}", path.display(), e))
        })?;
        let settings = toml::from_str(&raw)?;
        debug!(path = %path.display(), "Loaded settings file");
        Ok(settings)
    }

    /// Apply environment overrides through `lookup`.
    ///
    /// Unparsable numeric values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("KVBUS_REDIS_URL") {
            self.redis.url = Some(url);
        }
        if let Some(host) = lookup("REDIS_HOST") {
            self.redis.host = host;
        }
        if let Some(port) = lookup("REDIS_PORT").and_then(|v| v.parse().ok()) {
            self.redis.port = port;
        }
        if let Some(db) = lookup("REDIS_DB").and_then(|v| v.parse().ok()) {
            self.redis.db = db;
        }
        if let Some(password) = lookup("REDIS_PASSWORD") {
            self.redis.password = Some(password);
        }
        if let Some(broker) = lookup("KVBUS_BROKER_URL") {
            self.worker.broker_url = Some(broker);
        }
        if let Some(dir) = lookup("KVBUS_LOG_DIR") {
            self.log.dir = Some(dir);
        }
        if let Some(level) = lookup("KVBUS_LOG_LEVEL") {
            self.log.level = level;
        }
    }

    /// Broker URL for the task queue, falling back to the cache connection.
    pub fn broker_url(&self) -> KvResult<String> {
        match self.worker.broker_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(url.to_string()),
            _ => self.redis.connection_url(),
        }
    }
}
