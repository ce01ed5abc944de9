//! Process-wide connection handle.
//!
//! One `ConnectionLifecycle` is created at startup and shared by reference
//! (`Arc`) with every component that talks to Redis. It owns at most one live
//! connection at a time:
//!
//! ```text
//! Uninitialized --init/acquire--> Ready
//! Ready --transport fault--> Uninitialized --acquire--> Ready
//! Ready --close--> Uninitialized
//! ```

use kvbus_core::config::RedisSettings;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::{Backend, ConnectionOptions, Connector, RedisConnector, RedisResult};

struct Live {
    backend: Arc<dyn Backend>,
    checked_at: Instant,
}

/// Lazily created, self-healing shared connection.
pub struct ConnectionLifecycle {
    connector: Arc<dyn Connector>,
    health_check_interval: Duration,
    state: Mutex<Option<Live>>,
}

impl ConnectionLifecycle {
    pub fn new(connector: Arc<dyn Connector>, health_check_interval: Duration) -> Self {
        Self {
            connector,
            health_check_interval,
            state: Mutex::new(None),
        }
    }

    /// Build from settings. Fails fast when no connection target is configured.
    pub fn from_settings(settings: &RedisSettings) -> RedisResult<Self> {
        let connector = RedisConnector::from_settings(settings)?;
        let interval = connector.options().health_check_interval;
        Ok(Self::new(Arc::new(connector), interval))
    }

    /// Build for an explicit URL, reusing the transport tuning from `settings`.
    pub fn for_url(url: &str, settings: &RedisSettings) -> RedisResult<Self> {
        let options = ConnectionOptions::from(settings);
        let interval = options.health_check_interval;
        let connector = RedisConnector::new(url, options)?;
        Ok(Self::new(Arc::new(connector), interval))
    }

    /// The factory behind this handle, for callers that need short-lived
    /// connections of their own.
    pub fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }

    /// Connect eagerly and verify the server answers.
    pub async fn init(&self) -> RedisResult<()> {
        let backend = self.connect_if_absent().await?;
        if let Err(err) = backend.ping().await {
            self.invalidate(&backend).await;
            return Err(err);
        }
        info!(target = %self.connector.target(), "Redis connection ready");
        Ok(())
    }

    /// The live connection, created on first use.
    ///
    /// When the last health check is older than the health-check interval the
    /// connection is pinged first and replaced if it no longer answers.
    pub async fn acquire(&self) -> RedisResult<Arc<dyn Backend>> {
        let due = {
            let mut state = self.state.lock().await;
            match state.as_mut() {
                Some(live) if live.checked_at.elapsed() < self.health_check_interval => {
                    return Ok(live.backend.clone());
                }
                Some(live) => {
                    live.checked_at = Instant::now();
                    Some(live.backend.clone())
                }
                None => None,
            }
        };

        if let Some(backend) = due {
            match backend.ping().await {
                Ok(()) => return Ok(backend),
                Err(err) => {
                    warn!(error = %err, "Redis health check failed, reconnecting");
                    self.invalidate(&backend).await;
                }
            }
        }

        self.connect_if_absent().await
    }

    /// Drop `stale` after a transport fault and try to reconnect right away.
    ///
    /// A failed reconnect leaves the handle uninitialized; the next
    /// [`acquire`](Self::acquire) retries.
    pub async fn report_fault(&self, stale: &Arc<dyn Backend>) {
        self.invalidate(stale).await;
        if let Err(err) = self.connect_if_absent().await {
            warn!(error = %err, "Redis reconnect failed, will retry on next use");
        }
    }

    /// Ping the server through the live connection.
    pub async fn health_check(&self) -> bool {
        let backend = match self.acquire().await {
            Ok(backend) => backend,
            Err(err) => {
                warn!(error = %err, "Redis unavailable");
                return false;
            }
        };
        match backend.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Redis ping failed");
                if err.is_transport() {
                    self.report_fault(&backend).await;
                }
                false
            }
        }
    }

    pub async fn is_ready(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Dispose the connection. Safe to call repeatedly.
    pub async fn close(&self) {
        let live = self.state.lock().await.take();
        if let Some(live) = live {
            live.backend.close().await;
            info!(target = %self.connector.target(), "Redis connection closed");
        }
    }

    async fn connect_if_absent(&self) -> RedisResult<Arc<dyn Backend>> {
        let mut state = self.state.lock().await;
        if let Some(live) = state.as_ref() {
            return Ok(live.backend.clone());
        }

        let backend = self.connector.connect().await?;
        debug!(target = %self.connector.target(), "Redis connection created");
        *state = Some(Live {
            backend: backend.clone(),
            checked_at: Instant::now(),
        });
        Ok(backend)
    }

    async fn invalidate(&self, stale: &Arc<dyn Backend>) {
        let removed = {
            let mut state = self.state.lock().await;
            match state.as_ref() {
                Some(live) if Arc::ptr_eq(&live.backend, stale) => state.take(),
                _ => None,
            }
        };
        if let Some(live) = removed {
            live.backend.close().await;
            debug!("Dropped faulted Redis connection");
        }
    }
}
