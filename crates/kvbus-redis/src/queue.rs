//! Task queues between dispatchers and workers.

use async_trait::async_trait;
use kvbus_core::task::{self, model::TaskEnvelope};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

use crate::client::{Backend, Connector, RedisError, RedisResult};
use crate::lifecycle::ConnectionLifecycle;

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn push(&self, envelope: &TaskEnvelope) -> RedisResult<()>;

    /// Next task, or `None` if nothing arrived within `wait`.
    async fn pop(&self, wait: Duration) -> RedisResult<Option<TaskEnvelope>>;
}

/// Broker queue on a Redis list (`LPUSH` / `BRPOP`), shared across processes.
///
/// Pushes go through the lifecycle's shared connection. A `BRPOP` blocks the
/// connection it runs on, so every concurrent pop borrows a dedicated popper
/// connection instead; idle poppers are kept for reuse and a faulted one is
/// discarded.
pub struct RedisTaskQueue {
    lifecycle: Arc<ConnectionLifecycle>,
    connector: Arc<dyn Connector>,
    poppers: Mutex<Vec<Arc<dyn Backend>>>,
    key: String,
}

impl RedisTaskQueue {
    pub fn new(lifecycle: Arc<ConnectionLifecycle>, key: &str) -> Self {
        Self {
            connector: lifecycle.connector(),
            lifecycle,
            poppers: Mutex::new(Vec::new()),
            key: key.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Close the idle popper connections.
    pub async fn close(&self) {
        let poppers: Vec<_> = self.poppers.lock().await.drain(..).collect();
        for popper in poppers {
            popper.close().await;
        }
    }

    async fn checkout(&self) -> RedisResult<Arc<dyn Backend>> {
        let idle = self.poppers.lock().await.pop();
        match idle {
            Some(popper) => Ok(popper),
            None => {
                let popper = self.connector.connect().await?;
                debug!(queue = %self.key, "Opened popper connection");
                Ok(popper)
            }
        }
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn push(&self, envelope: &TaskEnvelope) -> RedisResult<()> {
        let raw = task::encode(envelope)?;
        let backend = self.lifecycle.acquire().await?;
        if let Err(err) = backend.push(&self.key, &raw).await {
            if err.is_transport() {
                self.lifecycle.report_fault(&backend).await;
            }
            return Err(err);
        }
        debug!(queue = %self.key, task_id = %envelope.id, "Enqueued task");
        Ok(())
    }

    async fn pop(&self, wait: Duration) -> RedisResult<Option<TaskEnvelope>> {
        let popper = self.checkout().await?;
        let raw = match popper.pop(&self.key, wait).await {
            Ok(raw) => {
                self.poppers.lock().await.push(popper);
                raw
            }
            Err(err) => {
                if err.is_transport() {
                    popper.close().await;
                } else {
                    self.poppers.lock().await.push(popper);
                }
                return Err(err);
            }
        };
        let Some(raw) = raw else {
            return Ok(None);
        };

        match task::decode(&raw) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(err) => {
                error!(
                    queue = %self.key,
                    error = %err,
                    raw = %String::from_utf8_lossy(&raw),
                    "Dropping undecodable task"
                );
                Ok(None)
            }
        }
    }
}

/// In-process queue for running workers inside the dispatching process.
pub struct LocalTaskQueue {
    tx: mpsc::UnboundedSender<TaskEnvelope>,
    rx: Mutex<mpsc::UnboundedReceiver<TaskEnvelope>>,
}

impl LocalTaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

impl Default for LocalTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn push(&self, envelope: &TaskEnvelope) -> RedisResult<()> {
        self.tx
            .send(envelope.clone())
            .map_err(|_| RedisError::Closed("local task queue closed".to_string()))
    }

    async fn pop(&self, wait: Duration) -> RedisResult<Option<TaskEnvelope>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(envelope) => Ok(envelope),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryConnector, MemoryServer};
    use serde_json::json;

    fn queue_with(connector: Arc<MemoryConnector>) -> RedisTaskQueue {
        let lifecycle = Arc::new(ConnectionLifecycle::new(connector, Duration::from_secs(30)));
        RedisTaskQueue::new(lifecycle, "kvbus:tasks")
    }

    fn redis_queue() -> (RedisTaskQueue, Arc<MemoryServer>) {
        let server = MemoryServer::new();
        let connector = MemoryConnector::new(server.clone());
        (queue_with(connector), server)
    }

    #[tokio::test]
    async fn test_redis_queue_is_fifo() {
        let (queue, server) = redis_queue();
        let first = task::send_event("c", &json!(1)).unwrap();
        let second = task::send_event("c", &json!(2)).unwrap();
        queue.push(&first).await.unwrap();
        queue.push(&second).await.unwrap();
        assert_eq!(server.list_len("kvbus:tasks"), 2);

        let wait = Duration::from_millis(50);
        assert_eq!(queue.pop(wait).await.unwrap(), Some(first));
        assert_eq!(queue.pop(wait).await.unwrap(), Some(second));
        assert_eq!(queue.pop(wait).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_redis_queue_drops_malformed_entries() {
        let (queue, server) = redis_queue();
        server.push_raw("kvbus:tasks", b"{not json");
        assert_eq!(queue.pop(Duration::from_millis(50)).await.unwrap(), None);
        assert_eq!(server.list_len("kvbus:tasks"), 0);
    }

    #[tokio::test]
    async fn test_redis_queue_pop_wakes_on_push() {
        let (queue, server) = redis_queue();
        let queue = Arc::new(queue);
        let envelope = task::send_event("c", "late").unwrap();
        let raw = task::encode(&envelope).unwrap();

        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.push_raw("kvbus:tasks", &raw);

        assert_eq!(popper.await.unwrap().unwrap(), Some(envelope));
    }

    #[tokio::test]
    async fn test_redis_queue_push_fault_is_reported() {
        let (queue, server) = redis_queue();
        queue.pop(Duration::from_millis(1)).await.unwrap();
        server.fail_next(1);
        let envelope = task::send_event("c", &1).unwrap();
        let err = queue.push(&envelope).await.unwrap_err();
        assert!(err.is_transport());
        queue.push(&envelope).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_pops_use_their_own_connections() {
        let server = MemoryServer::new();
        let connector = MemoryConnector::new(server.clone());
        let queue = Arc::new(queue_with(connector.clone()));

        let poppers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pop(Duration::from_millis(200)).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.connects(), 3);

        // Pushing is not held up behind the blocked pops.
        let envelope = task::send_event("c", &1).unwrap();
        tokio::time::timeout(Duration::from_millis(100), queue.push(&envelope))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connector.connects(), 4);

        let mut popped = 0;
        for popper in poppers {
            if popper.await.unwrap().unwrap().is_some() {
                popped += 1;
            }
        }
        assert_eq!(popped, 1);

        // Idle poppers are reused.
        queue.pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(connector.connects(), 4);

        queue.close().await;
        let opened = connector.opened();
        assert_eq!(opened.iter().filter(|b| b.is_closed()).count(), 3);
    }

    #[tokio::test]
    async fn test_faulted_popper_is_replaced() {
        let server = MemoryServer::new();
        let connector = MemoryConnector::new(server.clone());
        let queue = queue_with(connector.clone());

        queue.pop(Duration::from_millis(1)).await.unwrap();
        server.fail_next(1);
        assert!(queue.pop(Duration::from_millis(1)).await.unwrap_err().is_transport());
        assert!(connector.opened()[0].is_closed());

        queue.pop(Duration::from_millis(1)).await.unwrap();
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_local_queue_round_trip() {
        let queue = LocalTaskQueue::new();
        assert_eq!(queue.pop(Duration::from_millis(10)).await.unwrap(), None);

        let envelope = task::send_event("c", &json!({"k": "v"})).unwrap();
        queue.push(&envelope).await.unwrap();
        assert_eq!(
            queue.pop(Duration::from_millis(10)).await.unwrap(),
            Some(envelope)
        );
    }
}
