//! Background worker pool executing queued tasks.

use kvbus_core::config::WorkerSettings;
use kvbus_core::task::model::{Task, TaskEnvelope};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::client::{Backend, Connector, RedisError, RedisResult};
use crate::pubsub::Payload;
use crate::queue::TaskQueue;

/// Worker pool tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Hard limit; the task is aborted when it runs out.
    pub time_limit: Duration,
    /// A warning is logged when a task runs past this.
    pub soft_time_limit: Duration,
    /// Re-enqueues allowed after a failure. 0 disables retries.
    pub max_retries: u32,
    /// Longest a worker blocks on an empty queue before checking for shutdown.
    pub poll_interval: Duration,
}

impl From<&WorkerSettings> for WorkerConfig {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            concurrency: settings.concurrency,
            time_limit: settings.time_limit(),
            soft_time_limit: settings.soft_time_limit(),
            max_retries: settings.max_retries,
            poll_interval: settings.poll_interval(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&WorkerSettings::default())
    }
}

/// Task outcomes since the pool was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

struct Inner {
    queue: Arc<dyn TaskQueue>,
    connector: Arc<dyn Connector>,
    config: WorkerConfig,
    counters: Counters,
}

/// Pops tasks from a queue and runs them.
///
/// Every task opens its own connection through `connector` and closes it when
/// done, so workers never share the dispatching process's connection.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        connector: Arc<dyn Connector>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                connector,
                config,
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Run `concurrency` worker loops until `shutdown` turns true or its
    /// sender goes away. Tasks in flight finish before this returns.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> WorkerStats {
        let concurrency = self.inner.config.concurrency.max(1);
        info!(concurrency, "Worker pool started");

        let mut workers = JoinSet::new();
        for worker in 0..concurrency {
            workers.spawn(worker_loop(self.inner.clone(), worker, shutdown.clone()));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Worker loop panicked");
            }
        }

        let stats = self.stats();
        info!(
            processed = stats.processed,
            failed = stats.failed,
            retried = stats.retried,
            "Worker pool stopped"
        );
        stats
    }

    /// Pop and run at most one task. Returns false when the queue stayed
    /// empty for the poll interval.
    pub async fn process_next(&self) -> RedisResult<bool> {
        self.inner.process_next().await
    }

    pub fn stats(&self) -> WorkerStats {
        let counters = &self.inner.counters;
        WorkerStats {
            processed: counters.processed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
        }
    }
}

fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

async fn worker_loop(inner: Arc<Inner>, worker: usize, mut shutdown: watch::Receiver<bool>) {
    debug!(worker, "Worker started");
    while !stopping(&shutdown) {
        if let Err(err) = inner.process_next().await {
            warn!(worker, error = %err, "Task queue unavailable");
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(inner.config.poll_interval) => {}
            }
        }
    }
    debug!(worker, "Worker stopped");
}

impl Inner {
    async fn process_next(&self) -> RedisResult<bool> {
        let Some(envelope) = self.queue.pop(self.config.poll_interval).await? else {
            return Ok(false);
        };
        self.handle(envelope).await;
        Ok(true)
    }

    async fn handle(&self, envelope: TaskEnvelope) {
        let started = Instant::now();
        let outcome = self.supervise(&envelope).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let err = match outcome {
            Ok(()) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    task_id = %envelope.id,
                    task = envelope.task.name(),
                    elapsed_ms,
                    "Task completed"
                );
                return;
            }
            Err(err) => err,
        };

        if envelope.attempts < self.config.max_retries {
            let retry = envelope.next_attempt();
            warn!(
                task_id = %retry.id,
                attempt = retry.attempts,
                max_retries = self.config.max_retries,
                error = %err,
                "Task failed, retrying"
            );
            match self.queue.push(&retry).await {
                Ok(()) => {
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                }
                Err(push_err) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(task_id = %retry.id, error = %push_err, "Could not re-enqueue task");
                }
            }
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                task_id = %envelope.id,
                task = envelope.task.name(),
                attempts = envelope.attempts + 1,
                elapsed_ms,
                error = %err,
                "Task failed"
            );
        }
    }

    /// Run a task under the soft and hard time limits.
    async fn supervise(&self, envelope: &TaskEnvelope) -> RedisResult<()> {
        let execution = self.execute(&envelope.task);
        let soft = tokio::time::sleep(self.config.soft_time_limit);
        let hard = tokio::time::sleep(self.config.time_limit);
        tokio::pin!(execution, soft, hard);

        let mut warned = false;
        loop {
            tokio::select! {
                result = &mut execution => return result,
                _ = &mut hard => return Err(RedisError::Timeout(self.config.time_limit)),
                _ = &mut soft, if !warned => {
                    warned = true;
                    warn!(
                        task_id = %envelope.id,
                        limit = ?self.config.soft_time_limit,
                        "Task exceeded soft time limit"
                    );
                }
            }
        }
    }

    async fn execute(&self, task: &Task) -> RedisResult<()> {
        match task {
            Task::SendEvent { channel, payload } => {
                let bytes = Payload::from(payload.clone()).into_bytes()?;
                let connection = TaskConnection::new(self.connector.connect().await?);
                let published = connection.backend.publish(channel, &bytes).await;
                connection.close().await;
                let receivers = published?;
                debug!(channel = %channel, receivers, "Event published");
                Ok(())
            }
        }
    }
}

/// A per-task connection. Closed explicitly when the task finishes, or in the
/// background when the task is aborted by its time limit.
struct TaskConnection {
    backend: Arc<dyn Backend>,
    closed: bool,
}

impl TaskConnection {
    fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            closed: false,
        }
    }

    async fn close(mut self) {
        self.closed = true;
        self.backend.close().await;
    }
}

impl Drop for TaskConnection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let backend = self.backend.clone();
            runtime.spawn(async move { backend.close().await });
        }
    }
}
