//! Fire-and-forget task dispatch.

use kvbus_core::task;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::queue::TaskQueue;

/// Hands tasks to the worker queue without waiting for them to run.
#[derive(Clone)]
pub struct TaskDispatcher {
    queue: Arc<dyn TaskQueue>,
}

impl TaskDispatcher {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self { queue }
    }

    /// Queue a publish of `payload` on `channel` for a worker.
    ///
    /// Returns immediately. Must be called within a tokio runtime. The handle
    /// only tracks the enqueue; execution results never come back.
    pub fn dispatch<T: Serialize + ?Sized>(&self, channel: &str, payload: &T) -> Dispatched {
        let envelope = match task::send_event(channel, payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(channel = %channel, error = %err, "Cannot dispatch unserializable payload");
                return Dispatched {
                    task_id: None,
                    enqueue: None,
                };
            }
        };

        let task_id = envelope.id.clone();
        let queue = self.queue.clone();
        let enqueue = tokio::spawn(async move {
            match queue.push(&envelope).await {
                Ok(()) => {
                    debug!(task_id = %envelope.id, task = envelope.task.name(), "Task dispatched");
                    true
                }
                Err(err) => {
                    error!(task_id = %envelope.id, error = %err, "Task dispatch failed");
                    false
                }
            }
        });

        Dispatched {
            task_id: Some(task_id),
            enqueue: Some(enqueue),
        }
    }
}

/// Handle to a dispatched task's enqueue step.
pub struct Dispatched {
    task_id: Option<String>,
    enqueue: Option<JoinHandle<bool>>,
}

impl Dispatched {
    /// Id of the queued task; `None` if the payload could not be serialized.
    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    /// Wait for the enqueue (not the execution). True if the task was queued.
    pub async fn enqueued(self) -> bool {
        match self.enqueue {
            Some(handle) => handle.await.unwrap_or(false),
            None => false,
        }
    }
}
