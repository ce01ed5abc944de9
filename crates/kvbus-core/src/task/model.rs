//! Task queue wire models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A unit of background work.
///
/// Serialized as `{"name": "...", "args": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "snake_case")]
pub enum Task {
    /// Publish `payload` to `channel` from a worker.
    SendEvent { channel: String, payload: Value },
}

impl Task {
    /// Stable task name, as written on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendEvent { .. } => "send_event",
        }
    }
}

/// A task plus its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: String,
    pub task: Task,
    /// Number of failed executions so far.
    #[serde(default)]
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// Wrap a task with a fresh id.
    pub fn new(task: Task) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// The envelope to re-enqueue after a failed attempt.
    pub fn next_attempt(mut self) -> Self {
        self.attempts += 1;
        self.enqueued_at = Utc::now();
        self
    }
}
