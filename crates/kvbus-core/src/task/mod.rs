//! Background task envelopes shared by dispatchers and workers.

pub mod model;

use crate::error::KvResult;
use model::{Task, TaskEnvelope};
use serde::Serialize;

/// Build a `send_event` envelope from any serializable payload.
pub fn send_event<T: Serialize + ?Sized>(channel: &str, payload: &T) -> KvResult<TaskEnvelope> {
    let payload = serde_json::to_value(payload)?;
    Ok(TaskEnvelope::new(Task::SendEvent {
        channel: channel.to_string(),
        payload,
    }))
}

/// Encode an envelope for the broker.
pub fn encode(envelope: &TaskEnvelope) -> KvResult<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Decode an envelope read from the broker.
pub fn decode(raw: &[u8]) -> KvResult<TaskEnvelope> {
    Ok(serde_json::from_slice(raw)?)
}
