//! Publish/subscribe over named channels.
//!
//! A subscription runs as a producer task that owns a dedicated subscription
//! connection and forwards messages into a bounded channel read by
//! [`MessageStream`]. The task polls with a bounded wait so it notices a
//! departed consumer, and it always unsubscribes before exiting.

use futures::Stream;
use kvbus_core::config::PubSubSettings;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::borrow::Cow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::client::{RedisResult, Subscription};
use crate::lifecycle::ConnectionLifecycle;

/// A message received on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    channel: String,
    payload: Vec<u8>,
}

impl Message {
    pub fn new(channel: &str, payload: Vec<u8>) -> Self {
        Self {
            channel: channel.to_string(),
            payload,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as UTF-8, lossily.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}

/// Something to publish.
///
/// Text and bytes go out verbatim; anything else is JSON-encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Raw(Vec<u8>),
    Json(Value),
}

impl Payload {
    /// Serialize any value into a payload.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Self> {
        Ok(serde_json::to_value(value)?.into())
    }

    pub fn into_bytes(self) -> serde_json::Result<Vec<u8>> {
        match self {
            Self::Raw(bytes) => Ok(bytes),
            Self::Json(value) => serde_json::to_vec(&value),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Raw(text.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Raw(text.into_bytes())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Raw(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self::Raw(bytes.to_vec())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => Self::Raw(text.into_bytes()),
            other => Self::Json(other),
        }
    }
}

/// Publisher and subscription factory over the shared connection.
#[derive(Clone)]
pub struct PubSubChannel {
    lifecycle: Arc<ConnectionLifecycle>,
    poll_timeout: Duration,
    buffer: usize,
}

impl PubSubChannel {
    pub fn new(lifecycle: Arc<ConnectionLifecycle>, settings: &PubSubSettings) -> Self {
        Self {
            lifecycle,
            poll_timeout: settings.poll_timeout(),
            buffer: settings.buffer.max(1),
        }
    }

    /// Publish a payload. Returns how many subscribers received it; zero is
    /// not an error.
    pub async fn publish(&self, channel: &str, payload: impl Into<Payload>) -> RedisResult<usize> {
        let bytes = payload.into().into_bytes()?;
        let backend = self.lifecycle.acquire().await?;

        match backend.publish(channel, &bytes).await {
            Ok(receivers) => {
                debug!(channel = %channel, receivers, "Published message");
                Ok(receivers)
            }
            Err(err) => {
                error!(channel = %channel, error = %err, "Redis PUBLISH failed");
                if err.is_transport() {
                    self.lifecycle.report_fault(&backend).await;
                }
                Err(err)
            }
        }
    }

    /// Subscribe to `channel`.
    ///
    /// The subscription is registered before this returns, so anything
    /// published afterwards is delivered. Dropping or closing the stream ends
    /// the subscription.
    pub async fn subscribe(&self, channel: &str) -> RedisResult<MessageStream> {
        let backend = self.lifecycle.acquire().await?;
        let subscription = match backend.subscribe(channel).await {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(channel = %channel, error = %err, "Redis SUBSCRIBE failed");
                if err.is_transport() {
                    self.lifecycle.report_fault(&backend).await;
                }
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::channel(self.buffer);
        let producer = tokio::spawn(pump(
            channel.to_string(),
            subscription,
            tx,
            self.poll_timeout,
        ));

        Ok(MessageStream {
            channel: channel.to_string(),
            rx,
            producer,
        })
    }
}

async fn pump(
    channel: String,
    mut subscription: Box<dyn Subscription>,
    tx: mpsc::Sender<Message>,
    poll_timeout: Duration,
) {
    loop {
        let next = tokio::select! {
            _ = tx.closed() => break,
            next = subscription.next_message(poll_timeout) => next,
        };

        match next {
            Ok(Some(payload)) => {
                if tx.send(Message::new(&channel, payload)).await.is_err() {
                    break;
                }
            }
            Ok(None) => tokio::task::yield_now().await,
            Err(err) => {
                warn!(channel = %channel, error = %err, "Subscription poll failed, ending stream");
                break;
            }
        }
    }

    if let Err(err) = subscription.unsubscribe().await {
        warn!(channel = %channel, error = %err, "Unsubscribe failed");
    }
    debug!(channel = %channel, "Subscription closed");
}

/// Messages from one channel subscription, in publish order.
///
/// Ends when the subscription connection fails; subscribe again to resume.
pub struct MessageStream {
    channel: String,
    rx: mpsc::Receiver<Message>,
    producer: JoinHandle<()>,
}

impl MessageStream {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once the subscription has ended.
    pub async fn next_message(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// End the subscription and wait until it has unsubscribed.
    pub async fn close(self) {
        let Self { rx, producer, .. } = self;
        drop(rx);
        if let Err(err) = producer.await {
            warn!(error = %err, "Subscription task failed");
        }
    }
}

impl Stream for MessageStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}
