//! kvbus Redis adapter
//!
//! Shared connection lifecycle, JSON cache, pub/sub channels and the
//! dispatch/worker pair that publishes events off the request path.

pub mod client;
pub mod dispatch;
pub mod lifecycle;
pub mod pubsub;
pub mod queue;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testing;

pub use client::{Backend, Connector, RedisConnector, RedisError, RedisResult, Subscription};
pub use dispatch::{Dispatched, TaskDispatcher};
pub use lifecycle::ConnectionLifecycle;
pub use pubsub::{Message, MessageStream, Payload, PubSubChannel};
pub use queue::{LocalTaskQueue, RedisTaskQueue, TaskQueue};
pub use store::{CacheLookup, KeyValueStore};
pub use worker::{WorkerConfig, WorkerPool, WorkerStats};
