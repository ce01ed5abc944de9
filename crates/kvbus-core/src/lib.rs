//! kvbus core library
//!
//! Settings, error taxonomy, task envelopes and the outbound HTTP helper
//! shared by the Redis adapter and the CLI.

pub mod config;
pub mod error;
pub mod http_client;
pub mod task;

pub use config::Settings;
pub use error::{KvError, KvResult};
pub use http_client::{HttpClient, HttpError, HttpResponse};
