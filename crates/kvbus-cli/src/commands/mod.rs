//! CLI command definitions and handlers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kvbus_core::Settings;
use kvbus_redis::ConnectionLifecycle;
use std::path::PathBuf;
use std::sync::Arc;

pub mod cache;
pub mod health;
pub mod http;
pub mod pubsub;
pub mod task;

/// kvbus - Redis cache, pub/sub and background event dispatch
#[derive(Parser)]
#[command(name = "kvbus")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Settings file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Redis connection URL, overriding the settings file
    #[arg(long, global = true, env = "KVBUS_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Directory for the daily rotated log file
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that Redis answers
    Ping,

    /// Cache operations
    #[command(subcommand)]
    Cache(cache::CacheCommands),

    /// Publish a message on a channel
    Publish(pubsub::PublishArgs),

    /// Print messages arriving on a channel
    Subscribe(pubsub::SubscribeArgs),

    /// Queue an event for a worker to publish
    Emit(task::EmitArgs),

    /// Run the background worker pool
    Worker(task::WorkerArgs),

    /// Send an HTTP request with retries
    Http(http::HttpArgs),
}

impl Cli {
    /// Settings from the config file and environment, with CLI flags on top.
    pub fn load_settings(&self) -> Result<Settings> {
        let mut settings = Settings::load(self.config.as_deref()).with_context(|| match &self.config {
            Some(path) => format!("Failed to load settings from {}", path.display()),
            None => "Failed to load settings".to_string(),
        })?;

        if let Some(url) = &self.redis_url {
            settings.redis.url = Some(url.clone());
        }
        if let Some(dir) = &self.log_dir {
            settings.log.dir = Some(dir.display().to_string());
        }
        Ok(settings)
    }

    pub async fn execute(self, settings: Settings) -> Result<()> {
        match self.command {
            Commands::Ping => health::execute(&settings).await,
            Commands::Cache(cmd) => cache::execute(cmd, &settings).await,
            Commands::Publish(args) => pubsub::publish(args, &settings).await,
            Commands::Subscribe(args) => pubsub::subscribe(args, &settings).await,
            Commands::Emit(args) => task::emit(args, &settings).await,
            Commands::Worker(args) => task::worker(args, &settings).await,
            Commands::Http(args) => http::execute(args).await,
        }
    }
}

/// Shared connection handle for the cache and pub/sub commands.
pub(crate) fn connect(settings: &Settings) -> Result<Arc<ConnectionLifecycle>> {
    let lifecycle = ConnectionLifecycle::from_settings(&settings.redis)
        .context("Invalid Redis configuration")?;
    Ok(Arc::new(lifecycle))
}

/// Parse a command-line value as JSON, keeping it as a plain string when it
/// isn't valid JSON.
pub(crate) fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}
