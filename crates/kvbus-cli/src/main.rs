//! kvbus CLI
//!
//! Operator surface over the Redis cache, pub/sub channels and the
//! background event worker.

use anyhow::Result;
use clap::Parser;
use kvbus_core::config::LogSettings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod output;

use commands::Cli;

/// Initialize tracing, adding a daily rotated log file when a log directory
/// is configured. The returned guard flushes the file writer on drop.
fn init_tracing(log: &LogSettings, verbose: bool) -> Option<WorkerGuard> {
    let level = if verbose { "debug" } else { log.level.as_str() };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("kvbus={level},kvbus_redis={level},kvbus_core={level}").into()
    });

    match log.dir.as_deref() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "kvbus.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;
    let _guard = init_tracing(&settings.log, cli.verbose);

    cli.execute(settings).await
}
