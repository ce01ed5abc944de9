//! Event dispatch and the worker process.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use kvbus_core::Settings;
use kvbus_redis::{
    ConnectionLifecycle, RedisConnector, RedisTaskQueue, TaskDispatcher, WorkerConfig, WorkerPool,
};
use std::sync::Arc;
use tokio::sync::watch;

use super::parse_value;
use crate::output;

#[derive(Args)]
pub struct EmitArgs {
    pub channel: String,

    /// Event payload; parsed as JSON when possible
    pub payload: String,

    /// Broker queue key (defaults to the configured queue)
    #[arg(long)]
    pub queue: Option<String>,
}

#[derive(Args)]
pub struct WorkerArgs {
    /// Number of concurrent worker loops
    #[arg(long, short = 'c')]
    pub concurrency: Option<usize>,

    /// Broker queue key (defaults to the configured queue)
    #[arg(long)]
    pub queue: Option<String>,

    /// Re-enqueues allowed for a failed task
    #[arg(long)]
    pub max_retries: Option<u32>,
}

/// Queue backed by its own broker connection. BRPOP blocks the connection it
/// runs on, so the broker never shares the cache connection.
fn broker_queue(
    settings: &Settings,
    key: Option<&str>,
) -> Result<(Arc<ConnectionLifecycle>, RedisTaskQueue)> {
    let url = settings.broker_url().context("No broker configured")?;
    let lifecycle = ConnectionLifecycle::for_url(&url, &settings.redis)
        .context("Invalid broker configuration")?;
    let lifecycle = Arc::new(lifecycle);
    let key = key.unwrap_or(&settings.worker.queue);
    Ok((lifecycle.clone(), RedisTaskQueue::new(lifecycle, key)))
}

pub async fn emit(args: EmitArgs, settings: &Settings) -> Result<()> {
    let (lifecycle, queue) = broker_queue(settings, args.queue.as_deref())?;
    let key = queue.key().to_string();
    let dispatcher = TaskDispatcher::new(Arc::new(queue));

    let dispatched = dispatcher.dispatch(&args.channel, &parse_value(&args.payload));
    let task_id = dispatched.task_id().map(str::to_string);
    let enqueued = dispatched.enqueued().await;
    lifecycle.close().await;

    match (enqueued, task_id) {
        (true, Some(id)) => {
            println!(
                "{} Queued event for {} on {} (task: {})",
                "✓".green().bold(),
                args.channel.cyan(),
                key,
                id.dimmed()
            );
            Ok(())
        }
        _ => anyhow::bail!("Failed to queue event for '{}'", args.channel),
    }
}

pub async fn worker(args: WorkerArgs, settings: &Settings) -> Result<()> {
    let (lifecycle, queue) = broker_queue(settings, args.queue.as_deref())?;
    let connector =
        RedisConnector::from_settings(&settings.redis).context("Invalid Redis configuration")?;

    let mut config = WorkerConfig::from(&settings.worker);
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }

    println!(
        "{} Worker consuming {} (concurrency {}, Ctrl+C to stop)",
        "▶".cyan().bold(),
        queue.key().cyan(),
        config.concurrency.max(1)
    );

    let queue = Arc::new(queue);
    let pool = WorkerPool::new(queue.clone(), Arc::new(connector), config);
    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop.send(true);
        }
    });

    let stats = pool.run(shutdown).await;
    queue.close().await;
    lifecycle.close().await;

    println!();
    output::print_worker_stats(&stats);
    Ok(())
}
