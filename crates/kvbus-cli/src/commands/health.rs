//! Connectivity check.

use anyhow::Result;
use colored::Colorize;
use kvbus_core::Settings;
use std::time::Instant;

use super::connect;

pub async fn execute(settings: &Settings) -> Result<()> {
    let lifecycle = connect(settings)?;
    let target = lifecycle.connector().target();

    let started = Instant::now();
    let healthy = lifecycle.health_check().await;
    let elapsed = started.elapsed();
    lifecycle.close().await;

    if !healthy {
        anyhow::bail!("Redis at {} is not reachable", target);
    }

    println!(
        "{} Redis at {} answered in {} ms",
        "✓".green().bold(),
        target.cyan(),
        elapsed.as_millis()
    );
    Ok(())
}
