//! Publish and subscribe commands.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use kvbus_core::Settings;
use kvbus_redis::{Payload, PubSubChannel};

use super::{connect, parse_value};
use crate::output;

#[derive(Args)]
pub struct PublishArgs {
    pub channel: String,

    /// Message body; JSON is sent encoded, anything else as plain text
    pub message: String,
}

#[derive(Args)]
pub struct SubscribeArgs {
    pub channel: String,

    /// Exit after this many messages
    #[arg(long, short = 'n')]
    pub count: Option<usize>,
}

pub async fn publish(args: PublishArgs, settings: &Settings) -> Result<()> {
    let lifecycle = connect(settings)?;
    let channel = PubSubChannel::new(lifecycle.clone(), &settings.pubsub);

    let published = channel
        .publish(&args.channel, Payload::from(parse_value(&args.message)))
        .await;
    lifecycle.close().await;

    let receivers =
        published.with_context(|| format!("Failed to publish on '{}'", args.channel))?;
    println!(
        "{} Published on {} ({} receivers)",
        "✓".green().bold(),
        args.channel.cyan(),
        receivers
    );
    Ok(())
}

pub async fn subscribe(args: SubscribeArgs, settings: &Settings) -> Result<()> {
    let lifecycle = connect(settings)?;
    let channel = PubSubChannel::new(lifecycle.clone(), &settings.pubsub);
    let mut stream = channel
        .subscribe(&args.channel)
        .await
        .with_context(|| format!("Failed to subscribe to '{}'", args.channel))?;

    println!(
        "{}",
        format!("Listening on '{}' (Ctrl+C to stop)...", stream.channel()).dimmed()
    );

    let mut received = 0usize;
    loop {
        if args.count.is_some_and(|limit| received >= limit) {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = stream.next_message() => match message {
                Some(message) => {
                    output::print_message(&message);
                    received += 1;
                }
                None => {
                    println!("{}", "Subscription ended.".yellow());
                    break;
                }
            },
        }
    }

    stream.close().await;
    lifecycle.close().await;
    Ok(())
}
