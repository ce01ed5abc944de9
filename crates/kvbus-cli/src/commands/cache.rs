//! Cache commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use colored::Colorize;
use kvbus_core::Settings;
use kvbus_redis::store::DEFAULT_SCAN_BATCH;
use kvbus_redis::{CacheLookup, KeyValueStore};

use super::{connect, parse_value};
use crate::output;

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Read a cached value
    Get(KeyArgs),

    /// Write a value (parsed as JSON, stored as a string otherwise)
    Set(SetArgs),

    /// Remove a key
    Delete(KeyArgs),

    /// Check whether a key exists
    Exists(KeyArgs),

    /// Set a key's time to live
    Expire(ExpireArgs),

    /// Delete every key matching a glob pattern
    Clear(ClearArgs),
}

#[derive(Args)]
pub struct KeyArgs {
    pub key: String,
}

#[derive(Args)]
pub struct SetArgs {
    pub key: String,

    pub value: String,

    /// Expiry in seconds (0 keeps the key forever)
    #[arg(long)]
    pub ttl: Option<u64>,
}

#[derive(Args)]
pub struct ExpireArgs {
    pub key: String,

    /// Seconds until expiry
    #[arg(allow_negative_numbers = true)]
    pub seconds: i64,
}

#[derive(Args)]
pub struct ClearArgs {
    /// Glob pattern, e.g. "user:*"
    pub pattern: String,

    /// Keys deleted per round trip
    #[arg(long, default_value_t = DEFAULT_SCAN_BATCH)]
    pub batch_size: usize,
}

pub async fn execute(cmd: CacheCommands, settings: &Settings) -> Result<()> {
    let lifecycle = connect(settings)?;
    let store = KeyValueStore::new(lifecycle.clone());

    let result = match cmd {
        CacheCommands::Get(args) => cmd_get(&store, args).await,
        CacheCommands::Set(args) => cmd_set(&store, args).await,
        CacheCommands::Delete(args) => cmd_delete(&store, args).await,
        CacheCommands::Exists(args) => cmd_exists(&store, args).await,
        CacheCommands::Expire(args) => cmd_expire(&store, args).await,
        CacheCommands::Clear(args) => cmd_clear(&store, args).await,
    };

    lifecycle.close().await;
    result
}

async fn cmd_get(store: &KeyValueStore, args: KeyArgs) -> Result<()> {
    match store.lookup(&args.key).await {
        CacheLookup::Hit(value) => output::print_value(&value),
        CacheLookup::Miss => output::print_nil(),
        CacheLookup::Unavailable => anyhow::bail!("Redis is unavailable"),
    }
    Ok(())
}

async fn cmd_set(store: &KeyValueStore, args: SetArgs) -> Result<()> {
    let value = parse_value(&args.value);
    if !store.set(&args.key, &value, args.ttl).await {
        anyhow::bail!("Failed to set '{}'", args.key);
    }

    match args.ttl.filter(|ttl| *ttl > 0) {
        Some(ttl) => println!(
            "{} Set {} (expires in {}s)",
            "✓".green().bold(),
            args.key.cyan(),
            ttl
        ),
        None => println!("{} Set {}", "✓".green().bold(), args.key.cyan()),
    }
    Ok(())
}

async fn cmd_delete(store: &KeyValueStore, args: KeyArgs) -> Result<()> {
    if store.delete(&args.key).await {
        println!("{} Deleted {}", "✓".green().bold(), args.key.cyan());
    } else {
        println!("{}", format!("Key '{}' not found.", args.key).dimmed());
    }
    Ok(())
}

async fn cmd_exists(store: &KeyValueStore, args: KeyArgs) -> Result<()> {
    if store.exists(&args.key).await {
        println!("{} {} exists", "✓".green().bold(), args.key.cyan());
    } else {
        println!("{} {} does not exist", "✗".red().bold(), args.key.cyan());
    }
    Ok(())
}

async fn cmd_expire(store: &KeyValueStore, args: ExpireArgs) -> Result<()> {
    if store.expire(&args.key, args.seconds).await {
        println!(
            "{} {} expires in {}s",
            "✓".green().bold(),
            args.key.cyan(),
            args.seconds
        );
    } else {
        println!("{}", format!("Expiry not set for '{}'.", args.key).dimmed());
    }
    Ok(())
}

async fn cmd_clear(store: &KeyValueStore, args: ClearArgs) -> Result<()> {
    println!("{}", format!("Clearing keys matching '{}'...", args.pattern).dimmed());
    let deleted = store.clear_pattern(&args.pattern, args.batch_size).await;
    println!("{} Deleted {} keys", "✓".green().bold(), deleted);
    Ok(())
}
