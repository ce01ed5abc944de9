//! Terminal output formatting.

use colored::Colorize;
use kvbus_core::HttpResponse;
use kvbus_redis::{Message, WorkerStats};
use serde_json::Value;

/// Print a cached or decoded value. Strings print bare, everything else as
/// pretty JSON.
pub fn print_value(value: &Value) {
    match value {
        Value::String(text) => println!("{}", text),
        other => println!(
            "{}",
            serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())
        ),
    }
}

pub fn print_nil() {
    println!("{}", "(nil)".dimmed());
}

/// Print one received message, decoding JSON payloads when possible.
pub fn print_message(message: &Message) {
    let body = match message.json::<Value>() {
        Ok(value) => value.to_string(),
        Err(_) => message.text().into_owned(),
    };
    println!("{} {}", format!("[{}]", message.channel()).cyan().bold(), body);
}

pub fn print_worker_stats(stats: &WorkerStats) {
    println!("{}", "Worker stats".bold());
    println!("  {}: {}", "Processed".bold(), stats.processed.to_string().green());
    println!("  {}: {}", "Retried".bold(), stats.retried.to_string().yellow());
    println!("  {}: {}", "Failed".bold(), stats.failed.to_string().red());
}

pub fn print_http_response(response: &HttpResponse, show_headers: bool) {
    let status = response.status.to_string();
    let status = if response.status < 300 {
        status.green()
    } else {
        status.yellow()
    };
    println!("{} {}", "Status".bold(), status);

    if show_headers {
        for (name, value) in &response.headers {
            println!("  {}: {}", name.dimmed(), value);
        }
    }
    println!();
    print_value(&response.data);
}
