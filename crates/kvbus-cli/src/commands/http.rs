//! Outbound HTTP requests through the retrying client.

use anyhow::{Context, Result};
use clap::Args;
use kvbus_core::http_client::DEFAULT_RETRIES;
use kvbus_core::HttpClient;
use reqwest::Method;
use std::time::Duration;

use super::parse_value;
use crate::output;

#[derive(Args)]
pub struct HttpArgs {
    /// HTTP method (GET, POST, PUT, DELETE, ...)
    pub method: String,

    pub url: String,

    /// Request body, sent as JSON
    #[arg(long, short = 'd')]
    pub data: Option<String>,

    /// Extra header as "Name: value" (repeatable)
    #[arg(long = "header", short = 'H')]
    pub headers: Vec<String>,

    /// Attempts before giving up
    #[arg(long, default_value_t = DEFAULT_RETRIES)]
    pub retries: u32,

    /// Per-attempt timeout in seconds
    #[arg(long, default_value = "30")]
    pub timeout: u64,

    /// Print response headers
    #[arg(long, short = 'i')]
    pub include: bool,
}

pub async fn execute(args: HttpArgs) -> Result<()> {
    let method = Method::from_bytes(args.method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method '{}'", args.method))?;

    let mut builder = HttpClient::builder()
        .with_retries(args.retries)
        .with_timeout(Duration::from_secs(args.timeout));
    for header in &args.headers {
        let (name, value) = header
            .split_once(':')
            .with_context(|| format!("Header '{}' is not in 'Name: value' form", header))?;
        builder = builder.with_header(name.trim(), value.trim());
    }
    let client = builder.build()?;

    let body = args.data.as_deref().map(parse_value);
    let response = client.request(method, &args.url, body.as_ref()).await?;
    output::print_http_response(&response, args.include);
    Ok(())
}
