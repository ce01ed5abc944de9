//! Outbound HTTP helper with a bounded retry budget.
//!
//! Connect errors, timeouts and 5xx responses are retried with a linear
//! backoff. 4xx responses are returned immediately as [`HttpError::Client`].
//! When the budget is spent the caller gets [`HttpError::Exhausted`].

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of attempts per request.
pub const DEFAULT_RETRIES: u32 = 3;

/// Default backoff step; attempt `n` waits `n * step` before the next one.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Request to {url} rejected with status {status}: {body}")]
    Client { url: String, status: u16, body: String },

    #[error("Request to {url} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Invalid header '{0}'")]
    InvalidHeader(String),

    #[error("HTTP error: {0}")]
    Request(#[from] reqwest::Error),
}

/// Response body plus metadata.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Body decoded as JSON, or the raw text as a JSON string.
    pub data: Value,
    pub text: String,
}

/// Fluent configuration for [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpClientBuilder {
    base_url: Option<String>,
    timeout: Duration,
    retries: u32,
    backoff: Duration,
    headers: Vec<(String, String)>,
    params: Vec<(String, String)>,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            backoff: DEFAULT_BACKOFF,
            headers: Vec::new(),
            params: Vec::new(),
        }
    }
}

impl HttpClientBuilder {
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = Some(base_url.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Total attempts per request; values below 1 are treated as 1.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Query parameter sent with every request.
    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.params.push((name.to_string(), value.to_string()));
        self
    }

    pub fn build(self) -> Result<HttpClient, HttpError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| HttpError::InvalidHeader(name.clone()))?;
            let value =
                HeaderValue::from_str(value).map_err(|_| HttpError::InvalidHeader(name.clone()))?;
            headers.insert(header, value);
        }

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .default_headers(headers)
            .build()?;

        Ok(HttpClient {
            client,
            base_url: self.base_url.map(|u| u.trim_end_matches('/').to_string()),
            retries: self.retries.max(1),
            backoff: self.backoff,
            params: self.params,
        })
    }
}

/// Retrying HTTP client.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: Option<String>,
    retries: u32,
    backoff: Duration,
    params: Vec<(String, String)>,
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    pub async fn get(&self, endpoint: &str) -> Result<HttpResponse, HttpError> {
        self.request(Method::GET, endpoint, None).await
    }

    pub async fn post(&self, endpoint: &str, body: Option<&Value>) -> Result<HttpResponse, HttpError> {
        self.request(Method::POST, endpoint, body).await
    }

    pub async fn put(&self, endpoint: &str, body: Option<&Value>) -> Result<HttpResponse, HttpError> {
        self.request(Method::PUT, endpoint, body).await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<HttpResponse, HttpError> {
        self.request(Method::DELETE, endpoint, None).await
    }

    /// Send a request, retrying transient failures up to the configured budget.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<HttpResponse, HttpError> {
        let url = self.build_url(endpoint);
        let mut last_error = String::new();

        for attempt in 1..=self.retries {
            let mut request = self.client.request(method.clone(), &url).query(&self.params);
            if let Some(body) = body {
                request = request.json(body);
            }

            debug!(method = %method, url = %url, attempt, "Sending request");

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_client_error() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(HttpError::Client {
                            url,
                            status: status.as_u16(),
                            body,
                        });
                    }
                    if !status.is_server_error() {
                        return read_response(response).await;
                    }
                    last_error = format!("server responded with {}", status);
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last_error = e.to_string();
                }
                Err(e) => return Err(HttpError::Request(e)),
            }

            warn!(
                url = %url,
                attempt,
                retries = self.retries,
                error = %last_error,
                "Request failed"
            );

            if attempt < self.retries {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }

        Err(HttpError::Exhausted {
            url,
            attempts: self.retries,
            last_error,
        })
    }

    fn build_url(&self, endpoint: &str) -> String {
        match &self.base_url {
            Some(base) => format!("{}/{}", base, endpoint.trim_start_matches('/')),
            None => endpoint.to_string(),
        }
    }
}

async fn read_response(response: reqwest::Response) -> Result<HttpResponse, HttpError> {
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let text = response.text().await?;
    let data = serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.clone()));

    Ok(HttpResponse {
        status,
        headers,
        data,
        text,
    })
}
