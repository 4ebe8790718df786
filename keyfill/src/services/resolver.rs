//! Resolver interface and the default HTTP JSON resolver
//!
//! A resolver turns one key into a record. `Ok(None)` means the source has
//! nothing for the key; errors distinguish throttling from everything else so
//! the worker pool can feed the rate limiter.

use crate::types::{Key, Record};
use async_trait::async_trait;
use keyfill_common::ResolverConfig;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Resolver failures
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Source signalled throttling (HTTP 429 or equivalent)
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Any other failure (network, unexpected status, malformed payload)
    #[error("Resolution failed: {0}")]
    Failed(String),

    /// Run cancelled while waiting to retry; the key stays uncached
    #[error("Cancelled during retry backoff")]
    Cancelled,
}

impl ResolveError {
    /// Whether the retry policy may repeat the call
    ///
    /// Throttling is left to the rate limiter and never retried in place.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolveError::Failed(_))
    }
}

/// Converts a key into a record
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, key: &Key) -> Result<Option<Record>, ResolveError>;
}

/// Resolver fetching `url_template` with `{key}` substituted and reading a
/// JSON object body
pub struct HttpResolver {
    http_client: reqwest::Client,
    url_template: String,
}

impl HttpResolver {
    pub fn new(url_template: impl Into<String>, user_agent: &str, timeout: Duration) -> Result<Self, ResolveError> {
        let http_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| ResolveError::Failed(e.to_string()))?;

        Ok(Self {
            http_client,
            url_template: url_template.into(),
        })
    }

    /// Build from config; `None` when no URL template is configured
    pub fn from_config(config: &ResolverConfig) -> Result<Option<Self>, ResolveError> {
        match &config.url_template {
            Some(template) => Self::new(
                template.clone(),
                &config.user_agent,
                Duration::from_secs(config.timeout_secs),
            )
            .map(Some),
            None => Ok(None),
        }
    }

    fn url_for(&self, key: &Key) -> String {
        self.url_template.replace("{key}", key.as_str())
    }
}

/// Map a non-success HTTP status to a resolver outcome
///
/// 404 is an empty resolution; 429 and 503 are throttling.
pub fn classify_status(status: StatusCode, url: &str) -> Result<Option<Record>, ResolveError> {
    match status {
        StatusCode::NOT_FOUND => Ok(None),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => Err(
            ResolveError::RateLimited(format!("{} ({})", url, status.as_u16())),
        ),
        _ => Err(ResolveError::Failed(format!(
            "Failed to fetch {} (status {})",
            url,
            status.as_u16()
        ))),
    }
}

/// Flatten a JSON payload into a record
///
/// Scalars become strings, nested values keep their JSON text, nulls are
/// dropped. An empty object is an empty resolution.
pub fn record_from_json(value: serde_json::Value) -> Result<Option<Record>, ResolveError> {
    let serde_json::Value::Object(map) = value else {
        return Err(ResolveError::Failed("Expected a JSON object".to_string()));
    };

    let record: Record = map
        .into_iter()
        .filter_map(|(field, value)| {
            let text = match value {
                serde_json::Value::Null => return None,
                serde_json::Value::String(s) => s,
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                nested => nested.to_string(),
            };
            Some((field, text))
        })
        .collect();

    Ok(if record.is_empty() { None } else { Some(record) })
}

#[async_trait]
impl Resolver for HttpResolver {
    async fn resolve(&self, key: &Key) -> Result<Option<Record>, ResolveError> {
        let url = self.url_for(key);
        tracing::debug!(key = %key, url = %url, "Fetching record");

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| ResolveError::Failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return classify_status(status, &url);
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ResolveError::Failed(format!("Malformed body from {}: {}", url, e)))?;

        record_from_json(body)
    }
}
