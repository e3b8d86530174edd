//! Collaborator trait definitions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in connectors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limited: retry after {0} seconds")]
    RateLimited(u64),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// One row returned by a log query.
pub type LogRow = serde_json::Map<String, serde_json::Value>;

/// Configuration for an HTTP-backed collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Connector name/identifier.
    pub name: String,
    /// Base URL for the API.
    pub base_url: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Maximum retries on server errors.
    pub max_retries: u32,
    /// Additional headers to include.
    pub headers: HashMap<String, String>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            base_url: "http://localhost:8080".to_string(),
            api_key: None,
            timeout_secs: 30,
            max_retries: 2,
            headers: HashMap::new(),
        }
    }
}

/// Source of log rows for detection rules.
#[async_trait]
pub trait LogQuerySource: Send + Sync {
    /// Returns the source name.
    fn name(&self) -> &str;

    /// Executes `query`, giving up after `timeout`.
    ///
    /// An empty vector means the query matched nothing.
    async fn execute(&self, query: &str, timeout: Duration) -> ConnectorResult<Vec<LogRow>>;
}

/// Free-text analyzer used to enrich incident narratives.
#[async_trait]
pub trait TextAnalyzer: Send + Sync {
    /// Returns the analyzer name.
    fn name(&self) -> &str;

    /// Produces a free-form response for `prompt`.
    async fn analyze(&self, prompt: &str) -> ConnectorResult<String>;
}
