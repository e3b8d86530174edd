//! HTTP implementations of the collaborator traits.
//!
//! [`HttpClient`] wraps reqwest with bearer auth and retry with exponential
//! backoff on server errors. [`HttpLogQuerySource`] and [`HttpTextAnalyzer`]
//! speak a small JSON protocol on top of it.

use crate::traits::{
    ConnectorConfig, ConnectorError, ConnectorResult, LogQuerySource, LogRow, TextAnalyzer,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// HTTP client with retry support.
pub struct HttpClient {
    client: Client,
    config: ConnectorConfig,
}

impl HttpClient {
    /// Creates a new HTTP client from connector configuration.
    pub fn new(config: ConnectorConfig) -> ConnectorResult<Self> {
        if config.base_url.trim().is_empty() {
            return Err(ConnectorError::ConfigError(format!(
                "{}: base_url is empty",
                config.name
            )));
        }

        let mut headers = reqwest::header::HeaderMap::new();
        for (key, value) in &config.headers {
            if let (Ok(name), Ok(val)) = (
                reqwest::header::HeaderName::try_from(key.as_str()),
                reqwest::header::HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(name, val);
            }
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ConnectorError::ConfigError(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Builds a URL from a path.
    pub fn build_url(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }

    /// Returns the connector name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// POSTs a JSON body and parses the JSON response.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        timeout: Option<Duration>,
    ) -> ConnectorResult<Value> {
        let url = self.build_url(path);
        let mut request = self.client.post(&url).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = self.execute_with_retry(request).await?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;

        serde_json::from_str(&text).map_err(|e| {
            ConnectorError::InvalidResponse(format!(
                "Failed to parse response (status {}): {} - Body: {}",
                status,
                e,
                text.chars().take(500).collect::<String>()
            ))
        })
    }

    async fn execute_with_retry(&self, request: RequestBuilder) -> ConnectorResult<Response> {
        let request = match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        };

        let mut last_error = None;
        let mut delay = Duration::from_millis(100);

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                debug!(attempt, ?delay, "Retrying request");
                sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(10));
            }

            let request_clone = request
                .try_clone()
                .ok_or_else(|| ConnectorError::Internal("Failed to clone request".to_string()))?;

            match request_clone.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(60);
                        return Err(ConnectorError::RateLimited(retry_after));
                    }

                    if status.is_server_error() {
                        warn!(connector = %self.config.name, %status, "Server error");
                        last_error = Some(ConnectorError::RequestFailed(format!(
                            "Server error: {}",
                            status
                        )));
                        continue;
                    }

                    if status.is_client_error() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(ConnectorError::RequestFailed(format!(
                            "Client error {}: {}",
                            status,
                            body.chars().take(200).collect::<String>()
                        )));
                    }

                    return Ok(response);
                }
                Err(e) => {
                    let error = if e.is_timeout() {
                        ConnectorError::Timeout(e.to_string())
                    } else if e.is_connect() {
                        ConnectorError::ConnectionFailed(e.to_string())
                    } else {
                        ConnectorError::RequestFailed(e.to_string())
                    };
                    // A timed out query is not retried; the caller's budget is spent.
                    if matches!(error, ConnectorError::Timeout(_)) {
                        return Err(error);
                    }
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ConnectorError::Internal("Unknown error".to_string())))
    }
}

/// Log-query source backed by an HTTP search endpoint.
///
/// Sends `POST /query` with `{"query": ..., "timeout_secs": ...}` and accepts
/// either a bare JSON array of rows or an object with a `rows`/`results` array.
pub struct HttpLogQuerySource {
    client: HttpClient,
}

impl HttpLogQuerySource {
    pub fn new(config: ConnectorConfig) -> ConnectorResult<Self> {
        Ok(Self {
            client: HttpClient::new(config)?,
        })
    }
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
    timeout_secs: u64,
}

#[async_trait]
impl LogQuerySource for HttpLogQuerySource {
    fn name(&self) -> &str {
        self.client.name()
    }

    #[instrument(skip(self), fields(source = %self.client.name()))]
    async fn execute(&self, query: &str, timeout: Duration) -> ConnectorResult<Vec<LogRow>> {
        let body = QueryRequest {
            query,
            timeout_secs: timeout.as_secs().max(1),
        };
        let response = self.client.post_json("query", &body, Some(timeout)).await?;
        parse_rows(response)
    }
}

/// Extracts log rows from a query response body.
pub fn parse_rows(value: Value) -> ConnectorResult<Vec<LogRow>> {
    let array = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("rows").or_else(|| map.remove("results")) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(ConnectorError::InvalidResponse(format!(
                    "expected an array of rows, got {}",
                    type_name(&other)
                )))
            }
        },
        Value::Null => Vec::new(),
        other => {
            return Err(ConnectorError::InvalidResponse(format!(
                "expected an array of rows, got {}",
                type_name(&other)
            )))
        }
    };

    array
        .into_iter()
        .map(|item| match item {
            Value::Object(row) => Ok(row),
            other => Err(ConnectorError::InvalidResponse(format!(
                "row is not an object: {}",
                type_name(&other)
            ))),
        })
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Text analyzer backed by an HTTP completion endpoint.
///
/// Sends `POST /analyze` with `{"prompt": ...}`; the response text is read
/// from `text`, `completion` or `content`, or the body itself when it is a
/// JSON string.
pub struct HttpTextAnalyzer {
    client: HttpClient,
}

impl HttpTextAnalyzer {
    pub fn new(config: ConnectorConfig) -> ConnectorResult<Self> {
        Ok(Self {
            client: HttpClient::new(config)?,
        })
    }
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    prompt: &'a str,
}

#[async_trait]
impl TextAnalyzer for HttpTextAnalyzer {
    fn name(&self) -> &str {
        self.client.name()
    }

    #[instrument(skip(self, prompt), fields(analyzer = %self.client.name()))]
    async fn analyze(&self, prompt: &str) -> ConnectorResult<String> {
        let response = self
            .client
            .post_json("analyze", &AnalyzeRequest { prompt }, None)
            .await?;
        parse_analysis(response)
    }
}

/// Extracts the analysis text from a completion response body.
pub fn parse_analysis(value: Value) -> ConnectorResult<String> {
    match value {
        Value::String(text) => Ok(text),
        Value::Object(map) => ["text", "completion", "content"]
            .iter()
            .find_map(|key| map.get(*key).and_then(|v| v.as_str()).map(str::to_string))
            .ok_or_else(|| {
                ConnectorError::InvalidResponse("response has no text field".to_string())
            }),
        other => Err(ConnectorError::InvalidResponse(format!(
            "unexpected analysis response: {}",
            type_name(&other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_config() -> ConnectorConfig {
        ConnectorConfig {
            name: "test".to_string(),
            base_url: "https://logs.example.com/".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_url() {
        let client = HttpClient::new(create_test_config()).unwrap();

        assert_eq!(client.build_url("/query"), "https://logs.example.com/query");
        assert_eq!(client.build_url("analyze"), "https://logs.example.com/analyze");
    }

    #[test]
    fn test_empty_base_url_rejected() {
        let config = ConnectorConfig {
            base_url: "  ".to_string(),
            ..create_test_config()
        };
        assert!(matches!(
            HttpClient::new(config),
            Err(ConnectorError::ConfigError(_))
        ));
    }

    #[test]
    fn test_parse_rows_shapes() {
        let bare = parse_rows(json!([{"count": 51}, {"host": "web-1"}])).unwrap();
        assert_eq!(bare.len(), 2);

        let wrapped = parse_rows(json!({"rows": [{"count": 3}]})).unwrap();
        assert_eq!(wrapped[0]["count"], json!(3));

        let results = parse_rows(json!({"results": []})).unwrap();
        assert!(results.is_empty());

        assert!(parse_rows(json!({"status": "ok"})).unwrap().is_empty());
        assert!(parse_rows(json!([1, 2])).is_err());
        assert!(parse_rows(json!("nope")).is_err());
    }

    #[test]
    fn test_parse_analysis_shapes() {
        assert_eq!(parse_analysis(json!("plain")).unwrap(), "plain");
        assert_eq!(
            parse_analysis(json!({"completion": "from completion"})).unwrap(),
            "from completion"
        );
        assert!(parse_analysis(json!({"other": 1})).is_err());
        assert!(parse_analysis(json!(42)).is_err());
    }
}
