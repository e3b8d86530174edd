//! In-memory collaborators for tests.
//!
//! [`MockLogQuerySource`] answers queries from a scripted table and
//! [`MockTextAnalyzer`] returns a fixed response or error. Both count calls so
//! tests can assert on collaborator traffic.

use crate::traits::{ConnectorError, ConnectorResult, LogQuerySource, LogRow, TextAnalyzer};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Converts a JSON array of objects into log rows, skipping non-objects.
pub fn rows(value: Value) -> Vec<LogRow> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(row) => Some(row),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Rows(Vec<LogRow>),
    Fail(ConnectorError),
    Slow(Duration, Vec<LogRow>),
}

/// Log-query source answering from a per-query script.
///
/// Queries with no script return an empty result.
#[derive(Default)]
pub struct MockLogQuerySource {
    script: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<HashMap<String, usize>>,
    total_calls: AtomicUsize,
}

impl MockLogQuerySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `query` return `rows`.
    pub fn set_rows(&self, query: &str, rows: Vec<LogRow>) {
        self.set(query, Scripted::Rows(rows));
    }

    /// Makes `query` fail with `error`.
    pub fn set_error(&self, query: &str, error: ConnectorError) {
        self.set(query, Scripted::Fail(error));
    }

    /// Makes `query` sleep for `delay` before returning `rows`.
    pub fn set_slow(&self, query: &str, delay: Duration, rows: Vec<LogRow>) {
        self.set(query, Scripted::Slow(delay, rows));
    }

    /// Number of times `query` has been executed.
    pub fn calls_for(&self, query: &str) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(query).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Total number of executed queries.
    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    fn set(&self, query: &str, scripted: Scripted) {
        if let Ok(mut script) = self.script.lock() {
            script.insert(query.to_string(), scripted);
        }
    }
}

#[async_trait]
impl LogQuerySource for MockLogQuerySource {
    fn name(&self) -> &str {
        "mock-log-source"
    }

    async fn execute(&self, query: &str, _timeout: Duration) -> ConnectorResult<Vec<LogRow>> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(query.to_string()).or_insert(0) += 1;
        }

        let scripted = self
            .script
            .lock()
            .map_err(|_| ConnectorError::Internal("script lock poisoned".to_string()))?
            .get(query)
            .cloned();

        match scripted {
            None => Ok(Vec::new()),
            Some(Scripted::Rows(rows)) => Ok(rows),
            Some(Scripted::Fail(error)) => Err(error),
            Some(Scripted::Slow(delay, rows)) => {
                tokio::time::sleep(delay).await;
                Ok(rows)
            }
        }
    }
}

/// Text analyzer returning a fixed response.
pub struct MockTextAnalyzer {
    response: Mutex<ConnectorResult<String>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl MockTextAnalyzer {
    /// Analyzer that always answers with `response`.
    pub fn responding(response: &str) -> Self {
        Self {
            response: Mutex::new(Ok(response.to_string())),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Analyzer that always fails with `error`.
    pub fn failing(error: ConnectorError) -> Self {
        Self {
            response: Mutex::new(Err(error)),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TextAnalyzer for MockTextAnalyzer {
    fn name(&self) -> &str {
        "mock-analyzer"
    }

    async fn analyze(&self, prompt: &str) -> ConnectorResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        self.response
            .lock()
            .map_err(|_| ConnectorError::Internal("response lock poisoned".to_string()))?
            .clone()
    }
}
