//! # iw-connectors
//!
//! Collaborator interfaces consumed by the incident pipeline: the log-query
//! source that detection rules run against and the text analyzer used for
//! narrative enrichment.
//!
//! HTTP implementations live in [`http`]; scriptable in-memory doubles live in
//! [`testing`].

pub mod http;
pub mod testing;
pub mod traits;

pub use http::{HttpClient, HttpLogQuerySource, HttpTextAnalyzer};
pub use traits::{
    ConnectorConfig, ConnectorError, ConnectorResult, LogQuerySource, LogRow, TextAnalyzer,
};
