//! # iw-observability
//!
//! Logging, metrics, and audit infrastructure for Incident Warden.
//!
//! The audit module exposes the [`AuditLogger`] seam used by the automation
//! engine. Implementations are fire-and-forget: logging an event never fails
//! the caller.

pub mod audit;
pub mod logging;
pub mod metrics;

pub use audit::{AuditEventType, AuditLog, AuditLogEntry, AuditLogger, NoopAuditLogger};
pub use logging::{init_logging_with_config, LoggingConfig};
pub use metrics::MetricsCollector;
