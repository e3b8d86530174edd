//! # iw-core
//!
//! Incident model, storage, and detection for Incident Warden.
//!
//! Detection rules run against a [`iw_connectors::LogQuerySource`]; breaches
//! become [`Incident`]s that are correlated, stored in the [`IncidentStore`],
//! announced on the [`EventBus`], and sent to a [`Notifier`].

pub mod clock;
pub mod correlation;
pub mod detection;
pub mod events;
pub mod incident;
pub mod notifications;
pub mod store;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use correlation::{correlate, correlation_score, CorrelationConfig, CorrelationGroup};
pub use detection::{
    DetectionError, DetectionRule, DetectorConfig, IncidentDetector, RuleTestReport,
};
pub use events::{EventBus, PipelineEvent};
pub use incident::{
    ExternalAlert, Incident, IncidentError, IncidentStatus, Severity, RESOLUTION_MINUTES_KEY,
};
pub use notifications::{
    deliver, CompositeNotifier, LogNotifier, MemoryNotifier, Notification, NotificationError,
    NotificationPriority, NotificationType, Notifier, WebhookNotifier,
};
pub use store::{IncidentStore, StoreConfig, StoreError};
