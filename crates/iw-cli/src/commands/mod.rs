//! CLI command implementations.

pub mod inspect;
pub mod run;

pub use inspect::{list_incidents, test_rule};
pub use run::run_daemon;
