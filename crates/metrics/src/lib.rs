//! Metrics for the recordseal encryption core.
//!
//! Wraps the `metrics` crate facade with centralized metric names. When the
//! `prometheus` feature is enabled, [`init_metrics`] installs a Prometheus
//! recorder whose handle can render the current values as text.
//!
//! ```rust,ignore
//! use recordseal_metrics::{counter, vault};
//!
//! counter!(vault::RECORDS_ENCRYPTED_TOTAL).increment(1);
//! ```

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
