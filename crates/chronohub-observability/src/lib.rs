//! Chronohub Observability
//!
//! Prometheus metrics for the storage engine and an axum router that exposes them.
//!
//! Recording a metric never fails and never blocks the storage path; registration happens once
//! in [`init`].
//!
//! ```no_run
//! use chronohub_observability::{exporter, metrics};
//!
//! metrics::init();
//! let router = exporter::create_metrics_router();
//! ```

pub mod exporter;
pub mod metrics;

pub use metrics::{init as init_metrics, REGISTRY};

pub fn init() {
    metrics::init();
}
