//! Prometheus metrics for the load-balancer controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `lbaas_reconcile_duration_seconds` (histogram): engine call duration labeled by operation.
//! - `lbaas_reconcile_errors_total` (counter): engine errors labeled by operation and kind.
//! - `lbaas_remote_mutations_total` (counter): mutating remote API calls labeled by resource kind and action.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for engine call metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    /// Engine entry point, e.g. "ensure"
    pub operation: String,
}

/// Labels for engine error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub operation: String,
    /// Error category, e.g. "config", "api", "timeout"
    pub kind: String,
}

/// Labels for remote mutation metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MutationLabels {
    /// Remote resource kind, e.g. "listener"
    pub kind: String,
    /// "create", "update" or "delete"
    pub action: String,
}

/// Histogram tracking engine call duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<OperationLabels, Histogram>> =
    Lazy::new(|| {
        fn reconcile_histogram() -> Histogram {
            // 10ms .. ~5.5min across 16 buckets; waits on the backend dominate.
            Histogram::new(exponential_buckets(0.01, 2.0, 16))
        }

        Family::new_with_constructor(reconcile_histogram)
    });

/// Counter tracking engine errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking mutating calls against the remote APIs
pub static REMOTE_MUTATIONS_TOTAL: Lazy<Family<MutationLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "lbaas_reconcile_duration_seconds",
        "Duration of load balancer engine calls in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );

    registry.register(
        "lbaas_reconcile_errors_total",
        "Total number of load balancer engine errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );

    registry.register(
        "lbaas_remote_mutations_total",
        "Total number of mutating calls against the load-balancing and networking APIs",
        REMOTE_MUTATIONS_TOTAL.clone(),
    );

    registry
});

/// Observe an engine call duration in seconds.
pub fn observe_reconcile_duration_seconds(operation: &str, seconds: f64) {
    let labels = OperationLabels {
        operation: operation.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the engine error counter.
pub fn inc_reconcile_error(operation: &str, kind: &str) {
    let labels = ErrorLabels {
        operation: operation.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

/// Increment the remote mutation counter.
pub fn inc_remote_mutation(kind: &str, action: &str) {
    let labels = MutationLabels {
        kind: kind.to_string(),
        action: action.to_string(),
    };
    REMOTE_MUTATIONS_TOTAL.get_or_create(&labels).inc();
}

/// Render the registry in the OpenMetrics text format.
pub fn encode() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}
