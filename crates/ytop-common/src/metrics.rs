//! Metrics registry for ytop observability
//!
//! OpenTelemetry instruments for:
//! - reconciliation ticks (duration, errors)
//! - cluster lifecycle state
//! - component sync actions

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::crd::ClusterState;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("ytop"));

/// Histogram of reconciliation tick duration
///
/// Labels:
/// - `cluster`: cluster name
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("ytop_reconcile_duration_seconds")
        .with_description("Duration of Ytsaurus reconciliation ticks in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconciliation errors
///
/// Labels:
/// - `cluster`: cluster name
/// - `category`: accessor, config, validation, serialization, invariant
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("ytop_reconcile_errors_total")
        .with_description("Total number of Ytsaurus reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Gauge set to 1 for the current state of each cluster and 0 otherwise
///
/// Labels:
/// - `cluster`: cluster name
/// - `state`: Creating, Running, Reconfiguration, Updated, CreationFailed
pub static CLUSTER_STATE: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("ytop_cluster_state")
        .with_description("Current lifecycle state of each Ytsaurus cluster")
        .with_unit("{state}")
        .build()
});

/// Counter of component actions executed by the reconciler
///
/// Labels:
/// - `component`: component name
/// - `action`: sync, remove_pods, drain
pub static COMPONENT_ACTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("ytop_component_actions_total")
        .with_description("Total number of component actions executed")
        .with_unit("{actions}")
        .build()
});

const ALL_STATES: [ClusterState; 5] = [
    ClusterState::Creating,
    ClusterState::Running,
    ClusterState::Reconfiguration,
    ClusterState::Updated,
    ClusterState::CreationFailed,
];

/// Times one reconciliation tick
pub struct ReconcileTimer {
    cluster: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("cluster", self.cluster),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record a failed tick under the given error category
    pub fn error(self, category: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("cluster", self.cluster.clone()),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("cluster", self.cluster),
                KeyValue::new("category", category),
            ],
        );
    }
}

/// Publish the current state of a cluster
pub fn set_cluster_state(cluster: &str, state: ClusterState) {
    for candidate in ALL_STATES {
        CLUSTER_STATE.record(
            i64::from(candidate == state),
            &[
                KeyValue::new("cluster", cluster.to_string()),
                KeyValue::new("state", candidate.to_string()),
            ],
        );
    }
}

/// Count one executed component action
pub fn record_component_action(component: &str, action: &'static str) {
    COMPONENT_ACTIONS.add(
        1,
        &[
            KeyValue::new("component", component.to_string()),
            KeyValue::new("action", action),
        ],
    );
}
