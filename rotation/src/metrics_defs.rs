//! Metrics definitions for credential rotation.

use shared::metrics_defs::{MetricDef, MetricType};

pub const SECRET_CHANGES: MetricDef = MetricDef {
    name: "secrets.changed",
    metric_type: MetricType::Counter,
    description: "Number of confirmed secret changes detected by the watcher",
};

pub const SECRET_POLL_ERRORS: MetricDef = MetricDef {
    name: "secrets.poll.errors",
    metric_type: MetricType::Counter,
    description: "Number of failed secret store polls",
};

pub const ROTATION_BATCHES: MetricDef = MetricDef {
    name: "rotation.batches",
    metric_type: MetricType::Counter,
    description: "Number of debounced rotation batches delivered",
};

pub const ROTATION_BATCH_SIZE: MetricDef = MetricDef {
    name: "rotation.batch.size",
    metric_type: MetricType::Histogram,
    description: "Number of distinct secrets in a rotation batch",
};

pub const REBUILD_STARTED: MetricDef = MetricDef {
    name: "connection.rebuild.started",
    metric_type: MetricType::Counter,
    description: "Number of connection rebuilds led. Tagged with reason.",
};

pub const REBUILD_FAILED: MetricDef = MetricDef {
    name: "connection.rebuild.failed",
    metric_type: MetricType::Counter,
    description: "Number of connection rebuilds that failed or timed out",
};

pub const REBUILD_DURATION: MetricDef = MetricDef {
    name: "connection.rebuild.duration",
    metric_type: MetricType::Histogram,
    description: "Time to fetch the key, build and validate a client in seconds",
};

pub const REBUILD_FOLLOWERS: MetricDef = MetricDef {
    name: "connection.rebuild.followers",
    metric_type: MetricType::Counter,
    description: "Number of callers that attached to an in-flight rebuild",
};

pub const CONNECTION_GENERATION: MetricDef = MetricDef {
    name: "connection.generation",
    metric_type: MetricType::Gauge,
    description: "Generation of the currently published connection",
};

pub const AUTH_RETRIES: MetricDef = MetricDef {
    name: "operation.auth.retries",
    metric_type: MetricType::Counter,
    description: "Number of operations retried after an authorization failure",
};

pub const AUTH_RETRIES_EXHAUSTED: MetricDef = MetricDef {
    name: "operation.auth.exhausted",
    metric_type: MetricType::Counter,
    description: "Number of operations that kept failing authorization after all retries",
};

pub const ALL_METRICS: &[MetricDef] = &[
    SECRET_CHANGES,
    SECRET_POLL_ERRORS,
    ROTATION_BATCHES,
    ROTATION_BATCH_SIZE,
    REBUILD_STARTED,
    REBUILD_FAILED,
    REBUILD_DURATION,
    REBUILD_FOLLOWERS,
    CONNECTION_GENERATION,
    AUTH_RETRIES,
    AUTH_RETRIES_EXHAUSTED,
];
