//! Metrics definitions for the document API.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "docapi.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time spent handling a document API request in seconds. Tagged with route, method and status.",
};

pub const ALL_METRICS: &[MetricDef] = &[REQUEST_DURATION];
