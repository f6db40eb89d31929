//! playground-metrics — observability for the query playground.
//!
//! Tracks per-runner pipeline timings, GC and prewarmer activity, and
//! runner status gauges, and provides Prometheus-compatible text
//! exposition.
//!
//! # Architecture
//!
//! ```text
//! MetricsHub
//!   ├── runner(type, name) → Arc<RunnerMetrics>   (registered once per runner)
//!   ├── api() → Arc<ApiMetrics>                   (HTTP request counters)
//!   └── snapshot() → Vec<RunnerSnapshot> + ApiSnapshot
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod exporters;
pub mod prometheus;

pub use exporters::{
    ApiMetrics, GcMetrics, MetricsHub, PipelineMetrics, PrewarmerMetrics, RunnerMetrics,
    StatusMetrics,
};
pub use prometheus::render_prometheus;
