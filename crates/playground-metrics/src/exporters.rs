//! Metric exporters — atomics-backed counters and gauges.
//!
//! Exporters are cheap to update from hot paths; rendering takes a
//! consistent-enough snapshot by reading the atomics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, v: u64) {
        self.0.fetch_add(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Last-write-wins gauge.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Success/failure counters plus accumulated duration for one pipeline
/// step.
#[derive(Debug, Default)]
pub struct StepMetrics {
    pub success: Counter,
    pub failure: Counter,
    pub duration_us: Counter,
}

impl StepMetrics {
    /// Record one execution of the step.
    pub fn observe(&self, succeeded: bool, started_at: Instant) {
        if succeeded {
            self.success.inc();
        } else {
            self.failure.inc();
        }
        self.duration_us.add(started_at.elapsed().as_micros() as u64);
    }

    fn snapshot(&self) -> StepSnapshot {
        StepSnapshot {
            success: self.success.get(),
            failure: self.failure.get(),
            duration_us: self.duration_us.get(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepSnapshot {
    pub success: u64,
    pub failure: u64,
    pub duration_us: u64,
}

/// Per-step timings of the query pipeline.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub pull_existed_image: StepMetrics,
    pub pull_new_image: StepMetrics,
    pub create_container: StepMetrics,
    pub exec_command: StepMetrics,
    pub run_query: StepMetrics,
    pub remove_container: StepMetrics,
}

/// Garbage collection counters.
#[derive(Debug, Default)]
pub struct GcMetrics {
    pub containers_collected: Counter,
    pub containers_space_reclaimed_bytes: Counter,
    pub images_collected: Counter,
    pub images_space_reclaimed_bytes: Counter,
    pub paused_containers: Gauge,
}

/// Current counts and sizes of owned daemon objects.
#[derive(Debug, Default)]
pub struct StatusMetrics {
    pub image_count: Gauge,
    pub image_bytes: Gauge,
    pub container_count: Gauge,
    pub container_bytes: Gauge,
}

/// Prewarm pool counters.
#[derive(Debug, Default)]
pub struct PrewarmerMetrics {
    pub fetch_hits: Counter,
    pub fetch_misses: Counter,
    pub containers_added: Counter,
    pub containers_fetched: Counter,
    pub containers_ejected: Counter,
}

/// All metric families of a single runner.
#[derive(Debug)]
pub struct RunnerMetrics {
    pub runner_type: &'static str,
    pub runner_name: String,

    pub pipeline: PipelineMetrics,
    pub gc: GcMetrics,
    pub status: StatusMetrics,
    pub prewarmer: PrewarmerMetrics,
}

impl RunnerMetrics {
    fn new(runner_type: &'static str, runner_name: &str) -> Self {
        Self {
            runner_type,
            runner_name: runner_name.to_string(),
            pipeline: PipelineMetrics::default(),
            gc: GcMetrics::default(),
            status: StatusMetrics::default(),
            prewarmer: PrewarmerMetrics::default(),
        }
    }

    pub fn snapshot(&self) -> RunnerSnapshot {
        RunnerSnapshot {
            runner_type: self.runner_type,
            runner_name: self.runner_name.clone(),
            pipeline: [
                ("pull_existed_image", self.pipeline.pull_existed_image.snapshot()),
                ("pull_new_image", self.pipeline.pull_new_image.snapshot()),
                ("create_container", self.pipeline.create_container.snapshot()),
                ("exec_command", self.pipeline.exec_command.snapshot()),
                ("run_query", self.pipeline.run_query.snapshot()),
                ("remove_container", self.pipeline.remove_container.snapshot()),
            ],
            containers_collected: self.gc.containers_collected.get(),
            containers_space_reclaimed_bytes: self.gc.containers_space_reclaimed_bytes.get(),
            images_collected: self.gc.images_collected.get(),
            images_space_reclaimed_bytes: self.gc.images_space_reclaimed_bytes.get(),
            paused_containers: self.gc.paused_containers.get(),
            image_count: self.status.image_count.get(),
            image_bytes: self.status.image_bytes.get(),
            container_count: self.status.container_count.get(),
            container_bytes: self.status.container_bytes.get(),
            fetch_hits: self.prewarmer.fetch_hits.get(),
            fetch_misses: self.prewarmer.fetch_misses.get(),
            containers_added: self.prewarmer.containers_added.get(),
            containers_fetched: self.prewarmer.containers_fetched.get(),
            containers_ejected: self.prewarmer.containers_ejected.get(),
        }
    }
}

/// Flat view of a runner's metrics at one point in time.
#[derive(Debug, Clone)]
pub struct RunnerSnapshot {
    pub runner_type: &'static str,
    pub runner_name: String,

    pub pipeline: [(&'static str, StepSnapshot); 6],

    pub containers_collected: u64,
    pub containers_space_reclaimed_bytes: u64,
    pub images_collected: u64,
    pub images_space_reclaimed_bytes: u64,
    pub paused_containers: u64,

    pub image_count: u64,
    pub image_bytes: u64,
    pub container_count: u64,
    pub container_bytes: u64,

    pub fetch_hits: u64,
    pub fetch_misses: u64,
    pub containers_added: u64,
    pub containers_fetched: u64,
    pub containers_ejected: u64,
}

/// HTTP request counters for the REST surface.
#[derive(Debug, Default)]
pub struct ApiMetrics {
    pub requests_total: Counter,
    pub errors_total: Counter,
    pub duration_us: Counter,
}

impl ApiMetrics {
    pub fn observe(&self, is_error: bool, started_at: Instant) {
        self.requests_total.inc();
        if is_error {
            self.errors_total.inc();
        }
        self.duration_us.add(started_at.elapsed().as_micros() as u64);
    }

    pub fn snapshot(&self) -> ApiSnapshot {
        ApiSnapshot {
            requests_total: self.requests_total.get(),
            errors_total: self.errors_total.get(),
            duration_us: self.duration_us.get(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiSnapshot {
    pub requests_total: u64,
    pub errors_total: u64,
    pub duration_us: u64,
}

/// Registry of every exporter in the process.
#[derive(Clone, Default)]
pub struct MetricsHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    runners: Mutex<Vec<Arc<RunnerMetrics>>>,
    api: Arc<ApiMetrics>,
}

impl MetricsHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner and get its exporter.
    pub fn runner(&self, runner_type: &'static str, runner_name: &str) -> Arc<RunnerMetrics> {
        let metrics = Arc::new(RunnerMetrics::new(runner_type, runner_name));
        self.inner.runners.lock().unwrap().push(metrics.clone());
        metrics
    }

    pub fn api(&self) -> Arc<ApiMetrics> {
        self.inner.api.clone()
    }

    /// Snapshot every registered runner.
    pub fn runner_snapshots(&self) -> Vec<RunnerSnapshot> {
        self.inner
            .runners
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.snapshot())
            .collect()
    }

    pub fn api_snapshot(&self) -> ApiSnapshot {
        self.inner.api.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let c = Counter::default();
        c.inc();
        c.add(4);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn gauge_overwrites() {
        let g = Gauge::default();
        g.set(10);
        g.set(3);
        assert_eq!(g.get(), 3);
    }

    #[test]
    fn step_observe_splits_by_outcome() {
        let step = StepMetrics::default();
        let started = Instant::now();
        step.observe(true, started);
        step.observe(true, started);
        step.observe(false, started);

        let snap = step.snapshot();
        assert_eq!(snap.success, 2);
        assert_eq!(snap.failure, 1);
    }

    #[test]
    fn hub_registers_runners() {
        let hub = MetricsHub::new();
        let m = hub.runner("DOCKER_ENGINE", "docker-1");
        m.prewarmer.fetch_hits.inc();

        let snapshots = hub.runner_snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].runner_name, "docker-1");
        assert_eq!(snapshots[0].fetch_hits, 1);
    }

    #[test]
    fn api_metrics_count_errors() {
        let api = ApiMetrics::default();
        api.observe(false, Instant::now());
        api.observe(true, Instant::now());

        let snap = api.snapshot();
        assert_eq!(snap.requests_total, 2);
        assert_eq!(snap.errors_total, 1);
    }
}
