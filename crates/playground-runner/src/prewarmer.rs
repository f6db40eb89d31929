//! The prewarm pool: speculatively created, paused database containers
//! keyed by their digest-pinned image name.
//!
//! Requests seed a bounded queue of "images we will probably need next";
//! a single worker drains it one image at a time so the pool follows the
//! most recent request pattern. Freshly warmed containers are paused once
//! the database finishes its local bootstrap and unpaused on fetch, so a
//! fetched container is immediately ready for exec.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use playground_core::runner::RunnerError;
use playground_metrics::RunnerMetrics;

use crate::factory::ContainerFactory;
use crate::state::RequestState;

/// Time a fresh database container needs to finish its local bootstrap
/// before it can be paused.
pub const DATABASE_INITIALIZATION_TIME: Duration = Duration::from_secs(1);

/// Run id stamped on containers created by the prewarmer.
pub const PREWARMING_RUN_ID: &str = "PREWARMING";

/// What the prewarmer asks of the daemon; the seam keeps the pool logic
/// testable without a container engine.
#[async_trait]
pub trait PrewarmBackend: Send + Sync {
    /// Create and start a container for the request; returns its id.
    async fn create(&self, request: &PrewarmRequest) -> Result<String, RunnerError>;

    async fn remove(&self, id: &str) -> Result<(), RunnerError>;

    async fn pause(&self, id: &str) -> Result<(), RunnerError>;

    async fn unpause(&self, id: &str) -> Result<(), RunnerError>;
}

/// The image one request wanted; enough to warm the same image again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrewarmRequest {
    pub version: String,
    pub image_tag: String,
    pub image_fqn: String,
}

impl PrewarmRequest {
    pub fn from_state(state: &RequestState) -> Self {
        Self {
            version: state.version.clone(),
            image_tag: state.image_tag.clone(),
            image_fqn: state.image_fqn.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WarmStatus {
    Running,
    Paused,
    Fetched,
}

/// One pooled container. Status transitions are serialized by the entry's
/// own lock; the pool lock stays short.
struct WarmContainer {
    id: String,
    image_fqn: String,
    created_at: Instant,
    status: tokio::sync::Mutex<WarmStatus>,
}

#[derive(Default)]
struct PoolState {
    containers: HashMap<String, Arc<WarmContainer>>,
    queue: VecDeque<PrewarmRequest>,
}

/// The prewarm pool.
pub struct Prewarmer {
    token: CancellationToken,
    backend: Arc<dyn PrewarmBackend>,
    metrics: Arc<RunnerMetrics>,

    state: Mutex<PoolState>,
    signal: Notify,

    max_warm_containers: usize,
    initialization_time: Duration,
}

impl Prewarmer {
    pub fn new(
        token: CancellationToken,
        backend: Arc<dyn PrewarmBackend>,
        metrics: Arc<RunnerMetrics>,
        max_warm_containers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            token,
            backend,
            metrics,
            state: Mutex::new(PoolState::default()),
            signal: Notify::new(),
            max_warm_containers,
            initialization_time: DATABASE_INITIALIZATION_TIME,
        })
    }

    #[cfg(test)]
    fn with_initialization_time(self: Arc<Self>, initialization_time: Duration) -> Arc<Self> {
        let mut inner = Arc::try_unwrap(self).ok().expect("prewarmer already shared");
        inner.initialization_time = initialization_time;
        Arc::new(inner)
    }

    /// Remember a request's image and wake the worker.
    pub fn push_new_request(&self, request: PrewarmRequest) {
        {
            let mut state = self.state.lock().unwrap();

            // The image is already queued; nothing to do.
            if state.queue.iter().any(|r| r.image_fqn == request.image_fqn) {
                return;
            }

            state.queue.push_back(request);
            if state.queue.len() > self.max_warm_containers {
                state.queue.pop_front();
            }
        }

        self.signal.notify_one();
    }

    /// Take a warm container for the image, unpausing it if necessary.
    ///
    /// A returned container is no longer in the pool and is ready for
    /// exec.
    pub async fn fetch(&self, image_fqn: &str) -> Result<Option<String>, RunnerError> {
        let Some(container) = self.extract(image_fqn) else {
            self.metrics.prewarmer.fetch_misses.inc();
            debug!(image = image_fqn, "prewarmer cache miss");
            return Ok(None);
        };

        let mut status = container.status.lock().await;

        let unpause_result = if *status == WarmStatus::Paused {
            self.backend.unpause(&container.id).await
        } else {
            Ok(())
        };

        // The entry leaves the pool even when unpause fails; GC reclaims
        // the container later.
        *status = WarmStatus::Fetched;
        drop(status);

        unpause_result?;

        self.metrics.prewarmer.fetch_hits.inc();
        debug!(id = %container.id, image = %container.image_fqn, "prewarmer cache hit");

        Ok(Some(container.id.clone()))
    }

    fn extract(&self, image_fqn: &str) -> Option<Arc<WarmContainer>> {
        let mut state = self.state.lock().unwrap();
        let container = state.containers.remove(image_fqn)?;

        self.metrics.prewarmer.containers_fetched.inc();
        debug!(id = %container.id, image = %container.image_fqn, "container fetched from the prewarmed set");

        Some(container)
    }

    /// The worker loop: drains the queue one image at a time until the
    /// token is cancelled.
    pub async fn run(self: Arc<Self>) {
        info!("prewarmer has been started");

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = self.signal.notified() => {}
            }

            let (request, count) = self.next_request();
            let Some(request) = request else { continue };

            if let Err(err) = self.warm(&request).await {
                error!(image = %request.image_fqn, error = %err, "failed to start a prewarmed container");
            }

            // Leftover requests are handled on the next iteration; one at
            // a time keeps the pool aligned with the latest traffic.
            if count > 1 {
                self.signal.notify_one();
            }
        }
    }

    /// Pop the next request plus the queue length before the pop.
    fn next_request(&self) -> (Option<PrewarmRequest>, usize) {
        let mut state = self.state.lock().unwrap();
        let count = state.queue.len();
        (state.queue.pop_front(), count)
    }

    /// Create a container for the image and place it into the pool.
    async fn warm(&self, request: &PrewarmRequest) -> Result<(), RunnerError> {
        let id = self.backend.create(request).await?;

        let container = Arc::new(WarmContainer {
            id,
            image_fqn: request.image_fqn.clone(),
            created_at: Instant::now(),
            status: tokio::sync::Mutex::new(WarmStatus::Running),
        });

        let outcome = {
            let mut state = self.state.lock().unwrap();

            if state.containers.contains_key(&request.image_fqn) {
                Err(())
            } else {
                state
                    .containers
                    .insert(request.image_fqn.clone(), container.clone());

                if state.containers.len() > self.max_warm_containers {
                    Ok(self.pick_oldest(&mut state))
                } else {
                    Ok(None)
                }
            }
        };

        let evicted = match outcome {
            Err(()) => {
                // A concurrent warm won the race; this container is
                // surplus and must not leak.
                if let Err(err) = self.backend.remove(&container.id).await {
                    warn!(container_id = %container.id, error = %err, "failed to remove duplicate container");
                }
                return Err(RunnerError::Internal(format!(
                    "container for image {} already exists",
                    request.image_fqn
                )));
            }
            Ok(evicted) => evicted,
        };

        if let Some(oldest) = evicted {
            self.metrics.prewarmer.containers_ejected.inc();
            debug!(id = %oldest.id, image = %oldest.image_fqn, "container ejected from the prewarmed set");

            let backend = self.backend.clone();
            tokio::spawn(async move {
                if let Err(err) = backend.remove(&oldest.id).await {
                    error!(container_id = %oldest.id, error = %err, "failed to remove ejected container");
                }
            });
        }

        self.metrics.prewarmer.containers_added.inc();
        debug!(id = %container.id, image = %container.image_fqn, "container added to the prewarmed set");

        self.spawn_pause_task(container);

        Ok(())
    }

    /// Remove and return the oldest pooled container.
    fn pick_oldest(&self, state: &mut PoolState) -> Option<Arc<WarmContainer>> {
        let oldest_fqn = state
            .containers
            .values()
            .min_by_key(|c| c.created_at)
            .map(|c| c.image_fqn.clone())?;

        state.containers.remove(&oldest_fqn)
    }

    /// Pause the container once the database inside finished its
    /// bootstrap, unless it was fetched in the meantime.
    fn spawn_pause_task(&self, container: Arc<WarmContainer>) {
        let backend = self.backend.clone();
        let token = self.token.clone();
        let initialization_time = self.initialization_time;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(initialization_time) => {}
            }

            let mut status = container.status.lock().await;
            if *status != WarmStatus::Running {
                return;
            }

            if let Err(err) = backend.pause(&container.id).await {
                error!(container_id = %container.id, error = %err, "failed to pause container");
                return;
            }

            *status = WarmStatus::Paused;
            debug!(id = %container.id, image = %container.image_fqn, "container has been paused");
        });
    }

    /// Best-effort removal of every pooled container.
    pub async fn drain(&self) {
        let drained: Vec<Arc<WarmContainer>> = {
            let mut state = self.state.lock().unwrap();
            state.queue.clear();
            state.containers.drain().map(|(_, c)| c).collect()
        };

        info!(count = drained.len(), "removing prewarmed containers");

        for container in drained {
            if let Err(err) = self.backend.remove(&container.id).await {
                error!(container_id = %container.id, error = %err, "failed to remove container");
            } else {
                self.metrics.prewarmer.containers_ejected.inc();
            }
        }

        info!("prewarmer has been stopped");
    }

    /// Image names currently pooled (diagnostics and tests).
    pub fn pooled_images(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.containers.keys().cloned().collect()
    }

    /// Queued image names (diagnostics and tests).
    pub fn queued_images(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.queue.iter().map(|r| r.image_fqn.clone()).collect()
    }
}

/// The production backend: the shared container factory plus the daemon
/// handle for removals and pause transitions.
pub struct FactoryBackend {
    factory: Arc<ContainerFactory>,
    engine: Arc<playground_engine::EngineProvider>,
}

impl FactoryBackend {
    pub fn new(
        factory: Arc<ContainerFactory>,
        engine: Arc<playground_engine::EngineProvider>,
    ) -> Self {
        Self { factory, engine }
    }
}

#[async_trait]
impl PrewarmBackend for FactoryBackend {
    async fn create(&self, request: &PrewarmRequest) -> Result<String, RunnerError> {
        let mut state = RequestState {
            run_id: PREWARMING_RUN_ID.to_string(),
            query: " ".to_string(),
            version: request.version.clone(),
            image_tag: request.image_tag.clone(),
            image_fqn: request.image_fqn.clone(),
            ..Default::default()
        };

        self.factory.create_container(&mut state).await?;

        Ok(state.container_id)
    }

    async fn remove(&self, id: &str) -> Result<(), RunnerError> {
        self.engine
            .remove_container(id)
            .await
            .map_err(|e| RunnerError::Container(e.to_string()))
    }

    async fn pause(&self, id: &str) -> Result<(), RunnerError> {
        self.engine
            .pause_container(id)
            .await
            .map_err(|e| RunnerError::Container(e.to_string()))
    }

    async fn unpause(&self, id: &str) -> Result<(), RunnerError> {
        self.engine
            .unpause_container(id)
            .await
            .map_err(|e| RunnerError::Container(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use playground_metrics::MetricsHub;

    #[derive(Default)]
    struct MockBackend {
        next_id: AtomicUsize,
        created: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
        paused: Mutex<Vec<String>>,
        unpaused: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PrewarmBackend for MockBackend {
        async fn create(&self, request: &PrewarmRequest) -> Result<String, RunnerError> {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            let id = format!("cont-{n}-{}", request.image_fqn);
            self.created.lock().unwrap().push(id.clone());
            Ok(id)
        }

        async fn remove(&self, id: &str) -> Result<(), RunnerError> {
            self.removed.lock().unwrap().push(id.to_string());
            Ok(())
        }

        async fn pause(&self, id: &str) -> Result<(), RunnerError> {
            self.paused.lock().unwrap().push(id.to_string());
            Ok(())
        }

        async fn unpause(&self, id: &str) -> Result<(), RunnerError> {
            self.unpaused.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    fn request(fqn: &str) -> PrewarmRequest {
        PrewarmRequest {
            version: "21.8".to_string(),
            image_tag: format!("repo:{fqn}"),
            image_fqn: fqn.to_string(),
        }
    }

    fn prewarmer(max: usize, backend: Arc<MockBackend>) -> Arc<Prewarmer> {
        let hub = MetricsHub::new();
        let metrics = hub.runner("DOCKER_ENGINE", "test");
        Prewarmer::new(CancellationToken::new(), backend, metrics, max)
            .with_initialization_time(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn push_deduplicates_queued_images() {
        let prewarmer = prewarmer(5, Arc::new(MockBackend::default()));

        prewarmer.push_new_request(request("chp-a:1"));
        prewarmer.push_new_request(request("chp-a:1"));
        prewarmer.push_new_request(request("chp-b:2"));

        assert_eq!(prewarmer.queued_images(), vec!["chp-a:1", "chp-b:2"]);
    }

    #[tokio::test]
    async fn push_trims_queue_from_the_front() {
        let prewarmer = prewarmer(2, Arc::new(MockBackend::default()));

        prewarmer.push_new_request(request("chp-a:1"));
        prewarmer.push_new_request(request("chp-b:2"));
        prewarmer.push_new_request(request("chp-c:3"));

        assert_eq!(prewarmer.queued_images(), vec!["chp-b:2", "chp-c:3"]);
    }

    #[tokio::test]
    async fn worker_warms_queued_images() {
        let backend = Arc::new(MockBackend::default());
        let prewarmer = prewarmer(5, backend.clone());

        let worker = tokio::spawn(prewarmer.clone().run());

        prewarmer.push_new_request(request("chp-a:1"));
        prewarmer.push_new_request(request("chp-b:2"));

        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut pooled = prewarmer.pooled_images();
        pooled.sort();
        assert_eq!(pooled, vec!["chp-a:1", "chp-b:2"]);

        prewarmer.token.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn warmed_containers_get_paused_after_bootstrap() {
        let backend = Arc::new(MockBackend::default());
        let prewarmer = prewarmer(5, backend.clone());

        prewarmer.warm(&request("chp-a:1")).await.unwrap();
        assert!(backend.paused.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.paused.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fetch_unpauses_paused_containers() {
        let backend = Arc::new(MockBackend::default());
        let prewarmer = prewarmer(5, backend.clone());

        prewarmer.warm(&request("chp-a:1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let id = prewarmer.fetch("chp-a:1").await.unwrap().unwrap();
        assert_eq!(backend.unpaused.lock().unwrap().as_slice(), &[id]);
        assert!(prewarmer.pooled_images().is_empty());
    }

    #[tokio::test]
    async fn fetch_before_pause_skips_unpause_and_wins_the_race() {
        let backend = Arc::new(MockBackend::default());
        let prewarmer = prewarmer(5, backend.clone());

        prewarmer.warm(&request("chp-a:1")).await.unwrap();

        // Fetched while still RUNNING: no unpause needed.
        let id = prewarmer.fetch("chp-a:1").await.unwrap().unwrap();
        assert!(backend.unpaused.lock().unwrap().is_empty());
        assert!(!id.is_empty());

        // The pending pause task must observe FETCHED and do nothing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(backend.paused.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_miss_returns_none() {
        let prewarmer = prewarmer(5, Arc::new(MockBackend::default()));
        assert!(prewarmer.fetch("chp-a:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pool_overflow_ejects_the_oldest() {
        let backend = Arc::new(MockBackend::default());
        let prewarmer = prewarmer(2, backend.clone());

        prewarmer.warm(&request("chp-a:1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        prewarmer.warm(&request("chp-b:2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        prewarmer.warm(&request("chp-c:3")).await.unwrap();

        // Give the async removal a moment.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut pooled = prewarmer.pooled_images();
        pooled.sort();
        assert_eq!(pooled, vec!["chp-b:2", "chp-c:3"]);

        let removed = backend.removed.lock().unwrap();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].contains("chp-a:1"));
    }

    #[tokio::test]
    async fn duplicate_warm_removes_the_new_container() {
        let backend = Arc::new(MockBackend::default());
        let prewarmer = prewarmer(5, backend.clone());

        prewarmer.warm(&request("chp-a:1")).await.unwrap();
        let err = prewarmer.warm(&request("chp-a:1")).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));

        // The duplicate container must not leak.
        let removed = backend.removed.lock().unwrap();
        assert_eq!(removed.len(), 1);
        // The first container stays pooled.
        assert_eq!(prewarmer.pooled_images(), vec!["chp-a:1"]);
    }

    #[tokio::test]
    async fn drain_removes_every_pooled_container() {
        let backend = Arc::new(MockBackend::default());
        let prewarmer = prewarmer(5, backend.clone());

        prewarmer.warm(&request("chp-a:1")).await.unwrap();
        prewarmer.warm(&request("chp-b:2")).await.unwrap();

        prewarmer.drain().await;

        assert!(prewarmer.pooled_images().is_empty());
        assert_eq!(backend.removed.lock().unwrap().len(), 2);
    }
}
