//! The container-engine runner.
//!
//! One runner owns one daemon connection plus its background workers
//! (GC, status collector, prewarmer) for its lifetime. The request
//! pipeline is: resolve version → acquire container (prewarm hit or
//! fresh create) → schedule deferred removal → seed the prewarmer →
//! readiness-retry exec → combined output.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use playground_core::image::{playground_image_name, upstream_image_name};
use playground_core::readiness::query_accepted;
use playground_core::run::Run;
use playground_core::runner::{
    ImageTagStorage, QueryRunner, RunnerError, RunnerStatus, RunnerType,
};
use playground_engine::{EngineProvider, ExecOutput};
use playground_metrics::{MetricsHub, RunnerMetrics};

use crate::config::EngineRunnerConfig;
use crate::factory::ContainerFactory;
use crate::gc::GarbageCollector;
use crate::prewarmer::{FactoryBackend, PrewarmRequest, Prewarmer};
use crate::state::RequestState;
use crate::status::StatusCollector;

/// A runner that executes queries in containers created through the
/// container daemon.
///
/// The daemon may live on the same host or behind a remote address; the
/// only requirement is API access to a running daemon.
pub struct DockerRunner {
    token: CancellationToken,

    name: String,
    cfg: EngineRunnerConfig,

    engine: Arc<EngineProvider>,
    tags: Arc<dyn ImageTagStorage>,
    metrics: Arc<RunnerMetrics>,

    factory: Arc<ContainerFactory>,
    prewarmer: Arc<Prewarmer>,
    gc: Arc<GarbageCollector>,
    status: Arc<StatusCollector>,

    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DockerRunner {
    /// Connect to the daemon and assemble the runner.
    pub fn new(
        parent: &CancellationToken,
        name: &str,
        cfg: EngineRunnerConfig,
        tags: Arc<dyn ImageTagStorage>,
        hub: &MetricsHub,
    ) -> Result<Self, RunnerError> {
        let engine = Arc::new(
            EngineProvider::connect(cfg.daemon_url.as_deref())
                .map_err(|e| RunnerError::Internal(e.to_string()))?,
        );

        let token = parent.child_token();
        let metrics = hub.runner(RunnerType::DockerEngine.as_str(), name);

        let factory = Arc::new(ContainerFactory::new(
            name,
            cfg.clone(),
            engine.clone(),
            metrics.clone(),
        ));

        let prewarmer = Prewarmer::new(
            token.clone(),
            Arc::new(FactoryBackend::new(factory.clone(), engine.clone())),
            metrics.clone(),
            cfg.max_warm_containers,
        );

        let gc = Arc::new(GarbageCollector::new(
            token.clone(),
            cfg.gc.clone(),
            engine.clone(),
            metrics.clone(),
        ));

        let status = Arc::new(StatusCollector::new(
            token.clone(),
            engine.clone(),
            metrics.clone(),
            cfg.status_collection_frequency,
        ));

        Ok(Self {
            token,
            name: name.to_string(),
            cfg,
            engine,
            tags,
            metrics,
            factory,
            prewarmer,
            gc,
            status,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Resolve the version through the tag cache into the two image
    /// names.
    fn resolve(&self, state: &mut RequestState) -> Result<(), RunnerError> {
        let image = self
            .tags
            .get(&state.version)
            .ok_or_else(|| RunnerError::UnknownVersion(state.version.clone()))?;

        state.image_tag = upstream_image_name(&image.repository, &state.version);
        state.image_fqn = playground_image_name(&image.repository, &image.digest);

        Ok(())
    }

    /// Take a warm container or create a fresh one.
    async fn acquire_container(&self, state: &mut RequestState) -> Result<(), RunnerError> {
        if let Some(id) = self.prewarmer.fetch(&state.image_fqn).await? {
            state.container_id = id;
            return Ok(());
        }

        self.factory.create_container(state).await
    }

    /// Schedule removal of the request's container.
    ///
    /// The returned guard fires the removal as soon as it is dropped,
    /// which happens both when the query finishes and when the request
    /// future is cancelled. The removal itself runs detached so a
    /// cancelled client cannot leak a container.
    fn schedule_removal(&self, state: &RequestState) -> oneshot::Sender<()> {
        let (guard, dropped) = oneshot::channel::<()>();

        let engine = self.engine.clone();
        let metrics = self.metrics.clone();
        let container_id = state.container_id.clone();
        let run_id = state.run_id.clone();

        tokio::spawn(async move {
            let _ = dropped.await;

            let started_at = Instant::now();
            let result = engine.remove_container(&container_id).await;
            metrics
                .pipeline
                .remove_container
                .observe(result.is_ok(), started_at);

            match result {
                Ok(()) => debug!(container_id = %container_id, "container has been force removed"),
                Err(err) => {
                    error!(run_id = %run_id, container_id = %container_id, error = %err, "failed to remove container");
                }
            }
        });

        guard
    }

    /// One exec attempt with captured, demultiplexed output.
    async fn exec(&self, state: &RequestState) -> Result<ExecOutput, RunnerError> {
        let invoked_at = Instant::now();

        let mut argv: Vec<String> = ["clickhouse", "client", "-n", "-m", "--query"]
            .into_iter()
            .map(str::to_string)
            .collect();
        argv.push(state.query.clone());
        if let Some(settings) = &state.settings {
            argv.extend(settings.client_args(&state.version, &self.cfg.default_output_format));
        }

        let result = self.engine.exec(&state.container_id, argv).await;
        self.metrics
            .pipeline
            .exec_command
            .observe(result.is_ok(), invoked_at);

        match result {
            Ok(output) => {
                debug!(
                    run_id = %state.run_id,
                    elapsed_ms = invoked_at.elapsed().as_millis() as u64,
                    "exec finished"
                );
                Ok(output)
            }
            Err(err) => Err(RunnerError::Exec(err.to_string())),
        }
    }

    /// The readiness-retry exec loop.
    ///
    /// The database accepts connections some time after the container
    /// starts; until then the client fails with a connection-refused
    /// exception on stderr, so the exec is retried. When readiness is
    /// never reached the last captured output is returned as-is.
    async fn exec_with_retries(&self, state: &RequestState) -> Result<String, RunnerError> {
        let invoked_at = Instant::now();

        let mut output = ExecOutput::default();
        let mut succeeded = false;
        for attempt in 0..self.cfg.max_exec_retries {
            output = match self.exec(state).await {
                Ok(out) => out,
                Err(err) => {
                    self.metrics.pipeline.run_query.observe(false, invoked_at);
                    return Err(err);
                }
            };

            if query_accepted(&output.stderr) {
                debug!(run_id = %state.run_id, attempt, "query has been executed");
                succeeded = true;
                break;
            }

            tokio::time::sleep(self.cfg.exec_retry_delay).await;
        }

        self.metrics.pipeline.run_query.observe(succeeded, invoked_at);

        Ok(combine_output(&output))
    }
}

#[async_trait]
impl QueryRunner for DockerRunner {
    fn runner_type(&self) -> RunnerType {
        RunnerType::DockerEngine
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn status(&self) -> RunnerStatus {
        match self.engine.ping().await {
            Ok(()) => RunnerStatus::alive(),
            Err(err) => RunnerStatus::dead(err),
        }
    }

    async fn start(&self) -> Result<(), RunnerError> {
        let mut workers = self.workers.lock().unwrap();

        let gc = self.gc.clone();
        workers.push(tokio::spawn(async move { gc.run().await }));

        let status = self.status.clone();
        workers.push(tokio::spawn(async move { status.run().await }));

        workers.push(tokio::spawn(self.prewarmer.clone().run()));

        info!(
            runner = %self.name,
            daemon_url = self.cfg.daemon_url.as_deref().unwrap_or("local"),
            "runner has been started"
        );

        Ok(())
    }

    async fn stop(&self) -> Result<(), RunnerError> {
        info!(runner = %self.name, "stopping");

        self.token.cancel();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.await;
        }

        // Release the pool only after the worker stopped creating
        // containers.
        self.prewarmer.drain().await;

        info!(runner = %self.name, "runner has been stopped");

        Ok(())
    }

    async fn run_query(&self, run: &Run) -> Result<String, RunnerError> {
        let mut state = RequestState::from_run(run);

        self.resolve(&mut state)?;
        self.acquire_container(&mut state).await?;

        let _removal_guard = self.schedule_removal(&state);

        self.prewarmer.push_new_request(PrewarmRequest::from_state(&state));

        self.exec_with_retries(&state).await
    }
}

/// stdout alone when stderr is empty, otherwise both.
fn combine_output(output: &ExecOutput) -> String {
    if output.stderr.is_empty() {
        output.stdout.clone()
    } else {
        format!("{}\n{}", output.stdout, output.stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_output_prefers_plain_stdout() {
        let out = ExecOutput {
            stdout: "1\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(combine_output(&out), "1\n");
    }

    #[test]
    fn combine_output_appends_stderr() {
        let out = ExecOutput {
            stdout: "partial".to_string(),
            stderr: "DB::Exception: Syntax error".to_string(),
        };
        assert_eq!(combine_output(&out), "partial\nDB::Exception: Syntax error");
    }
}
