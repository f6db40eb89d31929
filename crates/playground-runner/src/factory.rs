//! The container factory: pull-if-needed, create, start.
//!
//! Shared by the request pipeline and the prewarmer, so both paths apply
//! the same labels and resource limits.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error};

use playground_core::image::is_playground_image_name;
use playground_core::labels::container_labels;
use playground_core::runner::RunnerError;
use playground_engine::provider::mount_target_with_extension;
use playground_engine::{BindMount, ContainerSpec, EngineProvider};
use playground_metrics::RunnerMetrics;

use crate::config::EngineRunnerConfig;
use crate::state::RequestState;

const CUSTOM_CONFIG_MOUNT: &str = "/etc/clickhouse-server/config.d/custom-config";
const QUOTAS_MOUNT: &str = "/etc/clickhouse-server/users.d/custom-quotas";

/// Creates started containers for resolved requests.
pub struct ContainerFactory {
    runner_name: String,
    cfg: EngineRunnerConfig,
    engine: Arc<EngineProvider>,
    metrics: Arc<RunnerMetrics>,
}

impl ContainerFactory {
    pub fn new(
        runner_name: &str,
        cfg: EngineRunnerConfig,
        engine: Arc<EngineProvider>,
        metrics: Arc<RunnerMetrics>,
    ) -> Self {
        Self {
            runner_name: runner_name.to_string(),
            cfg,
            engine,
            metrics,
        }
    }

    /// Ensure the image is present, then create and start a container.
    ///
    /// Expects `state.image_tag` and `state.image_fqn` to be resolved;
    /// fills in `state.container_id`.
    pub async fn create_container(&self, state: &mut RequestState) -> Result<(), RunnerError> {
        debug_assert!(is_playground_image_name(&state.image_fqn));

        self.ensure_image(state).await?;
        self.run_container(state).await
    }

    /// Pull the upstream image and alias it to the digest-pinned name,
    /// unless the alias already exists locally.
    async fn ensure_image(&self, state: &RequestState) -> Result<(), RunnerError> {
        if self.image_exists(state).await {
            return Ok(());
        }

        let started_at = Instant::now();

        if let Err(err) = self.engine.pull_image(&state.image_tag).await {
            self.metrics.pipeline.pull_new_image.observe(false, started_at);
            return Err(RunnerError::Pull(err.to_string()));
        }

        debug!(image = %state.image_tag, "base image has been pulled");

        if let Err(err) = self
            .engine
            .add_image_tag(&state.image_tag, &state.image_fqn)
            .await
        {
            self.metrics.pipeline.pull_new_image.observe(false, started_at);
            error!(
                run_id = %state.run_id,
                source = %state.image_tag,
                target = %state.image_fqn,
                error = %err,
                "failed to alias image"
            );
            return Err(RunnerError::ImageTag(err.to_string()));
        }

        self.metrics.pipeline.pull_new_image.observe(true, started_at);
        debug!(
            run_id = %state.run_id,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            image = %state.image_tag,
            "image has been pulled"
        );

        Ok(())
    }

    /// Whether the digest-pinned alias is already present locally.
    ///
    /// Daemon "not found" is the expected miss; other inspect errors are
    /// logged but treated as a miss so the pull can still win.
    async fn image_exists(&self, state: &RequestState) -> bool {
        let started_at = Instant::now();

        match self.engine.inspect_image(&state.image_fqn).await {
            Ok(Some(_)) => {
                self.metrics.pipeline.pull_existed_image.observe(true, started_at);
                debug!(image = %state.image_fqn, "image has already been pulled");
                true
            }
            Ok(None) => false,
            Err(err) => {
                self.metrics.pipeline.pull_existed_image.observe(false, started_at);
                error!(image = %state.image_fqn, error = %err, "image inspect failed");
                false
            }
        }
    }

    /// Create and start the container; record its id in the state.
    async fn run_container(&self, state: &mut RequestState) -> Result<(), RunnerError> {
        let invoked_at = Instant::now();

        let mut mounts = Vec::new();
        if let Some(path) = &self.cfg.custom_config_path {
            mounts.push(BindMount {
                source: path.clone(),
                target: mount_target_with_extension(CUSTOM_CONFIG_MOUNT, path),
            });
        }
        if let Some(path) = &self.cfg.quotas_path {
            mounts.push(BindMount {
                source: path.clone(),
                target: mount_target_with_extension(QUOTAS_MOUNT, path),
            });
        }

        let spec = ContainerSpec {
            image: state.image_fqn.clone(),
            labels: container_labels(&self.runner_name, &state.run_id, &state.version),
            network_mode: self.cfg.container.network_mode.clone(),
            nano_cpus: self.cfg.container.cpu_limit,
            cpuset_cpus: self.cfg.container.cpuset_cpus.clone(),
            memory_limit: self.cfg.container.memory_limit,
            mounts,
        };

        let created = match self.engine.create_container(&spec).await {
            Ok(id) => id,
            Err(err) => {
                self.metrics.pipeline.create_container.observe(false, invoked_at);
                return Err(RunnerError::Container(err.to_string()));
            }
        };

        debug!(
            run_id = %state.run_id,
            image = %state.image_fqn,
            container_id = %created,
            elapsed_ms = invoked_at.elapsed().as_millis() as u64,
            "container has been created"
        );

        if let Err(err) = self.engine.start_container(&created).await {
            self.metrics.pipeline.create_container.observe(false, invoked_at);
            return Err(RunnerError::Container(err.to_string()));
        }

        self.metrics.pipeline.create_container.observe(true, invoked_at);
        debug!(run_id = %state.run_id, container_id = %created, "container has been started");

        state.container_id = created;

        Ok(())
    }

    pub fn config(&self) -> &EngineRunnerConfig {
        &self.cfg
    }
}
