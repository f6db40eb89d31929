//! playgroundd — the query playground daemon.
//!
//! Single process hosting the REST API, the coordinator with its runner
//! fleet, the tag cache, and the run store.
//!
//! # Usage
//!
//! ```text
//! playgroundd --config config.yml
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use playground_api::{ApiState, Limits};
use playground_coordinator::{Coordinator, RunnerHandle};
use playground_core::runner::QueryRunner;
use playground_metrics::MetricsHub;
use playground_registry::{RegistryClient, TagCache, TagCacheConfig};
use playground_runner::DockerRunner;
use playground_store::RunStore;

use crate::config::Settings;

/// How long a graceful shutdown may take before in-flight removals are
/// abandoned to the GC.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "playgroundd", about = "Query playground daemon")]
struct Cli {
    /// Path to the YAML config file.
    #[arg(long, default_value = "config.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.log_level.parse().unwrap_or_default()),
        )
        .init();

    info!(config = %cli.config.display(), "playground daemon starting");

    let token = CancellationToken::new();

    // ── Tag cache ──────────────────────────────────────────────

    let registry = Arc::new(RegistryClient::new(
        &settings.registry_url,
        settings.registry_auth.clone(),
        settings.registry_page_size,
    ));

    let tag_cache = TagCache::new(
        TagCacheConfig {
            repositories: settings.repositories.clone(),
            os: settings.os.clone(),
            architecture: settings.architecture.clone(),
            expiration: settings.tag_cache_expiration,
        },
        registry,
    );

    // Warm the cache before serving; a failure only delays the data
    // until the next refresh.
    if let Err(err) = tag_cache.refresh().await {
        warn!(error = %err, "initial tag cache refresh failed");
    }
    tag_cache.run_background_update(token.child_token());

    // ── Store and metrics ──────────────────────────────────────

    let store = RunStore::open(&settings.storage_path)?;
    info!(path = %settings.storage_path.display(), "run store opened");

    let hub = MetricsHub::new();

    // ── Runner fleet ───────────────────────────────────────────

    let mut handles = Vec::with_capacity(settings.runners.len());
    for runner_settings in &settings.runners {
        let runner = DockerRunner::new(
            &token,
            &runner_settings.name,
            runner_settings.engine.clone(),
            Arc::new(tag_cache.clone()),
            &hub,
        )?;

        handles.push(RunnerHandle::new(
            Arc::new(runner),
            runner_settings.weight,
            runner_settings.max_concurrency,
        ));
    }

    let coordinator = Arc::new(Coordinator::new(
        &token,
        handles,
        settings.coordinator.clone(),
    ));
    coordinator.start().await?;

    // ── API server ─────────────────────────────────────────────

    let api_state = ApiState {
        runner: coordinator.clone(),
        tags: Arc::new(tag_cache),
        store,
        metrics: hub,
        limits: Limits {
            max_query_length: settings.max_query_length,
            max_output_length: settings.max_output_length,
        },
        server_timeout: settings.server_timeout,
    };

    let router = playground_api::build_router(api_state);
    let listener = tokio::net::TcpListener::bind(&settings.api_address).await?;

    info!(address = %settings.api_address, "API server starting");

    let shutdown_token = token.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            shutdown_token.cancel();
        })
        .await?;

    // ── Graceful shutdown ──────────────────────────────────────

    token.cancel();

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, coordinator.stop())
        .await
        .is_err()
    {
        error!("shutdown timed out; remaining containers are left to the GC");
    }

    info!("playground daemon stopped");

    Ok(())
}
