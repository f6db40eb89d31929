//! Periodic status export: how many owned images and containers exist
//! and how much space they hold.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use playground_engine::{EngineError, EngineProvider};
use playground_metrics::RunnerMetrics;

pub struct StatusCollector {
    token: CancellationToken,
    engine: Arc<EngineProvider>,
    metrics: Arc<RunnerMetrics>,
    frequency: Duration,
}

impl StatusCollector {
    pub fn new(
        token: CancellationToken,
        engine: Arc<EngineProvider>,
        metrics: Arc<RunnerMetrics>,
        frequency: Duration,
    ) -> Self {
        Self {
            token,
            engine,
            metrics,
            frequency,
        }
    }

    /// The collection loop: one pass at start, then one per period.
    pub async fn run(&self) {
        info!(trigger_frequency = ?self.frequency, "status collector has been started");

        loop {
            if let Err(err) = self.collect().await {
                error!(error = %err, "failed to collect runner status");
            }

            tokio::select! {
                _ = self.token.cancelled() => {
                    info!("status collector has been finished");
                    return;
                }
                _ = tokio::time::sleep(self.frequency) => {}
            }
        }
    }

    async fn collect(&self) -> Result<(), EngineError> {
        let images = self.engine.list_images(true).await?;
        let image_bytes: u64 = images.iter().map(|i| i.size.max(0) as u64).sum();
        self.metrics.status.image_count.set(images.len() as u64);
        self.metrics.status.image_bytes.set(image_bytes);

        let containers = self.engine.list_containers().await?;
        let container_bytes: u64 = containers.iter().map(|c| c.size_rw.max(0) as u64).sum();
        self.metrics
            .status
            .container_count
            .set(containers.len() as u64);
        self.metrics.status.container_bytes.set(container_bytes);

        Ok(())
    }
}
