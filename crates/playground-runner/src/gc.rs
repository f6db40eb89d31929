//! Background garbage collection of owned containers and images.
//!
//! Containers: periodic prune plus age-based force removal. Images: once
//! the number of owned (`chp-`) images crosses a threshold, everything
//! but the most recently tagged buffer is removed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use playground_engine::{EngineError, EngineProvider, ImageDetails};
use playground_metrics::RunnerMetrics;

use crate::config::GcConfig;

/// Paused containers belong to the prewarm pool and live long by design;
/// they are only reclaimed after this much time.
pub const PAUSED_CONTAINER_MAX_TTL: Duration = Duration::from_secs(30 * 60);

/// The periodic garbage collector of one runner.
pub struct GarbageCollector {
    token: CancellationToken,
    cfg: Option<GcConfig>,
    engine: Arc<EngineProvider>,
    metrics: Arc<RunnerMetrics>,
}

impl GarbageCollector {
    pub fn new(
        token: CancellationToken,
        cfg: Option<GcConfig>,
        engine: Arc<EngineProvider>,
        metrics: Arc<RunnerMetrics>,
    ) -> Self {
        Self {
            token,
            cfg,
            engine,
            metrics,
        }
    }

    /// The GC loop: one trigger at start, then one per configured period.
    pub async fn run(&self) {
        let Some(cfg) = self.cfg.clone() else {
            info!("garbage collector is disabled due to a missing configuration");
            return;
        };

        info!(trigger_frequency = ?cfg.trigger_frequency, "garbage collector has been started");

        loop {
            if let Err(err) = self.trigger(&cfg).await {
                error!(error = %err, "gc trigger failed");
            }

            tokio::select! {
                _ = self.token.cancelled() => {
                    info!("garbage collector has been finished");
                    return;
                }
                _ = tokio::time::sleep(cfg.trigger_frequency) => {}
            }
        }
    }

    async fn trigger(&self, cfg: &GcConfig) -> Result<(), EngineError> {
        if self.token.is_cancelled() {
            return Ok(());
        }

        self.collect_containers(cfg).await?;

        if self.token.is_cancelled() {
            return Ok(());
        }

        self.collect_images(cfg).await?;

        debug!("gc finished");

        Ok(())
    }

    /// Prune exited containers, then force remove the ones alive past
    /// their TTL.
    async fn collect_containers(&self, cfg: &GcConfig) -> Result<(), EngineError> {
        let pruned = self.engine.prune_containers().await?;

        let mut count = pruned.deleted;
        let mut space_reclaimed = pruned.space_reclaimed;

        if let Some(ttl) = cfg.container_ttl {
            let containers = self.engine.list_containers().await?;
            let now = Utc::now().timestamp();

            let mut paused = 0u64;
            for container in containers {
                let is_paused = container.state.as_deref() == Some("paused");
                if is_paused {
                    paused += 1;
                }

                let age = container_age(container.created, now);
                if !container_expired(age, is_paused, ttl) {
                    continue;
                }

                if let Err(err) = self.engine.remove_container(&container.id).await {
                    error!(container_id = %container.id, error = %err, "gc failed to remove container");
                    continue;
                }

                debug!(container_id = %container.id, "container has been force removed");
                count += 1;
                space_reclaimed += container.size_rw.max(0) as u64;
            }

            self.metrics.gc.paused_containers.set(paused);
        }

        self.metrics.gc.containers_collected.add(count);
        self.metrics
            .gc
            .containers_space_reclaimed_bytes
            .add(space_reclaimed);

        Ok(())
    }

    /// Trim the local image set down to the configured buffer, oldest tag
    /// time first.
    async fn collect_images(&self, cfg: &GcConfig) -> Result<(), EngineError> {
        let Some(threshold) = cfg.image_count_threshold else {
            return Ok(());
        };

        let candidates = self.engine.list_images(true).await?;
        if candidates.len() < threshold {
            return Ok(());
        }

        let mut detailed = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            match self.engine.inspect_image(&candidate.id).await {
                Ok(Some(details)) => detailed.push(details),
                Ok(None) => {}
                Err(err) => {
                    error!(image_id = %candidate.id, error = %err, "image inspect failed");
                }
            }
        }

        let doomed = select_doomed_images(detailed, cfg.image_buffer_size);

        let mut count = 0u64;
        let mut space_reclaimed = 0u64;
        for image in doomed {
            let mut fully_removed = true;
            for tag in &image.repo_tags {
                if let Err(err) = self.engine.remove_image(tag, true).await {
                    error!(image_id = %image.id, tag, error = %err, "failed to delete image tag");
                    fully_removed = false;
                }
            }

            if !fully_removed {
                continue;
            }

            debug!(image_id = %image.id, tags = ?image.repo_tags, "image has been removed");
            count += 1;
            space_reclaimed += image.size.max(0) as u64;
        }

        self.metrics.gc.images_collected.add(count);
        self.metrics
            .gc
            .images_space_reclaimed_bytes
            .add(space_reclaimed);

        Ok(())
    }
}

/// Whether a container of the given age is due for force removal.
///
/// Paused containers get the larger fixed limit.
pub fn container_expired(age: Duration, paused: bool, ttl: Duration) -> bool {
    if paused {
        age >= PAUSED_CONTAINER_MAX_TTL
    } else {
        age >= ttl
    }
}

/// The images to remove: all but the `buffer_size` most recently tagged.
///
/// Images without a tag time sort as oldest and go first.
pub fn select_doomed_images(mut images: Vec<ImageDetails>, buffer_size: usize) -> Vec<ImageDetails> {
    images.sort_by_key(|img| img.last_tag_time.unwrap_or(DateTime::<Utc>::MIN_UTC));

    let keep_from = images.len().saturating_sub(buffer_size);
    images.truncate(keep_from);
    images
}

/// Age of a container created at the given unix timestamp.
pub fn container_age(created: i64, now: i64) -> Duration {
    Duration::from_secs((now - created).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn image(id: &str, tag_time_secs: Option<i64>) -> ImageDetails {
        ImageDetails {
            id: id.to_string(),
            repo_tags: vec![format!("chp-repo:{id}")],
            size: 100,
            last_tag_time: tag_time_secs.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
        }
    }

    #[test]
    fn non_paused_containers_expire_at_ttl() {
        let ttl = Duration::from_secs(60);
        assert!(!container_expired(Duration::from_secs(59), false, ttl));
        assert!(container_expired(Duration::from_secs(60), false, ttl));
        assert!(container_expired(Duration::from_secs(61), false, ttl));
    }

    #[test]
    fn paused_containers_survive_the_regular_ttl() {
        let ttl = Duration::from_secs(60);
        assert!(!container_expired(Duration::from_secs(600), true, ttl));
        assert!(container_expired(PAUSED_CONTAINER_MAX_TTL, true, ttl));
    }

    #[test]
    fn doomed_images_are_the_least_recently_tagged() {
        let images = vec![
            image("c", Some(300)),
            image("a", Some(100)),
            image("d", Some(400)),
            image("b", Some(200)),
        ];

        let doomed = select_doomed_images(images, 2);
        let ids: Vec<&str> = doomed.iter().map(|i| i.id.as_str()).collect();
        // Keep the two newest (c, d); remove the two oldest, oldest first.
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn small_image_sets_are_untouched() {
        let images = vec![image("a", Some(100)), image("b", Some(200))];
        assert!(select_doomed_images(images, 5).is_empty());
    }

    #[test]
    fn images_without_tag_time_go_first() {
        let images = vec![image("a", Some(100)), image("untagged", None)];
        let doomed = select_doomed_images(images, 1);
        assert_eq!(doomed.len(), 1);
        assert_eq!(doomed[0].id, "untagged");
    }

    #[test]
    fn container_age_clamps_clock_skew() {
        assert_eq!(container_age(100, 160), Duration::from_secs(60));
        assert_eq!(container_age(200, 100), Duration::ZERO);
    }
}
