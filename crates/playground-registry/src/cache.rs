//! The tag cache: a coherent, asynchronously refreshed view of the
//! available database versions across several upstream repositories.
//!
//! Readers always observe a consistent snapshot (the tag map and the
//! ordered list are replaced together under the write lock). A reader
//! hitting a stale snapshot schedules an asynchronous refresh instead of
//! blocking; a single-slot atomic flag guarantees at most one refresh in
//! flight, whether it was triggered by the ticker or by a reader.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures_util::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use playground_core::image::ImageDescriptor;
use playground_core::runner::ImageTagStorage;

use crate::client::{RegistryResult, UpstreamClient};

pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(5 * 60);

/// Cache construction parameters.
#[derive(Debug, Clone)]
pub struct TagCacheConfig {
    /// Upstream repositories in priority order: the first repository wins
    /// on tag collision.
    pub repositories: Vec<String>,
    pub os: String,
    pub architecture: String,
    pub expiration: Duration,
}

#[derive(Default)]
struct CacheState {
    /// `None` until the first successful refresh.
    updated_at: Option<Instant>,
    by_tag: HashMap<String, ImageDescriptor>,
    ordered: Vec<ImageDescriptor>,
}

struct CacheInner {
    config: TagCacheConfig,
    client: Arc<dyn UpstreamClient>,

    /// Single-slot "refresh in flight" lock.
    updating: AtomicBool,
    state: RwLock<CacheState>,
}

/// Shared, cloneable handle to the tag cache.
#[derive(Clone)]
pub struct TagCache {
    inner: Arc<CacheInner>,
}

/// Releases the `updating` slot on every refresh exit path.
struct UpdatingGuard<'a>(&'a AtomicBool);

impl Drop for UpdatingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl TagCache {
    pub fn new(config: TagCacheConfig, client: Arc<dyn UpstreamClient>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                client,
                updating: AtomicBool::new(false),
                state: RwLock::new(CacheState::default()),
            }),
        }
    }

    /// Spawn the background task that keeps the cache fresh until the
    /// token is cancelled.
    pub fn run_background_update(&self, token: CancellationToken) {
        let cache = self.clone();
        let expiration = self.inner.config.expiration;

        tokio::spawn(async move {
            info!("tag cache background update started");

            cache.update_if_expired();

            let mut ticker = tokio::time::interval(expiration);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // The first tick fires immediately.

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("tag cache background update finished");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                cache.update_if_expired();
            }
        });
    }

    fn normalize_tag(tag: &str) -> String {
        tag.to_lowercase()
    }

    fn is_expired(&self) -> bool {
        let state = self.inner.state.read().unwrap();
        match state.updated_at {
            Some(at) => at.elapsed() >= self.inner.config.expiration,
            None => true,
        }
    }

    /// Schedule an asynchronous refresh iff the snapshot is stale and no
    /// refresh is already running.
    fn update_if_expired(&self) {
        if !self.is_expired() {
            return;
        }

        // Another reader or the ticker may already hold the slot.
        if self
            .inner
            .updating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let cache = self.clone();
        tokio::spawn(async move {
            let _slot = UpdatingGuard(&cache.inner.updating);

            if let Err(err) = cache.refresh_inner().await {
                error!(error = %err, "tag cache refresh failed");
            }
        });
    }

    /// Fetch and publish a fresh snapshot. On failure the previous
    /// snapshot is preserved and `updated_at` does not advance.
    ///
    /// Exposed for startup warm-up and tests; concurrent callers are
    /// serialized only through [`Self::update_if_expired`].
    pub async fn refresh(&self) -> RegistryResult<()> {
        self.refresh_inner().await
    }

    async fn refresh_inner(&self) -> RegistryResult<()> {
        let started_at = Instant::now();

        let per_repo = try_join_all(
            self.inner
                .config
                .repositories
                .iter()
                .map(|repo| self.fetch_repository(repo)),
        )
        .await?;

        let mut by_tag = HashMap::new();
        let mut ordered = Vec::new();
        for images in per_repo {
            for image in images {
                let tag = Self::normalize_tag(&image.tag);

                // First repository wins on tag collision.
                if by_tag.contains_key(&tag) {
                    continue;
                }

                by_tag.insert(tag, image.clone());
                ordered.push(image);
            }
        }

        ordered.sort_by(|a, b| Self::normalize_tag(&b.tag).cmp(&Self::normalize_tag(&a.tag)));

        {
            let mut state = self.inner.state.write().unwrap();
            state.updated_at = Some(Instant::now());
            state.by_tag = by_tag;
            state.ordered = ordered;
        }

        debug!(
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "tag cache has been updated"
        );

        Ok(())
    }

    /// Platform-filtered images of one repository, most recently pushed
    /// first.
    async fn fetch_repository(&self, repository: &str) -> RegistryResult<Vec<ImageDescriptor>> {
        let tags = self.inner.client.get_tags(repository).await.map_err(|e| {
            error!(repository, error = %e, "failed to fetch upstream tags");
            e
        })?;

        let config = &self.inner.config;
        let mut images = Vec::new();

        for tag in tags {
            for img in &tag.images {
                if !img.os.eq_ignore_ascii_case(&config.os)
                    || !img.architecture.eq_ignore_ascii_case(&config.architecture)
                {
                    continue;
                }

                let Some(digest) = img.digest.clone().filter(|d| !d.is_empty()) else {
                    continue;
                };

                images.push(ImageDescriptor {
                    repository: repository.to_string(),
                    tag: tag.name.clone(),
                    os: img.os.clone(),
                    architecture: img.architecture.clone(),
                    digest,
                    pushed_at: img
                        .last_pushed
                        .or(tag.tag_last_pushed)
                        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC),
                });
            }
        }

        images.sort_by(|a, b| b.pushed_at.cmp(&a.pushed_at));

        debug!(repository, count = images.len(), "fetched repository images");

        Ok(images)
    }
}

impl ImageTagStorage for TagCache {
    fn get(&self, version: &str) -> Option<ImageDescriptor> {
        let found = {
            let state = self.inner.state.read().unwrap();
            state.by_tag.get(&Self::normalize_tag(version)).cloned()
        };

        self.update_if_expired();

        found
    }

    fn exists(&self, version: &str) -> bool {
        let found = {
            let state = self.inner.state.read().unwrap();
            state.by_tag.contains_key(&Self::normalize_tag(version))
        };

        self.update_if_expired();

        found
    }

    fn all(&self) -> Vec<ImageDescriptor> {
        let images = {
            let state = self.inner.state.read().unwrap();
            state.ordered.clone()
        };

        self.update_if_expired();

        images
    }
}
