//! The daemon provider: one shared handle, safe for concurrent use.

use std::collections::HashMap;
use std::path::Path;

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, PruneContainersOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions, TagImageOptions};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tracing::trace;

use playground_core::image::is_playground_image_name;
use playground_core::labels::OWNED_FILTER;

use crate::error::{EngineError, EngineResult};

/// Client-side timeout for daemon calls, matching long pulls.
const DEFAULT_DAEMON_TIMEOUT_SECS: u64 = 300;

/// A read-only bind mount of a host file into the container.
#[derive(Debug, Clone)]
pub struct BindMount {
    pub source: String,
    pub target: String,
}

/// Everything needed to create one playground container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub labels: HashMap<String, String>,

    pub network_mode: Option<String>,
    /// In nano CPUs (1 core = 1e9). 0 means unlimited.
    pub nano_cpus: i64,
    /// Comma-separated list or hyphen range of usable cores. Empty means any.
    pub cpuset_cpus: String,
    /// In bytes. 0 means unlimited.
    pub memory_limit: i64,

    pub mounts: Vec<BindMount>,
}

/// Summary of a listed image.
#[derive(Debug, Clone)]
pub struct ImageSummaryInfo {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub size: i64,
}

/// Details of an inspected image.
#[derive(Debug, Clone)]
pub struct ImageDetails {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub size: i64,
    pub last_tag_time: Option<DateTime<Utc>>,
}

/// Summary of a listed container.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    /// Creation time, seconds since the epoch.
    pub created: i64,
    pub state: Option<String>,
    pub size_rw: i64,
}

/// Outcome of a container prune.
#[derive(Debug, Clone, Default)]
pub struct PruneOutcome {
    pub deleted: u64,
    pub space_reclaimed: u64,
}

/// Captured exec output, already demultiplexed.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Shared handle to one container daemon.
///
/// Cloning is cheap; the underlying client multiplexes concurrent calls.
#[derive(Clone)]
pub struct EngineProvider {
    cli: Docker,
}

impl EngineProvider {
    /// Connect to the daemon.
    ///
    /// `None` uses the platform's local defaults (unix socket / npipe);
    /// `http://` and `tcp://` URLs use the HTTP transport. `ssh://` is not
    /// supported by the client library and is rejected up front.
    pub fn connect(daemon_url: Option<&str>) -> EngineResult<Self> {
        let cli = match daemon_url {
            None => Docker::connect_with_local_defaults()
                .map_err(|e| EngineError::Connect(e.to_string()))?,
            Some(url) if url.starts_with("http://") || url.starts_with("tcp://") => {
                Docker::connect_with_http(
                    url,
                    DEFAULT_DAEMON_TIMEOUT_SECS,
                    bollard::API_DEFAULT_VERSION,
                )
                .map_err(|e| EngineError::Connect(e.to_string()))?
            }
            Some(url) => return Err(EngineError::UnsupportedDaemonUrl(url.to_string())),
        };

        Ok(Self { cli })
    }

    /// Liveness probe against the daemon.
    pub async fn ping(&self) -> EngineResult<()> {
        self.cli.ping().await?;
        Ok(())
    }

    /// Pull an image, draining the progress stream to completion.
    pub async fn pull_image(&self, image_tag: &str) -> EngineResult<()> {
        let options = CreateImageOptions {
            from_image: image_tag.to_string(),
            ..Default::default()
        };

        let mut progress = self.cli.create_image(Some(options), None, None);
        while let Some(update) = progress.next().await {
            let info = update?;
            trace!(image = image_tag, status = ?info.status, "pull progress");
        }

        Ok(())
    }

    /// Add `new_tag` as an alias of an existing image.
    pub async fn add_image_tag(&self, existing: &str, new_tag: &str) -> EngineResult<()> {
        let (repo, tag) = split_image_name(new_tag);
        self.cli
            .tag_image(
                existing,
                Some(TagImageOptions {
                    repo: repo.to_string(),
                    tag: tag.to_string(),
                }),
            )
            .await?;
        Ok(())
    }

    /// Inspect an image by name or id. Daemon 404 becomes `Ok(None)`.
    pub async fn inspect_image(&self, name: &str) -> EngineResult<Option<ImageDetails>> {
        match self.cli.inspect_image(name).await {
            Ok(inspect) => Ok(Some(ImageDetails {
                id: inspect.id.unwrap_or_default(),
                repo_tags: inspect.repo_tags.unwrap_or_default(),
                size: inspect.size.unwrap_or_default(),
                last_tag_time: inspect.metadata.and_then(|m| m.last_tag_time),
            })),
            Err(err) => {
                let err = EngineError::from(err);
                if err.is_not_found() {
                    return Ok(None);
                }
                Err(err)
            }
        }
    }

    /// List images; with `owned_only` only playground-aliased images are
    /// returned.
    pub async fn list_images(&self, owned_only: bool) -> EngineResult<Vec<ImageSummaryInfo>> {
        let images = self
            .cli
            .list_images(Some(ListImagesOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;

        let mut out = Vec::with_capacity(images.len());
        for img in images {
            if owned_only && !img.repo_tags.iter().any(|t| is_playground_image_name(t)) {
                continue;
            }
            out.push(ImageSummaryInfo {
                id: img.id,
                repo_tags: img.repo_tags,
                size: img.size,
            });
        }

        Ok(out)
    }

    /// Remove one image tag.
    pub async fn remove_image(&self, tag: &str, prune_children: bool) -> EngineResult<()> {
        self.cli
            .remove_image(
                tag,
                Some(RemoveImageOptions {
                    noprune: !prune_children,
                    ..Default::default()
                }),
                None,
            )
            .await?;
        Ok(())
    }

    /// Create a container and return its id.
    pub async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|m| Mount {
                target: Some(m.target.clone()),
                source: Some(m.source.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(true),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            network_mode: spec.network_mode.clone(),
            nano_cpus: (spec.nano_cpus > 0).then_some(spec.nano_cpus),
            cpuset_cpus: (!spec.cpuset_cpus.is_empty()).then(|| spec.cpuset_cpus.clone()),
            memory: (spec.memory_limit > 0).then_some(spec.memory_limit),
            mounts: (!mounts.is_empty()).then_some(mounts),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .cli
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;

        Ok(created.id)
    }

    pub async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.cli
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    pub async fn pause_container(&self, id: &str) -> EngineResult<()> {
        self.cli.pause_container(id).await?;
        Ok(())
    }

    pub async fn unpause_container(&self, id: &str) -> EngineResult<()> {
        self.cli.unpause_container(id).await?;
        Ok(())
    }

    /// Run a command in the container and capture its demultiplexed
    /// output. Returns when the stream ends or the calling future is
    /// dropped.
    pub async fn exec(&self, container_id: &str, argv: Vec<String>) -> EngineResult<ExecOutput> {
        let exec = self
            .cli
            .create_exec(
                container_id,
                CreateExecOptions::<String> {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(argv),
                    ..Default::default()
                },
            )
            .await?;

        let started = self.cli.start_exec(&exec.id, None).await?;
        let mut output = ExecOutput::default();

        match started {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    match chunk? {
                        bollard::container::LogOutput::StdOut { message } => {
                            output.stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        bollard::container::LogOutput::StdErr { message } => {
                            output.stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(EngineError::ExecStream(
                    "exec unexpectedly started detached".to_string(),
                ));
            }
        }

        Ok(output)
    }

    /// List owned containers, including stopped ones, with sizes.
    pub async fn list_containers(&self) -> EngineResult<Vec<ContainerInfo>> {
        let containers = self
            .cli
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                size: true,
                filters: owned_filter(),
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerInfo {
                id: c.id.unwrap_or_default(),
                created: c.created.unwrap_or_default(),
                state: c.state,
                size_rw: c.size_rw.unwrap_or_default(),
            })
            .collect())
    }

    /// Force remove a container together with its anonymous volumes.
    pub async fn remove_container(&self, id: &str) -> EngineResult<()> {
        self.cli
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    /// Prune stopped owned containers.
    pub async fn prune_containers(&self) -> EngineResult<PruneOutcome> {
        let report = self
            .cli
            .prune_containers(Some(PruneContainersOptions::<String> {
                filters: owned_filter(),
            }))
            .await?;

        Ok(PruneOutcome {
            deleted: report.containers_deleted.map(|d| d.len() as u64).unwrap_or(0),
            space_reclaimed: report.space_reclaimed.unwrap_or(0).max(0) as u64,
        })
    }
}

/// The label filter selecting playground-owned objects.
fn owned_filter() -> HashMap<String, Vec<String>> {
    HashMap::from([("label".to_string(), vec![OWNED_FILTER.to_string()])])
}

/// Split `repo:tag` on the final colon; a name without a tag maps to
/// `latest`.
fn split_image_name(name: &str) -> (&str, &str) {
    match name.rsplit_once(':') {
        // A colon inside a registry host (e.g. `host:5000/repo`) is not a
        // tag separator.
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (name, "latest"),
    }
}

/// Whether a mounted config file keeps its source extension.
pub fn mount_target_with_extension(base: &str, source: &str) -> String {
    match Path::new(source).extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{base}.{ext}"),
        None => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_filter_uses_ownership_label() {
        let filter = owned_filter();
        assert_eq!(filter["label"], vec!["playground.ownership=1"]);
    }

    #[test]
    fn split_image_name_on_tag() {
        assert_eq!(split_image_name("chp-repo:abc"), ("chp-repo", "abc"));
        assert_eq!(
            split_image_name("chp-clickhouse/clickhouse-server:edfee1"),
            ("chp-clickhouse/clickhouse-server", "edfee1")
        );
    }

    #[test]
    fn split_image_name_without_tag() {
        assert_eq!(split_image_name("repo"), ("repo", "latest"));
        // Registry port is not a tag.
        assert_eq!(
            split_image_name("registry:5000/repo"),
            ("registry:5000/repo", "latest")
        );
    }

    #[test]
    fn mount_target_keeps_extension() {
        assert_eq!(
            mount_target_with_extension(
                "/etc/clickhouse-server/config.d/custom-config",
                "/opt/cfg/fast-startup.xml"
            ),
            "/etc/clickhouse-server/config.d/custom-config.xml"
        );
        assert_eq!(
            mount_target_with_extension("/etc/clickhouse-server/users.d/custom-quotas", "/opt/q"),
            "/etc/clickhouse-server/users.d/custom-quotas"
        );
    }
}
