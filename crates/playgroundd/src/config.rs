//! YAML configuration: parsing, validation, defaults.
//!
//! Durations are written the human way (`200ms`, `30s`, `5m`, `1h`) and
//! parsed during validation; every missing optional gets its documented
//! default there too, so the rest of the daemon only ever sees typed
//! settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use playground_coordinator::{CoordinatorConfig, DEFAULT_WEIGHT};
use playground_registry::cache::DEFAULT_EXPIRATION;
use playground_registry::client::{DEFAULT_PAGE_SIZE, DEFAULT_REGISTRY_URL};
use playground_registry::RegistryAuth;
use playground_runner::{ContainerLimits, EngineRunnerConfig, GcConfig};

const DEFAULT_API_ADDRESS: &str = "0.0.0.0:9000";
const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_QUERY_LENGTH: u64 = 2500;
const DEFAULT_MAX_OUTPUT_LENGTH: u64 = 25000;
const DEFAULT_STORAGE_PATH: &str = "playground.redb";
const DEFAULT_GC_TRIGGER_FREQUENCY: Duration = Duration::from_secs(60);
const DEFAULT_MAX_WARM_CONTAINERS: usize = 5;

// ── Raw file shape ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    log_level: Option<String>,

    docker_image: RawDockerImage,

    #[serde(default)]
    registry: Option<RawRegistry>,

    #[serde(default)]
    api: RawApi,

    #[serde(default)]
    limits: RawLimits,

    #[serde(default)]
    storage: RawStorage,

    #[serde(default)]
    coordinator: RawCoordinator,

    #[serde(default)]
    runners: Vec<RawRunner>,
}

#[derive(Debug, Deserialize)]
struct RawDockerImage {
    #[serde(default)]
    repositories: Vec<String>,
    #[serde(default)]
    os: String,
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    image_tags_cache_expiration_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRegistry {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    identifier: Option<String>,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    page_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawApi {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    server_timeout: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLimits {
    #[serde(default)]
    max_query_length: Option<u64>,
    #[serde(default)]
    max_output_length: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStorage {
    #[serde(default)]
    path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCoordinator {
    #[serde(default)]
    health_checks_enabled: Option<bool>,
    #[serde(default)]
    health_check_retry_delay: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRunner {
    #[serde(rename = "type", default)]
    runner_type: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    weight: Option<u32>,
    #[serde(default)]
    max_concurrency: Option<u32>,
    #[serde(default)]
    docker_engine: Option<RawDockerEngine>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDockerEngine {
    #[serde(default)]
    daemon_url: Option<String>,
    #[serde(default)]
    custom_config_path: Option<String>,
    #[serde(default)]
    quotas_path: Option<String>,
    #[serde(default)]
    gc: Option<RawGc>,
    #[serde(default)]
    prewarm: Option<RawPrewarm>,
    #[serde(default)]
    container: RawContainer,
}

#[derive(Debug, Default, Deserialize)]
struct RawGc {
    #[serde(default)]
    trigger_frequency: Option<String>,
    #[serde(default)]
    container_ttl: Option<String>,
    #[serde(default)]
    image_count_threshold: Option<usize>,
    #[serde(default)]
    image_buffer_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPrewarm {
    #[serde(default)]
    max_warm_containers: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawContainer {
    #[serde(default)]
    network_mode: Option<String>,
    /// In cores; fractions are allowed.
    #[serde(default)]
    cpu_limit: Option<f64>,
    #[serde(default)]
    cpu_cores_set: Option<String>,
    #[serde(default)]
    memory_limit_mb: Option<f64>,
}

// ── Validated settings ─────────────────────────────────────────

/// Fully validated daemon settings with every default applied.
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_level: String,

    pub repositories: Vec<String>,
    pub os: String,
    pub architecture: String,
    pub tag_cache_expiration: Duration,

    pub registry_url: String,
    pub registry_auth: Option<RegistryAuth>,
    pub registry_page_size: u32,

    pub api_address: String,
    pub server_timeout: Duration,

    pub max_query_length: u64,
    pub max_output_length: u64,

    pub storage_path: PathBuf,

    pub coordinator: CoordinatorConfig,

    pub runners: Vec<RunnerSettings>,
}

/// One validated runner definition.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub name: String,
    pub weight: u32,
    pub max_concurrency: Option<u32>,
    pub engine: EngineRunnerConfig,
}

impl Settings {
    /// Load and validate a YAML config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a YAML config document.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(content).context("failed to parse config")?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> anyhow::Result<Self> {
        if raw.docker_image.repositories.is_empty() {
            bail!("docker_image.repositories must be non-empty");
        }
        if raw.docker_image.os.is_empty() {
            bail!("docker_image.os is required");
        }
        if raw.docker_image.architecture.is_empty() {
            bail!("docker_image.architecture is required");
        }

        let tag_cache_expiration = parse_optional_duration(
            raw.docker_image.image_tags_cache_expiration_time.as_deref(),
            "docker_image.image_tags_cache_expiration_time",
        )?
        .unwrap_or(DEFAULT_EXPIRATION);

        let registry = raw.registry.unwrap_or(RawRegistry {
            url: None,
            identifier: None,
            secret: None,
            page_size: None,
        });
        let registry_auth = match (registry.identifier, registry.secret) {
            (Some(identifier), Some(secret)) => Some(RegistryAuth { identifier, secret }),
            (None, None) => None,
            _ => bail!("registry.identifier and registry.secret must be set together"),
        };

        let api_address = match raw.api.address {
            None => DEFAULT_API_ADDRESS.to_string(),
            // A bare `:9000` binds every interface.
            Some(addr) if addr.starts_with(':') => format!("0.0.0.0{addr}"),
            Some(addr) => addr,
        };

        let server_timeout =
            parse_optional_duration(raw.api.server_timeout.as_deref(), "api.server_timeout")?
                .unwrap_or(DEFAULT_SERVER_TIMEOUT);

        let coordinator = CoordinatorConfig {
            health_checks_enabled: raw.coordinator.health_checks_enabled.unwrap_or(true),
            health_check_retry_delay: parse_optional_duration(
                raw.coordinator.health_check_retry_delay.as_deref(),
                "coordinator.health_check_retry_delay",
            )?
            .unwrap_or(playground_coordinator::coordinator::DEFAULT_HEALTH_CHECK_RETRY_DELAY),
        };

        if raw.runners.is_empty() {
            bail!("empty runner list");
        }

        let mut seen_names = std::collections::HashSet::new();
        let mut runners = Vec::with_capacity(raw.runners.len());
        for runner in raw.runners {
            let runner = validate_runner(runner)?;
            if !seen_names.insert(runner.name.clone()) {
                bail!("runner names must be unique, but '{}' is not", runner.name);
            }
            runners.push(runner);
        }

        Ok(Self {
            log_level: raw.log_level.unwrap_or_else(|| "debug".to_string()),
            repositories: raw.docker_image.repositories,
            os: raw.docker_image.os,
            architecture: raw.docker_image.architecture,
            tag_cache_expiration,
            registry_url: registry
                .url
                .unwrap_or_else(|| DEFAULT_REGISTRY_URL.to_string()),
            registry_auth,
            registry_page_size: registry.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            api_address,
            server_timeout,
            max_query_length: raw.limits.max_query_length.unwrap_or(DEFAULT_MAX_QUERY_LENGTH),
            max_output_length: raw
                .limits
                .max_output_length
                .unwrap_or(DEFAULT_MAX_OUTPUT_LENGTH),
            storage_path: raw
                .storage
                .path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_PATH)),
            coordinator,
            runners,
        })
    }
}

fn validate_runner(raw: RawRunner) -> anyhow::Result<RunnerSettings> {
    if raw.name.is_empty() {
        bail!("runner.name is required");
    }

    if raw.max_concurrency == Some(0) {
        bail!("[{}] max_concurrency must be > 0", raw.name);
    }

    match raw.runner_type.as_str() {
        "DOCKER_ENGINE" => {}
        "" => bail!("[{}] runner.type is required", raw.name),
        other => bail!(
            "unknown runner {} type {} (supported: DOCKER_ENGINE)",
            raw.name,
            other
        ),
    }

    let engine_raw = raw
        .docker_engine
        .with_context(|| format!("[{}] runner.docker_engine is required", raw.name))?;

    if let Some(url) = &engine_raw.daemon_url {
        if !url.starts_with("http://") && !url.starts_with("tcp://") {
            bail!(
                "[{}] docker_engine.daemon_url must be empty or start with http:// or tcp://, got {}",
                raw.name,
                url
            );
        }
    }

    let gc = match engine_raw.gc {
        None => None,
        Some(gc) => Some(GcConfig {
            trigger_frequency: parse_optional_duration(
                gc.trigger_frequency.as_deref(),
                "gc.trigger_frequency",
            )?
            .unwrap_or(DEFAULT_GC_TRIGGER_FREQUENCY),
            container_ttl: parse_optional_duration(gc.container_ttl.as_deref(), "gc.container_ttl")?,
            image_count_threshold: gc.image_count_threshold,
            image_buffer_size: gc
                .image_buffer_size
                .unwrap_or(GcConfig::default().image_buffer_size),
        }),
    };

    let defaults = ContainerLimits::default();
    let container = ContainerLimits {
        network_mode: engine_raw.container.network_mode,
        cpu_limit: engine_raw
            .container
            .cpu_limit
            .map(|cores| (cores * 1e9) as i64)
            .unwrap_or(defaults.cpu_limit),
        cpuset_cpus: engine_raw.container.cpu_cores_set.unwrap_or_default(),
        memory_limit: engine_raw
            .container
            .memory_limit_mb
            .map(|mb| (mb * 1e6) as i64)
            .unwrap_or(defaults.memory_limit),
    };

    let engine_defaults = EngineRunnerConfig::default();
    let engine = EngineRunnerConfig {
        daemon_url: engine_raw.daemon_url,
        custom_config_path: engine_raw.custom_config_path,
        quotas_path: engine_raw.quotas_path,
        gc,
        max_warm_containers: engine_raw
            .prewarm
            .and_then(|p| p.max_warm_containers)
            .unwrap_or(DEFAULT_MAX_WARM_CONTAINERS),
        container,
        ..engine_defaults
    };

    Ok(RunnerSettings {
        name: raw.name,
        weight: raw.weight.unwrap_or(DEFAULT_WEIGHT),
        max_concurrency: raw.max_concurrency,
        engine,
    })
}

fn parse_optional_duration(value: Option<&str>, field: &str) -> anyhow::Result<Option<Duration>> {
    match value {
        None => Ok(None),
        Some(s) => parse_duration(s)
            .map(Some)
            .with_context(|| format!("{field}: invalid duration '{s}'")),
    }
}

/// Parse `150ms`, `30s`, `5m`, `1h`.
fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();

    let (number, unit) = match s.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(idx) => s.split_at(idx),
        None => bail!("missing unit"),
    };

    let value: f64 = number.parse().context("not a number")?;

    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => bail!("unknown unit '{other}'"),
    };

    Ok(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
docker_image:
  repositories: ["clickhouse/clickhouse-server", "yandex/clickhouse-server"]
  os: linux
  architecture: amd64

runners:
  - type: DOCKER_ENGINE
    name: local
    docker_engine: {}
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let settings = Settings::from_yaml(MINIMAL).unwrap();

        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.tag_cache_expiration, DEFAULT_EXPIRATION);
        assert_eq!(settings.api_address, "0.0.0.0:9000");
        assert_eq!(settings.server_timeout, Duration::from_secs(60));
        assert_eq!(settings.max_query_length, 2500);
        assert_eq!(settings.max_output_length, 25000);
        assert!(settings.coordinator.health_checks_enabled);

        let runner = &settings.runners[0];
        assert_eq!(runner.weight, DEFAULT_WEIGHT);
        assert!(runner.max_concurrency.is_none());
        assert!(runner.engine.gc.is_none());
        assert_eq!(runner.engine.max_warm_containers, 5);
    }

    #[test]
    fn full_config_round_trip() {
        let yaml = r#"
log_level: info

docker_image:
  repositories: ["a/ch", "b/ch"]
  os: linux
  architecture: amd64
  image_tags_cache_expiration_time: 3m

registry:
  url: https://registry.test/v2
  identifier: playground
  secret: hunter2
  page_size: 50

api:
  address: ":8080"
  server_timeout: 30s

limits:
  max_query_length: 1000
  max_output_length: 5000

storage:
  path: /var/lib/playground/runs.redb

coordinator:
  health_check_retry_delay: 15s

runners:
  - type: DOCKER_ENGINE
    name: docker-1
    weight: 300
    max_concurrency: 8
    docker_engine:
      daemon_url: tcp://10.0.0.2:2375
      custom_config_path: /opt/config/fast-startup.xml
      quotas_path: /opt/config/quotas.yaml
      gc:
        trigger_frequency: 2m
        container_ttl: 90s
        image_count_threshold: 40
        image_buffer_size: 20
      prewarm:
        max_warm_containers: 10
      container:
        network_mode: bridge
        cpu_limit: 1.5
        cpu_cores_set: "0-3"
        memory_limit_mb: 512
"#;

        let settings = Settings::from_yaml(yaml).unwrap();

        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.repositories, vec!["a/ch", "b/ch"]);
        assert_eq!(settings.tag_cache_expiration, Duration::from_secs(180));
        assert_eq!(settings.registry_url, "https://registry.test/v2");
        assert_eq!(
            settings.registry_auth.as_ref().map(|a| a.identifier.as_str()),
            Some("playground")
        );
        assert_eq!(settings.registry_page_size, 50);
        assert_eq!(settings.api_address, "0.0.0.0:8080");
        assert_eq!(settings.server_timeout, Duration::from_secs(30));
        assert_eq!(
            settings.coordinator.health_check_retry_delay,
            Duration::from_secs(15)
        );

        let runner = &settings.runners[0];
        assert_eq!(runner.name, "docker-1");
        assert_eq!(runner.weight, 300);
        assert_eq!(runner.max_concurrency, Some(8));
        assert_eq!(
            runner.engine.daemon_url.as_deref(),
            Some("tcp://10.0.0.2:2375")
        );

        let gc = runner.engine.gc.as_ref().unwrap();
        assert_eq!(gc.trigger_frequency, Duration::from_secs(120));
        assert_eq!(gc.container_ttl, Some(Duration::from_secs(90)));
        assert_eq!(gc.image_count_threshold, Some(40));
        assert_eq!(gc.image_buffer_size, 20);

        assert_eq!(runner.engine.max_warm_containers, 10);
        assert_eq!(runner.engine.container.cpu_limit, 1_500_000_000);
        assert_eq!(runner.engine.container.cpuset_cpus, "0-3");
        assert_eq!(runner.engine.container.memory_limit, 512_000_000);
        assert_eq!(
            runner.engine.container.network_mode.as_deref(),
            Some("bridge")
        );
    }

    #[test]
    fn zero_weight_is_preserved() {
        let yaml = MINIMAL.replace("name: local", "name: local\n    weight: 0");
        let settings = Settings::from_yaml(&yaml).unwrap();
        // An explicit zero keeps the runner parked; only a missing weight
        // falls back to the default.
        assert_eq!(settings.runners[0].weight, 0);
    }

    #[test]
    fn missing_repositories_is_rejected() {
        let yaml = r#"
docker_image:
  repositories: []
  os: linux
  architecture: amd64
runners:
  - type: DOCKER_ENGINE
    name: local
    docker_engine: {}
"#;
        assert!(Settings::from_yaml(yaml).is_err());
    }

    #[test]
    fn duplicate_runner_names_are_rejected() {
        let yaml = r#"
docker_image:
  repositories: ["a/ch"]
  os: linux
  architecture: amd64
runners:
  - type: DOCKER_ENGINE
    name: local
    docker_engine: {}
  - type: DOCKER_ENGINE
    name: local
    docker_engine: {}
"#;
        let err = Settings::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("unique"));
    }

    #[test]
    fn unknown_runner_type_is_rejected() {
        let yaml = MINIMAL.replace("DOCKER_ENGINE", "EC2");
        let err = Settings::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("unknown runner"));
    }

    #[test]
    fn zero_max_concurrency_is_rejected() {
        let yaml = MINIMAL.replace("name: local", "name: local\n    max_concurrency: 0");
        assert!(Settings::from_yaml(&yaml).is_err());
    }

    #[test]
    fn ssh_daemon_url_is_rejected() {
        let yaml = MINIMAL.replace(
            "docker_engine: {}",
            "docker_engine:\n      daemon_url: ssh://host",
        );
        let err = Settings::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("daemon_url"));
    }

    #[test]
    fn durations_parse_human_units() {
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10d").is_err());
    }
}
