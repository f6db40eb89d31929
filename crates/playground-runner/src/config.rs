//! Runner configuration.

use std::time::Duration;

/// Configuration of one container-engine runner.
#[derive(Debug, Clone)]
pub struct EngineRunnerConfig {
    /// Daemon address; `None` means the platform's local default.
    pub daemon_url: Option<String>,

    /// Delay between readiness-retry exec attempts.
    pub exec_retry_delay: Duration,
    pub max_exec_retries: u32,

    pub default_output_format: String,

    /// Optional server config mounted into the container's `config.d`
    /// directory (used to trim startup features).
    pub custom_config_path: Option<String>,

    /// Optional quotas config mounted into the container's `users.d`
    /// directory.
    pub quotas_path: Option<String>,

    /// `None` disables garbage collection entirely.
    pub gc: Option<GcConfig>,

    pub status_collection_frequency: Duration,

    /// Upper bound of the prewarm pool.
    pub max_warm_containers: usize,

    pub container: ContainerLimits,
}

/// Resource limits applied to every created container.
#[derive(Debug, Clone)]
pub struct ContainerLimits {
    /// Network mode for the container; `None` keeps the daemon default.
    pub network_mode: Option<String>,

    /// In nano CPUs (1 core = 1e9). 0 means unlimited.
    pub cpu_limit: i64,

    /// Comma-separated list or hyphen range of usable cores. Empty means
    /// any core.
    pub cpuset_cpus: String,

    /// In bytes. 0 means unlimited.
    pub memory_limit: i64,
}

/// Garbage collector configuration.
#[derive(Debug, Clone)]
pub struct GcConfig {
    pub trigger_frequency: Duration,

    /// Containers older than this are force removed. `None` disables the
    /// force removal.
    pub container_ttl: Option<Duration>,

    /// Image GC triggers once at least this many owned images exist.
    /// `None` disables image GC.
    pub image_count_threshold: Option<usize>,

    /// How many of the most recently tagged images survive an image GC.
    pub image_buffer_size: usize,
}

impl Default for EngineRunnerConfig {
    fn default() -> Self {
        Self {
            daemon_url: None,
            exec_retry_delay: Duration::from_millis(200),
            max_exec_retries: 20,
            default_output_format: "TabSeparated".to_string(),
            custom_config_path: None,
            quotas_path: None,
            gc: Some(GcConfig::default()),
            status_collection_frequency: Duration::from_secs(30),
            max_warm_containers: 5,
            container: ContainerLimits::default(),
        }
    }
}

impl Default for ContainerLimits {
    fn default() -> Self {
        Self {
            network_mode: None,
            cpu_limit: 2_000_000_000,
            cpuset_cpus: String::new(),
            memory_limit: 1_000_000_000,
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            trigger_frequency: Duration::from_secs(5 * 60),
            container_ttl: Some(Duration::from_secs(60)),
            image_count_threshold: Some(60),
            image_buffer_size: 30,
        }
    }
}
