//! The runner abstraction the coordinator dispatches through.

use async_trait::async_trait;
use thiserror::Error;

use crate::image::ImageDescriptor;
use crate::run::Run;

/// The kind of backend a runner is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerType {
    Coordinator,
    DockerEngine,
    Stub,
}

impl RunnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerType::Coordinator => "COORDINATOR",
            RunnerType::DockerEngine => "DOCKER_ENGINE",
            RunnerType::Stub => "STUB",
        }
    }
}

/// Result of a liveness probe.
#[derive(Debug, Clone, Default)]
pub struct RunnerStatus {
    /// Whether the runner's backing daemon responded.
    pub alive: bool,
    pub probe_error: Option<String>,
}

impl RunnerStatus {
    pub fn alive() -> Self {
        Self {
            alive: true,
            probe_error: None,
        }
    }

    pub fn dead(err: impl ToString) -> Self {
        Self {
            alive: false,
            probe_error: Some(err.to_string()),
        }
    }
}

/// Failures surfaced by runners and the coordinator.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("unknown version: {0}")]
    UnknownVersion(String),

    #[error("no available runners")]
    NoAvailableRunners,

    #[error("total runners weight must be > 0")]
    NoRunners,

    #[error("image pull failed: {0}")]
    Pull(String),

    #[error("image tagging failed: {0}")]
    ImageTag(String),

    #[error("container failed: {0}")]
    Container(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("{0}")]
    Internal(String),
}

/// A backend capable of executing runs against a database version.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    fn runner_type(&self) -> RunnerType;

    fn name(&self) -> &str;

    /// Probe the runner's backing daemon.
    async fn status(&self) -> RunnerStatus;

    /// Execute the run and return the combined output.
    async fn run_query(&self, run: &Run) -> Result<String, RunnerError>;

    /// Start background workers (GC, status export, prewarming).
    /// Non-blocking.
    async fn start(&self) -> Result<(), RunnerError>;

    /// Stop background workers and release held resources.
    async fn stop(&self) -> Result<(), RunnerError>;
}

/// Read access to the known image tags.
pub trait ImageTagStorage: Send + Sync {
    /// Look up an image by its version tag.
    fn get(&self, version: &str) -> Option<ImageDescriptor>;

    /// Whether the version tag is known.
    fn exists(&self, version: &str) -> bool;

    /// Snapshot of all known images, newest tag first.
    fn all(&self) -> Vec<ImageDescriptor>;
}
