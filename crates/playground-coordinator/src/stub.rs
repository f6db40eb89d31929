//! A stub runner for tests: configurable output, latency, and liveness.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use playground_core::run::Run;
use playground_core::runner::{QueryRunner, RunnerError, RunnerStatus, RunnerType};

/// A runner that executes nothing.
pub struct StubRunner {
    name: String,
    delay: Duration,
    output: Option<String>,
    alive: AtomicBool,
    calls: AtomicU64,
}

impl StubRunner {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::ZERO,
            output: None,
            alive: AtomicBool::new(true),
            calls: AtomicU64::new(0),
        }
    }

    /// Answer queries with the given output instead of failing.
    pub fn with_output(mut self, output: &str) -> Self {
        self.output = Some(output.to_string());
        self
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// How many queries reached this stub.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryRunner for StubRunner {
    fn runner_type(&self) -> RunnerType {
        RunnerType::Stub
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn status(&self) -> RunnerStatus {
        if self.alive.load(Ordering::SeqCst) {
            RunnerStatus::alive()
        } else {
            RunnerStatus::dead("stub is down")
        }
    }

    async fn run_query(&self, _run: &Run) -> Result<String, RunnerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.output {
            Some(output) => Ok(output.clone()),
            None => Err(RunnerError::Internal("stub cannot run queries".to_string())),
        }
    }

    async fn start(&self) -> Result<(), RunnerError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), RunnerError> {
        Ok(())
    }
}
