//! The coordinator: starts the runner fleet, probes liveness, and
//! dispatches queries through the balancer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use playground_core::run::Run;
use playground_core::runner::{QueryRunner, RunnerError, RunnerStatus, RunnerType};

use crate::balancer::{Balancer, RunnerHandle};

/// How long a single liveness probe may take.
pub const DEFAULT_LIVENESS_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default delay between two liveness probes of the same runner.
pub const DEFAULT_HEALTH_CHECK_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Weight assigned to runners that do not configure one.
pub const DEFAULT_WEIGHT: u32 = 100;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub health_checks_enabled: bool,
    pub health_check_retry_delay: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            health_checks_enabled: true,
            health_check_retry_delay: DEFAULT_HEALTH_CHECK_RETRY_DELAY,
        }
    }
}

/// Dispatches incoming queries to one of the underlying runners.
///
/// A runner enters the balancer's set when a liveness probe passes and
/// leaves it when one fails; with liveness checks disabled every started
/// runner is added up front.
pub struct Coordinator {
    token: CancellationToken,
    config: CoordinatorConfig,

    runners: Vec<Arc<RunnerHandle>>,
    balancer: Arc<Balancer>,

    started: AtomicBool,
    liveness_loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        parent: &CancellationToken,
        runners: Vec<Arc<RunnerHandle>>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            token: parent.child_token(),
            config,
            runners,
            balancer: Arc::new(Balancer::new()),
            started: AtomicBool::new(false),
            liveness_loops: Mutex::new(Vec::new()),
        }
    }

    /// Runners currently eligible for selection (diagnostics and tests).
    pub fn available_runners(&self) -> usize {
        self.balancer.len()
    }
}

#[async_trait]
impl QueryRunner for Coordinator {
    fn runner_type(&self) -> RunnerType {
        RunnerType::Coordinator
    }

    fn name(&self) -> &str {
        "coordinator"
    }

    async fn status(&self) -> RunnerStatus {
        if self.runners.iter().any(|r| r.is_alive()) {
            RunnerStatus::alive()
        } else {
            RunnerStatus::dead("no alive runners")
        }
    }

    /// Start the non-zero-weight runners and their liveness probe loops.
    /// Single-shot.
    async fn start(&self) -> Result<(), RunnerError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RunnerError::Internal(
                "coordinator has already been started".to_string(),
            ));
        }

        info!(count = self.runners.len(), "starting runners");

        let total_weight: u64 = self.runners.iter().map(|r| r.weight as u64).sum();
        if total_weight == 0 {
            return Err(RunnerError::NoRunners);
        }

        let mut started = 0usize;
        for runner in &self.runners {
            if runner.weight == 0 {
                continue;
            }

            runner.underlying.start().await.map_err(|e| {
                RunnerError::Internal(format!("{} cannot be started: {e}", runner.name()))
            })?;
            started += 1;

            if self.config.health_checks_enabled {
                let loop_handle = tokio::spawn(run_liveness_loop(
                    self.token.clone(),
                    self.balancer.clone(),
                    runner.clone(),
                    self.config.health_check_retry_delay,
                ));
                self.liveness_loops.lock().unwrap().push(loop_handle);
            } else {
                runner.set_alive(true);
                self.balancer.add(runner);
            }
        }

        info!(count = started, "underlying runners have been started");

        Ok(())
    }

    /// Stop the runners and wait for the probe loops to finish.
    async fn stop(&self) -> Result<(), RunnerError> {
        self.token.cancel();

        info!("stopping coordinator");

        for runner in &self.runners {
            if runner.weight == 0 {
                continue;
            }

            if let Err(err) = runner.underlying.stop().await {
                error!(underlying = runner.name(), error = %err, "runner cannot be stopped");
            }
        }

        info!("runners have been stopped");

        let loops: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.liveness_loops.lock().unwrap());
        for handle in loops {
            let _ = handle.await;
        }

        info!("coordinator has been stopped");

        Ok(())
    }

    /// Proxy the query to one of the underlying runners.
    async fn run_query(&self, run: &Run) -> Result<String, RunnerError> {
        let processed = self
            .balancer
            .process_job(|runner| async move { runner.underlying.run_query(run).await })
            .await;

        match processed {
            Some(result) => result,
            None => Err(RunnerError::NoAvailableRunners),
        }
    }
}

/// Periodically probe one runner; the set membership follows the probe
/// results. The loop only ends on shutdown.
async fn run_liveness_loop(
    token: CancellationToken,
    balancer: Arc<Balancer>,
    runner: Arc<RunnerHandle>,
    retry_delay: Duration,
) {
    debug!(
        underlying_runner = runner.name(),
        retry_delay_ms = retry_delay.as_millis() as u64,
        "liveness loop has been started"
    );

    loop {
        check_liveness(&token, &balancer, &runner).await;

        tokio::select! {
            _ = token.cancelled() => {
                debug!(underlying_runner = runner.name(), "liveness loop has been stopped");
                return;
            }
            _ = tokio::time::sleep(retry_delay) => {}
        }
    }
}

async fn check_liveness(
    token: &CancellationToken,
    balancer: &Arc<Balancer>,
    runner: &Arc<RunnerHandle>,
) {
    let status =
        match tokio::time::timeout(DEFAULT_LIVENESS_CHECK_TIMEOUT, runner.underlying.status())
            .await
        {
            Ok(status) => status,
            Err(_) => RunnerStatus::dead("liveness probe timed out"),
        };

    if token.is_cancelled() {
        return;
    }

    if status.alive {
        runner.set_alive(true);
        balancer.add(runner);
        return;
    }

    runner.set_alive(false);
    balancer.remove(runner);

    debug!(
        underlying_runner = runner.name(),
        error = status.probe_error.as_deref().unwrap_or(""),
        "runner is not responding"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::stub::StubRunner;

    fn coordinator_with(
        stubs: Vec<(Arc<StubRunner>, u32, Option<u32>)>,
        config: CoordinatorConfig,
    ) -> Coordinator {
        let handles = stubs
            .into_iter()
            .map(|(stub, weight, max)| RunnerHandle::new(stub, weight, max))
            .collect();

        Coordinator::new(&CancellationToken::new(), handles, config)
    }

    fn no_health_checks() -> CoordinatorConfig {
        CoordinatorConfig {
            health_checks_enabled: false,
            ..Default::default()
        }
    }

    fn test_run() -> Run {
        Run::new("SELECT 1", "clickhouse", "21.8", None)
    }

    #[tokio::test]
    async fn start_requires_positive_total_weight() {
        let stub = Arc::new(StubRunner::new("r1"));
        let coordinator = coordinator_with(vec![(stub, 0, None)], no_health_checks());

        let err = coordinator.start().await.unwrap_err();
        assert!(matches!(err, RunnerError::NoRunners));
    }

    #[tokio::test]
    async fn start_is_single_shot() {
        let stub = Arc::new(StubRunner::new("r1").with_output(""));
        let coordinator = coordinator_with(vec![(stub, 100, None)], no_health_checks());

        coordinator.start().await.unwrap();
        assert!(coordinator.start().await.is_err());
    }

    #[tokio::test]
    async fn zero_weight_runners_are_never_dispatched() {
        let active = Arc::new(StubRunner::new("active").with_output("ok"));
        let parked = Arc::new(StubRunner::new("parked").with_output("never"));

        let coordinator = coordinator_with(
            vec![(active.clone(), 100, None), (parked.clone(), 0, None)],
            no_health_checks(),
        );
        coordinator.start().await.unwrap();

        for _ in 0..50 {
            coordinator.run_query(&test_run()).await.unwrap();
        }

        assert_eq!(active.calls(), 50);
        assert_eq!(parked.calls(), 0);
    }

    #[tokio::test]
    async fn dispatch_follows_weights() {
        let light = Arc::new(StubRunner::new("light").with_output("ok"));
        let heavy = Arc::new(StubRunner::new("heavy").with_output("ok"));

        let coordinator = coordinator_with(
            vec![(light.clone(), 100, None), (heavy.clone(), 300, None)],
            no_health_checks(),
        );
        coordinator.start().await.unwrap();

        const SAMPLES: u64 = 2_000;
        for _ in 0..SAMPLES {
            coordinator.run_query(&test_run()).await.unwrap();
        }

        assert_eq!(light.calls() + heavy.calls(), SAMPLES);

        // 1:3 split within 15%.
        let expected_light = SAMPLES as f64 * 0.25;
        let deviation = (light.calls() as f64 / expected_light - 1.0).abs();
        assert!(deviation <= 0.15, "light got {} calls", light.calls());
    }

    #[tokio::test]
    async fn no_runners_maps_to_no_available_runners() {
        let stub = Arc::new(StubRunner::new("r1").with_output("ok"));
        let coordinator = coordinator_with(
            vec![(stub, 100, None)],
            CoordinatorConfig {
                health_checks_enabled: true,
                health_check_retry_delay: Duration::from_secs(3600),
            },
        );
        // Not started: the balancer set is empty.

        let err = coordinator.run_query(&test_run()).await.unwrap_err();
        assert!(matches!(err, RunnerError::NoAvailableRunners));
    }

    #[tokio::test]
    async fn liveness_probes_manage_set_membership() {
        let stub = Arc::new(StubRunner::new("r1").with_output("ok"));
        let coordinator = coordinator_with(
            vec![(stub.clone(), 100, None)],
            CoordinatorConfig {
                health_checks_enabled: true,
                health_check_retry_delay: Duration::from_millis(20),
            },
        );

        coordinator.start().await.unwrap();

        // The initial probe admits the runner.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.available_runners(), 1);
        assert!(coordinator.run_query(&test_run()).await.is_ok());

        // A failing probe evicts it.
        stub.set_alive(false);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(coordinator.available_runners(), 0);
        let err = coordinator.run_query(&test_run()).await.unwrap_err();
        assert!(matches!(err, RunnerError::NoAvailableRunners));

        // Recovery puts it back.
        stub.set_alive(true);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(coordinator.available_runners(), 1);
        assert!(coordinator.run_query(&test_run()).await.is_ok());

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_joins_liveness_loops() {
        let stub = Arc::new(StubRunner::new("r1").with_output("ok"));
        let coordinator = coordinator_with(
            vec![(stub, 100, None)],
            CoordinatorConfig {
                health_checks_enabled: true,
                health_check_retry_delay: Duration::from_millis(10),
            },
        );

        coordinator.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        coordinator.stop().await.unwrap();

        assert!(coordinator.liveness_loops.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_load_respects_the_ceiling() {
        let stub = Arc::new(
            StubRunner::new("r1")
                .with_output("ok")
                .with_delay(Duration::from_millis(200)),
        );
        let coordinator = Arc::new(coordinator_with(
            vec![(stub.clone(), 100, Some(2))],
            no_health_checks(),
        ));
        coordinator.start().await.unwrap();

        let first = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.run_query(&test_run()).await })
        };
        let second = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.run_query(&test_run()).await })
        };

        // Give both long-running jobs time to occupy the runner.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let third = coordinator.run_query(&test_run()).await;
        assert!(matches!(third.unwrap_err(), RunnerError::NoAvailableRunners));

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());

        // With the slots free again the next query goes through.
        assert!(coordinator.run_query(&test_run()).await.is_ok());
    }
}
