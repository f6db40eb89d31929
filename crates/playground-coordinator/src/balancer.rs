//! Weighted random load balancing with per-runner in-flight accounting.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use playground_core::runner::QueryRunner;

/// One configured runner plus its balancing state.
pub struct RunnerHandle {
    pub underlying: Arc<dyn QueryRunner>,

    /// Selection weight; a zero-weight runner is configured but never
    /// selected nor started.
    pub weight: u32,

    /// Upper bound of concurrently dispatched jobs, if any.
    pub max_concurrency: Option<u32>,

    alive: AtomicBool,
    in_flight: AtomicU32,
}

impl RunnerHandle {
    pub fn new(
        underlying: Arc<dyn QueryRunner>,
        weight: u32,
        max_concurrency: Option<u32>,
    ) -> Arc<Self> {
        Arc::new(Self {
            underlying,
            weight,
            max_concurrency,
            alive: AtomicBool::new(false),
            in_flight: AtomicU32::new(0),
        })
    }

    pub fn name(&self) -> &str {
        self.underlying.name()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// Currently dispatched jobs (diagnostics and tests).
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

struct BalancerInner {
    runners: HashMap<String, Arc<RunnerHandle>>,
    rng: StdRng,
}

/// Selects runners at random, proportionally to their weights, and keeps
/// saturated runners out of the selection set.
pub struct Balancer {
    inner: Mutex<BalancerInner>,
}

impl Default for Balancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BalancerInner {
                runners: HashMap::new(),
                // Load balancing does not need a crypto-grade source.
                rng: StdRng::from_entropy(),
            }),
        }
    }

    /// Include a runner in load balancing. Returns whether it was newly
    /// added.
    pub fn add(&self, runner: &Arc<RunnerHandle>) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.runners.contains_key(runner.name()) {
            return false;
        }

        inner
            .runners
            .insert(runner.name().to_string(), runner.clone());

        info!(name = runner.name(), "runner has been included in load balancing");

        true
    }

    /// Exclude a runner from load balancing.
    pub fn remove(&self, runner: &Arc<RunnerHandle>) {
        let mut inner = self.inner.lock().unwrap();
        Self::remove_locked(&mut inner, runner.name());
    }

    fn remove_locked(inner: &mut BalancerInner, name: &str) {
        if inner.runners.remove(name).is_some() {
            info!(name, "runner has been excluded from load balancing");
        }
    }

    /// Number of runners currently in the selection set.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Select a runner and execute the job on it.
    ///
    /// Returns `None` when no runner is available (all dead or
    /// saturated). Selection and the saturation check happen atomically
    /// under the balancer lock; the job itself runs outside it. The
    /// in-flight counter is decremented exactly once, and a runner
    /// removed on saturation is re-added exactly once after the job.
    pub async fn process_job<T, F, Fut>(&self, job: F) -> Option<T>
    where
        F: FnOnce(Arc<RunnerHandle>) -> Fut,
        Fut: Future<Output = T>,
    {
        let (runner, excluded) = {
            let mut inner = self.inner.lock().unwrap();

            let runner = Self::select_runner(&mut inner)?;

            let in_flight = runner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let excluded = match runner.max_concurrency {
                Some(max) if in_flight >= max => {
                    Self::remove_locked(&mut inner, runner.name());
                    true
                }
                _ => false,
            };

            (runner, excluded)
        };

        let result = job(runner.clone()).await;

        runner.in_flight.fetch_sub(1, Ordering::SeqCst);
        if excluded {
            self.add(&runner);
        }

        Some(result)
    }

    /// Weighted random choice over the current membership.
    ///
    /// A runner with 10 times the weight of another is selected roughly
    /// 10 times as often.
    fn select_runner(inner: &mut BalancerInner) -> Option<Arc<RunnerHandle>> {
        let total_weight: u64 = inner.runners.values().map(|r| r.weight as u64).sum();
        if total_weight == 0 {
            return None;
        }

        let mut sample = inner.rng.gen_range(0..total_weight);
        for runner in inner.runners.values() {
            if sample < runner.weight as u64 {
                return Some(runner.clone());
            }
            sample -= runner.weight as u64;
        }

        None
    }

    #[cfg(test)]
    fn select_once(&self) -> Option<Arc<RunnerHandle>> {
        let mut inner = self.inner.lock().unwrap();
        Self::select_runner(&mut inner)
    }
}
