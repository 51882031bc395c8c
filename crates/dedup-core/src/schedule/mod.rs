//! Routes hash jobs to a large-file pool and a small-file pool and keeps the
//! boundary between them in step with observed latency.

mod pool;
mod workload;

pub use pool::WorkerPool;
pub use workload::{AdaptiveThreshold, SizeClass, WorkloadStat};

use crate::config::EngineConfig;
use crate::hasher::HashSample;
use parking_lot::Mutex;
use serde::Serialize;
use std::thread;
use tracing::debug;

const LARGE_POOL_MIN: usize = 2;
const LARGE_POOL_MAX: usize = 4;
const SMALL_POOL_MAX: usize = 8;

/// Per-run caps on worker counts, e.g. from `--large-cores` / `--small-cores`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoreCaps {
    pub large: usize,
    pub small: usize,
}

impl CoreCaps {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            large: config.large_cores,
            small: config.small_cores,
        }
    }
}

impl Default for CoreCaps {
    fn default() -> Self {
        Self {
            large: LARGE_POOL_MAX,
            small: SMALL_POOL_MAX,
        }
    }
}

/// Worker counts for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolPlan {
    pub large: usize,
    pub small: usize,
}

impl PoolPlan {
    /// Size both pools for `cores` available cores.
    ///
    /// The large pool runs 2 to 4 workers and takes its maximum under latency
    /// pressure; the small pool takes up to 8. Each pool keeps at least one
    /// worker, and otherwise the total never exceeds `cores`.
    pub fn compute(cores: usize, caps: CoreCaps, under_pressure: bool) -> Self {
        let cores = cores.max(1);
        let large_max = caps.large.clamp(1, LARGE_POOL_MAX);
        let large_min = LARGE_POOL_MIN.min(large_max);
        let mut large = if under_pressure { large_max } else { large_min };
        let mut small = caps.small.clamp(1, SMALL_POOL_MAX);

        if large + small > cores {
            small = cores.saturating_sub(large).max(1);
        }
        if large + small > cores {
            large = cores.saturating_sub(small).max(1);
        }
        Self { large, small }
    }

    pub fn total(&self) -> usize {
        self.large + self.small
    }
}

/// Anything the scheduler can route by size.
pub trait SizedTask: Send {
    fn size(&self) -> u64;
}

/// Owns the adaptive threshold and runs batches of hash jobs on two pools.
///
/// One scheduler is created per workspace load and shared by every scan, so
/// what it learns about throughput carries over between scans.
#[derive(Debug)]
pub struct HashScheduler {
    threshold: Mutex<AdaptiveThreshold>,
    cores: usize,
}

impl HashScheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_threshold(AdaptiveThreshold::from_config(config), num_cpus::get())
    }

    pub fn with_threshold(threshold: AdaptiveThreshold, cores: usize) -> Self {
        Self {
            threshold: Mutex::new(threshold),
            cores: cores.max(1),
        }
    }

    pub fn classify(&self, size: u64) -> SizeClass {
        self.threshold.lock().classify(size)
    }

    pub fn threshold(&self) -> u64 {
        self.threshold.lock().threshold()
    }

    pub fn stat(&self, class: SizeClass) -> WorkloadStat {
        self.threshold.lock().stat(class)
    }

    pub fn record_sample(&self, class: SizeClass, sample: HashSample) {
        self.threshold.lock().record_sample(class, sample);
    }

    pub fn plan(&self, caps: CoreCaps) -> PoolPlan {
        let pressure = self.threshold.lock().under_pressure();
        PoolPlan::compute(self.cores, caps, pressure)
    }

    /// Hash every task and wait for all of them.
    ///
    /// Tasks are split by size class and each class is processed largest
    /// first on its own pool; both pools run at the same time. `job` returns
    /// its result plus a timing sample for every completed hash. Results
    /// are returned in completion order.
    pub fn dispatch<T, R, F>(&self, tasks: Vec<T>, caps: CoreCaps, job: F) -> Vec<R>
    where
        T: SizedTask,
        R: Send,
        F: Fn(&T) -> (R, Option<HashSample>) + Sync,
    {
        if tasks.is_empty() {
            return Vec::new();
        }

        let plan = self.plan(caps);
        let (mut large, mut small): (Vec<T>, Vec<T>) = {
            let guard = self.threshold.lock();
            tasks
                .into_iter()
                .partition(|task| guard.classify(task.size()) == SizeClass::Large)
        };
        large.sort_by_key(|task| std::cmp::Reverse(task.size()));
        small.sort_by_key(|task| std::cmp::Reverse(task.size()));
        debug!(
            "Dispatching {} large / {} small job(s) on {}+{} worker(s), threshold {} bytes",
            large.len(),
            small.len(),
            plan.large,
            plan.small,
            self.threshold()
        );

        let job = &job;
        let run_class = |class: SizeClass| {
            move |task: T| {
                let (result, sample) = job(&task);
                if let Some(sample) = sample {
                    self.record_sample(class, sample);
                }
                result
            }
        };
        let large_job = run_class(SizeClass::Large);
        let small_job = run_class(SizeClass::Small);
        let large_pool = WorkerPool::new("large", plan.large);
        let small_pool = WorkerPool::new("small", plan.small);

        let (mut results, small_results) = thread::scope(|scope| {
            let large_handle = scope.spawn(|| large_pool.run(large, &large_job));
            let small_results = small_pool.run(small, &small_job);
            let large_results = match large_handle.join() {
                Ok(results) => results,
                Err(panic) => std::panic::resume_unwind(panic),
            };
            (large_results, small_results)
        });
        results.extend(small_results);
        results
    }
}
