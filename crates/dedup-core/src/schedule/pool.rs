use crossbeam_channel::{bounded, unbounded};
use std::thread;
use tracing::trace;

/// Fixed-size set of worker threads fed through a bounded queue.
///
/// A pool lives for one `run` call; `run` returns only after every task has
/// produced its result, which makes it the join barrier for a batch.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    name: &'static str,
    workers: usize,
}

impl WorkerPool {
    pub fn new(name: &'static str, workers: usize) -> Self {
        Self {
            name,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `job` over `tasks`, handing tasks out in the given order.
    /// Results come back in completion order.
    pub fn run<T, R, F>(&self, tasks: Vec<T>, job: &F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync,
    {
        if tasks.is_empty() {
            return Vec::new();
        }
        let total = tasks.len();
        let workers = self.workers.min(total);
        let (task_tx, task_rx) = bounded::<T>(workers * 2);
        let (result_tx, result_rx) = unbounded::<R>();

        thread::scope(|scope| {
            for i in 0..workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                let name = self.name;
                scope.spawn(move || {
                    let mut done = 0usize;
                    for task in task_rx.iter() {
                        if result_tx.send(job(task)).is_err() {
                            break;
                        }
                        done += 1;
                    }
                    trace!("{} worker {} finished {} task(s)", name, i, done);
                });
            }
            drop(task_rx);
            drop(result_tx);

            for task in tasks {
                if task_tx.send(task).is_err() {
                    break;
                }
            }
            drop(task_tx);
        });

        let results: Vec<R> = result_rx.try_iter().collect();
        debug_assert_eq!(results.len(), total);
        results
    }
}
