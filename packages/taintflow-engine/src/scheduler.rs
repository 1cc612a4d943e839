/*
 * Worker scheduler
 *
 * Fans analysis work out over a dedicated rayon thread pool and folds
 * the results back deterministically. The same entry points run inline
 * when the scheduler is sequential (single worker, `parallel` disabled
 * at build or run time), with an identical contract: same outputs, same
 * errors, same reduce order.
 *
 * A panicking job never unwinds across the pool. Each bucket runs under
 * `catch_unwind`; the first crash is logged and surfaces as a fatal
 * scheduler error. Work is not retried.
 */

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use tracing::{debug, error};

use crate::config::AnalysisConfig;
use crate::errors::{EngineError, Result};

/// Stack size per worker thread. Deep model trees recurse during join
/// and widen, so keep this generous.
const WORKER_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Cap on buckets per worker; past this, larger buckets amortize better
/// than more of them.
const MAX_BUCKETS_PER_WORKER: usize = 10;

/// Inputs per additional bucket per worker.
const INPUTS_PER_BUCKET: usize = 400;

/// How often a pending single job is polled for completion.
const SINGLE_JOB_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Work scheduler backing the fixpoint driver.
///
/// Holds its own thread pool rather than the global one so tests and
/// embedders can run several engines with different worker counts in
/// one process.
pub struct Scheduler {
    pool: Option<rayon::ThreadPool>,
    workers: usize,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.workers)
            .field("parallel", &self.is_parallel())
            .finish()
    }
}

#[cfg(feature = "parallel")]
fn build_pool(workers: usize) -> Result<Option<rayon::ThreadPool>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .stack_size(WORKER_STACK_SIZE)
        .thread_name(|i| format!("taintflow-worker-{}", i))
        .build()
        .map_err(|e| EngineError::scheduler(format!("failed to build worker pool: {}", e)))?;
    Ok(Some(pool))
}

#[cfg(not(feature = "parallel"))]
fn build_pool(_workers: usize) -> Result<Option<rayon::ThreadPool>> {
    Ok(None)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked with a non-string payload".to_string()
    }
}

impl Scheduler {
    /// Build a scheduler for the given configuration. A worker count of
    /// one, `parallel: false`, or a build without the `parallel` feature
    /// all degrade to the inline sequential backend.
    pub fn create(config: &AnalysisConfig) -> Result<Self> {
        let workers = config.effective_workers();
        let pool = if config.parallel && workers > 1 {
            build_pool(workers)?
        } else {
            None
        };
        match &pool {
            Some(_) => debug!(workers, "scheduler worker pool ready"),
            None => debug!("scheduler running sequentially"),
        }
        Ok(Scheduler { pool, workers })
    }

    /// Inline scheduler with no pool at all.
    pub fn sequential() -> Self {
        Scheduler {
            pool: None,
            workers: 1,
        }
    }

    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Buckets for a workload: more buckets per worker as the input
    /// grows, capped so tiny work items are not drowned in overhead.
    fn bucket_count(&self, input_count: usize) -> usize {
        let per_worker = (1 + input_count / INPUTS_PER_BUCKET).min(MAX_BUCKETS_PER_WORKER);
        (self.workers * per_worker).max(1)
    }

    /// Map every input and fold the outputs, in input order, into
    /// `initial`. The fold runs on the calling thread after all buckets
    /// complete, so the reduction is deterministic under any worker
    /// interleaving. Bucket sizes follow `bucket_count`.
    pub fn map_reduce<I, O, R>(
        &self,
        inputs: &[I],
        map: impl Fn(&I) -> O + Send + Sync,
        reduce: impl FnMut(R, O) -> R,
        initial: R,
    ) -> Result<R>
    where
        I: Sync,
        O: Send,
    {
        let chunk_size = inputs
            .len()
            .div_ceil(self.bucket_count(inputs.len()))
            .max(1);
        self.run_buckets(inputs, chunk_size, map, reduce, initial)
    }

    /// `map_reduce` with a caller-chosen number of inputs per bucket,
    /// for workloads where the caller knows the cost profile better
    /// than the derived default (a handful of very expensive items
    /// wants `bucket_size` of one).
    pub fn map_reduce_with_buckets<I, O, R>(
        &self,
        inputs: &[I],
        bucket_size: usize,
        map: impl Fn(&I) -> O + Send + Sync,
        reduce: impl FnMut(R, O) -> R,
        initial: R,
    ) -> Result<R>
    where
        I: Sync,
        O: Send,
    {
        self.run_buckets(inputs, bucket_size.max(1), map, reduce, initial)
    }

    fn run_buckets<I, O, R>(
        &self,
        inputs: &[I],
        chunk_size: usize,
        map: impl Fn(&I) -> O + Send + Sync,
        mut reduce: impl FnMut(R, O) -> R,
        initial: R,
    ) -> Result<R>
    where
        I: Sync,
        O: Send,
    {
        if inputs.is_empty() {
            return Ok(initial);
        }

        let buckets: Vec<std::thread::Result<Vec<O>>> = match &self.pool {
            Some(pool) => pool.install(|| {
                inputs
                    .par_chunks(chunk_size)
                    .map(|bucket| {
                        catch_unwind(AssertUnwindSafe(|| {
                            bucket.iter().map(&map).collect::<Vec<O>>()
                        }))
                    })
                    .collect()
            }),
            None => inputs
                .chunks(chunk_size)
                .map(|bucket| {
                    catch_unwind(AssertUnwindSafe(|| {
                        bucket.iter().map(&map).collect::<Vec<O>>()
                    }))
                })
                .collect(),
        };

        let mut accumulated = initial;
        for bucket in buckets {
            match bucket {
                Ok(outputs) => {
                    for output in outputs {
                        accumulated = reduce(accumulated, output);
                    }
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(message = %message, "analysis worker crashed");
                    return Err(EngineError::scheduler(format!(
                        "worker crashed: {}",
                        message
                    )));
                }
            }
        }
        Ok(accumulated)
    }

    /// Run a side-effecting job over every input. Outputs are discarded;
    /// crash handling matches `map_reduce`.
    pub fn iter<I>(&self, inputs: &[I], each: impl Fn(&I) + Send + Sync) -> Result<()>
    where
        I: Sync,
    {
        self.map_reduce(inputs, each, |(), ()| (), ())
    }

    /// Run one job on the pool and poll until it completes. Sequential
    /// schedulers run the job inline.
    pub fn single_job<T>(&self, job: impl FnOnce() -> T + Send + 'static) -> Result<T>
    where
        T: Send + 'static,
    {
        let pool = match &self.pool {
            Some(pool) => pool,
            None => {
                return catch_unwind(AssertUnwindSafe(job)).map_err(|payload| {
                    let message = panic_message(payload.as_ref());
                    error!(message = %message, "single job crashed");
                    EngineError::scheduler(format!("worker crashed: {}", message))
                })
            }
        };

        let slot: Arc<(Mutex<Option<std::thread::Result<T>>>, Condvar)> =
            Arc::new((Mutex::new(None), Condvar::new()));
        let completion = Arc::clone(&slot);
        pool.spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(job));
            let (result, ready) = &*completion;
            *result.lock() = Some(outcome);
            ready.notify_one();
        });

        let (result, ready) = &*slot;
        let mut guard = result.lock();
        loop {
            if let Some(outcome) = guard.take() {
                return outcome.map_err(|payload| {
                    let message = panic_message(payload.as_ref());
                    error!(message = %message, "single job crashed");
                    EngineError::scheduler(format!("worker crashed: {}", message))
                });
            }
            let _ = ready.wait_for(&mut guard, SINGLE_JOB_POLL_INTERVAL);
        }
    }

    /// Run a job once on every worker thread (exactly once inline for a
    /// sequential scheduler). Used for per-worker setup such as seeding
    /// thread-local state.
    pub fn once_per_worker(&self, job: impl Fn() + Send + Sync) -> Result<()> {
        let pool = match &self.pool {
            Some(pool) => pool,
            None => {
                return catch_unwind(AssertUnwindSafe(&job)).map_err(|payload| {
                    let message = panic_message(payload.as_ref());
                    error!(message = %message, "per-worker job crashed");
                    EngineError::scheduler(format!("worker crashed: {}", message))
                })
            }
        };

        let outcomes = pool.broadcast(|_| catch_unwind(AssertUnwindSafe(&job)));
        for outcome in outcomes {
            if let Err(payload) = outcome {
                let message = panic_message(payload.as_ref());
                error!(message = %message, "per-worker job crashed");
                return Err(EngineError::scheduler(format!(
                    "worker crashed: {}",
                    message
                )));
            }
        }
        Ok(())
    }

    /// Shut the pool down, joining all worker threads.
    pub fn destroy(self) {
        if let Some(pool) = self.pool {
            let workers = pool.current_num_threads();
            drop(pool);
            debug!(workers, "scheduler worker pool shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn parallel_config(workers: usize) -> AnalysisConfig {
        AnalysisConfig::new().with_workers(workers)
    }

    #[test]
    fn test_bucket_count_formula() {
        let scheduler = Scheduler {
            pool: None,
            workers: 4,
        };
        // Small workloads: one bucket per worker.
        assert_eq!(scheduler.bucket_count(1), 4);
        assert_eq!(scheduler.bucket_count(399), 4);
        // Each additional 400 inputs adds a bucket per worker.
        assert_eq!(scheduler.bucket_count(400), 8);
        assert_eq!(scheduler.bucket_count(1200), 16);
        // Capped at ten buckets per worker.
        assert_eq!(scheduler.bucket_count(100_000), 40);
    }

    #[test]
    fn test_map_reduce_empty_returns_initial() {
        let scheduler = Scheduler::sequential();
        let total = scheduler
            .map_reduce(&[] as &[u64], |x| *x, |acc, x| acc + x, 7u64)
            .unwrap();
        assert_eq!(total, 7);
    }

    #[test]
    fn test_map_reduce_sequential_sums() {
        let scheduler = Scheduler::sequential();
        let inputs: Vec<u64> = (1..=100).collect();
        let total = scheduler
            .map_reduce(&inputs, |x| x * x, |acc, x| acc + x, 0u64)
            .unwrap();
        assert_eq!(total, (1..=100u64).map(|x| x * x).sum::<u64>());
    }

    #[test]
    fn test_map_reduce_preserves_input_order() {
        let scheduler = Scheduler::create(&parallel_config(4)).unwrap();
        let inputs: Vec<u64> = (0..1000).collect();
        let collected = scheduler
            .map_reduce(
                &inputs,
                |x| *x,
                |mut acc: Vec<u64>, x| {
                    acc.push(x);
                    acc
                },
                Vec::new(),
            )
            .unwrap();
        assert_eq!(collected, inputs);
        scheduler.destroy();
    }

    #[test]
    fn test_explicit_bucket_size_matches_derived_buckets() {
        let scheduler = Scheduler::create(&parallel_config(4)).unwrap();
        let inputs: Vec<u64> = (0..1000).collect();
        let derived = scheduler
            .map_reduce(&inputs, |x| x + 1, |acc, x| acc + x, 0u64)
            .unwrap();
        let explicit = scheduler
            .map_reduce_with_buckets(&inputs, 17, |x| x + 1, |acc, x| acc + x, 0u64)
            .unwrap();
        assert_eq!(derived, explicit);
        scheduler.destroy();
    }

    #[test]
    fn test_bucket_size_of_one_still_folds_in_order() {
        let scheduler = Scheduler::create(&parallel_config(4)).unwrap();
        let inputs: Vec<u64> = (0..64).collect();
        let collected = scheduler
            .map_reduce_with_buckets(
                &inputs,
                1,
                |x| *x,
                |mut acc: Vec<u64>, x| {
                    acc.push(x);
                    acc
                },
                Vec::new(),
            )
            .unwrap();
        assert_eq!(collected, inputs);
        scheduler.destroy();
    }

    #[test]
    fn test_zero_bucket_size_is_clamped() {
        let scheduler = Scheduler::sequential();
        let inputs: Vec<u64> = (1..=10).collect();
        let total = scheduler
            .map_reduce_with_buckets(&inputs, 0, |x| *x, |acc, x| acc + x, 0u64)
            .unwrap();
        assert_eq!(total, 55);
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_parallel_and_sequential_agree() {
        let parallel = Scheduler::create(&parallel_config(4)).unwrap();
        let sequential = Scheduler::sequential();
        let inputs: Vec<u64> = (0..2000).collect();

        let from_parallel = parallel
            .map_reduce(&inputs, |x| x * 3, |acc, x| acc + x, 0u64)
            .unwrap();
        let from_sequential = sequential
            .map_reduce(&inputs, |x| x * 3, |acc, x| acc + x, 0u64)
            .unwrap();
        assert_eq!(from_parallel, from_sequential);
        parallel.destroy();
    }

    #[test]
    fn test_worker_crash_is_fatal() {
        let scheduler = Scheduler::create(&parallel_config(2)).unwrap();
        let inputs: Vec<u64> = (0..10).collect();
        let outcome = scheduler.map_reduce(
            &inputs,
            |x| {
                if *x == 5 {
                    panic!("boom at {}", x);
                }
                *x
            },
            |acc, x| acc + x,
            0u64,
        );
        match outcome {
            Err(EngineError::Scheduler(message)) => assert!(message.contains("boom")),
            other => panic!("expected scheduler error, got {:?}", other),
        }
        scheduler.destroy();
    }

    #[test]
    fn test_iter_visits_every_input() {
        let scheduler = Scheduler::create(&parallel_config(4)).unwrap();
        let counter = AtomicUsize::new(0);
        let inputs: Vec<u64> = (0..500).collect();
        scheduler
            .iter(&inputs, |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 500);
        scheduler.destroy();
    }

    #[test]
    fn test_single_job_returns_value() {
        let scheduler = Scheduler::create(&parallel_config(2)).unwrap();
        let value = scheduler.single_job(|| 41 + 1).unwrap();
        assert_eq!(value, 42);
        scheduler.destroy();
    }

    #[test]
    fn test_single_job_crash_is_fatal() {
        let scheduler = Scheduler::sequential();
        let outcome: Result<u64> = scheduler.single_job(|| panic!("lost"));
        assert!(matches!(outcome, Err(EngineError::Scheduler(_))));
    }

    #[test]
    fn test_once_per_worker_sequential_runs_once() {
        let scheduler = Scheduler::sequential();
        let counter = AtomicUsize::new(0);
        scheduler
            .once_per_worker(|| {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_once_per_worker_reaches_every_thread() {
        let scheduler = Scheduler::create(&parallel_config(3)).unwrap();
        assert!(scheduler.is_parallel());
        let counter = AtomicUsize::new(0);
        scheduler
            .once_per_worker(|| {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 3);
        scheduler.destroy();
    }

    #[test]
    fn test_sequential_scheduler_reports_not_parallel() {
        assert!(!Scheduler::sequential().is_parallel());
        let config = AnalysisConfig::new().with_workers(8).sequential();
        let scheduler = Scheduler::create(&config).unwrap();
        assert!(!scheduler.is_parallel());
        assert_eq!(scheduler.workers(), 1);
    }
}
