//! hkv-pool - An elastic, bounded worker pool
//!
//! A rewrite of a classic low/high-watermark thread pool. The shape is
//! familiar (one queue, workers that scale between a floor and a ceiling,
//! idle-timeout retirement) but two bugs present in the pool this design is
//! descended from are fixed by construction:
//!
//! ## Design Principles
//! 1. **Join, never detach.** Every spawned worker's `JoinHandle` is kept and
//!    joined on shutdown; `Drop` cannot leak a running OS thread.
//! 2. **One mutex for queue, state, and worker bookkeeping.** The live/busy
//!    worker counts, the task queue, and the lifecycle state all live behind
//!    the same `parking_lot::Mutex`, so the spawn predicate
//!    (`busy == live ⇒ spawn`) and the retirement predicate
//!    (`idle ∧ live > low_watermark ⇒ retire`) can never race with each
//!    other or with a concurrent `stop`.
//! 3. **No side-effecting predicates.** The spawn decision is two plain
//!    boolean reads under the lock, not a single expression that both tests
//!    and mutates state.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use hkv_common::{HkvError, HkvResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Thread pool construction parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Prefix used for worker thread names (`"{name}-{n}"`).
    pub name: String,
    /// Upper bound on queued-but-not-yet-running tasks.
    pub max_queue_size: usize,
    /// Worker count never drops below this while `Running`.
    pub low_watermark: usize,
    /// Worker count never grows past this.
    pub high_watermark: usize,
    /// How long an idle worker waits for work before considering retirement.
    pub idle_time_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            name: "hkv-pool".to_string(),
            max_queue_size: 1024,
            low_watermark: 1,
            high_watermark: 8,
            idle_time_ms: 5_000,
        }
    }
}

/// Pool lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Stopping,
    Stopped,
}

struct Inner {
    jobs: VecDeque<Job>,
    state: State,
    live: usize,
    busy: usize,
    handles: Vec<JoinHandle<()>>,
    next_worker_id: usize,
}

struct Shared {
    config: PoolConfig,
    inner: Mutex<Inner>,
    work_cv: Condvar,
    stop_cv: Condvar,
}

/// An elastic, bounded worker pool.
///
/// `Submit` never blocks. `Drop` implies `stop(await = true)`: every worker
/// is joined before the pool's memory is reclaimed.
pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    /// Builds a pool and pre-spawns `low_watermark` workers.
    pub fn new(config: PoolConfig) -> HkvResult<Self> {
        if config.high_watermark == 0 || config.low_watermark > config.high_watermark {
            return Err(HkvError::InvalidWatermarks {
                low: config.low_watermark,
                high: config.high_watermark,
            });
        }

        let shared = Arc::new(Shared {
            config,
            inner: Mutex::new(Inner {
                jobs: VecDeque::new(),
                state: State::Running,
                live: 0,
                busy: 0,
                handles: Vec::new(),
                next_worker_id: 0,
            }),
            work_cv: Condvar::new(),
            stop_cv: Condvar::new(),
        });

        {
            let mut inner = shared.inner.lock();
            let floor = shared.config.low_watermark;
            for _ in 0..floor {
                spawn_worker(&shared, &mut inner);
            }
        }

        Ok(ThreadPool { shared })
    }

    /// Enqueues `job`. Returns `false` (job dropped) if the pool is not
    /// `Running` or the queue is already at `max_queue_size`.
    ///
    /// Spawns one additional worker when every live worker is currently busy
    /// and `high_watermark` has not been reached — the sole elasticity
    /// trigger.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.shared.inner.lock();
        if inner.state != State::Running || inner.jobs.len() >= self.shared.config.max_queue_size {
            return false;
        }

        inner.jobs.push_back(Box::new(job));

        if inner.live < self.shared.config.high_watermark && inner.busy == inner.live {
            spawn_worker(&self.shared, &mut inner);
        }

        drop(inner);
        self.shared.work_cv.notify_one();
        true
    }

    /// Transitions to `Stopping`. Queued tasks still run to completion.
    ///
    /// If `await_` is true, blocks until every worker has exited.
    pub fn stop(&self, await_: bool) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == State::Running {
                inner.state = State::Stopping;
                if inner.live == 0 {
                    inner.state = State::Stopped;
                }
            }
            self.shared.work_cv.notify_all();
            self.shared.stop_cv.notify_all();

            if await_ {
                while inner.state != State::Stopped {
                    self.shared.stop_cv.wait(&mut inner);
                }
            }
        }
    }

    /// Number of workers currently alive (idle + busy).
    pub fn live_workers(&self) -> usize {
        self.shared.inner.lock().live
    }

    /// Number of tasks currently queued, not counting ones a worker has
    /// already popped.
    pub fn queue_len(&self) -> usize {
        self.shared.inner.lock().jobs.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop(true);
        let handles = {
            let mut inner = self.shared.inner.lock();
            std::mem::take(&mut inner.handles)
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// Spawns one worker and records its handle. Caller must hold `inner`'s lock
/// and increment bookkeeping — this function registers the handle and bumps
/// `live`/`next_worker_id` itself so every call site stays in sync.
fn spawn_worker(shared: &Arc<Shared>, inner: &mut Inner) {
    let worker_id = inner.next_worker_id;
    inner.next_worker_id += 1;
    inner.live += 1;

    let shared = Arc::clone(shared);
    let thread_name = format!("{}-{worker_id}", shared.config.name);
    let handle = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || worker_loop(shared))
        .expect("failed to spawn pool worker thread");

    inner.handles.push(handle);
}

fn worker_loop(shared: Arc<Shared>) {
    let idle_deadline = Duration::from_millis(shared.config.idle_time_ms);

    loop {
        let job = {
            let mut inner = shared.inner.lock();
            loop {
                if !inner.jobs.is_empty() {
                    break;
                }
                if inner.state != State::Running {
                    retire(&shared, inner);
                    return;
                }

                let timed_out = shared.work_cv.wait_for(&mut inner, idle_deadline).timed_out();
                if timed_out && inner.jobs.is_empty() && inner.live > shared.config.low_watermark {
                    retire(&shared, inner);
                    return;
                }
            }
            let job = inner.jobs.pop_front().expect("queue non-empty");
            inner.busy += 1;
            job
        };

        let result = std::panic::catch_unwind(AssertUnwindSafe(job));
        if let Err(panic) = result {
            tracing::error!(?panic, "pool task panicked");
        }

        shared.inner.lock().busy -= 1;
    }
}

/// Removes this worker from the live count and, if it is the last one to
/// leave during a `Stopping` drain, transitions the pool to `Stopped`.
///
/// The caller's `MutexGuard` is consumed so the state mutation and the
/// `Stopped` notification happen atomically with respect to other workers
/// retiring at the same time.
fn retire(shared: &Arc<Shared>, mut inner: parking_lot::MutexGuard<'_, Inner>) {
    inner.live -= 1;
    if inner.state == State::Stopping && inner.live == 0 {
        inner.state = State::Stopped;
        drop(inner);
        shared.stop_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn config(low: usize, high: usize, idle_ms: u64, max_queue: usize) -> PoolConfig {
        PoolConfig {
            name: "test-pool".to_string(),
            max_queue_size: max_queue,
            low_watermark: low,
            high_watermark: high,
            idle_time_ms: idle_ms,
        }
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let err = ThreadPool::new(config(5, 1, 100, 10)).unwrap_err();
        assert!(matches!(err, HkvError::InvalidWatermarks { .. }));
    }

    #[test]
    fn submitted_tasks_all_run() {
        let pool = ThreadPool::new(config(1, 4, 50, 100)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            assert!(pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.stop(true);
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn elasticity_scales_up_then_back_down() {
        let pool = Arc::new(ThreadPool::new(config(1, 3, 50, 10)).unwrap());
        // Submit from three separate threads, as scenario 3 describes
        // ("submit three 200ms tasks concurrently"): a single submitting
        // thread can race the pre-spawned worker's wakeup, since the spawn
        // predicate only sees a worker as busy once it has actually dequeued
        // a job, and nothing guarantees that happens before the 2nd/3rd
        // `submit()` calls run.
        let submitters: Vec<_> = (0..3)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    pool.submit(|| std::thread::sleep(Duration::from_millis(200)));
                })
            })
            .collect();
        for submitter in submitters {
            submitter.join().unwrap();
        }

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(pool.live_workers(), 3);

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(pool.live_workers(), 1);
    }

    #[test]
    fn shutdown_preserves_queue_and_waits_for_completion() {
        let pool = ThreadPool::new(config(1, 2, 1_000, 10)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                std::thread::sleep(Duration::from_millis(20));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        let start = Instant::now();
        pool.stop(true);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn full_queue_rejects_submission() {
        let pool = ThreadPool::new(config(1, 1, 10_000, 1)).unwrap();
        // Occupy the single worker so the queue actually backs up.
        pool.submit(|| std::thread::sleep(Duration::from_millis(200)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(pool.submit(|| ()));
        assert!(!pool.submit(|| ()));
        pool.stop(true);
    }

    #[test]
    fn panicking_task_does_not_poison_the_pool() {
        let pool = ThreadPool::new(config(1, 2, 200, 10)).unwrap();
        assert!(pool.submit(|| panic!("boom")));
        std::thread::sleep(Duration::from_millis(50));

        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::clone(&counter);
        assert!(pool.submit(move || {
            counter2.fetch_add(1, Ordering::SeqCst);
        }));
        pool.stop(true);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
