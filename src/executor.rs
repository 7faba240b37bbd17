use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::util::{lock_unpoisoned, wait_timeout_unpoisoned};

const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
const WORKER_THREAD_NAME: &str = "callx-dispatcher";

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, thiserror::Error)]
#[error("executor rejected job: {reason}")]
pub struct RejectedExecution {
    reason: String,
}

impl RejectedExecution {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Runs dispatcher jobs. A rejected or dropped job fails its call with
/// [`crate::Error::ExecutorRejected`].
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job) -> Result<(), RejectedExecution>;
}

struct WorkerState {
    queue: VecDeque<Job>,
    workers: usize,
    idle_workers: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<WorkerState>,
    condvar: Condvar,
    keep_alive: Duration,
}

/// Unbounded cached thread pool: a job either wakes an idle worker or gets a
/// new one, and workers idle for longer than the keep-alive exit.
#[derive(Clone)]
pub struct ThreadPoolExecutor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_unpoisoned(&self.shared.state);
        formatter
            .debug_struct("ThreadPoolExecutor")
            .field("workers", &state.workers)
            .field("idle_workers", &state.idle_workers)
            .field("queued", &state.queue.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl Default for ThreadPoolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadPoolExecutor {
    pub fn new() -> Self {
        Self::with_keep_alive(DEFAULT_KEEP_ALIVE)
    }

    pub fn with_keep_alive(keep_alive: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(WorkerState {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle_workers: 0,
                    shutdown: false,
                }),
                condvar: Condvar::new(),
                keep_alive,
            }),
        }
    }

    pub fn worker_count(&self) -> usize {
        lock_unpoisoned(&self.shared.state).workers
    }

    /// Stops accepting jobs. Queued jobs still run.
    pub fn shutdown(&self) {
        lock_unpoisoned(&self.shared.state).shutdown = true;
        self.shared.condvar.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        lock_unpoisoned(&self.shared.state).shutdown
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, job: Job) -> Result<(), RejectedExecution> {
        let mut state = lock_unpoisoned(&self.shared.state);
        if state.shutdown {
            drop(state);
            drop(job);
            return Err(RejectedExecution::new("executor is shut down"));
        }
        state.queue.push_back(job);
        if state.idle_workers >= state.queue.len() {
            self.shared.condvar.notify_one();
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_owned())
            .spawn(move || run_worker(shared))
        {
            Ok(_) => {
                state.workers += 1;
                Ok(())
            }
            Err(error) => {
                warn!(error = %error, "failed to spawn dispatcher worker");
                if state.workers > 0 {
                    return Ok(());
                }
                let rejected = state.queue.pop_back();
                drop(state);
                drop(rejected);
                Err(RejectedExecution::new(format!("failed to spawn worker: {error}")))
            }
        }
    }
}

fn run_worker(shared: Arc<Shared>) {
    let mut state = lock_unpoisoned(&shared.state);
    let mut idle_since = Instant::now();
    loop {
        if let Some(job) = state.queue.pop_front() {
            drop(state);
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                warn!("dispatcher job panicked");
            }
            state = lock_unpoisoned(&shared.state);
            idle_since = Instant::now();
            continue;
        }

        let idle_for = idle_since.elapsed();
        if state.shutdown || idle_for >= shared.keep_alive {
            state.workers = state.workers.saturating_sub(1);
            return;
        }
        state.idle_workers += 1;
        state = wait_timeout_unpoisoned(&shared.condvar, state, shared.keep_alive - idle_for);
        state.idle_workers = state.idle_workers.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn runs_jobs_on_named_workers() {
        let executor = ThreadPoolExecutor::new();
        let (sender, receiver) = mpsc::channel();
        executor
            .execute(Box::new(move || {
                let name = thread::current().name().map(ToOwned::to_owned);
                let _ = sender.send(name);
            }))
            .expect("job should be accepted");
        let name = receiver
            .recv_timeout(Duration::from_secs(2))
            .expect("job should run");
        assert_eq!(name.as_deref(), Some(WORKER_THREAD_NAME));
    }

    #[test]
    fn concurrent_jobs_get_their_own_workers() {
        let executor = ThreadPoolExecutor::new();
        let (sender, receiver) = mpsc::channel();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        for _ in 0..3 {
            let sender = sender.clone();
            let gate = Arc::clone(&gate);
            executor
                .execute(Box::new(move || {
                    let _ = sender.send(());
                    let (lock, condvar) = &*gate;
                    let mut open = lock_unpoisoned(lock);
                    while !*open {
                        open = crate::util::wait_unpoisoned(condvar, open);
                    }
                }))
                .expect("job should be accepted");
        }
        for _ in 0..3 {
            receiver
                .recv_timeout(Duration::from_secs(2))
                .expect("every job should start without waiting for another");
        }
        *lock_unpoisoned(&gate.0) = true;
        gate.1.notify_all();
        assert_eq!(executor.worker_count(), 3);
    }

    #[test]
    fn idle_workers_exit_after_keep_alive() {
        let executor = ThreadPoolExecutor::with_keep_alive(Duration::from_millis(20));
        let (sender, receiver) = mpsc::channel();
        executor
            .execute(Box::new(move || {
                let _ = sender.send(());
            }))
            .expect("job should be accepted");
        receiver
            .recv_timeout(Duration::from_secs(2))
            .expect("job should run");
        assert!(crate::tests::support::wait_until(Duration::from_secs(2), || {
            executor.worker_count() == 0
        }));
    }

    #[test]
    fn shutdown_rejects_new_jobs() {
        let executor = ThreadPoolExecutor::new();
        executor.shutdown();
        assert!(executor.execute(Box::new(|| {})).is_err());
    }
}
