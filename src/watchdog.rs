use std::collections::BTreeMap;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::Error;
use crate::util::{lock_unpoisoned, wait_timeout_unpoisoned};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const WATCHDOG_THREAD_NAME: &str = "callx-watchdog";

type Callback = Arc<dyn Fn() + Send + Sync>;
type NodeKey = (Instant, u64);

struct QueueState {
    queue: BTreeMap<NodeKey, Callback>,
    next_seq: u64,
    running: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    condvar: Condvar,
    idle_timeout: Duration,
}

/// Deadline registry served by one lazily spawned background thread.
///
/// The thread sleeps until the nearest deadline, removes the expired node and
/// runs its callback. Once the registry has stayed empty for the idle window
/// the thread exits; the next [`Timeout::enter`] starts a new one.
#[derive(Clone)]
pub struct Watchdog {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Watchdog")
            .field("pending", &self.pending())
            .field("running", &self.is_running())
            .finish()
    }
}

impl PartialEq for Watchdog {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Watchdog {
    pub fn global() -> Self {
        static GLOBAL: OnceLock<Watchdog> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Self::with_idle_timeout(DEFAULT_IDLE_TIMEOUT))
            .clone()
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    queue: BTreeMap::new(),
                    next_seq: 0,
                    running: false,
                }),
                condvar: Condvar::new(),
                idle_timeout,
            }),
        }
    }

    pub fn timeout<F>(&self, on_timeout: F) -> Timeout
    where
        F: Fn() + Send + Sync + 'static,
    {
        Timeout {
            watchdog: self.clone(),
            timeout: None,
            deadline: None,
            on_timeout: Arc::new(on_timeout),
            fired: Arc::new(AtomicBool::new(false)),
            scheduled: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        lock_unpoisoned(&self.shared.state).running
    }

    pub fn pending(&self) -> usize {
        lock_unpoisoned(&self.shared.state).queue.len()
    }

    fn schedule(&self, at: Instant, callback: Callback) -> NodeKey {
        let mut state = lock_unpoisoned(&self.shared.state);
        let key = (at, state.next_seq);
        state.next_seq = state.next_seq.wrapping_add(1);
        let becomes_first = state
            .queue
            .first_key_value()
            .is_none_or(|(first, _)| key < *first);
        state.queue.insert(key, callback);

        if !state.running {
            let shared = Arc::clone(&self.shared);
            match thread::Builder::new()
                .name(WATCHDOG_THREAD_NAME.to_owned())
                .spawn(move || run_watchdog(shared))
            {
                Ok(_) => state.running = true,
                Err(error) => warn!(error = %error, "failed to spawn watchdog thread"),
            }
        } else if becomes_first {
            self.shared.condvar.notify_all();
        }
        key
    }

    /// Returns `false` when the node already left the queue, i.e. it fired.
    fn cancel(&self, key: &NodeKey) -> bool {
        lock_unpoisoned(&self.shared.state)
            .queue
            .remove(key)
            .is_some()
    }
}

fn run_watchdog(shared: Arc<Shared>) {
    let mut state = lock_unpoisoned(&shared.state);
    let mut idle_since: Option<Instant> = None;
    loop {
        let Some((&key, _)) = state.queue.first_key_value() else {
            let since = *idle_since.get_or_insert_with(Instant::now);
            let waited = since.elapsed();
            if waited >= shared.idle_timeout {
                state.running = false;
                debug!("watchdog idle, exiting");
                return;
            }
            state = wait_timeout_unpoisoned(&shared.condvar, state, shared.idle_timeout - waited);
            continue;
        };
        idle_since = None;

        let now = Instant::now();
        if key.0 > now {
            state = wait_timeout_unpoisoned(&shared.condvar, state, key.0 - now);
            continue;
        }

        let Some((_, callback)) = state.queue.pop_first() else {
            continue;
        };
        drop(state);
        if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
            warn!("watchdog timeout callback panicked");
        }
        state = lock_unpoisoned(&shared.state);
    }
}

/// Raised through `io::ErrorKind::TimedOut` when a guarded operation outlives
/// its node.
#[derive(Debug, thiserror::Error)]
#[error("operation timed out")]
pub struct TimedOut {
    #[source]
    source: Option<io::Error>,
}

impl TimedOut {
    pub fn into_io_error(source: Option<io::Error>) -> io::Error {
        io::Error::new(io::ErrorKind::TimedOut, Self { source })
    }
}

/// A single deadline registration. Enter before a blocking operation and exit
/// after it; the callback runs on the watchdog thread if the deadline passes
/// in between.
pub struct Timeout {
    watchdog: Watchdog,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    on_timeout: Callback,
    fired: Arc<AtomicBool>,
    scheduled: Mutex<Option<NodeKey>>,
}

impl std::fmt::Debug for Timeout {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Timeout")
            .field("timeout", &self.timeout)
            .field("deadline", &self.deadline)
            .field("fired", &self.has_fired())
            .finish()
    }
}

impl Timeout {
    /// Relative budget measured from `enter`. Zero disables it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn enter(&self) -> crate::Result<()> {
        let mut scheduled = lock_unpoisoned(&self.scheduled);
        if scheduled.is_some() {
            return Err(Error::UnbalancedTimeout);
        }
        let now = Instant::now();
        let at = match (self.timeout.map(|timeout| now + timeout), self.deadline) {
            (Some(relative), Some(absolute)) => relative.min(absolute),
            (Some(at), None) | (None, Some(at)) => at,
            (None, None) => return Ok(()),
        };

        self.fired.store(false, Ordering::Release);
        let fired = Arc::clone(&self.fired);
        let on_timeout = Arc::clone(&self.on_timeout);
        let callback: Callback = Arc::new(move || {
            fired.store(true, Ordering::Release);
            on_timeout();
        });
        *scheduled = Some(self.watchdog.schedule(at, callback));
        Ok(())
    }

    /// Unregisters the node. Returns `true` if the deadline had already fired.
    pub fn exit(&self) -> bool {
        let Some(key) = lock_unpoisoned(&self.scheduled).take() else {
            return false;
        };
        !self.watchdog.cancel(&key)
    }

    /// Runs `op` inside `enter`/`exit`. Any outcome that completes after the
    /// node fired is reported as [`io::ErrorKind::TimedOut`].
    pub fn run<T, F>(&self, op: F) -> io::Result<T>
    where
        F: FnOnce() -> io::Result<T>,
    {
        self.enter().map_err(io::Error::other)?;
        let result = op();
        let expired = self.exit();
        match result {
            Ok(value) if !expired => Ok(value),
            Ok(_) => Err(TimedOut::into_io_error(None)),
            Err(error) if expired => Err(TimedOut::into_io_error(Some(error))),
            Err(error) => Err(error),
        }
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        self.exit();
    }
}
