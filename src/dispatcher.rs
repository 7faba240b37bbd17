use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::call::{Call, CallCallback};
use crate::error::Error;
use crate::executor::{Executor, ThreadPoolExecutor};
use crate::util::{lock_unpoisoned, redact_url_for_logs};

pub(crate) const DEFAULT_MAX_REQUESTS: usize = 64;
pub(crate) const DEFAULT_MAX_REQUESTS_PER_HOST: usize = 5;

type IdleCallback = Arc<dyn Fn() + Send + Sync>;

struct RunningCall {
    call: Call,
    host: String,
}

struct DispatcherState {
    max_requests: usize,
    max_requests_per_host: usize,
    ready: VecDeque<AsyncCall>,
    running_async: Vec<RunningCall>,
    running_sync: Vec<Call>,
    per_host: HashMap<String, usize>,
    idle_callback: Option<IdleCallback>,
}

impl DispatcherState {
    fn running_count(&self) -> usize {
        self.running_async.len() + self.running_sync.len()
    }
}

struct DispatcherInner {
    state: Mutex<DispatcherState>,
    executor: Arc<dyn Executor>,
}

/// Decides when enqueued calls run.
///
/// At most `max_requests` async calls run at once, and at most
/// `max_requests_per_host` of those share a destination host. Synchronous
/// calls are tracked for bookkeeping but never throttled.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_unpoisoned(&self.inner.state);
        formatter
            .debug_struct("Dispatcher")
            .field("max_requests", &state.max_requests)
            .field("max_requests_per_host", &state.max_requests_per_host)
            .field("queued", &state.ready.len())
            .field("running_async", &state.running_async.len())
            .field("running_sync", &state.running_sync.len())
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Dispatcher {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_executor(Arc::new(ThreadPoolExecutor::new()))
    }

    pub fn with_executor(executor: Arc<dyn Executor>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                state: Mutex::new(DispatcherState {
                    max_requests: DEFAULT_MAX_REQUESTS,
                    max_requests_per_host: DEFAULT_MAX_REQUESTS_PER_HOST,
                    ready: VecDeque::new(),
                    running_async: Vec::new(),
                    running_sync: Vec::new(),
                    per_host: HashMap::new(),
                    idle_callback: None,
                }),
                executor,
            }),
        }
    }

    pub fn max_requests(&self) -> usize {
        lock_unpoisoned(&self.inner.state).max_requests
    }

    /// Lowering the cap below the current load only throttles admission;
    /// running calls are left alone.
    pub fn set_max_requests(&self, max_requests: usize) -> crate::Result<()> {
        if max_requests == 0 {
            return Err(Error::invalid_config("max_requests must be at least 1"));
        }
        lock_unpoisoned(&self.inner.state).max_requests = max_requests;
        self.promote_and_execute();
        Ok(())
    }

    pub fn max_requests_per_host(&self) -> usize {
        lock_unpoisoned(&self.inner.state).max_requests_per_host
    }

    pub fn set_max_requests_per_host(&self, max_requests_per_host: usize) -> crate::Result<()> {
        if max_requests_per_host == 0 {
            return Err(Error::invalid_config(
                "max_requests_per_host must be at least 1",
            ));
        }
        lock_unpoisoned(&self.inner.state).max_requests_per_host = max_requests_per_host;
        self.promote_and_execute();
        Ok(())
    }

    /// Invoked each time a finishing call leaves the dispatcher with no
    /// running calls.
    pub fn set_idle_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock_unpoisoned(&self.inner.state).idle_callback = Some(Arc::new(callback));
    }

    pub fn clear_idle_callback(&self) {
        lock_unpoisoned(&self.inner.state).idle_callback = None;
    }

    /// Cancels every queued and running call. Canceled calls still finish
    /// through the usual bookkeeping.
    pub fn cancel_all(&self) {
        let calls = {
            let state = lock_unpoisoned(&self.inner.state);
            state
                .ready
                .iter()
                .map(|queued| queued.call.clone())
                .chain(state.running_async.iter().map(|running| running.call.clone()))
                .chain(state.running_sync.iter().cloned())
                .collect::<Vec<_>>()
        };
        for call in calls {
            call.cancel();
        }
    }

    pub fn queued_calls(&self) -> Vec<Call> {
        let state = lock_unpoisoned(&self.inner.state);
        state.ready.iter().map(|queued| queued.call.clone()).collect()
    }

    pub fn running_calls(&self) -> Vec<Call> {
        let state = lock_unpoisoned(&self.inner.state);
        state
            .running_async
            .iter()
            .map(|running| running.call.clone())
            .chain(state.running_sync.iter().cloned())
            .collect()
    }

    pub fn queued_calls_count(&self) -> usize {
        lock_unpoisoned(&self.inner.state).ready.len()
    }

    pub fn running_calls_count(&self) -> usize {
        lock_unpoisoned(&self.inner.state).running_count()
    }

    pub(crate) fn enqueue(&self, call: Call, callback: CallCallback) {
        let queued = AsyncCall {
            host: host_key(&call),
            call,
            callback: Some(callback),
            dispatcher: Arc::downgrade(&self.inner),
        };
        lock_unpoisoned(&self.inner.state).ready.push_back(queued);
        self.promote_and_execute();
    }

    pub(crate) fn executed(&self, call: &Call) {
        lock_unpoisoned(&self.inner.state)
            .running_sync
            .push(call.clone());
    }

    pub(crate) fn finished_sync(&self, call: &Call) {
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            if let Some(index) = state.running_sync.iter().position(|running| running == call) {
                state.running_sync.swap_remove(index);
            }
        }
        self.after_finish();
    }

    fn finished_async(&self, call: &Call) {
        {
            let mut state = lock_unpoisoned(&self.inner.state);
            if let Some(index) = state
                .running_async
                .iter()
                .position(|running| running.call == *call)
            {
                let running = state.running_async.swap_remove(index);
                release_host(&mut state.per_host, &running.host);
            }
        }
        self.after_finish();
    }

    fn after_finish(&self) {
        self.promote_and_execute();
        let idle_callback = {
            let state = lock_unpoisoned(&self.inner.state);
            if state.running_count() == 0 {
                state.idle_callback.clone()
            } else {
                None
            }
        };
        if let Some(idle_callback) = idle_callback {
            idle_callback();
        }
    }

    /// Moves eligible calls from the ready queue to the running set, then
    /// hands them to the executor with the lock released.
    fn promote_and_execute(&self) {
        let admitted = {
            let mut state = lock_unpoisoned(&self.inner.state);
            promote(&mut state)
        };
        for queued in admitted {
            debug!(
                call_id = queued.call.id(),
                host = %queued.host,
                url = %redact_url_for_logs(queued.call.request().url()),
                "promoting queued call"
            );
            // A rejected job is dropped by the executor, and dropping an
            // AsyncCall fails its callback and finishes it.
            if let Err(error) = self.inner.executor.execute(Box::new(move || queued.run())) {
                debug!(error = %error, "executor rejected call");
            }
        }
    }
}

fn promote(state: &mut DispatcherState) -> Vec<AsyncCall> {
    let mut admitted = Vec::new();
    let mut index = 0;
    while index < state.ready.len() {
        if state.running_async.len() >= state.max_requests {
            break;
        }
        let host = &state.ready[index].host;
        let host_load = state.per_host.get(host).copied().unwrap_or(0);
        if host_load >= state.max_requests_per_host {
            index += 1;
            continue;
        }
        let Some(queued) = state.ready.remove(index) else {
            break;
        };
        *state.per_host.entry(queued.host.clone()).or_insert(0) += 1;
        state.running_async.push(RunningCall {
            call: queued.call.clone(),
            host: queued.host.clone(),
        });
        admitted.push(queued);
    }
    admitted
}

fn release_host(per_host: &mut HashMap<String, usize>, host: &str) {
    if let Some(count) = per_host.get_mut(host) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            per_host.remove(host);
        }
    }
}

fn host_key(call: &Call) -> String {
    call.request().host().to_ascii_lowercase()
}

/// A queued call with its pending callback. Dropping it finishes the call
/// with the dispatcher; if the callback never ran, it first receives
/// [`Error::ExecutorRejected`].
struct AsyncCall {
    call: Call,
    host: String,
    callback: Option<CallCallback>,
    dispatcher: Weak<DispatcherInner>,
}

impl AsyncCall {
    fn run(mut self) {
        let result = self.call.run();
        if let Some(callback) = self.callback.take() {
            callback(&self.call, result);
        }
    }
}

impl Drop for AsyncCall {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            let request = self.call.request();
            let error = Error::ExecutorRejected {
                method: request.method().clone(),
                uri: redact_url_for_logs(request.url()),
            };
            callback(&self.call, Err(error));
        }
        if let Some(inner) = self.dispatcher.upgrade() {
            Dispatcher { inner }.finished_async(&self.call);
        }
    }
}
