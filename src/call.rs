use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info_span};

use crate::chain::{Chain, ChainTimeouts, ExchangeState};
use crate::client::Client;
use crate::error::{Error, TimeoutPhase};
use crate::request::Request;
use crate::response::Response;
use crate::transport::Shutdown;
use crate::util::{lock_unpoisoned, redact_url_for_logs};

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type CallCallback = Box<dyn FnOnce(&Call, crate::Result<Response>) + Send + 'static>;

struct CallInner {
    id: u64,
    client: Client,
    request: Request,
    executed: AtomicBool,
    canceled: AtomicBool,
    active: Mutex<Option<Arc<dyn Shutdown>>>,
}

/// One request/response exchange, possibly spanning redirects, retries and
/// auth follow-ups. Cloning yields another handle to the same call.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

impl std::fmt::Debug for Call {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Call")
            .field("id", &self.inner.id)
            .field("method", self.inner.request.method())
            .field("url", &redact_url_for_logs(self.inner.request.url()))
            .field("executed", &self.is_executed())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

impl PartialEq for Call {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Call {}

impl Call {
    pub(crate) fn new(client: Client, request: Request) -> Self {
        Self {
            inner: Arc::new(CallInner {
                id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
                client,
                request,
                executed: AtomicBool::new(false),
                canceled: AtomicBool::new(false),
                active: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    pub fn is_executed(&self) -> bool {
        self.inner.executed.load(Ordering::Acquire)
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Runs the call on the current thread and blocks until it completes.
    pub fn execute(&self) -> crate::Result<Response> {
        self.mark_executed()?;
        let dispatcher = self.inner.client.dispatcher().clone();
        dispatcher.executed(self);
        let _finished = SyncFinish {
            dispatcher,
            call: self,
        };
        self.run()
    }

    /// Schedules the call on the dispatcher. `callback` runs exactly once on
    /// a dispatcher worker with the outcome.
    pub fn enqueue<F>(&self, callback: F) -> crate::Result<()>
    where
        F: FnOnce(&Call, crate::Result<Response>) + Send + 'static,
    {
        self.mark_executed()?;
        self.inner
            .client
            .dispatcher()
            .enqueue(self.clone(), Box::new(callback));
        Ok(())
    }

    /// Cancels the call. Safe from any thread and idempotent; in-flight I/O
    /// is interrupted by closing the active transport.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(call_id = self.inner.id, "call canceled");
        let active = lock_unpoisoned(&self.inner.active).clone();
        if let Some(active) = active {
            active.shutdown();
        }
        self.inner.client.event_listener().canceled(self);
    }

    /// A fresh, unexecuted call for the same request on the same client.
    pub fn reissue(&self) -> Call {
        Call::new(self.inner.client.clone(), self.inner.request.clone())
    }

    pub(crate) fn set_active_transport(&self, shutdown: Option<Arc<dyn Shutdown>>) {
        let registered = shutdown.clone();
        *lock_unpoisoned(&self.inner.active) = shutdown;
        if self.is_canceled()
            && let Some(registered) = registered
        {
            registered.shutdown();
        }
    }

    fn mark_executed(&self) -> crate::Result<()> {
        if self.inner.executed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyExecuted {
                method: self.inner.request.method().clone(),
                uri: redact_url_for_logs(self.inner.request.url()),
            });
        }
        Ok(())
    }

    pub(crate) fn canceled_error(&self) -> Error {
        Error::Canceled {
            method: self.inner.request.method().clone(),
            uri: redact_url_for_logs(self.inner.request.url()),
        }
    }

    pub(crate) fn run(&self) -> crate::Result<Response> {
        let client = &self.inner.client;
        let request = &self.inner.request;
        let span = info_span!(
            "callx.call",
            method = %request.method(),
            url = %redact_url_for_logs(request.url()),
            call_id = self.inner.id,
        );
        let _entered = span.enter();
        let listener = client.event_listener();
        listener.call_start(self);

        let result = if self.is_canceled() {
            Err(self.canceled_error())
        } else {
            self.run_chain()
        };

        match &result {
            Ok(response) => listener.call_end(self, response),
            Err(error) => listener.call_failed(self, error),
        }
        result
    }

    fn run_chain(&self) -> crate::Result<Response> {
        let client = &self.inner.client;
        let request = &self.inner.request;
        let call_timeout = client.call_timeout();
        let node = call_timeout.map(|timeout| {
            let call = self.clone();
            client
                .watchdog()
                .timeout(move || call.cancel())
                .with_timeout(timeout)
        });
        if let Some(node) = &node {
            node.enter()?;
        }

        let mut state = ExchangeState::default();
        let timeouts = ChainTimeouts {
            connect: client.connect_timeout(),
            read: client.read_timeout(),
            write: client.write_timeout(),
        };
        let (stages, network_from) = client.stages();
        let result = {
            let mut chain = Chain::new(
                &stages,
                network_from,
                request.clone(),
                self,
                &mut state,
                timeouts,
            );
            chain.proceed(request.clone())
        };
        drop(state);

        let timed_out = node.as_ref().is_some_and(|node| node.exit());
        if timed_out {
            return Err(Error::Timeout {
                phase: TimeoutPhase::Call,
                timeout_ms: crate::util::duration_millis(call_timeout),
                method: request.method().clone(),
                uri: redact_url_for_logs(request.url()),
                source: result.err().map(|error| Box::new(error) as crate::error::BoxError),
            });
        }
        if self.is_canceled() {
            return Err(self.canceled_error());
        }
        result
    }
}

struct SyncFinish<'a> {
    dispatcher: crate::dispatcher::Dispatcher,
    call: &'a Call,
}

impl Drop for SyncFinish<'_> {
    fn drop(&mut self) {
        self.dispatcher.finished_sync(self.call);
    }
}
