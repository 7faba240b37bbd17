use std::sync::Arc;
use std::time::Duration;

use crate::call::Call;
use crate::connection::Connection;
use crate::error::Error;
use crate::pool::PooledConnection;
use crate::request::Request;
use crate::response::Response;
use crate::route::Route;
use crate::stages::connect::ExchangeFinder;
use crate::util::redact_url_for_logs;

/// One stage of call processing.
///
/// Application interceptors run once per call and may short-circuit or call
/// [`Chain::proceed`] any number of times. Network interceptors run once per
/// network exchange and must call `proceed` exactly once without changing
/// the request's host or port.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, chain: &mut Chain<'_>) -> crate::Result<Response>;
}

impl<F> Interceptor for F
where
    F: Fn(&mut Chain<'_>) -> crate::Result<Response> + Send + Sync,
{
    fn intercept(&self, chain: &mut Chain<'_>) -> crate::Result<Response> {
        self(chain)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ChainTimeouts {
    pub(crate) connect: Option<Duration>,
    pub(crate) read: Option<Duration>,
    pub(crate) write: Option<Duration>,
}

/// Per-call connection state shared by every stage of one call.
#[derive(Default)]
pub(crate) struct ExchangeState {
    pub(crate) connection: Option<PooledConnection>,
    pub(crate) finder: Option<ExchangeFinder>,
    pub(crate) last_route: Option<Route>,
    pub(crate) last_connection_reused: bool,
}

/// A view of the remaining stages for one request.
pub struct Chain<'a> {
    stages: &'a [Arc<dyn Interceptor>],
    index: usize,
    request: Request,
    call: &'a Call,
    state: &'a mut ExchangeState,
    timeouts: ChainTimeouts,
    network_from: usize,
    calls: usize,
}

impl<'a> Chain<'a> {
    pub(crate) fn new(
        stages: &'a [Arc<dyn Interceptor>],
        network_from: usize,
        request: Request,
        call: &'a Call,
        state: &'a mut ExchangeState,
        timeouts: ChainTimeouts,
    ) -> Self {
        Self {
            stages,
            index: 0,
            request,
            call,
            state,
            timeouts,
            network_from,
            calls: 0,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn call(&self) -> &Call {
        self.call
    }

    /// The connection carrying this exchange. `None` for application
    /// interceptors and the stages before connect.
    pub fn connection(&self) -> Option<&Connection> {
        self.state.connection.as_deref()
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.timeouts.connect
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.timeouts.read
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.timeouts.write
    }

    /// Overrides apply to the remaining stages of this call only. Zero
    /// disables the timeout.
    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.timeouts.connect = (!timeout.is_zero()).then_some(timeout);
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.timeouts.read = (!timeout.is_zero()).then_some(timeout);
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.timeouts.write = (!timeout.is_zero()).then_some(timeout);
    }

    pub(crate) fn state(&mut self) -> &mut ExchangeState {
        self.state
    }

    pub(crate) fn timeouts(&self) -> ChainTimeouts {
        self.timeouts
    }

    pub fn proceed(&mut self, request: Request) -> crate::Result<Response> {
        if self.call.is_canceled() {
            return Err(Error::Canceled {
                method: request.method().clone(),
                uri: redact_url_for_logs(request.url()),
            });
        }
        let stages = self.stages;
        let Some(stage) = stages.get(self.index) else {
            return Err(Error::Interceptor {
                message: "chain has no remaining stages".to_owned(),
            });
        };

        self.calls += 1;
        let behind_network_stage = self.index >= self.network_from;
        if behind_network_stage {
            if self.calls > 1 {
                return Err(Error::Interceptor {
                    message: format!(
                        "network interceptor {} must call proceed() exactly once",
                        self.index - 1
                    ),
                });
            }
            if let Some(connection) = self.connection() {
                let address = connection.route().address();
                let host = request.host().trim_start_matches('[').trim_end_matches(']');
                let same_target = host.eq_ignore_ascii_case(address.host())
                    && request.port() == address.port();
                if !same_target {
                    return Err(Error::Interceptor {
                        message: format!(
                            "network interceptor {} must retain the same host and port",
                            self.index - 1
                        ),
                    });
                }
            }
        }

        let invokes_network_interceptor =
            self.index >= self.network_from && self.index + 1 < stages.len();
        let mut next = Chain {
            stages,
            index: self.index + 1,
            request: request.clone(),
            call: self.call,
            state: &mut *self.state,
            timeouts: self.timeouts,
            network_from: self.network_from,
            calls: 0,
        };
        let response = stage.intercept(&mut next)?;

        if invokes_network_interceptor && next.calls != 1 {
            return Err(Error::Interceptor {
                message: format!(
                    "network interceptor {} must call proceed() exactly once",
                    self.index
                ),
            });
        }
        Ok(response)
    }
}
