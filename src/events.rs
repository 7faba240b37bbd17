use crate::call::Call;
use crate::connection::Connection;
use crate::error::Error;
use crate::response::Response;
use crate::route::Route;
use crate::tls::Protocol;

/// Lifecycle hooks for calls and connections. Every method defaults to a
/// no-op; listeners run on the thread driving the call and must not block.
pub trait EventListener: Send + Sync {
    fn call_start(&self, _call: &Call) {}

    fn call_end(&self, _call: &Call, _response: &Response) {}

    fn call_failed(&self, _call: &Call, _error: &Error) {}

    fn canceled(&self, _call: &Call) {}

    fn connect_start(&self, _call: &Call, _route: &Route) {}

    fn connect_end(&self, _call: &Call, _route: &Route, _protocol: Protocol) {}

    fn connect_failed(&self, _call: &Call, _route: &Route, _error: &Error) {}

    fn connection_acquired(&self, _call: &Call, _connection: &Connection) {}

    fn connection_released(&self, _call: &Call, _connection: &Connection) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEventListener;

impl EventListener for NoopEventListener {}
