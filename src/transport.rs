//! The boundary between call scheduling and the wire.
//!
//! This crate ships no HTTP/1.1 or HTTP/2 codec. A [`Connector`] opens one
//! [`Transport`] per connection, and the transport moves a whole request and
//! a whole buffered response per exchange.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::connection_spec::ConnectionSpec;
use crate::request::Request;
use crate::response::ResponseParts;
use crate::route::Route;
use crate::tls::{Handshake, Protocol};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    pub connect_timeout: Option<Duration>,
    pub ping_interval: Option<Duration>,
}

/// What a TLS upgrade should negotiate.
#[derive(Clone, Copy, Debug)]
pub struct TlsOptions<'a> {
    pub host: &'a str,
    /// Offered through ALPN, in preference order.
    pub protocols: &'a [Protocol],
    /// Versions and cipher suites to enable, intersected with what the
    /// transport supports.
    pub spec: &'a ConnectionSpec,
    /// Set when an earlier handshake on this address failed. Transports that
    /// support it should advertise `TLS_FALLBACK_SCSV`.
    pub is_fallback: bool,
}

/// Opens raw transports, honoring the connect timeout natively.
pub trait Connector: Send + Sync {
    fn connect(&self, route: &Route, options: &ConnectOptions) -> io::Result<Box<dyn Transport>>;
}

impl<F> Connector for F
where
    F: Fn(&Route, &ConnectOptions) -> io::Result<Box<dyn Transport>> + Send + Sync,
{
    fn connect(&self, route: &Route, options: &ConnectOptions) -> io::Result<Box<dyn Transport>> {
        self(route, options)
    }
}

/// One open connection to a socket address. Exchanges are strictly
/// sequential: `write_request` then `read_response`.
pub trait Transport: Send {
    fn write_request(&mut self, request: &Request) -> io::Result<()>;

    fn read_response(&mut self) -> io::Result<ResponseParts>;

    /// Upgrades the transport to TLS. Report a rejected peer certificate as
    /// `InvalidData`; other failures let the client retry with the next
    /// connection spec.
    fn start_tls(&mut self, _options: &TlsOptions<'_>) -> io::Result<Handshake> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transport does not support tls",
        ))
    }

    fn is_healthy(&self) -> bool {
        true
    }

    /// Handle that force-closes this transport from another thread, waking
    /// any operation blocked on it.
    fn shutdown_handle(&self) -> Arc<dyn Shutdown>;
}

pub trait Shutdown: Send + Sync {
    fn shutdown(&self);
}

impl<F> Shutdown for F
where
    F: Fn() + Send + Sync,
{
    fn shutdown(&self) {
        self()
    }
}
