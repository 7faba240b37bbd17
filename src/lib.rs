//! `callx` schedules and executes HTTP calls over pluggable transports.
//!
//! A [`Client`] turns a [`Request`] into a [`Call`]. Calls run synchronously
//! on the caller's thread or asynchronously through the [`Dispatcher`], which
//! caps concurrency globally and per host. Each call drives an interceptor
//! chain that retries, follows redirects, answers auth challenges, reuses
//! pooled connections and pins certificates. The wire format is supplied by a
//! [`Connector`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::io;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use callx::prelude::*;
//!
//! fn main() -> callx::Result<()> {
//!     let connector: Arc<dyn Connector> = Arc::new(
//!         |_route: &Route, _options: &ConnectOptions| -> io::Result<Box<dyn Transport>> {
//!             Err(io::Error::other("plug in a real transport"))
//!         },
//!     );
//!     let client = Client::builder()
//!         .connector(connector)
//!         .call_timeout(Duration::from_secs(30))
//!         .build()?;
//!
//!     let response = client
//!         .new_call(Request::get("https://api.example.com/v1/items")?)
//!         .execute()?;
//!     println!("status={}", response.status());
//!
//!     client
//!         .new_call(Request::get("https://api.example.com/v1/users")?)
//!         .enqueue(|_call, result| match result {
//!             Ok(response) => println!("status={}", response.status()),
//!             Err(error) => eprintln!("failed: {error}"),
//!         })?;
//!     Ok(())
//! }
//! ```

mod auth;
mod cache;
mod call;
mod chain;
mod client;
mod connection;
mod connection_spec;
mod content_encoding;
mod cookie;
mod dispatcher;
mod dns;
mod error;
mod events;
mod executor;
mod pinner;
mod pool;
mod proxy;
mod request;
mod response;
mod route;
mod stages;
mod tls;
mod transport;
mod util;
mod watchdog;

pub use crate::auth::{
    Authenticator, BasicAuthenticator, NoAuthenticator, PREEMPTIVE_CHALLENGE_SCHEME,
    basic_credentials,
};
pub use crate::cache::ResponseCache;
pub use crate::call::Call;
pub use crate::chain::{Chain, Interceptor};
pub use crate::client::{Client, ClientBuilder, ClientConfig};
pub use crate::connection::Connection;
pub use crate::connection_spec::{ConnectionSpec, ConnectionSpecBuilder, TlsVersion};
pub use crate::cookie::{Cookie, CookieJar, NoCookies};
pub use crate::dispatcher::Dispatcher;
pub use crate::dns::{Dns, SystemDns};
pub use crate::error::{Error, ErrorCode, TimeoutPhase, TransportErrorKind};
pub use crate::events::{EventListener, NoopEventListener};
pub use crate::executor::{Executor, Job, RejectedExecution, ThreadPoolExecutor};
pub use crate::pinner::{CertificatePinner, CertificatePinnerBuilder, HashAlgorithm, Pin};
pub use crate::pool::{ConnectionPool, PooledConnection};
pub use crate::proxy::{NoProxySelector, Proxy, ProxySelector, StaticProxySelector};
pub use crate::request::{Request, RequestBuilder};
pub use crate::response::{Challenge, Response, ResponseBuilder, ResponseParts};
pub use crate::route::{Address, Route, RouteDatabase, RouteSelector};
pub use crate::tls::{
    Certificate, ChainCleaner, DefaultHostnameVerifier, Handshake, HostnameVerifier, Protocol,
};
pub use crate::transport::{ConnectOptions, Connector, Shutdown, TlsOptions, Transport};
pub use crate::watchdog::{TimedOut, Timeout, Watchdog};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Authenticator, BasicAuthenticator, Call, CertificatePinner, Chain, Client, ClientBuilder,
        ClientConfig, ConnectOptions, ConnectionSpec, Connector, Dispatcher, Error, ErrorCode,
        Interceptor, Protocol, Proxy, Request, Response, ResponseParts, Route, TimeoutPhase,
        TlsOptions, Transport, TransportErrorKind,
    };
}
