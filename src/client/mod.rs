use std::sync::Arc;
use std::time::Duration;

use http::HeaderValue;
use url::Url;

use crate::auth::Authenticator;
use crate::cache::ResponseCache;
use crate::call::Call;
use crate::chain::Interceptor;
use crate::connection_spec::ConnectionSpec;
use crate::cookie::CookieJar;
use crate::dispatcher::Dispatcher;
use crate::dns::Dns;
use crate::error::Error;
use crate::events::EventListener;
use crate::pinner::CertificatePinner;
use crate::pool::ConnectionPool;
use crate::proxy::{Proxy, ProxySelector};
use crate::request::Request;
use crate::route::{Address, RouteDatabase};
use crate::tls::{HostnameVerifier, Protocol};
use crate::transport::Connector;
use crate::util::redact_url_for_logs;
use crate::watchdog::Watchdog;

mod builder;
mod config;

pub use builder::ClientBuilder;
pub use config::ClientConfig;

pub(crate) struct ClientInner {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) connection_pool: ConnectionPool,
    pub(crate) route_database: Arc<RouteDatabase>,
    pub(crate) watchdog: Watchdog,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) dns: Arc<dyn Dns>,
    pub(crate) proxy: Option<Proxy>,
    pub(crate) proxy_selector: Arc<dyn ProxySelector>,
    pub(crate) hostname_verifier: Arc<dyn HostnameVerifier>,
    pub(crate) certificate_pinner: Arc<CertificatePinner>,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) proxy_authenticator: Arc<dyn Authenticator>,
    pub(crate) cookie_jar: Arc<dyn CookieJar>,
    pub(crate) cache: Option<Arc<dyn ResponseCache>>,
    pub(crate) interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) network_interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) event_listener: Arc<dyn EventListener>,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) call_timeout: Option<Duration>,
    pub(crate) ping_interval: Option<Duration>,
    pub(crate) follow_redirects: bool,
    pub(crate) follow_ssl_redirects: bool,
    pub(crate) retry_on_connection_failure: bool,
    pub(crate) protocols: Vec<Protocol>,
    pub(crate) connection_specs: Vec<ConnectionSpec>,
    pub(crate) user_agent: HeaderValue,
    pub(crate) stages: Arc<[Arc<dyn Interceptor>]>,
    pub(crate) network_from: usize,
}

/// Factory for calls. Cheap to clone; clones share every collaborator.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = &self.inner;
        formatter
            .debug_struct("Client")
            .field("dispatcher", &inner.dispatcher)
            .field("connection_pool", &inner.connection_pool)
            .field("proxy", &inner.proxy)
            .field("connect_timeout", &inner.connect_timeout)
            .field("read_timeout", &inner.read_timeout)
            .field("write_timeout", &inner.write_timeout)
            .field("call_timeout", &inner.call_timeout)
            .field("ping_interval", &inner.ping_interval)
            .field("follow_redirects", &inner.follow_redirects)
            .field("follow_ssl_redirects", &inner.follow_ssl_redirects)
            .field("retry_on_connection_failure", &inner.retry_on_connection_failure)
            .field("protocols", &inner.protocols)
            .field("connection_specs", &inner.connection_specs)
            .field("user_agent", &inner.user_agent)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn from_inner(inner: ClientInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn new_call(&self, request: Request) -> Call {
        Call::new(self.clone(), request)
    }

    /// A builder seeded with this client's settings. Clients built from it
    /// share the dispatcher, connection pool, route database and watchdog.
    pub fn to_builder(&self) -> ClientBuilder {
        ClientBuilder::from_client(&self.inner)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.inner.connection_pool
    }

    pub fn route_database(&self) -> Arc<RouteDatabase> {
        Arc::clone(&self.inner.route_database)
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.inner.watchdog
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        self.inner.proxy.as_ref()
    }

    pub fn certificate_pinner(&self) -> &CertificatePinner {
        &self.inner.certificate_pinner
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.inner.authenticator
    }

    pub fn proxy_authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.inner.proxy_authenticator
    }

    pub fn cookie_jar(&self) -> &Arc<dyn CookieJar> {
        &self.inner.cookie_jar
    }

    pub fn cache(&self) -> Option<&Arc<dyn ResponseCache>> {
        self.inner.cache.as_ref()
    }

    pub fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.inner.interceptors
    }

    pub fn network_interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.inner.network_interceptors
    }

    pub fn event_listener(&self) -> &Arc<dyn EventListener> {
        &self.inner.event_listener
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.inner.connect_timeout
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.inner.read_timeout
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.inner.write_timeout
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.inner.call_timeout
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.inner.ping_interval
    }

    pub fn follow_redirects(&self) -> bool {
        self.inner.follow_redirects
    }

    pub fn follow_ssl_redirects(&self) -> bool {
        self.inner.follow_ssl_redirects
    }

    pub fn retry_on_connection_failure(&self) -> bool {
        self.inner.retry_on_connection_failure
    }

    pub fn protocols(&self) -> &[Protocol] {
        &self.inner.protocols
    }

    pub fn connection_specs(&self) -> &[ConnectionSpec] {
        &self.inner.connection_specs
    }

    pub fn user_agent(&self) -> &HeaderValue {
        &self.inner.user_agent
    }

    pub(crate) fn stages(&self) -> (Arc<[Arc<dyn Interceptor>]>, usize) {
        (Arc::clone(&self.inner.stages), self.inner.network_from)
    }

    /// The pooling key for `url`. TLS collaborators only take part for
    /// `https` URLs.
    pub(crate) fn address(&self, url: &Url) -> crate::Result<Address> {
        let inner = &self.inner;
        let Some(host) = url.host_str().filter(|host| !host.is_empty()) else {
            return Err(Error::InvalidUrl {
                url: redact_url_for_logs(url),
            });
        };
        let Some(port) = url.port_or_known_default() else {
            return Err(Error::InvalidUrl {
                url: redact_url_for_logs(url),
            });
        };
        let https = url.scheme().eq_ignore_ascii_case("https");
        Ok(Address {
            host: host.trim_start_matches('[').trim_end_matches(']').to_owned(),
            port,
            https,
            dns: Arc::clone(&inner.dns),
            connector: Arc::clone(&inner.connector),
            proxy: inner.proxy.clone(),
            proxy_selector: Arc::clone(&inner.proxy_selector),
            proxy_authenticator: Arc::clone(&inner.proxy_authenticator),
            hostname_verifier: https.then(|| Arc::clone(&inner.hostname_verifier)),
            certificate_pinner: https.then(|| Arc::clone(&inner.certificate_pinner)),
            protocols: inner.protocols.clone(),
            connection_specs: inner.connection_specs.clone(),
        })
    }
}
