use std::sync::Arc;
use std::time::Duration;

use http::HeaderValue;

use super::{Client, ClientConfig, ClientInner};
use crate::auth::{Authenticator, NoAuthenticator};
use crate::cache::ResponseCache;
use crate::chain::Interceptor;
use crate::connection_spec::ConnectionSpec;
use crate::cookie::{CookieJar, NoCookies};
use crate::dispatcher::Dispatcher;
use crate::dns::{Dns, SystemDns};
use crate::error::Error;
use crate::events::{EventListener, NoopEventListener};
use crate::pinner::CertificatePinner;
use crate::pool::ConnectionPool;
use crate::proxy::{NoProxySelector, Proxy, ProxySelector, StaticProxySelector};
use crate::route::RouteDatabase;
use crate::stages;
use crate::tls::{DefaultHostnameVerifier, HostnameVerifier, Protocol};
use crate::transport::Connector;
use crate::watchdog::Watchdog;

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_USER_AGENT: &str = concat!("callx/", env!("CARGO_PKG_VERSION"));

pub struct ClientBuilder {
    dispatcher: Dispatcher,
    connection_pool: ConnectionPool,
    route_database: Arc<RouteDatabase>,
    watchdog: Watchdog,
    connector: Option<Arc<dyn Connector>>,
    dns: Arc<dyn Dns>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    hostname_verifier: Arc<dyn HostnameVerifier>,
    certificate_pinner: Arc<CertificatePinner>,
    authenticator: Arc<dyn Authenticator>,
    proxy_authenticator: Arc<dyn Authenticator>,
    cookie_jar: Arc<dyn CookieJar>,
    cache: Option<Arc<dyn ResponseCache>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    event_listener: Arc<dyn EventListener>,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    call_timeout: Duration,
    ping_interval: Duration,
    follow_redirects: bool,
    follow_ssl_redirects: bool,
    retry_on_connection_failure: bool,
    protocols: Vec<Protocol>,
    connection_specs: Vec<ConnectionSpec>,
    user_agent: String,
    max_requests: Option<usize>,
    max_requests_per_host: Option<usize>,
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientBuilder")
            .field("has_connector", &self.connector.is_some())
            .field("proxy", &self.proxy)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("call_timeout", &self.call_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("protocols", &self.protocols)
            .field("connection_specs", &self.connection_specs)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            dispatcher: Dispatcher::new(),
            connection_pool: ConnectionPool::default(),
            route_database: Arc::new(RouteDatabase::new()),
            watchdog: Watchdog::global(),
            connector: None,
            dns: Arc::new(SystemDns),
            proxy: None,
            proxy_selector: Arc::new(NoProxySelector),
            hostname_verifier: Arc::new(DefaultHostnameVerifier),
            certificate_pinner: Arc::new(CertificatePinner::default()),
            authenticator: Arc::new(NoAuthenticator),
            proxy_authenticator: Arc::new(NoAuthenticator),
            cookie_jar: Arc::new(NoCookies),
            cache: None,
            interceptors: Vec::new(),
            network_interceptors: Vec::new(),
            event_listener: Arc::new(NoopEventListener),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            call_timeout: Duration::ZERO,
            ping_interval: Duration::ZERO,
            follow_redirects: true,
            follow_ssl_redirects: true,
            retry_on_connection_failure: true,
            protocols: vec![Protocol::Http2, Protocol::Http11],
            connection_specs: vec![ConnectionSpec::modern_tls(), ConnectionSpec::cleartext()],
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            max_requests: None,
            max_requests_per_host: None,
        }
    }

    pub(crate) fn from_client(inner: &ClientInner) -> Self {
        Self {
            dispatcher: inner.dispatcher.clone(),
            connection_pool: inner.connection_pool.clone(),
            route_database: Arc::clone(&inner.route_database),
            watchdog: inner.watchdog.clone(),
            connector: Some(Arc::clone(&inner.connector)),
            dns: Arc::clone(&inner.dns),
            proxy: inner.proxy.clone(),
            proxy_selector: Arc::clone(&inner.proxy_selector),
            hostname_verifier: Arc::clone(&inner.hostname_verifier),
            certificate_pinner: Arc::clone(&inner.certificate_pinner),
            authenticator: Arc::clone(&inner.authenticator),
            proxy_authenticator: Arc::clone(&inner.proxy_authenticator),
            cookie_jar: Arc::clone(&inner.cookie_jar),
            cache: inner.cache.clone(),
            interceptors: inner.interceptors.clone(),
            network_interceptors: inner.network_interceptors.clone(),
            event_listener: Arc::clone(&inner.event_listener),
            connect_timeout: inner.connect_timeout.unwrap_or_default(),
            read_timeout: inner.read_timeout.unwrap_or_default(),
            write_timeout: inner.write_timeout.unwrap_or_default(),
            call_timeout: inner.call_timeout.unwrap_or_default(),
            ping_interval: inner.ping_interval.unwrap_or_default(),
            follow_redirects: inner.follow_redirects,
            follow_ssl_redirects: inner.follow_ssl_redirects,
            retry_on_connection_failure: inner.retry_on_connection_failure,
            protocols: inner.protocols.clone(),
            connection_specs: inner.connection_specs.clone(),
            user_agent: String::from_utf8_lossy(inner.user_agent.as_bytes()).into_owned(),
            max_requests: None,
            max_requests_per_host: None,
        }
    }

    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn connection_pool(mut self, connection_pool: ConnectionPool) -> Self {
        self.connection_pool = connection_pool;
        self
    }

    /// Deadline registry for timeouts. Defaults to [`Watchdog::global`].
    pub fn watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn dns(mut self, dns: Arc<dyn Dns>) -> Self {
        self.dns = dns;
        self
    }

    /// Routes every call through `proxy`, bypassing the proxy selector.
    /// [`Proxy::Direct`] disables proxying.
    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn try_proxy(self, proxy: &str) -> crate::Result<Self> {
        Ok(self.proxy(Proxy::http(proxy)?))
    }

    pub fn proxy_selector(mut self, proxy_selector: Arc<dyn ProxySelector>) -> Self {
        self.proxy = None;
        self.proxy_selector = proxy_selector;
        self
    }

    pub fn hostname_verifier(mut self, hostname_verifier: Arc<dyn HostnameVerifier>) -> Self {
        self.hostname_verifier = hostname_verifier;
        self
    }

    pub fn certificate_pinner(mut self, certificate_pinner: CertificatePinner) -> Self {
        self.certificate_pinner = Arc::new(certificate_pinner);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn proxy_authenticator(mut self, proxy_authenticator: Arc<dyn Authenticator>) -> Self {
        self.proxy_authenticator = proxy_authenticator;
        self
    }

    pub fn cookie_jar(mut self, cookie_jar: Arc<dyn CookieJar>) -> Self {
        self.cookie_jar = cookie_jar;
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn add_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn add_network_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.network_interceptors.push(interceptor);
        self
    }

    pub fn event_listener(mut self, event_listener: Arc<dyn EventListener>) -> Self {
        self.event_listener = event_listener;
        self
    }

    /// Zero disables the timeout.
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Budget for the whole call, redirects and retries included. Zero
    /// disables it.
    pub fn call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    pub fn follow_redirects(mut self, follow_redirects: bool) -> Self {
        self.follow_redirects = follow_redirects;
        self
    }

    /// Whether redirects may switch between `http` and `https`.
    pub fn follow_ssl_redirects(mut self, follow_ssl_redirects: bool) -> Self {
        self.follow_ssl_redirects = follow_ssl_redirects;
        self
    }

    pub fn retry_on_connection_failure(mut self, retry_on_connection_failure: bool) -> Self {
        self.retry_on_connection_failure = retry_on_connection_failure;
        self
    }

    pub fn protocols(mut self, protocols: impl IntoIterator<Item = Protocol>) -> Self {
        self.protocols = protocols.into_iter().collect();
        self
    }

    /// TLS specs are tried in order; `http` URLs need
    /// [`ConnectionSpec::cleartext`] in the list.
    pub fn connection_specs(
        mut self,
        connection_specs: impl IntoIterator<Item = ConnectionSpec>,
    ) -> Self {
        self.connection_specs = connection_specs.into_iter().collect();
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Applies every override present in `config`.
    pub fn config(mut self, config: &ClientConfig) -> crate::Result<Self> {
        if let Some(timeout) = config.connect_timeout() {
            self.connect_timeout = timeout;
        }
        if let Some(timeout) = config.read_timeout() {
            self.read_timeout = timeout;
        }
        if let Some(timeout) = config.write_timeout() {
            self.write_timeout = timeout;
        }
        if let Some(timeout) = config.call_timeout() {
            self.call_timeout = timeout;
        }
        if let Some(interval) = config.ping_interval() {
            self.ping_interval = interval;
        }
        if let Some(follow_redirects) = config.follow_redirects {
            self.follow_redirects = follow_redirects;
        }
        if let Some(follow_ssl_redirects) = config.follow_ssl_redirects {
            self.follow_ssl_redirects = follow_ssl_redirects;
        }
        if let Some(retry) = config.retry_on_connection_failure {
            self.retry_on_connection_failure = retry;
        }
        if let Some(protocols) = &config.protocols {
            self.protocols = protocols
                .iter()
                .map(|id| {
                    Protocol::from_alpn(id)
                        .ok_or_else(|| Error::invalid_config(format!("unknown protocol: {id}")))
                })
                .collect::<crate::Result<Vec<_>>>()?;
        }
        if let Some(user_agent) = &config.user_agent {
            self.user_agent = user_agent.clone();
        }

        match (&config.proxy, &config.no_proxy) {
            (Some(proxy), Some(rules)) => {
                let selector = StaticProxySelector::new(Proxy::http(proxy)?).try_no_proxy(rules)?;
                self = self.proxy_selector(Arc::new(selector));
            }
            (Some(proxy), None) => self = self.try_proxy(proxy)?,
            (None, Some(_)) => {
                return Err(Error::invalid_config("no_proxy requires a proxy"));
            }
            (None, None) => {}
        }

        if config.max_requests.is_some() {
            self.max_requests = config.max_requests;
        }
        if config.max_requests_per_host.is_some() {
            self.max_requests_per_host = config.max_requests_per_host;
        }
        if config.max_idle_connections.is_some() || config.keep_alive_ms.is_some() {
            self.connection_pool = ConnectionPool::new(
                config
                    .max_idle_connections
                    .unwrap_or(self.connection_pool.max_idle_connections()),
                config
                    .keep_alive()
                    .unwrap_or(self.connection_pool.keep_alive()),
            );
        }
        Ok(self)
    }

    pub fn build(self) -> crate::Result<Client> {
        let Some(connector) = self.connector else {
            return Err(Error::invalid_config("a connector is required"));
        };
        let connect_timeout = checked_timeout("connect_timeout", self.connect_timeout)?;
        let read_timeout = checked_timeout("read_timeout", self.read_timeout)?;
        let write_timeout = checked_timeout("write_timeout", self.write_timeout)?;
        let call_timeout = checked_timeout("call_timeout", self.call_timeout)?;
        let ping_interval = checked_timeout("ping_interval", self.ping_interval)?;
        let protocols = checked_protocols(self.protocols)?;
        let connection_specs = checked_connection_specs(self.connection_specs)?;
        let user_agent = HeaderValue::from_str(&self.user_agent).map_err(|_| {
            Error::invalid_config(format!("invalid user agent: {:?}", self.user_agent))
        })?;

        if let Some(max_requests) = self.max_requests {
            self.dispatcher.set_max_requests(max_requests)?;
        }
        if let Some(max_requests_per_host) = self.max_requests_per_host {
            self.dispatcher
                .set_max_requests_per_host(max_requests_per_host)?;
        }

        let (stages, network_from) =
            stages::assemble(&self.interceptors, &self.network_interceptors);
        Ok(Client::from_inner(ClientInner {
            dispatcher: self.dispatcher,
            connection_pool: self.connection_pool,
            route_database: self.route_database,
            watchdog: self.watchdog,
            connector,
            dns: self.dns,
            proxy: self.proxy,
            proxy_selector: self.proxy_selector,
            hostname_verifier: self.hostname_verifier,
            certificate_pinner: self.certificate_pinner,
            authenticator: self.authenticator,
            proxy_authenticator: self.proxy_authenticator,
            cookie_jar: self.cookie_jar,
            cache: self.cache,
            interceptors: self.interceptors,
            network_interceptors: self.network_interceptors,
            event_listener: self.event_listener,
            connect_timeout,
            read_timeout,
            write_timeout,
            call_timeout,
            ping_interval,
            follow_redirects: self.follow_redirects,
            follow_ssl_redirects: self.follow_ssl_redirects,
            retry_on_connection_failure: self.retry_on_connection_failure,
            protocols,
            connection_specs,
            user_agent,
            stages,
            network_from,
        }))
    }
}

/// Zero means no timeout. Anything else must be whole milliseconds between
/// 1 ms and `u32::MAX` ms.
fn checked_timeout(name: &str, timeout: Duration) -> crate::Result<Option<Duration>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    if timeout < Duration::from_millis(1) {
        return Err(Error::invalid_config(format!("{name} too small: {timeout:?}")));
    }
    if timeout.as_millis() > u128::from(u32::MAX) {
        return Err(Error::invalid_config(format!("{name} too large: {timeout:?}")));
    }
    Ok(Some(timeout))
}

fn checked_connection_specs(specs: Vec<ConnectionSpec>) -> crate::Result<Vec<ConnectionSpec>> {
    let mut unique = Vec::with_capacity(specs.len());
    for spec in specs {
        if !unique.contains(&spec) {
            unique.push(spec);
        }
    }
    if unique.is_empty() {
        return Err(Error::invalid_config("connection_specs must not be empty"));
    }
    Ok(unique)
}

fn checked_protocols(protocols: Vec<Protocol>) -> crate::Result<Vec<Protocol>> {
    let mut unique = Vec::with_capacity(protocols.len());
    for protocol in protocols {
        if !unique.contains(&protocol) {
            unique.push(protocol);
        }
    }
    if unique.contains(&Protocol::Http10) {
        return Err(Error::invalid_config("protocols must not contain http/1.0"));
    }
    if unique.contains(&Protocol::H2PriorKnowledge) {
        if unique.len() != 1 {
            return Err(Error::invalid_config(
                "h2_prior_knowledge cannot be combined with other protocols",
            ));
        }
        return Ok(unique);
    }
    if !unique.contains(&Protocol::Http11) {
        return Err(Error::invalid_config("protocols must contain http/1.1"));
    }
    Ok(unique)
}
