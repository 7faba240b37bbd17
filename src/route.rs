use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashSet;
use tracing::debug;
use url::Url;

use crate::auth::Authenticator;
use crate::connection_spec::ConnectionSpec;
use crate::dns::{self, Dns};
use crate::error::{Error, TransportErrorKind};
use crate::pinner::CertificatePinner;
use crate::proxy::{Proxy, ProxySelector};
use crate::tls::{HostnameVerifier, Protocol};
use crate::transport::Connector;
use crate::util::same_arc;

/// Everything that decides whether a pooled connection can serve a request.
///
/// Path and query never take part. Collaborators compare by identity, so two
/// clients only share connections when they share the same collaborator
/// instances.
#[derive(Clone)]
pub struct Address {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) https: bool,
    pub(crate) dns: Arc<dyn Dns>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) proxy: Option<Proxy>,
    pub(crate) proxy_selector: Arc<dyn ProxySelector>,
    pub(crate) proxy_authenticator: Arc<dyn Authenticator>,
    pub(crate) hostname_verifier: Option<Arc<dyn HostnameVerifier>>,
    pub(crate) certificate_pinner: Option<Arc<CertificatePinner>>,
    pub(crate) protocols: Vec<Protocol>,
    pub(crate) connection_specs: Vec<ConnectionSpec>,
}

impl std::fmt::Debug for Address {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Address")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("https", &self.https)
            .field("proxy", &self.proxy)
            .field("protocols", &self.protocols)
            .field("connection_specs", &self.connection_specs)
            .finish_non_exhaustive()
    }
}

fn same_optional_arc<T: ?Sized>(left: &Option<Arc<T>>, right: &Option<Arc<T>>) -> bool {
    match (left, right) {
        (Some(left), Some(right)) => same_arc(left, right),
        (None, None) => true,
        _ => false,
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.host.eq_ignore_ascii_case(&other.host)
            && self.port == other.port
            && self.https == other.https
            && same_arc(&self.dns, &other.dns)
            && same_arc(&self.connector, &other.connector)
            && self.proxy == other.proxy
            && same_arc(&self.proxy_selector, &other.proxy_selector)
            && same_arc(&self.proxy_authenticator, &other.proxy_authenticator)
            && same_optional_arc(&self.hostname_verifier, &other.hostname_verifier)
            && match (&self.certificate_pinner, &other.certificate_pinner) {
                (Some(left), Some(right)) => Arc::ptr_eq(left, right) || left == right,
                (None, None) => true,
                _ => false,
            }
            && self.protocols == other.protocols
            && self.connection_specs == other.connection_specs
    }
}

impl Eq for Address {}

impl Address {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_https(&self) -> bool {
        self.https
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    pub fn connection_specs(&self) -> &[ConnectionSpec] {
        &self.connection_specs
    }

    pub(crate) fn url(&self) -> Option<Url> {
        let scheme = if self.https { "https" } else { "http" };
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        Url::parse(&format!("{scheme}://{host}:{}/", self.port)).ok()
    }
}

/// A concrete path to an origin: address, proxy and socket address.
#[derive(Clone, Debug)]
pub struct Route {
    address: Address,
    proxy: Proxy,
    socket_addr: SocketAddr,
}

impl Route {
    pub fn new(address: Address, proxy: Proxy, socket_addr: SocketAddr) -> Self {
        Self {
            address,
            proxy,
            socket_addr,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// HTTPS through an HTTP proxy needs a CONNECT tunnel.
    pub fn requires_tunnel(&self) -> bool {
        self.address.https && !self.proxy.is_direct()
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.proxy == other.proxy
            && self.socket_addr == other.socket_addr
    }
}

impl Eq for Route {}

impl Hash for Route {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.host.to_ascii_lowercase().hash(state);
        self.address.port.hash(state);
        self.address.https.hash(state);
        self.proxy.hash(state);
        self.socket_addr.hash(state);
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "{}:{} via {} ({})",
            self.address.host, self.address.port, self.proxy, self.socket_addr
        )
    }
}

/// Routes that recently failed to connect. Selection tries them last.
#[derive(Debug, Default)]
pub struct RouteDatabase {
    failed: DashSet<Route>,
}

impl RouteDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failed(&self, route: &Route) {
        self.failed.insert(route.clone());
    }

    pub fn connected(&self, route: &Route) {
        self.failed.remove(route);
    }

    pub fn should_postpone(&self, route: &Route) -> bool {
        self.failed.contains(route)
    }

    pub fn len(&self) -> usize {
        self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Yields candidate routes for one address, one proxy at a time. Routes the
/// database marks as failed are held back until every other candidate has
/// been offered.
pub struct RouteSelector {
    address: Address,
    url: Url,
    route_database: Arc<RouteDatabase>,
    proxies: Vec<Proxy>,
    next_proxy_index: usize,
    current: VecDeque<Route>,
    postponed: Vec<Route>,
}

impl std::fmt::Debug for RouteSelector {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RouteSelector")
            .field("address", &self.address)
            .field("proxies", &self.proxies)
            .field("next_proxy_index", &self.next_proxy_index)
            .field("current", &self.current.len())
            .field("postponed", &self.postponed.len())
            .finish()
    }
}

impl RouteSelector {
    pub fn new(address: Address, url: Url, route_database: Arc<RouteDatabase>) -> Self {
        let proxies = match &address.proxy {
            Some(proxy) => vec![proxy.clone()],
            None => {
                let selected = address.proxy_selector.select(&url);
                if selected.is_empty() {
                    vec![Proxy::Direct]
                } else {
                    selected
                }
            }
        };
        Self {
            address,
            url,
            route_database,
            proxies,
            next_proxy_index: 0,
            current: VecDeque::new(),
            postponed: Vec::new(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn has_next(&self) -> bool {
        !self.current.is_empty()
            || self.next_proxy_index < self.proxies.len()
            || !self.postponed.is_empty()
    }

    pub fn next_route(&mut self) -> crate::Result<Option<Route>> {
        loop {
            if let Some(route) = self.current.pop_front() {
                return Ok(Some(route));
            }
            if self.next_proxy_index < self.proxies.len() {
                let proxy = self.proxies[self.next_proxy_index].clone();
                self.next_proxy_index += 1;
                self.resolve_proxy(proxy)?;
                continue;
            }
            if self.postponed.is_empty() {
                return Ok(None);
            }
            self.current.extend(self.postponed.drain(..));
        }
    }

    /// Records a connect failure and tells the proxy selector about it.
    pub fn connect_failed(&self, route: &Route, error: &io::Error) {
        if !route.proxy().is_direct() {
            self.address
                .proxy_selector
                .connect_failed(&self.url, route.proxy(), error);
        }
        self.route_database.failed(route);
    }

    fn resolve_proxy(&mut self, proxy: Proxy) -> crate::Result<()> {
        let (host, port) = match &proxy {
            Proxy::Direct => (self.address.host.clone(), self.address.port),
            Proxy::Http { host, port } => (host.clone(), *port),
        };
        let addresses =
            dns::resolve(self.address.dns.as_ref(), &host).map_err(|source| Error::Connect {
                kind: TransportErrorKind::Dns,
                route: format!("{host}:{port} via {proxy}"),
                source: Box::new(source),
            })?;
        debug!(
            host = %host,
            port,
            proxy = %proxy,
            candidates = addresses.len(),
            "resolved route candidates"
        );
        for ip in addresses {
            let route = Route::new(self.address.clone(), proxy.clone(), SocketAddr::new(ip, port));
            if self.route_database.should_postpone(&route) {
                self.postponed.push(route);
            } else {
                self.current.push_back(route);
            }
        }
        Ok(())
    }
}
