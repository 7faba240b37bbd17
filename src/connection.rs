use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use http::header::{CONNECTION, HOST, PROXY_AUTHENTICATE, USER_AGENT};
use http::{HeaderValue, Method, StatusCode};
use tracing::debug;

use crate::auth::PREEMPTIVE_CHALLENGE_SCHEME;
use crate::call::Call;
use crate::connection_spec::{ConnectionSpec, ConnectionSpecSelector};
use crate::error::{Error, TimeoutPhase, TransportErrorKind};
use crate::request::Request;
use crate::response::Response;
use crate::route::Route;
use crate::tls::{DefaultHostnameVerifier, Handshake, HostnameVerifier, Protocol};
use crate::transport::{ConnectOptions, Shutdown, TlsOptions, Transport};
use crate::util::{duration_millis, header_has_token, lock_unpoisoned, redact_url_for_logs};
use crate::watchdog::Watchdog;

const MAX_TUNNEL_ATTEMPTS: usize = 21;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Timeouts and collaborators used while a connection is being set up.
#[derive(Clone, Debug)]
pub(crate) struct EstablishOptions {
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) ping_interval: Option<Duration>,
    pub(crate) user_agent: HeaderValue,
    pub(crate) watchdog: Watchdog,
    pub(crate) retry_on_connection_failure: bool,
    /// Receives the shutdown handle of every raw transport opened, so a
    /// cancel interrupts connection setup too.
    pub(crate) call: Option<Call>,
}

impl EstablishOptions {
    fn is_canceled(&self) -> bool {
        self.call.as_ref().is_some_and(Call::is_canceled)
    }

    fn register(&self, transport: &dyn Transport) {
        if let Some(call) = &self.call {
            call.set_active_transport(Some(transport.shutdown_handle()));
        }
    }
}

/// An established transport bound to one route.
pub struct Connection {
    id: u64,
    route: Route,
    transport: Mutex<Box<dyn Transport>>,
    shutdown: Arc<dyn Shutdown>,
    handshake: Option<Handshake>,
    protocol: Protocol,
    no_new_exchanges: AtomicBool,
    exchanges: AtomicUsize,
    created_at: Instant,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Connection")
            .field("id", &self.id)
            .field("route", &self.route.to_string())
            .field("protocol", &self.protocol)
            .field("no_new_exchanges", &self.no_new_exchanges())
            .finish()
    }
}

impl Connection {
    pub(crate) fn establish(
        route: &Route,
        options: &EstablishOptions,
        request: &Request,
    ) -> crate::Result<Self> {
        let address = route.address();
        check_service(route)?;
        let connect_options = ConnectOptions {
            connect_timeout: options.connect_timeout,
            ping_interval: options.ping_interval,
        };
        let mut specs = ConnectionSpecSelector::new(&address.connection_specs);

        loop {
            let mut transport = open_socket(route, &connect_options, options, request)?;
            if route.requires_tunnel() {
                transport = establish_tunnel(route, transport, &connect_options, options, request)?;
            }
            let shutdown = transport.shutdown_handle();
            if !address.https {
                return Ok(Self::established(route, transport, None, cleartext_protocol(route)));
            }

            let Some(spec) = specs.next_spec() else {
                shutdown.shutdown();
                return Err(Error::UnknownService {
                    host: address.host.clone(),
                    message: "no tls connection spec left to try".to_owned(),
                });
            };
            let tls = TlsOptions {
                host: &address.host,
                protocols: &address.protocols,
                spec,
                is_fallback: specs.is_fallback(),
            };
            let handshake = guarded(&options.watchdog, options.read_timeout, &shutdown, || {
                transport.start_tls(&tls)
            });
            match handshake {
                Ok(handshake) => {
                    if let Err(error) = verify_peer(route, &handshake) {
                        shutdown.shutdown();
                        return Err(error);
                    }
                    let protocol = handshake.protocol().unwrap_or(Protocol::Http11);
                    return Ok(Self::established(route, transport, Some(handshake), protocol));
                }
                Err(source) => {
                    shutdown.shutdown();
                    let fallback = options.retry_on_connection_failure
                        && !options.is_canceled()
                        && specs.connection_failed(&source);
                    let error = handshake_error(route, options, request, source);
                    if !fallback {
                        return Err(error);
                    }
                    debug!(
                        route = %route,
                        spec = %spec,
                        error = %error,
                        "tls handshake failed, retrying with next connection spec"
                    );
                    if let Some(call) = &options.call {
                        call.client()
                            .event_listener()
                            .connect_failed(call, route, &error);
                    }
                }
            }
        }
    }

    fn established(
        route: &Route,
        transport: Box<dyn Transport>,
        handshake: Option<Handshake>,
        protocol: Protocol,
    ) -> Self {
        let connection = Self::from_parts(route.clone(), transport, handshake, protocol);
        debug!(
            connection_id = connection.id,
            route = %route,
            protocol = %protocol,
            "connection established"
        );
        connection
    }

    pub(crate) fn from_parts(
        route: Route,
        transport: Box<dyn Transport>,
        handshake: Option<Handshake>,
        protocol: Protocol,
    ) -> Self {
        let shutdown = transport.shutdown_handle();
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            route,
            transport: Mutex::new(transport),
            shutdown,
            handshake,
            protocol,
            no_new_exchanges: AtomicBool::new(false),
            exchanges: AtomicUsize::new(0),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Exchanges started on this connection so far.
    pub fn exchange_count(&self) -> usize {
        self.exchanges.load(Ordering::Acquire)
    }

    pub fn no_new_exchanges(&self) -> bool {
        self.no_new_exchanges.load(Ordering::Acquire)
    }

    /// Prevents reuse. The connection closes when it is next released.
    pub fn mark_no_new_exchanges(&self) {
        self.no_new_exchanges.store(true, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        !self.no_new_exchanges() && lock_unpoisoned(&self.transport).is_healthy()
    }

    pub(crate) fn shutdown_handle(&self) -> Arc<dyn Shutdown> {
        Arc::clone(&self.shutdown)
    }

    pub(crate) fn close(&self) {
        self.mark_no_new_exchanges();
        self.shutdown.shutdown();
    }

    pub(crate) fn begin_exchange(&self) -> MutexGuard<'_, Box<dyn Transport>> {
        self.exchanges.fetch_add(1, Ordering::AcqRel);
        lock_unpoisoned(&self.transport)
    }
}

/// Runs a blocking transport operation under a watchdog node that force-closes
/// the transport when `timeout` passes.
pub(crate) fn guarded<T, F>(
    watchdog: &Watchdog,
    timeout: Option<Duration>,
    shutdown: &Arc<dyn Shutdown>,
    op: F,
) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T>,
{
    let Some(timeout) = timeout else {
        return op();
    };
    let handle = Arc::clone(shutdown);
    watchdog
        .timeout(move || handle.shutdown())
        .with_timeout(timeout)
        .run(op)
}

fn open_socket(
    route: &Route,
    connect_options: &ConnectOptions,
    options: &EstablishOptions,
    request: &Request,
) -> crate::Result<Box<dyn Transport>> {
    let transport = route
        .address()
        .connector
        .connect(route, connect_options)
        .map_err(|source| {
            if source.kind() == io::ErrorKind::TimedOut {
                Error::Timeout {
                    phase: TimeoutPhase::Connect,
                    timeout_ms: duration_millis(options.connect_timeout),
                    method: request.method().clone(),
                    uri: redact_url_for_logs(request.url()),
                    source: Some(Box::new(source)),
                }
            } else {
                Error::Connect {
                    kind: TransportErrorKind::Connect,
                    route: route.to_string(),
                    source: Box::new(source),
                }
            }
        })?;
    options.register(transport.as_ref());
    Ok(transport)
}

fn tunnel_target(route: &Route) -> String {
    let address = route.address();
    if address.host.contains(':') {
        format!("[{}]:{}", address.host, address.port)
    } else {
        format!("{}:{}", address.host, address.port)
    }
}

fn tunnel_request(route: &Route, options: &EstablishOptions) -> crate::Result<Request> {
    let target = tunnel_target(route);
    let url = route.address().url().ok_or_else(|| Error::ProxyTunnel {
        target: target.clone(),
        message: "tunnel target is not a valid url".to_owned(),
    })?;
    let host = crate::util::parse_header_value(HOST.as_str(), &target)?;
    Request::builder()
        .url(url)
        .method(Method::CONNECT, None)
        .set_header(HOST, host)
        .set_header(
            http::header::HeaderName::from_static("proxy-connection"),
            HeaderValue::from_static("Keep-Alive"),
        )
        .set_header(USER_AGENT, options.user_agent.clone())
        .build()
}

/// Offers the proxy authenticator a synthetic `407` so it can attach
/// credentials before the first CONNECT.
fn preemptive_tunnel_request(route: &Route, request: Request) -> crate::Result<Request> {
    let challenge = Response::builder(request.clone())
        .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
        .try_header(PROXY_AUTHENTICATE.as_str(), PREEMPTIVE_CHALLENGE_SCHEME)?
        .build();
    let authenticated = route
        .address()
        .proxy_authenticator
        .authenticate(Some(route), &challenge)?;
    Ok(authenticated.unwrap_or(request))
}

enum TunnelOutcome {
    Established,
    /// The proxy closed the connection; retry on a fresh socket.
    Reconnect(Request),
}

fn establish_tunnel(
    route: &Route,
    mut transport: Box<dyn Transport>,
    connect_options: &ConnectOptions,
    options: &EstablishOptions,
    request: &Request,
) -> crate::Result<Box<dyn Transport>> {
    let mut tunnel = preemptive_tunnel_request(route, tunnel_request(route, options)?)?;
    for attempt in 1..=MAX_TUNNEL_ATTEMPTS {
        let shutdown = transport.shutdown_handle();
        match create_tunnel(route, transport.as_mut(), &shutdown, tunnel, options) {
            Ok(TunnelOutcome::Established) => return Ok(transport),
            Ok(TunnelOutcome::Reconnect(next)) => {
                debug!(attempt, route = %route, "proxy closed tunnel connection, reconnecting");
                shutdown.shutdown();
                tunnel = next;
                transport = open_socket(route, connect_options, options, request)?;
            }
            Err(error) => {
                shutdown.shutdown();
                return Err(error);
            }
        }
    }
    transport.shutdown_handle().shutdown();
    Err(Error::ProxyTunnel {
        target: tunnel_target(route),
        message: format!("too many tunnel connections attempted: {MAX_TUNNEL_ATTEMPTS}"),
    })
}

fn create_tunnel(
    route: &Route,
    transport: &mut dyn Transport,
    shutdown: &Arc<dyn Shutdown>,
    mut tunnel: Request,
    options: &EstablishOptions,
) -> crate::Result<TunnelOutcome> {
    let target = tunnel_target(route);
    let tunnel_io_error = |kind: TransportErrorKind, source: io::Error| Error::Connect {
        kind,
        route: route.to_string(),
        source: Box::new(source),
    };
    loop {
        guarded(&options.watchdog, options.write_timeout, shutdown, || {
            transport.write_request(&tunnel)
        })
        .map_err(|source| tunnel_io_error(TransportErrorKind::Write, source))?;
        let parts = guarded(&options.watchdog, options.read_timeout, shutdown, || {
            transport.read_response()
        })
        .map_err(|source| tunnel_io_error(TransportErrorKind::Read, source))?;

        match parts.status {
            StatusCode::OK => return Ok(TunnelOutcome::Established),
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                let close = header_has_token(&parts.headers, CONNECTION, "close");
                let response = Response::builder(tunnel).parts(parts).build();
                let next = route
                    .address()
                    .proxy_authenticator
                    .authenticate(Some(route), &response)?
                    .ok_or_else(|| Error::ProxyTunnel {
                        target: target.clone(),
                        message: "failed to authenticate with proxy".to_owned(),
                    })?;
                if close {
                    return Ok(TunnelOutcome::Reconnect(next));
                }
                tunnel = next;
            }
            status => {
                return Err(Error::ProxyTunnel {
                    target,
                    message: format!("unexpected response code for CONNECT: {}", status.as_u16()),
                });
            }
        }
    }
}

/// Rejects routes the configured connection specs and protocols cannot
/// serve before any socket is opened.
fn check_service(route: &Route) -> crate::Result<()> {
    let address = route.address();
    let unknown_service = |message: &str| Error::UnknownService {
        host: address.host.clone(),
        message: message.to_owned(),
    };
    if address.https {
        if address.protocols.contains(&Protocol::H2PriorKnowledge) {
            return Err(unknown_service("h2_prior_knowledge cannot be used with https"));
        }
        if !address.connection_specs.iter().any(ConnectionSpec::is_tls) {
            return Err(unknown_service("tls communication not enabled for client"));
        }
    } else if !address.connection_specs.contains(&ConnectionSpec::cleartext()) {
        return Err(unknown_service("cleartext communication not enabled for client"));
    }
    Ok(())
}

fn cleartext_protocol(route: &Route) -> Protocol {
    if route.address().protocols == [Protocol::H2PriorKnowledge] {
        Protocol::H2PriorKnowledge
    } else {
        Protocol::Http11
    }
}

fn handshake_error(
    route: &Route,
    options: &EstablishOptions,
    request: &Request,
    source: io::Error,
) -> Error {
    if source.kind() == io::ErrorKind::TimedOut {
        Error::Timeout {
            phase: TimeoutPhase::Connect,
            timeout_ms: duration_millis(options.read_timeout),
            method: request.method().clone(),
            uri: redact_url_for_logs(request.url()),
            source: Some(Box::new(source)),
        }
    } else {
        Error::Connect {
            kind: TransportErrorKind::Tls,
            route: route.to_string(),
            source: Box::new(source),
        }
    }
}

fn verify_peer(route: &Route, handshake: &Handshake) -> crate::Result<()> {
    let address = route.address();
    let verified = match &address.hostname_verifier {
        Some(verifier) => verifier.verify(&address.host, handshake),
        None => DefaultHostnameVerifier.verify(&address.host, handshake),
    };
    if !verified {
        return Err(Error::PeerUnverified {
            host: address.host.clone(),
        });
    }
    if let Some(pinner) = &address.certificate_pinner {
        pinner.check(&address.host, handshake.peer_certificates())?;
    }
    Ok(())
}
