#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use callx::{
    Certificate, Client, ClientBuilder, ConnectOptions, ConnectionSpec, Connector, Dns, Handshake,
    Protocol, Request, ResponseParts, Route, Shutdown, TlsOptions, Transport,
};
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// What the scripted server does with one request.
pub enum Reply {
    Respond(ResponseParts),
    /// Blocks until the transport is shut down.
    Stall,
    /// Blocks for the given duration, then responds.
    Delay(Duration, ResponseParts),
    Fail(io::ErrorKind),
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self::Respond(parts(status))
    }

    pub fn text(status: u16, body: &str) -> Self {
        let mut parts = parts(status);
        parts.body = body.as_bytes().to_vec().into();
        Self::Respond(parts)
    }

    pub fn with_header(self, name: &'static str, value: &str) -> Self {
        match self {
            Self::Respond(mut parts) => {
                parts.headers.append(
                    HeaderName::from_static(name),
                    HeaderValue::from_str(value).expect("test header value should be valid"),
                );
                Self::Respond(parts)
            }
            other => other,
        }
    }

    pub fn with_body(self, body: Vec<u8>) -> Self {
        match self {
            Self::Respond(mut parts) => {
                parts.body = body.into();
                Self::Respond(parts)
            }
            other => other,
        }
    }
}

pub fn parts(status: u16) -> ResponseParts {
    ResponseParts::new(StatusCode::from_u16(status).expect("test status should be valid"))
}

type Handler = dyn Fn(&Request) -> Reply + Send + Sync;

#[derive(Default)]
struct Script {
    refused: HashMap<SocketAddr, io::ErrorKind>,
    certificates: Vec<Certificate>,
    requests: Vec<Request>,
    connects: Vec<SocketAddr>,
    tls_hosts: Vec<String>,
    tls_attempts: Vec<TlsAttempt>,
    handshake_failures: VecDeque<io::ErrorKind>,
    stall_handshakes: bool,
}

/// One `start_tls` call as the server saw it.
#[derive(Clone, Debug)]
pub struct TlsAttempt {
    pub host: String,
    pub spec: ConnectionSpec,
    pub is_fallback: bool,
}

/// An in-memory network. Every connection feeds requests to one handler.
pub struct MockNetwork {
    handler: Box<Handler>,
    script: Mutex<Script>,
    open_transports: AtomicUsize,
}

impl MockNetwork {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            script: Mutex::new(Script::default()),
            open_transports: AtomicUsize::new(0),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            network: Arc::clone(self),
        })
    }

    pub fn refuse(&self, socket_addr: SocketAddr, kind: io::ErrorKind) {
        lock(&self.script).refused.insert(socket_addr, kind);
    }

    pub fn set_certificates(&self, certificates: Vec<Certificate>) {
        lock(&self.script).certificates = certificates;
    }

    pub fn requests(&self) -> Vec<Request> {
        lock(&self.script).requests.clone()
    }

    pub fn connects(&self) -> Vec<SocketAddr> {
        lock(&self.script).connects.clone()
    }

    pub fn tls_hosts(&self) -> Vec<String> {
        lock(&self.script).tls_hosts.clone()
    }

    pub fn tls_attempts(&self) -> Vec<TlsAttempt> {
        lock(&self.script).tls_attempts.clone()
    }

    /// Fails the next handshakes with the given kinds, one per handshake.
    pub fn fail_handshakes(&self, kinds: impl IntoIterator<Item = io::ErrorKind>) {
        lock(&self.script).handshake_failures.extend(kinds);
    }

    /// Every handshake blocks until its transport is shut down.
    pub fn stall_handshakes(&self) {
        lock(&self.script).stall_handshakes = true;
    }

    pub fn open_transports(&self) -> usize {
        self.open_transports.load(Ordering::Acquire)
    }
}

struct MockConnector {
    network: Arc<MockNetwork>,
}

impl Connector for MockConnector {
    fn connect(&self, route: &Route, _options: &ConnectOptions) -> io::Result<Box<dyn Transport>> {
        let refused = {
            let mut script = lock(&self.network.script);
            script.connects.push(route.socket_addr());
            script.refused.get(&route.socket_addr()).copied()
        };
        if let Some(kind) = refused {
            return Err(io::Error::new(kind, "scripted connect failure"));
        }
        self.network.open_transports.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MemoryTransport {
            network: Arc::clone(&self.network),
            link: Arc::new(Link::default()),
            pending: None,
        }))
    }
}

#[derive(Default)]
struct Link {
    closed: Mutex<bool>,
    condvar: Condvar,
}

impl Link {
    fn is_closed(&self) -> bool {
        *lock(&self.closed)
    }

    fn close(&self) {
        *lock(&self.closed) = true;
        self.condvar.notify_all();
    }

    /// Waits until closed or `timeout` passes. Returns true when closed.
    fn wait_closed(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut closed = lock(&self.closed);
        while !*closed {
            match deadline {
                None => {
                    closed = match self.condvar.wait(closed) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    closed = match self.condvar.wait_timeout(closed, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }
        }
        true
    }
}

struct MemoryTransport {
    network: Arc<MockNetwork>,
    link: Arc<Link>,
    pending: Option<Request>,
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "transport closed")
}

impl Transport for MemoryTransport {
    fn write_request(&mut self, request: &Request) -> io::Result<()> {
        if self.link.is_closed() {
            return Err(closed_error());
        }
        lock(&self.network.script).requests.push(request.clone());
        self.pending = Some(request.clone());
        Ok(())
    }

    fn read_response(&mut self) -> io::Result<ResponseParts> {
        if self.link.is_closed() {
            return Err(closed_error());
        }
        let Some(request) = self.pending.take() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no request written"));
        };
        match (self.network.handler)(&request) {
            Reply::Respond(parts) => Ok(parts),
            Reply::Stall => {
                self.link.wait_closed(None);
                Err(closed_error())
            }
            Reply::Delay(delay, parts) => {
                if self.link.wait_closed(Some(delay)) {
                    return Err(closed_error());
                }
                Ok(parts)
            }
            Reply::Fail(kind) => Err(io::Error::new(kind, "scripted read failure")),
        }
    }

    fn start_tls(&mut self, options: &TlsOptions<'_>) -> io::Result<Handshake> {
        let (certificates, failure, stall) = {
            let mut script = lock(&self.network.script);
            script.tls_hosts.push(options.host.to_owned());
            script.tls_attempts.push(TlsAttempt {
                host: options.host.to_owned(),
                spec: options.spec.clone(),
                is_fallback: options.is_fallback,
            });
            (
                script.certificates.clone(),
                script.handshake_failures.pop_front(),
                script.stall_handshakes,
            )
        };
        if stall {
            self.link.wait_closed(None);
            return Err(closed_error());
        }
        if let Some(kind) = failure {
            return Err(io::Error::new(kind, "scripted handshake failure"));
        }
        let protocol = options
            .protocols
            .iter()
            .copied()
            .find(|protocol| *protocol == Protocol::Http11);
        Ok(
            Handshake::new("TLSv1.3", "TLS_AES_128_GCM_SHA256", certificates)
                .with_protocol(protocol),
        )
    }

    fn is_healthy(&self) -> bool {
        !self.link.is_closed()
    }

    fn shutdown_handle(&self) -> Arc<dyn Shutdown> {
        let link = Arc::clone(&self.link);
        Arc::new(move || link.close())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.open_transports.fetch_sub(1, Ordering::AcqRel);
    }
}

pub fn loopback(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, last))
}

/// Resolves every host to the given addresses.
pub fn dns(ips: Vec<IpAddr>) -> Arc<dyn Dns> {
    Arc::new(move |_host: &str| -> io::Result<Vec<IpAddr>> { Ok(ips.clone()) })
}

/// A client wired to `network` with every host resolving to 127.0.0.1.
pub fn client_builder(network: &Arc<MockNetwork>) -> ClientBuilder {
    Client::builder()
        .connector(network.connector())
        .dns(dns(vec![loopback(1)]))
        .connect_timeout(Duration::from_secs(2))
        .read_timeout(Duration::from_secs(2))
        .write_timeout(Duration::from_secs(2))
}

pub fn get(url: &str) -> Request {
    Request::get(url).expect("test request should build")
}

pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}
