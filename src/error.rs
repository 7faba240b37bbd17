use http::Method;
use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Write,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Write => "write",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimeoutPhase {
    Connect,
    Write,
    Read,
    Call,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connect => "connect",
            Self::Write => "write",
            Self::Read => "read",
            Self::Call => "call",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidConfig,
    InvalidUrl,
    InvalidRequest,
    InvalidHeaderName,
    InvalidHeaderValue,
    AlreadyExecuted,
    Canceled,
    Connect,
    Transport,
    Timeout,
    PeerUnverified,
    CertificatePinning,
    ProxyTunnel,
    ProtocolViolation,
    UnknownService,
    TooManyFollowUps,
    RedirectLoop,
    Interceptor,
    ExecutorRejected,
    UnbalancedTimeout,
    DecodeContentEncoding,
    Deserialize,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidConfig => "invalid_config",
            Self::InvalidUrl => "invalid_url",
            Self::InvalidRequest => "invalid_request",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::AlreadyExecuted => "already_executed",
            Self::Canceled => "canceled",
            Self::Connect => "connect",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::PeerUnverified => "peer_unverified",
            Self::CertificatePinning => "certificate_pinning",
            Self::ProxyTunnel => "proxy_tunnel",
            Self::ProtocolViolation => "protocol_violation",
            Self::UnknownService => "unknown_service",
            Self::TooManyFollowUps => "too_many_follow_ups",
            Self::RedirectLoop => "redirect_loop",
            Self::Interceptor => "interceptor",
            Self::ExecutorRejected => "executor_rejected",
            Self::UnbalancedTimeout => "unbalanced_timeout",
            Self::DecodeContentEncoding => "decode_content_encoding",
            Self::Deserialize => "deserialize",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid client configuration: {message}")]
    InvalidConfig { message: String },
    #[error("invalid url: {url}")]
    InvalidUrl { url: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("call already executed: {method} {uri}")]
    AlreadyExecuted { method: Method, uri: String },
    #[error("call canceled: {method} {uri}")]
    Canceled { method: Method, uri: String },
    #[error("failed to connect ({kind}) via {route}: {source}")]
    Connect {
        kind: TransportErrorKind,
        route: String,
        #[source]
        source: BoxError,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http call timed out in {phase} after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        phase: TimeoutPhase,
        timeout_ms: u128,
        method: Method,
        uri: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("hostname {host} not verified by peer certificate chain")]
    PeerUnverified { host: String },
    #[error("certificate pinning failure for {host}: {message}")]
    CertificatePinning { host: String, message: String },
    #[error("proxy tunnel to {target} failed: {message}")]
    ProxyTunnel { target: String, message: String },
    #[error("protocol violation for {method} {uri}: {message}")]
    ProtocolViolation {
        method: Method,
        uri: String,
        message: String,
    },
    #[error("unknown service {host}: {message}")]
    UnknownService { host: String, message: String },
    #[error("too many follow-up requests ({max_follow_ups}) for {method} {uri}")]
    TooManyFollowUps {
        max_follow_ups: usize,
        method: Method,
        uri: String,
    },
    #[error("redirect loop detected for {method} {uri}")]
    RedirectLoop { method: Method, uri: String },
    #[error("interceptor contract violated: {message}")]
    Interceptor { message: String },
    #[error("executor rejected call {method} {uri}")]
    ExecutorRejected { method: Method, uri: String },
    #[error("timeout node entered twice without exit")]
    UnbalancedTimeout,
    #[error("failed to decode response content-encoding {encoding} for {method} {uri}: {message}")]
    DecodeContentEncoding {
        encoding: String,
        method: Method,
        uri: String,
        message: String,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::InvalidUrl { .. } => ErrorCode::InvalidUrl,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::AlreadyExecuted { .. } => ErrorCode::AlreadyExecuted,
            Self::Canceled { .. } => ErrorCode::Canceled,
            Self::Connect { .. } => ErrorCode::Connect,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::PeerUnverified { .. } => ErrorCode::PeerUnverified,
            Self::CertificatePinning { .. } => ErrorCode::CertificatePinning,
            Self::ProxyTunnel { .. } => ErrorCode::ProxyTunnel,
            Self::ProtocolViolation { .. } => ErrorCode::ProtocolViolation,
            Self::UnknownService { .. } => ErrorCode::UnknownService,
            Self::TooManyFollowUps { .. } => ErrorCode::TooManyFollowUps,
            Self::RedirectLoop { .. } => ErrorCode::RedirectLoop,
            Self::Interceptor { .. } => ErrorCode::Interceptor,
            Self::ExecutorRejected { .. } => ErrorCode::ExecutorRejected,
            Self::UnbalancedTimeout => ErrorCode::UnbalancedTimeout,
            Self::DecodeContentEncoding { .. } => ErrorCode::DecodeContentEncoding,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
        }
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    /// True for failures that happened while establishing a connection on a
    /// route, before any request bytes were exchanged.
    pub const fn is_route_failure(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::Timeout {
                    phase: TimeoutPhase::Connect,
                    ..
                }
        )
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }
}
