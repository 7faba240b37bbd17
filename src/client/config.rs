use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

/// Optional overrides applied on top of a [`super::ClientBuilder`].
///
/// Every field is optional; absent fields leave the builder untouched.
/// Durations are whole milliseconds so the struct loads directly from JSON.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub connect_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
    pub call_timeout_ms: Option<u64>,
    pub ping_interval_ms: Option<u64>,
    pub follow_redirects: Option<bool>,
    pub follow_ssl_redirects: Option<bool>,
    pub retry_on_connection_failure: Option<bool>,
    /// ALPN identifiers such as `h2` or `http/1.1`.
    pub protocols: Option<Vec<String>>,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub no_proxy: Option<Vec<String>>,
    pub max_requests: Option<usize>,
    pub max_requests_per_host: Option<usize>,
    pub max_idle_connections: Option<usize>,
    pub keep_alive_ms: Option<u64>,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json)
            .map_err(|error| Error::invalid_config(format!("invalid client config: {error}")))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = Some(millis(timeout));
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = Some(millis(timeout));
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = Some(millis(timeout));
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = Some(millis(timeout));
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval_ms = Some(millis(interval));
        self
    }

    pub fn with_follow_redirects(mut self, follow_redirects: bool) -> Self {
        self.follow_redirects = Some(follow_redirects);
        self
    }

    pub fn with_follow_ssl_redirects(mut self, follow_ssl_redirects: bool) -> Self {
        self.follow_ssl_redirects = Some(follow_ssl_redirects);
        self
    }

    pub fn with_retry_on_connection_failure(mut self, retry: bool) -> Self {
        self.retry_on_connection_failure = Some(retry);
        self
    }

    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = Some(protocols.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_no_proxy<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.no_proxy = Some(rules.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = Some(max_requests);
        self
    }

    pub fn with_max_requests_per_host(mut self, max_requests_per_host: usize) -> Self {
        self.max_requests_per_host = Some(max_requests_per_host);
        self
    }

    pub fn with_max_idle_connections(mut self, max_idle_connections: usize) -> Self {
        self.max_idle_connections = Some(max_idle_connections);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive_ms = Some(millis(keep_alive));
        self
    }

    pub(crate) fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_ms.map(Duration::from_millis)
    }

    pub(crate) fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive_ms.map(Duration::from_millis)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
