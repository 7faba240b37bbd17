use std::io;

use url::Url;

use crate::error::Error;
use crate::util::default_port;

/// How a route reaches the origin server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Proxy {
    Direct,
    Http { host: String, port: u16 },
}

impl Proxy {
    /// Parses `http://host:port` or a bare `host:port`. The port defaults to 80.
    pub fn http(text: &str) -> crate::Result<Self> {
        let trimmed = text.trim();
        let candidate = if trimmed.contains("://") {
            trimmed.to_owned()
        } else {
            format!("http://{trimmed}")
        };
        let url = Url::parse(&candidate)
            .map_err(|_| Error::invalid_config(format!("invalid proxy address: {text}")))?;
        if !url.scheme().eq_ignore_ascii_case("http") {
            return Err(Error::invalid_config(format!(
                "unsupported proxy scheme {}; only http proxies are supported",
                url.scheme()
            )));
        }
        let Some(host) = url.host_str().filter(|host| !host.is_empty()) else {
            return Err(Error::invalid_config(format!("proxy address has no host: {text}")));
        };
        Ok(Self::Http {
            host: host.to_owned(),
            port: url.port().or_else(|| default_port("http")).unwrap_or(80),
        })
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct)
    }
}

impl std::fmt::Display for Proxy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => formatter.write_str("direct"),
            Self::Http { host, port } => write!(formatter, "http://{host}:{port}"),
        }
    }
}

/// Chooses candidate proxies for a URL, in preference order.
pub trait ProxySelector: Send + Sync {
    fn select(&self, url: &Url) -> Vec<Proxy>;

    fn connect_failed(&self, _url: &Url, _proxy: &Proxy, _error: &io::Error) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoProxySelector;

impl ProxySelector for NoProxySelector {
    fn select(&self, _url: &Url) -> Vec<Proxy> {
        vec![Proxy::Direct]
    }
}

/// One proxy for every URL except those matching a `NO_PROXY` rule.
#[derive(Clone, Debug)]
pub struct StaticProxySelector {
    proxy: Proxy,
    no_proxy_rules: Vec<NoProxyRule>,
}

impl StaticProxySelector {
    pub fn new(proxy: Proxy) -> Self {
        Self {
            proxy,
            no_proxy_rules: Vec::new(),
        }
    }

    /// Adds bypass rules in `NO_PROXY` syntax: `*`, `example.com`,
    /// `.example.com`, `host:port` or `[::1]:8080`.
    pub fn try_no_proxy<I, S>(mut self, rules: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for rule in rules {
            let rule = rule.as_ref();
            let parsed = NoProxyRule::parse(rule)
                .ok_or_else(|| Error::invalid_config(format!("invalid no_proxy rule: {rule}")))?;
            self.no_proxy_rules.push(parsed);
        }
        Ok(self)
    }

    pub fn bypasses(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let normalized = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        let port = url.port_or_known_default();
        self.no_proxy_rules
            .iter()
            .any(|rule| rule.matches(&normalized, port))
    }
}

impl ProxySelector for StaticProxySelector {
    fn select(&self, url: &Url) -> Vec<Proxy> {
        if self.bypasses(url) {
            vec![Proxy::Direct]
        } else {
            vec![self.proxy.clone()]
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum NoProxyRule {
    Any,
    Domain { host: String, port: Option<u16> },
}

impl NoProxyRule {
    pub(crate) fn parse(text: &str) -> Option<Self> {
        let mut candidate = text.trim().to_owned();
        let mut port = None;
        if candidate.is_empty() {
            return None;
        }
        if candidate == "*" {
            return Some(Self::Any);
        }
        if candidate.contains("://")
            && let Ok(url) = Url::parse(&candidate)
            && let Some(host) = url.host_str()
        {
            candidate = host.to_owned();
            port = url.port();
        }
        candidate = candidate.trim_start_matches('.').to_owned();
        if let Some(stripped) = candidate.strip_prefix('[') {
            let end = stripped.find(']')?;
            let host = &stripped[..end];
            let suffix = &stripped[end + 1..];
            if let Some(raw_port) = suffix.strip_prefix(':') {
                port = Some(raw_port.parse::<u16>().ok()?);
            } else if !suffix.is_empty() {
                return None;
            }
            candidate = host.to_owned();
        } else if candidate.matches(':').count() == 1 {
            let (host, raw_port) = candidate.rsplit_once(':')?;
            if host.is_empty() {
                return None;
            }
            port = Some(raw_port.parse::<u16>().ok()?);
            candidate = host.to_owned();
        }
        if candidate.is_empty() {
            return None;
        }
        Some(Self::Domain {
            host: candidate.to_ascii_lowercase(),
            port,
        })
    }

    pub(crate) fn matches(&self, host: &str, port: Option<u16>) -> bool {
        match self {
            Self::Any => true,
            Self::Domain {
                host: domain,
                port: rule_port,
            } => {
                let host_matches = host == domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'));
                host_matches && rule_port.is_none_or(|rule_port| port == Some(rule_port))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(text: &str) -> Url {
        Url::parse(text).expect("url should parse")
    }

    #[test]
    fn parses_http_proxy_with_default_port() {
        assert_eq!(
            Proxy::http("proxy.local").expect("proxy should parse"),
            Proxy::Http {
                host: "proxy.local".to_owned(),
                port: 80
            }
        );
        assert!(Proxy::http("socks5://proxy.local:1080").is_err());
    }

    #[test]
    fn no_proxy_rules_match_domain_and_subdomains() {
        let rule = NoProxyRule::parse(".example.com").expect("rule should parse");
        assert!(rule.matches("example.com", Some(443)));
        assert!(rule.matches("api.example.com", Some(443)));
        assert!(!rule.matches("badexample.com", Some(443)));
    }

    #[test]
    fn no_proxy_rule_port_must_match() {
        let rule = NoProxyRule::parse("localhost:8080").expect("rule should parse");
        assert!(rule.matches("localhost", Some(8080)));
        assert!(!rule.matches("localhost", Some(80)));
        let ipv6 = NoProxyRule::parse("[::1]:9000").expect("rule should parse");
        assert!(ipv6.matches("::1", Some(9000)));
    }

    #[test]
    fn static_selector_bypasses_matching_hosts() {
        let proxy = Proxy::http("proxy.local:3128").expect("proxy should parse");
        let selector = StaticProxySelector::new(proxy.clone())
            .try_no_proxy(["internal.example", "localhost"])
            .expect("rules should parse");
        assert_eq!(selector.select(&url("https://svc.internal.example/")), vec![Proxy::Direct]);
        assert_eq!(selector.select(&url("https://example.org/")), vec![proxy]);
        assert!(
            StaticProxySelector::new(Proxy::Direct)
                .try_no_proxy(["[::1"])
                .is_err()
        );
    }
}
