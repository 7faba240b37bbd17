use bytes::Bytes;
use http::Version;
use x509_parser::extensions::GeneralName;

use crate::error::Error;

/// Application protocols the client may negotiate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Http10,
    Http11,
    Http2,
    /// Cleartext HTTP/2 without an upgrade. Only valid as the sole protocol.
    H2PriorKnowledge,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "http/1.0",
            Self::Http11 => "http/1.1",
            Self::Http2 => "h2",
            Self::H2PriorKnowledge => "h2_prior_knowledge",
        }
    }

    /// Maps an ALPN identifier. Unknown identifiers yield `None`.
    pub fn from_alpn(id: &str) -> Option<Self> {
        match id {
            "http/1.0" => Some(Self::Http10),
            "http/1.1" => Some(Self::Http11),
            "h2" => Some(Self::Http2),
            "h2_prior_knowledge" => Some(Self::H2PriorKnowledge),
            _ => None,
        }
    }

    pub const fn version(self) -> Version {
        match self {
            Self::Http10 => Version::HTTP_10,
            Self::Http11 => Version::HTTP_11,
            Self::Http2 | Self::H2PriorKnowledge => Version::HTTP_2,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// The parts of a peer certificate this crate looks at.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Certificate {
    subject: String,
    public_key_info: Bytes,
    dns_names: Vec<String>,
}

impl Certificate {
    pub fn from_der(der: &[u8]) -> crate::Result<Self> {
        let (_, parsed) = x509_parser::parse_x509_certificate(der).map_err(|error| {
            Error::invalid_config(format!("failed to parse x509 certificate: {error}"))
        })?;
        let dns_names = match parsed.subject_alternative_name() {
            Ok(Some(extension)) => extension
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
                    _ => None,
                })
                .collect(),
            Ok(None) => Vec::new(),
            Err(error) => {
                return Err(Error::invalid_config(format!(
                    "invalid subjectAltName extension: {error}"
                )));
            }
        };
        Ok(Self {
            subject: parsed.subject().to_string(),
            public_key_info: Bytes::copy_from_slice(parsed.public_key().raw),
            dns_names,
        })
    }

    /// Builds a certificate from an already extracted DER
    /// SubjectPublicKeyInfo.
    pub fn from_public_key_info(
        subject: impl Into<String>,
        public_key_info: impl Into<Bytes>,
    ) -> Self {
        Self {
            subject: subject.into(),
            public_key_info: public_key_info.into(),
            dns_names: Vec::new(),
        }
    }

    pub fn with_dns_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dns_names = names
            .into_iter()
            .map(|name| name.into().to_ascii_lowercase())
            .collect();
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn public_key_info(&self) -> &Bytes {
        &self.public_key_info
    }

    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }
}

/// Result of a completed TLS handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    tls_version: String,
    cipher_suite: String,
    peer_certificates: Vec<Certificate>,
    protocol: Option<Protocol>,
}

impl Handshake {
    pub fn new(
        tls_version: impl Into<String>,
        cipher_suite: impl Into<String>,
        peer_certificates: Vec<Certificate>,
    ) -> Self {
        Self {
            tls_version: tls_version.into(),
            cipher_suite: cipher_suite.into(),
            peer_certificates,
            protocol: None,
        }
    }

    /// ALPN result. `None` means the peer did not negotiate a protocol.
    pub fn with_protocol(mut self, protocol: Option<Protocol>) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn tls_version(&self) -> &str {
        &self.tls_version
    }

    pub fn cipher_suite(&self) -> &str {
        &self.cipher_suite
    }

    /// Leaf first.
    pub fn peer_certificates(&self) -> &[Certificate] {
        &self.peer_certificates
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }
}

pub trait HostnameVerifier: Send + Sync {
    fn verify(&self, host: &str, handshake: &Handshake) -> bool;
}

impl<F> HostnameVerifier for F
where
    F: Fn(&str, &Handshake) -> bool + Send + Sync,
{
    fn verify(&self, host: &str, handshake: &Handshake) -> bool {
        self(host, handshake)
    }
}

/// Matches the host against the leaf certificate's DNS subject alternative
/// names. A `*.` wildcard covers exactly one label.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultHostnameVerifier;

impl HostnameVerifier for DefaultHostnameVerifier {
    fn verify(&self, host: &str, handshake: &Handshake) -> bool {
        let Some(leaf) = handshake.peer_certificates().first() else {
            return false;
        };
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        leaf.dns_names()
            .iter()
            .any(|pattern| hostname_matches(&host, pattern.trim_end_matches('.')))
    }
}

pub(crate) fn hostname_matches(host: &str, pattern: &str) -> bool {
    if host.is_empty() || pattern.is_empty() {
        return false;
    }
    let Some(suffix) = pattern.strip_prefix("*.") else {
        return host.eq_ignore_ascii_case(pattern);
    };
    if suffix.contains('*') {
        return false;
    }
    match host.split_once('.') {
        Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
        None => false,
    }
}

/// Reduces a presented chain to the trusted path before pin checks.
pub trait ChainCleaner: Send + Sync {
    fn clean(&self, chain: &[Certificate], host: &str) -> crate::Result<Vec<Certificate>>;
}

impl<F> ChainCleaner for F
where
    F: Fn(&[Certificate], &str) -> crate::Result<Vec<Certificate>> + Send + Sync,
{
    fn clean(&self, chain: &[Certificate], host: &str) -> crate::Result<Vec<Certificate>> {
        self(chain, host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_for(names: &[&str]) -> Handshake {
        let leaf = Certificate::from_public_key_info("CN=leaf", Bytes::from_static(b"spki"))
            .with_dns_names(names.iter().copied());
        Handshake::new("TLSv1.3", "TLS_AES_128_GCM_SHA256", vec![leaf])
    }

    #[test]
    fn wildcard_san_matches_exactly_one_label() {
        let handshake = handshake_for(&["*.example.com"]);
        let verifier = DefaultHostnameVerifier;
        assert!(verifier.verify("api.example.com", &handshake));
        assert!(!verifier.verify("a.b.example.com", &handshake));
        assert!(!verifier.verify("example.com", &handshake));
    }

    #[test]
    fn verifier_without_certificates_fails() {
        let handshake = Handshake::new("TLSv1.3", "TLS_AES_128_GCM_SHA256", Vec::new());
        assert!(!DefaultHostnameVerifier.verify("example.com", &handshake));
    }

    #[test]
    fn protocol_alpn_round_trip() {
        assert_eq!(Protocol::from_alpn("h2"), Some(Protocol::Http2));
        assert_eq!(Protocol::from_alpn("spdy/3.1"), None);
        assert_eq!(Protocol::Http11.version(), Version::HTTP_11);
    }

    #[test]
    fn malformed_der_is_rejected() {
        let error = Certificate::from_der(b"not a certificate").expect_err("garbage should fail");
        assert!(matches!(error, Error::InvalidConfig { .. }));
    }
}
