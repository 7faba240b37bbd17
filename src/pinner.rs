use std::fmt::Write as _;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use ring::digest;
use url::Url;

use crate::error::Error;
use crate::tls::{Certificate, ChainCleaner};
use crate::util::same_arc;

const WILDCARD: &str = "*.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1/",
            Self::Sha256 => "sha256/",
        }
    }

    fn digest(self, public_key_info: &[u8]) -> Bytes {
        let algorithm = match self {
            Self::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            Self::Sha256 => &digest::SHA256,
        };
        Bytes::copy_from_slice(digest::digest(algorithm, public_key_info).as_ref())
    }
}

/// A hostname pattern bound to one public-key hash.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Pin {
    pattern: String,
    canonical_host: String,
    algorithm: HashAlgorithm,
    hash: Bytes,
}

impl Pin {
    pub fn parse(pattern: &str, pin: &str) -> crate::Result<Self> {
        let canonical_host = canonical_host(pattern)?;
        let (algorithm, encoded) = if let Some(encoded) = pin.strip_prefix("sha256/") {
            (HashAlgorithm::Sha256, encoded)
        } else if let Some(encoded) = pin.strip_prefix("sha1/") {
            (HashAlgorithm::Sha1, encoded)
        } else {
            return Err(Error::invalid_config(format!(
                "pins must start with 'sha256/' or 'sha1/': {pin}"
            )));
        };
        let hash = STANDARD
            .decode(encoded)
            .ok()
            .filter(|hash| !hash.is_empty())
            .ok_or_else(|| Error::invalid_config(format!("pins must be base64: {pin}")))?;
        Ok(Self {
            pattern: pattern.to_owned(),
            canonical_host,
            algorithm,
            hash: Bytes::from(hash),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn hash(&self) -> &Bytes {
        &self.hash
    }

    /// `*.example.com` covers `api.example.com` but neither `example.com`
    /// nor `a.b.example.com`.
    pub fn matches(&self, hostname: &str) -> bool {
        if self.pattern.starts_with(WILDCARD) {
            return hostname
                .split_once('.')
                .is_some_and(|(_, rest)| rest == self.canonical_host);
        }
        hostname == self.canonical_host
    }
}

impl std::fmt::Display for Pin {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "{}{}",
            self.algorithm.prefix(),
            STANDARD.encode(&self.hash)
        )
    }
}

fn canonical_host(pattern: &str) -> crate::Result<String> {
    let host = pattern.strip_prefix(WILDCARD).unwrap_or(pattern);
    let invalid = || Error::invalid_config(format!("invalid pattern: {pattern}"));
    if host.is_empty() || host.contains('*') {
        return Err(invalid());
    }
    let url = Url::parse(&format!("http://{host}")).map_err(|_| invalid())?;
    url.host_str().map(ToOwned::to_owned).ok_or_else(invalid)
}

/// Constrains which certificates are trusted for a hostname.
///
/// A check passes when at least one certificate in the (cleaned) chain has a
/// public key whose hash matches a pin configured for the host. Hosts with no
/// matching pin pattern are not constrained.
#[derive(Clone, Default)]
pub struct CertificatePinner {
    pins: Vec<Pin>,
    chain_cleaner: Option<Arc<dyn ChainCleaner>>,
}

impl std::fmt::Debug for CertificatePinner {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CertificatePinner")
            .field("pins", &self.pins)
            .field("chain_cleaner", &self.chain_cleaner.is_some())
            .finish()
    }
}

impl PartialEq for CertificatePinner {
    fn eq(&self, other: &Self) -> bool {
        let cleaners_equal = match (&self.chain_cleaner, &other.chain_cleaner) {
            (Some(left), Some(right)) => same_arc(left, right),
            (None, None) => true,
            _ => false,
        };
        cleaners_equal && self.pins == other.pins
    }
}

impl CertificatePinner {
    pub fn builder() -> CertificatePinnerBuilder {
        CertificatePinnerBuilder::default()
    }

    pub fn pins(&self) -> &[Pin] {
        &self.pins
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn with_chain_cleaner(mut self, cleaner: Arc<dyn ChainCleaner>) -> Self {
        self.chain_cleaner = Some(cleaner);
        self
    }

    pub fn find_matching_pins(&self, hostname: &str) -> Vec<&Pin> {
        self.pins
            .iter()
            .filter(|pin| pin.matches(hostname))
            .collect()
    }

    pub fn check(&self, hostname: &str, chain: &[Certificate]) -> crate::Result<()> {
        let pins = self.find_matching_pins(hostname);
        if pins.is_empty() {
            return Ok(());
        }

        let cleaned;
        let chain = match &self.chain_cleaner {
            Some(cleaner) => {
                cleaned = cleaner.clean(chain, hostname)?;
                cleaned.as_slice()
            }
            None => chain,
        };

        for certificate in chain {
            let mut sha1 = None;
            let mut sha256 = None;
            for pin in &pins {
                let slot = match pin.algorithm {
                    HashAlgorithm::Sha1 => &mut sha1,
                    HashAlgorithm::Sha256 => &mut sha256,
                };
                let hash =
                    slot.get_or_insert_with(|| pin.algorithm.digest(certificate.public_key_info()));
                if *hash == pin.hash {
                    return Ok(());
                }
            }
        }

        let mut message = String::from("peer certificate chain:");
        for certificate in chain {
            let _ = write!(message, "\n    {}: {}", Self::pin(certificate), certificate.subject());
        }
        let _ = write!(message, "\n  pinned certificates for {hostname}:");
        for pin in &pins {
            let _ = write!(message, "\n    {pin}");
        }
        Err(Error::CertificatePinning {
            host: hostname.to_owned(),
            message,
        })
    }

    /// `sha256/` pin string for a certificate's public key.
    pub fn pin(certificate: &Certificate) -> String {
        let hash = HashAlgorithm::Sha256.digest(certificate.public_key_info());
        format!("{}{}", HashAlgorithm::Sha256.prefix(), STANDARD.encode(hash))
    }
}

#[derive(Clone, Debug, Default)]
pub struct CertificatePinnerBuilder {
    pins: Vec<Pin>,
}

impl CertificatePinnerBuilder {
    pub fn add<S: AsRef<str>>(mut self, pattern: &str, pins: &[S]) -> crate::Result<Self> {
        for pin in pins {
            self.pins.push(Pin::parse(pattern, pin.as_ref())?);
        }
        Ok(self)
    }

    pub fn build(self) -> CertificatePinner {
        CertificatePinner {
            pins: self.pins,
            chain_cleaner: None,
        }
    }
}
