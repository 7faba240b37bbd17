//! TLS versions and cipher suites a connection may be negotiated with.
//!
//! A client carries an ordered list of [`ConnectionSpec`]s. Cleartext
//! `http` URLs need [`ConnectionSpec::cleartext`] in that list; `https`
//! connections try the TLS specs in order and fall back to the next one when
//! a handshake fails.

use std::io;

use crate::error::Error;

/// TLS protocol versions, newest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls13,
    Tls12,
    Tls11,
    Tls10,
}

impl TlsVersion {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tls13 => "TLSv1.3",
            Self::Tls12 => "TLSv1.2",
            Self::Tls11 => "TLSv1.1",
            Self::Tls10 => "TLSv1",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "TLSv1.3" => Some(Self::Tls13),
            "TLSv1.2" => Some(Self::Tls12),
            "TLSv1.1" => Some(Self::Tls11),
            "TLSv1" => Some(Self::Tls10),
            _ => None,
        }
    }
}

impl std::fmt::Display for TlsVersion {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

const TLS13_CIPHER_SUITES: [&str; 5] = [
    "TLS_AES_128_GCM_SHA256",
    "TLS_AES_256_GCM_SHA384",
    "TLS_CHACHA20_POLY1305_SHA256",
    "TLS_AES_128_CCM_SHA256",
    "TLS_AES_256_CCM_8_SHA256",
];

const RESTRICTED_CIPHER_SUITES: [&str; 6] = [
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
];

// Listed on the HTTP/2 bad cipher list; kept for older servers.
const LEGACY_CIPHER_SUITES: [&str; 7] = [
    "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
    "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
    "TLS_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_RSA_WITH_AES_128_CBC_SHA",
    "TLS_RSA_WITH_AES_256_CBC_SHA",
    "TLS_RSA_WITH_3DES_EDE_CBC_SHA",
];

fn suites(groups: &[&[&str]]) -> Vec<String> {
    groups
        .iter()
        .flat_map(|group| group.iter())
        .map(|suite| (*suite).to_owned())
        .collect()
}

/// Whether a connection is cleartext or TLS, and which TLS versions and
/// cipher suites it may use. `None` lists leave the choice to the transport.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionSpec {
    tls: bool,
    cipher_suites: Option<Vec<String>>,
    tls_versions: Option<Vec<TlsVersion>>,
    supports_tls_extensions: bool,
}

impl ConnectionSpec {
    /// Unencrypted, unauthenticated connections for `http` URLs.
    pub const fn cleartext() -> Self {
        Self {
            tls: false,
            cipher_suites: None,
            tls_versions: None,
            supports_tls_extensions: false,
        }
    }

    /// TLS 1.2 and 1.3 with forward-secret AEAD suites only.
    pub fn restricted_tls() -> Self {
        Self {
            tls: true,
            cipher_suites: Some(suites(&[&TLS13_CIPHER_SUITES, &RESTRICTED_CIPHER_SUITES])),
            tls_versions: Some(vec![TlsVersion::Tls13, TlsVersion::Tls12]),
            supports_tls_extensions: true,
        }
    }

    pub fn modern_tls() -> Self {
        Self {
            tls: true,
            cipher_suites: Some(suites(&[
                &TLS13_CIPHER_SUITES,
                &RESTRICTED_CIPHER_SUITES,
                &LEGACY_CIPHER_SUITES,
            ])),
            tls_versions: Some(vec![
                TlsVersion::Tls13,
                TlsVersion::Tls12,
                TlsVersion::Tls11,
                TlsVersion::Tls10,
            ]),
            supports_tls_extensions: true,
        }
    }

    /// TLS 1.0 only, for servers that reject anything newer.
    pub fn compatible_tls() -> Self {
        Self {
            tls_versions: Some(vec![TlsVersion::Tls10]),
            ..Self::modern_tls()
        }
    }

    pub fn tls_builder() -> ConnectionSpecBuilder {
        ConnectionSpecBuilder {
            cipher_suites: None,
            tls_versions: None,
            supports_tls_extensions: false,
        }
    }

    /// A builder seeded with this spec. Cleartext specs have nothing to
    /// configure.
    pub fn to_builder(&self) -> crate::Result<ConnectionSpecBuilder> {
        if !self.tls {
            return Err(Error::invalid_config(
                "cleartext connection specs have no tls settings",
            ));
        }
        Ok(ConnectionSpecBuilder {
            cipher_suites: self.cipher_suites.clone(),
            tls_versions: self.tls_versions.clone(),
            supports_tls_extensions: self.supports_tls_extensions,
        })
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn cipher_suites(&self) -> Option<&[String]> {
        self.cipher_suites.as_deref()
    }

    pub fn tls_versions(&self) -> Option<&[TlsVersion]> {
        self.tls_versions.as_deref()
    }

    pub fn supports_tls_extensions(&self) -> bool {
        self.supports_tls_extensions
    }
}

impl std::fmt::Display for ConnectionSpec {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.tls {
            return formatter.write_str("ConnectionSpec()");
        }
        let cipher_suites = match &self.cipher_suites {
            Some(suites) => format!("[{}]", suites.join(", ")),
            None => "[all enabled]".to_owned(),
        };
        let tls_versions = match &self.tls_versions {
            Some(versions) => format!(
                "[{}]",
                versions
                    .iter()
                    .map(|version| version.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            None => "[all enabled]".to_owned(),
        };
        write!(
            formatter,
            "ConnectionSpec(cipher_suites={cipher_suites}, tls_versions={tls_versions}, \
             supports_tls_extensions={})",
            self.supports_tls_extensions
        )
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionSpecBuilder {
    cipher_suites: Option<Vec<String>>,
    tls_versions: Option<Vec<TlsVersion>>,
    supports_tls_extensions: bool,
}

impl ConnectionSpecBuilder {
    pub fn cipher_suites<I, S>(mut self, cipher_suites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cipher_suites = Some(cipher_suites.into_iter().map(Into::into).collect());
        self
    }

    pub fn all_enabled_cipher_suites(mut self) -> Self {
        self.cipher_suites = None;
        self
    }

    pub fn tls_versions(mut self, tls_versions: impl IntoIterator<Item = TlsVersion>) -> Self {
        self.tls_versions = Some(tls_versions.into_iter().collect());
        self
    }

    pub fn all_enabled_tls_versions(mut self) -> Self {
        self.tls_versions = None;
        self
    }

    pub fn supports_tls_extensions(mut self, supports_tls_extensions: bool) -> Self {
        self.supports_tls_extensions = supports_tls_extensions;
        self
    }

    pub fn build(self) -> crate::Result<ConnectionSpec> {
        if self.cipher_suites.as_ref().is_some_and(Vec::is_empty) {
            return Err(Error::invalid_config("at least one cipher suite is required"));
        }
        if self.tls_versions.as_ref().is_some_and(Vec::is_empty) {
            return Err(Error::invalid_config("at least one tls version is required"));
        }
        Ok(ConnectionSpec {
            tls: true,
            cipher_suites: self.cipher_suites,
            tls_versions: self.tls_versions,
            supports_tls_extensions: self.supports_tls_extensions,
        })
    }
}

/// Walks the TLS specs of one address in order, deciding after each failed
/// handshake whether the next spec is worth a try.
#[derive(Debug)]
pub(crate) struct ConnectionSpecSelector<'a> {
    specs: &'a [ConnectionSpec],
    next: usize,
    is_fallback: bool,
}

impl<'a> ConnectionSpecSelector<'a> {
    pub(crate) fn new(specs: &'a [ConnectionSpec]) -> Self {
        Self {
            specs,
            next: 0,
            is_fallback: false,
        }
    }

    pub(crate) fn next_spec(&mut self) -> Option<&'a ConnectionSpec> {
        let specs = self.specs;
        let (index, spec) = specs
            .iter()
            .enumerate()
            .skip(self.next)
            .find(|(_, spec)| spec.is_tls())?;
        self.next = index + 1;
        Some(spec)
    }

    /// True once a handshake has failed on this address.
    pub(crate) fn is_fallback(&self) -> bool {
        self.is_fallback
    }

    /// Records a failed handshake. Returns true when another spec remains
    /// and the failure is one a different spec could avoid. Timeouts and
    /// rejected certificates (`InvalidData`) are final.
    pub(crate) fn connection_failed(&mut self, error: &io::Error) -> bool {
        self.is_fallback = true;
        let has_fallback = self.specs.iter().skip(self.next).any(ConnectionSpec::is_tls);
        has_fallback
            && !matches!(
                error.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::InvalidData
            )
    }
}
