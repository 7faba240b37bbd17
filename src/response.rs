use std::collections::BTreeMap;
use std::time::SystemTime;

use bytes::Bytes;
use http::header::{HeaderName, PROXY_AUTHENTICATE, WWW_AUTHENTICATE};
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::request::Request;
use crate::tls::Handshake;
use crate::util::{is_redirect_status, truncate_body};

/// What a transport produces for one exchange, before the chain attaches
/// the request and timing metadata.
#[derive(Clone, Debug)]
pub struct ResponseParts {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseParts {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    request: Request,
    handshake: Option<Handshake>,
    prior_response: Option<Box<Response>>,
    sent_at: SystemTime,
    received_at: SystemTime,
}

impl Response {
    pub fn builder(request: Request) -> ResponseBuilder {
        ResponseBuilder::new(request)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The request that produced this response. After redirects this is the
    /// last request sent, not the one the call started with.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// Redirect or auth response that triggered this one. Its body is always empty.
    pub fn prior_response(&self) -> Option<&Response> {
        self.prior_response.as_deref()
    }

    pub fn sent_at(&self) -> SystemTime {
        self.sent_at
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_redirect(&self) -> bool {
        is_redirect_status(self.status)
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&self.body),
        })
    }

    /// Authentication challenges carried by a `401` or `407`.
    pub fn challenges(&self) -> Vec<Challenge> {
        let name: HeaderName = match self.status {
            StatusCode::UNAUTHORIZED => WWW_AUTHENTICATE,
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => PROXY_AUTHENTICATE,
            _ => return Vec::new(),
        };
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(Challenge::parse)
            .collect()
    }

    pub fn to_builder(&self) -> ResponseBuilder {
        ResponseBuilder {
            status: self.status,
            version: self.version,
            headers: self.headers.clone(),
            body: self.body.clone(),
            request: self.request.clone(),
            handshake: self.handshake.clone(),
            prior_response: self.prior_response.clone(),
            sent_at: self.sent_at,
            received_at: self.received_at,
        }
    }

    pub(crate) fn without_body(&self) -> Response {
        let mut stripped = self.clone();
        stripped.body = Bytes::new();
        stripped
    }
}

#[derive(Clone, Debug)]
pub struct ResponseBuilder {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    request: Request,
    handshake: Option<Handshake>,
    prior_response: Option<Box<Response>>,
    sent_at: SystemTime,
    received_at: SystemTime,
}

impl ResponseBuilder {
    fn new(request: Request) -> Self {
        let now = SystemTime::now();
        Self {
            status: StatusCode::OK,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            request,
            handshake: None,
            prior_response: None,
            sent_at: now,
            received_at: now,
        }
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn try_header(mut self, name: &str, value: &str) -> crate::Result<Self> {
        let name = crate::util::parse_header_name(name)?;
        let value = crate::util::parse_header_value(name.as_str(), value)?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn request(mut self, request: Request) -> Self {
        self.request = request;
        self
    }

    pub fn handshake(mut self, handshake: Option<Handshake>) -> Self {
        self.handshake = handshake;
        self
    }

    /// Prior responses never keep their body.
    pub fn prior_response(mut self, prior: Option<Response>) -> Self {
        self.prior_response = prior.map(|response| Box::new(response.without_body()));
        self
    }

    pub fn sent_at(mut self, at: SystemTime) -> Self {
        self.sent_at = at;
        self
    }

    pub fn received_at(mut self, at: SystemTime) -> Self {
        self.received_at = at;
        self
    }

    pub(crate) fn parts(mut self, parts: ResponseParts) -> Self {
        self.status = parts.status;
        self.version = parts.version;
        self.headers = parts.headers;
        self.body = parts.body;
        self
    }

    pub fn build(self) -> Response {
        Response {
            status: self.status,
            version: self.version,
            headers: self.headers,
            body: self.body,
            request: self.request,
            handshake: self.handshake,
            prior_response: self.prior_response,
            sent_at: self.sent_at,
            received_at: self.received_at,
        }
    }
}

/// One `WWW-Authenticate` / `Proxy-Authenticate` challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    scheme: String,
    params: BTreeMap<String, String>,
}

impl Challenge {
    pub fn new(scheme: impl Into<String>, realm: Option<&str>) -> Self {
        let mut params = BTreeMap::new();
        if let Some(realm) = realm {
            params.insert("realm".to_owned(), realm.to_owned());
        }
        Self {
            scheme: scheme.into(),
            params,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn realm(&self) -> Option<&str> {
        self.params.get("realm").map(String::as_str)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    // Single challenge per header value; comma-separated challenge lists are
    // split only where the next token has no `=`.
    fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let (scheme, rest) = match text.split_once(char::is_whitespace) {
            Some((scheme, rest)) => (scheme, rest.trim()),
            None => (text, ""),
        };
        let mut params = BTreeMap::new();
        for item in rest.split(',') {
            let Some((key, value)) = item.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().trim_matches('"');
            if !key.is_empty() {
                params.insert(key, value.to_owned());
            }
        }
        Some(Self {
            scheme: scheme.to_owned(),
            params,
        })
    }
}
