use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use url::Url;

use crate::error::Error;
use crate::util::{parse_header_name, parse_header_value, permits_request_body};

/// An immutable HTTP request. Use [`Request::to_builder`] to derive a modified copy.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl Request {
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    pub fn get(url: &str) -> crate::Result<Self> {
        Self::builder().try_url(url)?.build()
    }

    pub fn post(url: &str, body: impl Into<Bytes>) -> crate::Result<Self> {
        Self::builder()
            .try_url(url)?
            .method(Method::POST, Some(body.into()))
            .build()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of `name`, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn is_https(&self) -> bool {
        self.url.scheme().eq_ignore_ascii_case("https")
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(if self.is_https() { 443 } else { 80 })
    }

    pub fn to_builder(&self) -> RequestBuilder {
        RequestBuilder {
            method: self.method.clone(),
            url: Some(self.url.clone()),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RequestBuilder {
    method: Method,
    url: Option<Url>,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self {
            method: Method::GET,
            url: None,
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

impl RequestBuilder {
    pub fn url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    pub fn try_url(self, url: &str) -> crate::Result<Self> {
        let parsed = Url::parse(url).map_err(|_| Error::InvalidUrl {
            url: url.to_owned(),
        })?;
        Ok(self.url(parsed))
    }

    pub fn method(mut self, method: Method, body: Option<Bytes>) -> Self {
        self.method = method;
        self.body = body;
        self
    }

    /// Appends a value, keeping any existing values for the same name.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replaces every existing value for `name`.
    pub fn set_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn try_set_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.set_header(name, value))
    }

    pub fn remove_header(mut self, name: &HeaderName) -> Self {
        self.headers.remove(name);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn build(self) -> crate::Result<Request> {
        let url = self
            .url
            .ok_or_else(|| Error::invalid_request("request url is required"))?;
        let scheme = url.scheme();
        if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
            return Err(Error::InvalidUrl {
                url: url.to_string(),
            });
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(Error::InvalidUrl {
                url: url.to_string(),
            });
        }
        if self.body.is_some() && !permits_request_body(&self.method) {
            return Err(Error::invalid_request(format!(
                "method {} must not have a request body",
                self.method
            )));
        }
        if self.body.is_none() && requires_request_body(&self.method) {
            return Err(Error::invalid_request(format!(
                "method {} must have a request body",
                self.method
            )));
        }
        Ok(Request {
            method: self.method,
            url,
            headers: self.headers,
            body: self.body,
        })
    }
}

fn requires_request_body(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}
