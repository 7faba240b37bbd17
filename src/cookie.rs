use url::Url;

/// A name/value pair sent in the `Cookie` request header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Leading `name=value` of a `Set-Cookie` header. Attributes are ignored.
    pub fn parse(set_cookie: &str) -> Option<Self> {
        let pair = set_cookie.split(';').next()?.trim();
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name, value.trim().trim_matches('"')))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Storage policy for cookies. Persistence and expiry are up to the jar.
pub trait CookieJar: Send + Sync {
    fn load_for_request(&self, url: &Url) -> Vec<Cookie>;

    fn save_from_response(&self, url: &Url, set_cookie_values: &[String]);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoCookies;

impl CookieJar for NoCookies {
    fn load_for_request(&self, _url: &Url) -> Vec<Cookie> {
        Vec::new()
    }

    fn save_from_response(&self, _url: &Url, _set_cookie_values: &[String]) {}
}

pub(crate) fn cookie_header(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .map(|cookie| format!("{}={}", cookie.name, cookie.value))
        .collect::<Vec<_>>()
        .join("; ")
}
