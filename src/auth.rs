use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::StatusCode;
use http::header::{AUTHORIZATION, HeaderName, PROXY_AUTHORIZATION};

use crate::request::Request;
use crate::response::Response;
use crate::route::Route;
use crate::util::parse_header_value;

/// Scheme of the synthetic challenge offered to proxy authenticators before
/// the first CONNECT attempt.
pub const PREEMPTIVE_CHALLENGE_SCHEME: &str = "Preemptive";

/// Answers `401` and `407` challenges.
///
/// Returning `Ok(None)` gives up and surfaces the challenge response to the
/// caller. The follow-up stage bounds the number of attempts and stops when
/// an authenticator returns a request identical to one already sent.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, route: Option<&Route>, response: &Response)
    -> crate::Result<Option<Request>>;
}

impl<F> Authenticator for F
where
    F: Fn(Option<&Route>, &Response) -> crate::Result<Option<Request>> + Send + Sync,
{
    fn authenticate(
        &self,
        route: Option<&Route>,
        response: &Response,
    ) -> crate::Result<Option<Request>> {
        self(route, response)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoAuthenticator;

impl Authenticator for NoAuthenticator {
    fn authenticate(
        &self,
        _route: Option<&Route>,
        _response: &Response,
    ) -> crate::Result<Option<Request>> {
        Ok(None)
    }
}

/// `Basic` credentials for origin (`401`) or proxy (`407`) challenges.
#[derive(Clone)]
pub struct BasicAuthenticator {
    credentials: String,
}

impl std::fmt::Debug for BasicAuthenticator {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BasicAuthenticator")
            .field("credentials", &"<redacted>")
            .finish()
    }
}

impl BasicAuthenticator {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            credentials: basic_credentials(username, password),
        }
    }
}

impl Authenticator for BasicAuthenticator {
    fn authenticate(
        &self,
        _route: Option<&Route>,
        response: &Response,
    ) -> crate::Result<Option<Request>> {
        let header: HeaderName = match response.status() {
            StatusCode::UNAUTHORIZED => AUTHORIZATION,
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => PROXY_AUTHORIZATION,
            _ => return Ok(None),
        };
        let challenges = response.challenges();
        let accepts_basic = challenges.is_empty()
            || challenges.iter().any(|challenge| {
                challenge.scheme().eq_ignore_ascii_case("basic")
                    || challenge
                        .scheme()
                        .eq_ignore_ascii_case(PREEMPTIVE_CHALLENGE_SCHEME)
            });
        if !accepts_basic {
            return Ok(None);
        }

        let request = response.request();
        let already_sent = request
            .headers()
            .get(&header)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == self.credentials);
        if already_sent {
            return Ok(None);
        }

        let value = parse_header_value(header.as_str(), &self.credentials)?;
        request.to_builder().set_header(header, value).build().map(Some)
    }
}

/// `Basic <base64(user:pass)>`.
pub fn basic_credentials(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}
