use http::header::RETRY_AFTER;
use http::{Method, StatusCode};
use tracing::{debug, warn};

use crate::chain::{Chain, Interceptor};
use crate::client::Client;
use crate::error::{Error, TransportErrorKind};
use crate::proxy::Proxy;
use crate::request::Request;
use crate::response::Response;
use crate::route::Route;
use crate::util::{
    permits_request_body, redact_url_for_logs, redirect_location, retry_after_seconds,
    same_origin, sanitize_headers_for_redirect,
};

/// Redirects plus auth challenges a single call may follow.
pub(crate) const MAX_FOLLOW_UPS: usize = 20;

/// Recovers from connection failures and follows redirects, auth challenges
/// and retryable statuses.
pub(crate) struct RetryAndFollowUp;

impl Interceptor for RetryAndFollowUp {
    fn intercept(&self, chain: &mut Chain<'_>) -> crate::Result<Response> {
        let client = chain.call().client().clone();
        let mut request = chain.request().clone();
        let mut prior: Option<Response> = None;
        let mut follow_ups = 0usize;
        let mut recoveries = 0usize;
        let mut attempted: Vec<(Request, Option<Route>)> = Vec::new();

        loop {
            let response = match chain.proceed(request.clone()) {
                Ok(response) => response,
                Err(error) => {
                    if !recover(&client, chain, &error) {
                        return Err(error);
                    }
                    recoveries += 1;
                    warn!(
                        error = %error,
                        recoveries,
                        url = %redact_url_for_logs(request.url()),
                        "recovering from connection failure"
                    );
                    continue;
                }
            };

            let response = match prior.take() {
                Some(prior) => response.to_builder().prior_response(Some(prior)).build(),
                None => response,
            };

            let route = chain.state().last_route.clone();
            let Some(follow_up) = follow_up_request(&client, &response, route.as_ref())? else {
                return Ok(response);
            };

            attempted.push((request.clone(), route.clone()));
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED
            ) || response.is_redirect()
            {
                let repeated = attempted.iter().any(|(earlier, earlier_route)| {
                    *earlier == follow_up
                        && (!same_origin(follow_up.url(), request.url())
                            || *earlier_route == route)
                });
                if repeated {
                    if response.is_redirect() {
                        return Err(Error::RedirectLoop {
                            method: follow_up.method().clone(),
                            uri: redact_url_for_logs(follow_up.url()),
                        });
                    }
                    debug!(
                        status = response.status().as_u16(),
                        "auth retry repeats an earlier request, giving up"
                    );
                    return Ok(response);
                }
            }

            follow_ups += 1;
            if follow_ups > MAX_FOLLOW_UPS {
                return Err(Error::TooManyFollowUps {
                    max_follow_ups: MAX_FOLLOW_UPS,
                    method: follow_up.method().clone(),
                    uri: redact_url_for_logs(follow_up.url()),
                });
            }

            debug!(
                status = response.status().as_u16(),
                follow_ups,
                url = %redact_url_for_logs(follow_up.url()),
                "following up"
            );
            // Routes and connections are chosen afresh for the follow-up.
            chain.state().finder = None;
            request = follow_up;
            prior = Some(response);
        }
    }
}

/// Whether a failed attempt may be retried on another route or connection.
fn recover(client: &Client, chain: &mut Chain<'_>, error: &Error) -> bool {
    if !client.retry_on_connection_failure() || chain.call().is_canceled() {
        return false;
    }
    let state = chain.state();
    if error.is_route_failure() {
        return state
            .finder
            .as_ref()
            .is_some_and(|finder| finder.has_more_routes());
    }
    // A pooled connection may have been closed by the peer while idle.
    matches!(
        error,
        Error::Transport {
            kind: TransportErrorKind::Read | TransportErrorKind::Write,
            ..
        }
    ) && state.last_connection_reused
}

fn retry_after(response: &Response, default: u64) -> u64 {
    if response.headers().get(RETRY_AFTER).is_none() {
        return default;
    }
    retry_after_seconds(response.headers()).unwrap_or(u64::MAX)
}

fn follow_up_request(
    client: &Client,
    response: &Response,
    route: Option<&Route>,
) -> crate::Result<Option<Request>> {
    let request = response.request();
    match response.status() {
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
            let through_proxy =
                route.is_some_and(|route| matches!(route.proxy(), Proxy::Http { .. }));
            if !through_proxy {
                return Err(Error::ProtocolViolation {
                    method: request.method().clone(),
                    uri: redact_url_for_logs(request.url()),
                    message: "received 407 while not using a proxy".to_owned(),
                });
            }
            client.proxy_authenticator().authenticate(route, response)
        }
        StatusCode::UNAUTHORIZED => client.authenticator().authenticate(route, response),
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => {
            if *request.method() != Method::GET && *request.method() != Method::HEAD {
                return Ok(None);
            }
            redirect_request(client, response)
        }
        StatusCode::MULTIPLE_CHOICES
        | StatusCode::MOVED_PERMANENTLY
        | StatusCode::FOUND
        | StatusCode::SEE_OTHER => redirect_request(client, response),
        StatusCode::REQUEST_TIMEOUT => {
            if !client.retry_on_connection_failure() {
                return Ok(None);
            }
            if response
                .prior_response()
                .is_some_and(|prior| prior.status() == StatusCode::REQUEST_TIMEOUT)
            {
                return Ok(None);
            }
            if retry_after(response, 0) > 0 {
                return Ok(None);
            }
            Ok(Some(request.clone()))
        }
        StatusCode::SERVICE_UNAVAILABLE => {
            if response
                .prior_response()
                .is_some_and(|prior| prior.status() == StatusCode::SERVICE_UNAVAILABLE)
            {
                return Ok(None);
            }
            if retry_after(response, u64::MAX) == 0 {
                return Ok(Some(request.clone()));
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}

fn redirect_request(client: &Client, response: &Response) -> crate::Result<Option<Request>> {
    if !client.follow_redirects() {
        return Ok(None);
    }
    let Some(location) = redirect_location(response.headers()) else {
        return Ok(None);
    };
    let request = response.request();
    let Ok(url) = request.url().join(&location) else {
        return Ok(None);
    };
    if !matches!(url.scheme(), "http" | "https") {
        return Ok(None);
    }
    if url.scheme() != request.url().scheme() && !client.follow_ssl_redirects() {
        return Ok(None);
    }

    let method = request.method().clone();
    let mut builder = request.to_builder().url(url.clone());
    let mut body_dropped = false;
    if permits_request_body(&method) {
        let maintain_body = method.as_str() == "PROPFIND";
        if maintain_body {
            builder = builder.method(method, request.body().cloned());
        } else {
            builder = builder.method(Method::GET, None);
            body_dropped = true;
        }
    }

    let mut headers = request.headers().clone();
    let same_origin_redirect = same_origin(request.url(), &url);
    sanitize_headers_for_redirect(&mut headers, body_dropped, same_origin_redirect);
    builder.headers(headers).build().map(Some)
}
