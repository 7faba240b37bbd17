use http::header::{
    ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, COOKIE, HOST, RANGE, SET_COOKIE,
    TRANSFER_ENCODING, USER_AGENT,
};
use http::HeaderValue;

use crate::chain::{Chain, Interceptor};
use crate::content_encoding::{
    ACCEPTED_ENCODINGS, decode_content_encoded_body, is_decodable_encoded, response_has_body,
};
use crate::cookie::cookie_header;
use crate::error::Error;
use crate::response::Response;
use crate::util::{host_header, parse_header_value, redact_url_for_logs};

/// Turns a caller request into a network request and the network response
/// back into a caller response.
pub(crate) struct Bridge;

impl Interceptor for Bridge {
    fn intercept(&self, chain: &mut Chain<'_>) -> crate::Result<Response> {
        let client = chain.call().client().clone();
        let user_request = chain.request().clone();
        let mut headers = user_request.headers().clone();

        if let Some(body) = user_request.body() {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            headers.remove(TRANSFER_ENCODING);
        }
        if !headers.contains_key(HOST) {
            let host = host_header(user_request.url());
            headers.insert(HOST, parse_header_value(HOST.as_str(), &host)?);
        }
        if !headers.contains_key(CONNECTION) {
            headers.insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));
        }

        // Only decode when we negotiated the encoding ourselves.
        let transparent_decoding =
            !headers.contains_key(ACCEPT_ENCODING) && !headers.contains_key(RANGE);
        if transparent_decoding {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static(ACCEPTED_ENCODINGS));
        }

        let cookies = client.cookie_jar().load_for_request(user_request.url());
        if !cookies.is_empty() {
            let cookie = cookie_header(&cookies);
            headers.insert(COOKIE, parse_header_value(COOKIE.as_str(), &cookie)?);
        }
        if !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, client.user_agent().clone());
        }

        let network_request = user_request.to_builder().headers(headers).build()?;
        let network_response = chain.proceed(network_request)?;

        let set_cookies = network_response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(ToOwned::to_owned)
            .collect::<Vec<_>>();
        if !set_cookies.is_empty() {
            client
                .cookie_jar()
                .save_from_response(user_request.url(), &set_cookies);
        }

        let decode = transparent_decoding
            && is_decodable_encoded(network_response.headers())
            && response_has_body(
                user_request.method(),
                network_response.status(),
                network_response.body().len(),
            );
        if !decode {
            return Ok(network_response.to_builder().request(user_request).build());
        }

        let mut response_headers = network_response.headers().clone();
        let body = decode_content_encoded_body(network_response.body().clone(), &response_headers)
            .map_err(|error| Error::DecodeContentEncoding {
                encoding: error.encoding,
                method: user_request.method().clone(),
                uri: redact_url_for_logs(user_request.url()),
                message: error.message,
            })?;
        response_headers.remove(CONTENT_ENCODING);
        response_headers.remove(CONTENT_LENGTH);
        Ok(network_response
            .to_builder()
            .headers(response_headers)
            .body(body)
            .request(user_request)
            .build())
    }
}
