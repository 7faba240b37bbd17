use std::io::{self, Read};

use bytes::Bytes;
use http::header::CONTENT_ENCODING;
use http::{HeaderMap, Method, StatusCode};

#[derive(Debug)]
pub(crate) struct DecodeContentEncodingError {
    pub(crate) encoding: String,
    pub(crate) message: String,
}

/// Sent as `Accept-Encoding` when the client decodes responses itself.
pub(crate) const ACCEPTED_ENCODINGS: &str = "gzip, deflate, br, zstd";

const DECODABLE_ENCODINGS: [&str; 5] = ["gzip", "deflate", "br", "zstd", "identity"];

fn read_to_end<R: Read>(
    reader: &mut R,
    encoding: &str,
) -> Result<Vec<u8>, DecodeContentEncodingError> {
    let mut decoded = Vec::new();
    reader
        .read_to_end(&mut decoded)
        .map_err(|error: io::Error| DecodeContentEncodingError {
            encoding: encoding.to_owned(),
            message: error.to_string(),
        })?;
    Ok(decoded)
}

pub(crate) fn response_has_body(method: &Method, status: StatusCode, body_len: usize) -> bool {
    if body_len == 0 || *method == Method::HEAD {
        return false;
    }
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// True when the body carries a `Content-Encoding` made only of codings
/// [`decode_content_encoded_body`] understands, and at least one of them
/// is not `identity`.
pub(crate) fn is_decodable_encoded(headers: &HeaderMap) -> bool {
    let Some(value) = headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let mut encodings = value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .peekable();
    if encodings.peek().is_none() {
        return false;
    }
    let mut any_transform = false;
    for encoding in encodings {
        let known = DECODABLE_ENCODINGS
            .iter()
            .any(|known| encoding.eq_ignore_ascii_case(known));
        if !known {
            return false;
        }
        any_transform |= !encoding.eq_ignore_ascii_case("identity");
    }
    any_transform
}

/// Decodes the layered `Content-Encoding` of a buffered body, last encoding first.
pub(crate) fn decode_content_encoded_body(
    mut body: Bytes,
    headers: &HeaderMap,
) -> Result<Bytes, DecodeContentEncodingError> {
    let Some(content_encoding) = headers.get(CONTENT_ENCODING) else {
        return Ok(body);
    };
    let content_encoding =
        content_encoding
            .to_str()
            .map_err(|error| DecodeContentEncodingError {
                encoding: "content-encoding".to_owned(),
                message: error.to_string(),
            })?;
    let mut encodings = content_encoding
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>();

    while let Some(encoding) = encodings.pop() {
        let decoded = match encoding.to_ascii_lowercase().as_str() {
            "identity" => continue,
            "gzip" => {
                let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
                read_to_end(&mut decoder, encoding)?
            }
            "deflate" => {
                let mut decoder = flate2::read::ZlibDecoder::new(body.as_ref());
                read_to_end(&mut decoder, encoding)?
            }
            "br" => {
                let mut decoder = brotli::Decompressor::new(body.as_ref(), 4096);
                read_to_end(&mut decoder, encoding)?
            }
            "zstd" => {
                let mut decoder =
                    zstd::stream::read::Decoder::new(body.as_ref()).map_err(|error| {
                        DecodeContentEncodingError {
                            encoding: encoding.to_owned(),
                            message: error.to_string(),
                        }
                    })?;
                read_to_end(&mut decoder, encoding)?
            }
            other => {
                return Err(DecodeContentEncodingError {
                    encoding: other.to_owned(),
                    message: "unsupported content-encoding".to_owned(),
                });
            }
        };
        body = Bytes::from(decoded);
    }

    Ok(body)
}
