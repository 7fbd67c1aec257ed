//! HTTP-over-Call codec
//!
//! Serializes a whole HTTP/1.1 request or response into one self-delimiting
//! payload and parses it back. Bodies are always complete: there is no
//! chunked or streamed form on the tunnel.

use ::http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use ::http::{Method, Request, Response, StatusCode, Version};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::trace;

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 100;

/// HTTP codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpCodecError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

/// Encode an HTTP request in HTTP/1.1 wire format
///
/// The request target is written in origin form. `Content-Length` is
/// rewritten to the real body length, or added when the body is non-empty.
pub fn encode_request(request: &Request<Bytes>) -> Bytes {
    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let body = request.body();
    let mut buf = BytesMut::with_capacity(256 + body.len());
    buf.put_slice(request.method().as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(target.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");

    if !request.headers().contains_key(::http::header::HOST) {
        if let Some(authority) = request.uri().authority() {
            put_header(&mut buf, b"host", authority.as_str().as_bytes());
        }
    }

    put_headers(
        &mut buf,
        request.headers(),
        Framing::Body {
            len: body.len(),
            always: false,
        },
    );
    buf.put_slice(b"\r\n");
    buf.put_slice(body);

    trace!(
        "Encoded request {} {} ({} body bytes)",
        request.method(),
        target,
        body.len()
    );
    buf.freeze()
}

/// Decode an HTTP request previously produced by [`encode_request`] (or any
/// HTTP/1.x client)
pub fn decode_request(buf: &[u8]) -> Result<Request<Bytes>, HttpCodecError> {
    let malformed = |reason: String| HttpCodecError::MalformedRequest(reason);

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    let head_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Err(malformed("incomplete head".to_string())),
        Err(e) => return Err(malformed(e.to_string())),
    };

    let method = Method::from_bytes(parsed.method.unwrap_or("").as_bytes())
        .map_err(|e| malformed(e.to_string()))?;
    let uri = parsed
        .path
        .unwrap_or("/")
        .parse::<::http::Uri>()
        .map_err(|e| malformed(e.to_string()))?;
    let header_map = collect_headers(parsed.headers).map_err(malformed)?;
    let body = extract_body(&buf[head_len..], &header_map, false).map_err(malformed)?;

    let mut request = Request::new(body);
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.version_mut() = version_of(parsed.version);
    *request.headers_mut() = header_map;

    Ok(request)
}

/// Whether a response to `method` with `status` never carries a body
///
/// Such responses keep whatever `Content-Length` the server chose (a HEAD
/// answer advertises the length a GET would have had).
pub fn is_bodiless(method: &Method, status: StatusCode) -> bool {
    method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// Encode an HTTP response in HTTP/1.1 wire format, always carrying a
/// correct `Content-Length`
///
/// Same as [`encode_response_for`] with a GET request.
pub fn encode_response(response: &Response<Bytes>) -> Bytes {
    encode_response_for(&Method::GET, response)
}

/// Encode the response to a `method` request
///
/// Bodiless responses (see [`is_bodiless`]) are written without a body and
/// with their headers untouched apart from `Transfer-Encoding`.
pub fn encode_response_for(method: &Method, response: &Response<Bytes>) -> Bytes {
    let status = response.status();
    let bodiless = is_bodiless(method, status);
    let body = if bodiless {
        &[][..]
    } else {
        &response.body()[..]
    };

    let mut buf = BytesMut::with_capacity(256 + body.len());
    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(status.canonical_reason().unwrap_or("").as_bytes());
    buf.put_slice(b"\r\n");

    let framing = if bodiless {
        Framing::Bodiless
    } else {
        Framing::Body {
            len: body.len(),
            always: true,
        }
    };
    put_headers(&mut buf, response.headers(), framing);
    buf.put_slice(b"\r\n");
    buf.put_slice(body);

    trace!("Encoded response {} ({} body bytes)", status, body.len());
    buf.freeze()
}

/// Decode an HTTP response previously produced by [`encode_response`]
///
/// Without `Content-Length` the rest of the payload is the body.
pub fn decode_response(buf: &[u8]) -> Result<Response<Bytes>, HttpCodecError> {
    decode_response_for(&Method::GET, buf)
}

/// Decode the response to a `method` request
///
/// A bodiless response has an empty body whatever its `Content-Length` says.
pub fn decode_response_for(
    method: &Method,
    buf: &[u8],
) -> Result<Response<Bytes>, HttpCodecError> {
    let malformed = |reason: String| HttpCodecError::MalformedResponse(reason);

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);

    let head_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Err(malformed("incomplete head".to_string())),
        Err(e) => return Err(malformed(e.to_string())),
    };

    let status = StatusCode::from_u16(parsed.code.unwrap_or(0))
        .map_err(|e| malformed(e.to_string()))?;
    let header_map = collect_headers(parsed.headers).map_err(malformed)?;
    let body = if is_bodiless(method, status) {
        Bytes::new()
    } else {
        extract_body(&buf[head_len..], &header_map, true).map_err(malformed)?
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.version_mut() = version_of(parsed.version);
    *response.headers_mut() = header_map;

    Ok(response)
}

fn put_header(buf: &mut BytesMut, name: &[u8], value: &[u8]) {
    buf.put_slice(name);
    buf.put_slice(b": ");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}

/// How `Content-Length` is written
#[derive(Clone, Copy)]
enum Framing {
    /// A whole body of `len` bytes; the header is added when absent only if
    /// `always` is set or the body is non-empty
    Body { len: usize, always: bool },
    /// No body follows; an existing `Content-Length` is kept as is
    Bodiless,
}

/// Write all headers, normalising framing headers
fn put_headers(buf: &mut BytesMut, headers: &HeaderMap, framing: Framing) {
    let length = match framing {
        Framing::Body { len, .. } => Some(len.to_string()),
        Framing::Bodiless => None,
    };
    let mut wrote_length = false;

    for (name, value) in headers.iter() {
        if name == CONTENT_LENGTH {
            // Keep the position of the first one, drop duplicates
            if !wrote_length {
                let value = length.as_deref().map_or(value.as_bytes(), str::as_bytes);
                put_header(buf, name.as_str().as_bytes(), value);
                wrote_length = true;
            }
            continue;
        }
        if name == TRANSFER_ENCODING {
            continue;
        }
        put_header(buf, name.as_str().as_bytes(), value.as_bytes());
    }

    if let (Framing::Body { len, always }, Some(length)) = (framing, &length) {
        if !wrote_length && (always || len > 0) {
            put_header(buf, CONTENT_LENGTH.as_str().as_bytes(), length.as_bytes());
        }
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|e| e.to_string())?;
        let value = HeaderValue::from_bytes(header.value).map_err(|e| e.to_string())?;
        map.append(name, value);
    }
    Ok(map)
}

fn extract_body(rest: &[u8], headers: &HeaderMap, to_end: bool) -> Result<Bytes, String> {
    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .any(|v| v.as_bytes().eq_ignore_ascii_case(b"chunked"));
    if chunked {
        return Err("chunked transfer encoding is not supported".to_string());
    }

    match headers.get(CONTENT_LENGTH) {
        Some(value) => {
            let length = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or_else(|| "invalid content-length".to_string())?;
            if rest.len() < length {
                return Err(format!(
                    "body truncated: expected {} bytes, got {}",
                    length,
                    rest.len()
                ));
            }
            Ok(Bytes::copy_from_slice(&rest[..length]))
        }
        None if to_end => Ok(Bytes::copy_from_slice(rest)),
        None => Ok(Bytes::new()),
    }
}

fn version_of(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_request() -> Request<Bytes> {
        Request::builder()
            .method(Method::POST)
            .uri("/v1/tasks?limit=10&sort=asc")
            .header("host", "localhost")
            .header("content-type", "application/json")
            .header("x-trace", "a")
            .header("x-trace", "b")
            .header("content-length", "15")
            .body(Bytes::from_static(b"{\"name\":\"task\"}"))
            .unwrap()
    }

    #[test]
    fn test_request_roundtrip() {
        let request = post_request();

        let encoded = encode_request(&request);
        let decoded = decode_request(&encoded).unwrap();

        assert_eq!(decoded.method(), request.method());
        assert_eq!(decoded.uri(), request.uri());
        assert_eq!(decoded.headers(), request.headers());
        assert_eq!(decoded.body(), request.body());

        let traces: Vec<_> = decoded.headers().get_all("x-trace").iter().collect();
        assert_eq!(traces, vec!["a", "b"]);
    }

    #[test]
    fn test_request_without_body_gets_no_length() {
        let request = Request::builder()
            .uri("/v1/plugins")
            .header("accept", "application/json")
            .body(Bytes::new())
            .unwrap();

        let encoded = encode_request(&request);
        assert_eq!(
            &encoded[..],
            b"GET /v1/plugins HTTP/1.1\r\naccept: application/json\r\n\r\n"
        );

        let decoded = decode_request(&encoded).unwrap();
        assert_eq!(decoded.headers(), request.headers());
        assert!(decoded.body().is_empty());
    }

    #[test]
    fn test_request_length_is_normalised() {
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/v1/items/1")
            .header("content-length", "999")
            .header("transfer-encoding", "chunked")
            .body(Bytes::from_static(b"hello"))
            .unwrap();

        let decoded = decode_request(&encode_request(&request)).unwrap();
        assert_eq!(decoded.headers()["content-length"], "5");
        assert!(decoded.headers().get("transfer-encoding").is_none());
        assert_eq!(decoded.body(), &Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_request_absolute_uri_becomes_origin_form() {
        let request = Request::builder()
            .uri("http://agent.local:8181/v1/metrics?ns=/intel")
            .body(Bytes::new())
            .unwrap();

        let encoded = encode_request(&request);
        let decoded = decode_request(&encoded).unwrap();

        assert_eq!(decoded.uri(), "/v1/metrics?ns=/intel");
        assert_eq!(decoded.headers()["host"], "agent.local:8181");
    }

    #[test]
    fn test_request_trailing_bytes_ignored() {
        let mut raw = encode_request(&post_request()).to_vec();
        raw.extend_from_slice(b"garbage");

        let decoded = decode_request(&raw).unwrap();
        assert_eq!(decoded.body().len(), 15);
    }

    #[test]
    fn test_response_roundtrip() {
        let response = Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("content-type", "application/json")
            .header("set-cookie", "a=1")
            .header("set-cookie", "b=2")
            .header("content-length", "19")
            .body(Bytes::from_static(b"{\"error\":\"missing\"}"))
            .unwrap();

        let encoded = encode_response(&response);
        assert!(encoded.starts_with(b"HTTP/1.1 404 Not Found\r\n"));

        let decoded = decode_response(&encoded).unwrap();
        assert_eq!(decoded.status(), StatusCode::NOT_FOUND);
        assert_eq!(decoded.headers(), response.headers());
        assert_eq!(decoded.body(), response.body());
    }

    #[test]
    fn test_response_always_has_length() {
        let response = Response::builder()
            .status(StatusCode::OK)
            .body(Bytes::new())
            .unwrap();

        let decoded = decode_response(&encode_response(&response)).unwrap();
        assert_eq!(decoded.headers()["content-length"], "0");

        let no_content = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Bytes::new())
            .unwrap();
        let decoded = decode_response(&encode_response(&no_content)).unwrap();
        assert_eq!(decoded.status(), StatusCode::NO_CONTENT);
        assert!(decoded.headers().get("content-length").is_none());
    }

    #[test]
    fn test_head_response_keeps_advertised_length() {
        let response = Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .header("content-length", "14")
            .body(Bytes::new())
            .unwrap();

        let encoded = encode_response_for(&Method::HEAD, &response);
        assert!(encoded.ends_with(b"content-length: 14\r\n\r\n"));

        let decoded = decode_response_for(&Method::HEAD, &encoded).unwrap();
        assert_eq!(decoded.headers()["content-length"], "14");
        assert!(decoded.body().is_empty());
    }

    #[test]
    fn test_head_response_drops_stray_body() {
        let response = Response::builder()
            .header("content-length", "5")
            .body(Bytes::from_static(b"hello"))
            .unwrap();

        let encoded = encode_response_for(&Method::HEAD, &response);
        assert!(!encoded.ends_with(b"hello"));

        let decoded = decode_response_for(&Method::HEAD, &encoded).unwrap();
        assert_eq!(decoded.headers()["content-length"], "5");
        assert!(decoded.body().is_empty());
    }

    #[test]
    fn test_not_modified_ignores_length_on_decode() {
        let raw = b"HTTP/1.1 304 Not Modified\r\ncontent-length: 120\r\n\r\n";
        let decoded = decode_response(raw).unwrap();
        assert_eq!(decoded.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(decoded.headers()["content-length"], "120");
        assert!(decoded.body().is_empty());
    }

    #[test]
    fn test_response_without_length_reads_to_end() {
        let decoded = decode_response(b"HTTP/1.0 200 OK\r\nx-a: b\r\n\r\nstreamed body").unwrap();
        assert_eq!(decoded.version(), Version::HTTP_10);
        assert_eq!(decoded.body(), &Bytes::from_static(b"streamed body"));
    }

    #[test]
    fn test_non_utf8_header_value() {
        let request = Request::builder()
            .uri("/")
            .header("x-raw", HeaderValue::from_bytes(&[0xe9, b'a']).unwrap())
            .body(Bytes::new())
            .unwrap();

        let decoded = decode_request(&encode_request(&request)).unwrap();
        assert_eq!(decoded.headers()["x-raw"].as_bytes(), &[0xe9, b'a']);
    }

    #[test]
    fn test_decode_malformed_request() {
        assert!(matches!(
            decode_request(b"\x00\x01\x02 not http"),
            Err(HttpCodecError::MalformedRequest(_))
        ));
        assert!(matches!(
            decode_request(b"GET / HTTP/1.1\r\nhost: x\r\n"),
            Err(HttpCodecError::MalformedRequest(_))
        ));
        assert!(matches!(
            decode_request(b""),
            Err(HttpCodecError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_decode_truncated_body() {
        let result = decode_request(b"POST / HTTP/1.1\r\ncontent-length: 10\r\n\r\nshort");
        assert_eq!(
            result.unwrap_err(),
            HttpCodecError::MalformedRequest(
                "body truncated: expected 10 bytes, got 5".to_string()
            )
        );
    }

    #[test]
    fn test_decode_chunked_rejected() {
        let result = decode_response(
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        );
        assert!(matches!(result, Err(HttpCodecError::MalformedResponse(_))));
    }

    #[test]
    fn test_decode_too_many_headers() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..(MAX_HEADERS + 1) {
            raw.extend_from_slice(format!("x-h{}: v\r\n", i).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");

        assert!(matches!(
            decode_request(&raw),
            Err(HttpCodecError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_decode_malformed_response() {
        assert!(matches!(
            decode_response(b"HTTP/1.1 abc OK\r\n\r\n"),
            Err(HttpCodecError::MalformedResponse(_))
        ));
        assert!(matches!(
            decode_response(b"HTTP/1.1 200 OK\r\ncontent-length: nope\r\n\r\n"),
            Err(HttpCodecError::MalformedResponse(_))
        ));
    }
}
