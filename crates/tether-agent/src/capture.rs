//! In-memory HTTP response sink

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Response, StatusCode};

/// Destination a local HTTP server writes its response into
pub trait ResponseSink: Send {
    fn set_status(&mut self, status: StatusCode);

    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Append to the response body
    fn write_body(&mut self, chunk: &[u8]);
}

/// Accumulates a response without any socket underneath
///
/// The status defaults to `200 OK` when the server never sets one.
#[derive(Debug, Default)]
pub struct CapturedResponse {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
}

impl CapturedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_response(self) -> Response<Bytes> {
        let mut response = Response::new(self.body.freeze());
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = self.headers;
        response
    }
}

impl ResponseSink for CapturedResponse {
    fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }
}
