//! The agent's local HTTP server, reached without a socket

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use std::convert::Infallible;
use tower::util::ServiceExt;
use tower::Service;
use tracing::warn;

use crate::capture::ResponseSink;

/// Serves one HTTP request into a [`ResponseSink`]
///
/// Failures inside the server are expected to be written as ordinary
/// 4xx/5xx responses.
#[async_trait]
pub trait LocalService: Send + Sync + 'static {
    async fn handle(&self, request: Request<Bytes>, sink: &mut dyn ResponseSink);
}

/// Adapts a tower service (an `axum::Router`, typically) into a [`LocalService`]
#[derive(Clone)]
pub struct TowerService<S> {
    inner: S,
    body_limit: usize,
}

impl<S> TowerService<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            body_limit: tether_proto::MAX_FRAME_SIZE,
        }
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }
}

impl TowerService<axum::Router> {
    pub fn router(router: axum::Router) -> Self {
        Self::new(router)
    }
}

#[async_trait]
impl<S> LocalService for TowerService<S>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    async fn handle(&self, request: Request<Bytes>, sink: &mut dyn ResponseSink) {
        let request = request.map(Body::from);
        let response = match self.inner.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        let (parts, body) = response.into_parts();
        match axum::body::to_bytes(body, self.body_limit).await {
            Ok(bytes) => {
                sink.set_status(parts.status);
                *sink.headers_mut() = parts.headers;
                sink.write_body(&bytes);
            }
            Err(e) => {
                warn!("Local response body could not be read: {}", e);
                sink.set_status(StatusCode::INTERNAL_SERVER_ERROR);
                sink.write_body(format!("failed to read response body: {}", e).as_bytes());
            }
        }
    }
}
