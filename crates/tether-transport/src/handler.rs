//! Handlers for incoming calls

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use thiserror::Error;

/// Failure reported back to the caller of a method
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type HandlerResult = Result<Bytes, HandlerError>;

/// Serves one named method on a [`crate::CallTransport`]
///
/// Each incoming call runs on its own task, so a handler may take as long as
/// it needs without stalling the connection.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    async fn handle(&self, payload: Bytes) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> CallHandler for F
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, payload: Bytes) -> HandlerResult {
        (self)(payload).await
    }
}
