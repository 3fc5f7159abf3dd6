//! The user request handler seam.

use std::sync::Arc;

use async_trait::async_trait;
use http::{Response, StatusCode};

use crate::body::BoxBody;
use crate::request::IncomingRequest;
use crate::BoxError;

/// What a handler produced for a request.
#[derive(Debug)]
pub enum HandlerResponse {
    /// A complete response, written as-is (plus the standard `Server`
    /// header).
    Full(Response<BoxBody>),
    /// A bare status, expanded by the pipeline into a plain-text meta
    /// response.
    Status(StatusCode),
}

impl From<Response<BoxBody>> for HandlerResponse {
    fn from(response: Response<BoxBody>) -> Self {
        Self::Full(response)
    }
}

impl From<StatusCode> for HandlerResponse {
    fn from(status: StatusCode) -> Self {
        Self::Status(status)
    }
}

/// A user-provided request handler.
///
/// Returning `Ok(None)` means "not handled" and produces a `404`.
/// Errors are caught by the pipeline and produce a `500`; they never
/// propagate into the connection. Handlers are called without any lock
/// held and must be re-entrant.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        request: Arc<IncomingRequest>,
    ) -> Result<Option<HandlerResponse>, BoxError>;
}

#[async_trait]
impl<T: RequestHandler + ?Sized> RequestHandler for Arc<T> {
    async fn handle(
        &self,
        request: Arc<IncomingRequest>,
    ) -> Result<Option<HandlerResponse>, BoxError> {
        (**self).handle(request).await
    }
}
