//! Access-log sink seam.
//!
//! An endpoint with a configured sink reports each request twice:
//! [`request_started`](AccessLogSink::request_started) before dispatch
//! begins, so the log captures true server-side latency, and
//! [`request_ended`](AccessLogSink::request_ended) once the response has
//! been handed to the protocol server. Sink failures are logged and
//! swallowed; they never fail the request.

use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use tracing::info;

use crate::request::IncomingRequest;
use crate::BoxError;

/// What the pipeline knows about a response when reporting it.
#[derive(Debug, Clone)]
pub struct ResponseSummary {
    pub status: StatusCode,
    /// The response body length, when knowable up front.
    pub body_bytes: Option<u64>,
    /// Server-side time from request start to response write.
    pub elapsed: Duration,
}

/// Receives request life cycle events from an endpoint.
#[async_trait]
pub trait AccessLogSink: Send + Sync + 'static {
    async fn request_started(&self, request: &IncomingRequest) -> Result<(), BoxError>;

    async fn request_ended(
        &self,
        request: &IncomingRequest,
        response: &ResponseSummary,
    ) -> Result<(), BoxError>;
}

/// An [`AccessLogSink`] that writes `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAccessLog;

#[async_trait]
impl AccessLogSink for TracingAccessLog {
    async fn request_started(&self, request: &IncomingRequest) -> Result<(), BoxError> {
        info!(
            id = request.id(),
            method = %request.method(),
            url = %request.logged_url(),
            remote = %request.connection().remote_addr(),
            "request started"
        );
        Ok(())
    }

    async fn request_ended(
        &self,
        request: &IncomingRequest,
        response: &ResponseSummary,
    ) -> Result<(), BoxError> {
        info!(
            id = request.id(),
            status = response.status.as_u16(),
            bytes = response.body_bytes,
            elapsed_ms = response.elapsed.as_millis() as u64,
            "request ended"
        );
        Ok(())
    }
}
