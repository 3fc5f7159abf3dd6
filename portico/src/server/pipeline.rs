//! The per-request flow: parse, admit, dispatch, write, log.
//!
//! Nothing in here may let an error or panic escape into the executor:
//! every failure either becomes an HTTP error response or is logged and
//! suppressed.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION};
use http::{Request, Response, StatusCode, Version};
use http_body::Body as HttpBody;
use http_body_util::{BodyExt, Limited};
use tokio::sync::watch;
use tower_service::Service;
use tracing::{debug, error, warn};

use super::{ConnectionContext, EndpointShared};
use crate::access::ResponseSummary;
use crate::body::BoxBody;
use crate::handler::HandlerResponse;
use crate::request::IncomingRequest;
use crate::response;
use crate::BoxError;

/// The request service for one connection.
#[derive(Clone)]
pub(crate) struct PipelineService {
    shared: Arc<EndpointShared>,
    connection: Arc<ConnectionContext>,
    /// Raised to wind the connection down after the response flushes.
    close: watch::Sender<bool>,
}

impl PipelineService {
    pub(crate) fn new(
        shared: Arc<EndpointShared>,
        connection: Arc<ConnectionContext>,
        close: watch::Sender<bool>,
    ) -> Self {
        Self {
            shared,
            connection,
            close,
        }
    }

    async fn handle<B>(self, req: Request<B>) -> Response<BoxBody>
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let started_at = Instant::now();
        let (parts, body) = req.into_parts();

        let request = match IncomingRequest::parse(
            self.connection.clone(),
            &parts,
            self.shared.scheme,
        ) {
            Ok(request) => Arc::new(request),
            Err(err) => {
                warn!(
                    conn = self.connection.id(),
                    remote = %self.connection.remote_addr(),
                    local = %self.connection.local_addr(),
                    %err,
                    "rejecting unparseable request"
                );
                let response = response::meta_response(StatusCode::BAD_REQUEST, None);
                return self.finish(None, started_at, response).await;
            }
        };

        self.report_started(&request).await;

        if let Err(err) = self.collect_body(&request, body).await {
            warn!(
                id = request.id(),
                conn = self.connection.id(),
                %err,
                "rejecting request body"
            );
            let response = response::meta_response(StatusCode::BAD_REQUEST, None);
            return self.finish(Some(&request), started_at, response).await;
        }

        // No new work while the endpoint drains.
        let stopping = *self.shared.stopping.borrow();
        if stopping {
            debug!(id = request.id(), "request received while stopping");
            let response = response::meta_response(StatusCode::SERVICE_UNAVAILABLE, None);
            return self.finish(Some(&request), started_at, response).await;
        }

        if let Some(limiter) = &self.shared.limiter {
            if !limiter.admit_request().await {
                debug!(id = request.id(), "request refused by rate limiter");
                let response = response::meta_response(StatusCode::SERVICE_UNAVAILABLE, None);
                return self.finish(Some(&request), started_at, response).await;
            }
        }

        // Only origin-form targets are dispatchable.
        if request.pathname().is_none() {
            debug!(id = request.id(), "request target has no path");
            let response = response::meta_response(StatusCode::BAD_REQUEST, None);
            return self.finish(Some(&request), started_at, response).await;
        }

        let response = self.dispatch(&request).await;
        self.finish(Some(&request), started_at, response).await
    }

    /// Invoke the user handler on its own task so that a panic becomes a
    /// `500` instead of tearing down the connection.
    async fn dispatch(&self, request: &Arc<IncomingRequest>) -> Response<BoxBody> {
        let handler = self.shared.handler.clone();
        let handler_request = request.clone();
        let outcome = tokio::spawn(async move { handler.handle(handler_request).await }).await;

        match outcome {
            Err(join_error) => {
                error!(
                    id = request.id(),
                    conn = self.connection.id(),
                    remote = %self.connection.remote_addr(),
                    %join_error,
                    "request handler panicked"
                );
                response::meta_response(StatusCode::INTERNAL_SERVER_ERROR, None)
            }
            Ok(Err(err)) => {
                error!(id = request.id(), %err, "request handler failed");
                response::meta_response(StatusCode::INTERNAL_SERVER_ERROR, None)
            }
            Ok(Ok(None)) => {
                response::meta_response(StatusCode::NOT_FOUND, Some(&request.logged_url()))
            }
            Ok(Ok(Some(HandlerResponse::Status(status)))) => response::meta_response(status, None),
            Ok(Ok(Some(HandlerResponse::Full(response)))) => response,
        }
    }

    async fn collect_body<B>(&self, request: &IncomingRequest, body: B) -> Result<(), BoxError>
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let collected = match self.shared.max_request_body_bytes {
            None => body.collect().await.map_err(Into::into)?,
            Some(limit) => Limited::new(body, limit as usize).collect().await?,
        };
        request.set_body(collected.to_bytes());
        Ok(())
    }

    async fn finish(
        &self,
        request: Option<&Arc<IncomingRequest>>,
        started_at: Instant,
        mut response: Response<BoxBody>,
    ) -> Response<BoxBody> {
        response::apply_server_header(response.headers_mut());

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            // Let the response flush, then wind the connection down.
            let h1 = request.map_or(true, |request| request.version() <= Version::HTTP_11);
            if h1 {
                response
                    .headers_mut()
                    .insert(CONNECTION, HeaderValue::from_static("close"));
            }
            self.close.send_replace(true);
        }

        if let Some(request) = request {
            self.report_ended(request, &response, started_at).await;
        }
        response
    }

    async fn report_started(&self, request: &IncomingRequest) {
        if let Some(sink) = &self.shared.access_log {
            if let Err(err) = sink.request_started(request).await {
                warn!(id = request.id(), %err, "access log request_started failed");
            }
        }
    }

    async fn report_ended(
        &self,
        request: &IncomingRequest,
        response: &Response<BoxBody>,
        started_at: Instant,
    ) {
        if let Some(sink) = &self.shared.access_log {
            let summary = ResponseSummary {
                status: response.status(),
                body_bytes: response.body().size_hint().exact(),
                elapsed: started_at.elapsed(),
            };
            if let Err(err) = sink.request_ended(request, &summary).await {
                warn!(id = request.id(), %err, "access log request_ended failed");
            }
        }
    }
}

impl<B> Service<Request<B>> for PipelineService
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<BoxBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let pipeline = self.clone();
        Box::pin(async move { Ok(pipeline.handle(req).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RequestHandler;
    use crate::limit::RateLimiter;
    use crate::response::SERVER_NAME;
    use crate::server::Endpoint;
    use async_trait::async_trait;
    use http::header::SERVER;
    use http_body_util::Full;

    struct NullHandler;

    #[async_trait]
    impl RequestHandler for NullHandler {
        async fn handle(
            &self,
            _request: Arc<IncomingRequest>,
        ) -> Result<Option<HandlerResponse>, BoxError> {
            Ok(None)
        }
    }

    struct HelloHandler;

    #[async_trait]
    impl RequestHandler for HelloHandler {
        async fn handle(
            &self,
            _request: Arc<IncomingRequest>,
        ) -> Result<Option<HandlerResponse>, BoxError> {
            let response = Response::builder()
                .status(StatusCode::OK)
                .body(crate::body::full("hello"))
                .unwrap();
            Ok(Some(HandlerResponse::Full(response)))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl RequestHandler for FailingHandler {
        async fn handle(
            &self,
            _request: Arc<IncomingRequest>,
        ) -> Result<Option<HandlerResponse>, BoxError> {
            Err("kaboom".into())
        }
    }

    struct PanickyHandler;

    #[async_trait]
    impl RequestHandler for PanickyHandler {
        async fn handle(
            &self,
            _request: Arc<IncomingRequest>,
        ) -> Result<Option<HandlerResponse>, BoxError> {
            panic!("handler bug")
        }
    }

    struct TeapotHandler;

    #[async_trait]
    impl RequestHandler for TeapotHandler {
        async fn handle(
            &self,
            _request: Arc<IncomingRequest>,
        ) -> Result<Option<HandlerResponse>, BoxError> {
            Ok(Some(HandlerResponse::Status(StatusCode::IM_A_TEAPOT)))
        }
    }

    struct DenyRequests;

    #[async_trait]
    impl RateLimiter for DenyRequests {
        async fn admit_connection(&self) -> bool {
            true
        }

        async fn admit_request(&self) -> bool {
            false
        }
    }

    fn endpoint(handler: Arc<dyn RequestHandler>) -> Endpoint {
        Endpoint::builder("test")
            .bind("127.0.0.1:0".parse().unwrap())
            .serve(handler)
            .unwrap()
    }

    fn service(endpoint: &Endpoint) -> (PipelineService, watch::Receiver<bool>) {
        let connection = Arc::new(ConnectionContext::new(
            "203.0.113.9:55555".parse().unwrap(),
            "127.0.0.1:80".parse().unwrap(),
        ));
        let (close_tx, close_rx) = watch::channel(false);
        (
            PipelineService::new(endpoint.shared(), connection, close_tx),
            close_rx,
        )
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(uri)
            .header(http::header::HOST, "test.example")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn run(
        service: &mut PipelineService,
        request: Request<Full<Bytes>>,
    ) -> (StatusCode, String, http::HeaderMap) {
        let response = service.call(request).await.unwrap();
        let (parts, body) = response.into_parts();
        let text =
            String::from_utf8(body.collect().await.unwrap().to_bytes().to_vec()).unwrap();
        (parts.status, text, parts.headers)
    }

    #[tokio::test]
    async fn handled_request_carries_the_server_header() {
        let endpoint = endpoint(Arc::new(HelloHandler));
        let (mut service, _close) = service(&endpoint);
        let (status, text, headers) = run(&mut service, get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "hello");
        assert_eq!(headers.get(SERVER).unwrap(), SERVER_NAME);
    }

    #[tokio::test]
    async fn unhandled_request_is_404_with_the_logged_url() {
        let endpoint = endpoint(Arc::new(NullHandler));
        let (mut service, _close) = service(&endpoint);
        let (status, text, _) = run(&mut service, get("/missing/thing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(text.starts_with("404 Not Found"));
        assert!(text.contains("http://test.example/missing/thing"));
    }

    #[tokio::test]
    async fn asterisk_target_is_rejected_with_400() {
        let endpoint = endpoint(Arc::new(HelloHandler));
        let (mut service, _close) = service(&endpoint);
        let request = Request::builder()
            .method(http::Method::OPTIONS)
            .uri("*")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let (status, text, _) = run(&mut service, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(text.starts_with("400 Bad Request"));
    }

    #[tokio::test]
    async fn handler_errors_become_500_and_close_the_connection() {
        let endpoint = endpoint(Arc::new(FailingHandler));
        let (mut service, close) = service(&endpoint);
        let (status, text, headers) = run(&mut service, get("/x")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(text.starts_with("500 Internal Server Error"));
        assert_eq!(headers.get(CONNECTION).unwrap(), "close");
        assert!(*close.borrow());
    }

    #[tokio::test]
    async fn handler_panics_become_500() {
        let endpoint = endpoint(Arc::new(PanickyHandler));
        let (mut service, _close) = service(&endpoint);
        let (status, text, _) = run(&mut service, get("/x")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(text.starts_with("500 Internal Server Error"));
    }

    #[tokio::test]
    async fn status_outcomes_expand_to_meta_responses() {
        let endpoint = endpoint(Arc::new(TeapotHandler));
        let (mut service, close) = service(&endpoint);
        let (status, text, _) = run(&mut service, get("/x")).await;
        assert_eq!(status, StatusCode::IM_A_TEAPOT);
        assert!(text.starts_with("418 I'm a teapot"));
        assert!(!*close.borrow());
    }

    #[tokio::test]
    async fn stopping_endpoint_rejects_new_requests_with_503() {
        let endpoint = endpoint(Arc::new(HelloHandler));
        let (mut service, close) = service(&endpoint);
        endpoint.shared().stopping.send_replace(true);
        let (status, text, _) = run(&mut service, get("/x")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(text.starts_with("503 Service Unavailable"));
        assert!(*close.borrow());
    }

    #[tokio::test]
    async fn rate_limited_request_is_503_and_closes() {
        let endpoint = Endpoint::builder("test")
            .bind("127.0.0.1:0".parse().unwrap())
            .rate_limiter(Arc::new(DenyRequests))
            .serve(Arc::new(HelloHandler))
            .unwrap();
        let (mut service, close) = service(&endpoint);
        let (status, _, _) = run(&mut service, get("/x")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(*close.borrow());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_with_400() {
        let endpoint = Endpoint::builder("test")
            .bind("127.0.0.1:0".parse().unwrap())
            .max_request_body_bytes(4)
            .serve(Arc::new(HelloHandler))
            .unwrap();
        let (mut service, _close) = service(&endpoint);
        let request = Request::builder()
            .method(http::Method::POST)
            .uri("/upload")
            .body(Full::new(Bytes::from_static(b"way past the cap")))
            .unwrap();
        let (status, text, _) = run(&mut service, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(text.starts_with("400 Bad Request"));
    }

    #[tokio::test]
    async fn handler_sees_the_collected_body() {
        struct EchoLen;

        #[async_trait]
        impl RequestHandler for EchoLen {
            async fn handle(
                &self,
                request: Arc<IncomingRequest>,
            ) -> Result<Option<HandlerResponse>, BoxError> {
                let len = request.body().map_or(0, |body| body.len());
                let response = Response::builder()
                    .status(StatusCode::OK)
                    .body(crate::body::full(len.to_string()))
                    .unwrap();
                Ok(Some(HandlerResponse::Full(response)))
            }
        }

        let endpoint = endpoint(Arc::new(EchoLen));
        let (mut service, _close) = service(&endpoint);
        let request = Request::builder()
            .method(http::Method::POST)
            .uri("/len")
            .body(Full::new(Bytes::from_static(b"12345")))
            .unwrap();
        let (status, text, _) = run(&mut service, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "5");
    }
}
