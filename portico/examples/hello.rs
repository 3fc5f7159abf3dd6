//! The smallest useful endpoint: answer everything, log every request,
//! stop cleanly on ctrl-c.

use std::sync::Arc;

use async_trait::async_trait;
use http::{Response, StatusCode};

use portico::access::TracingAccessLog;
use portico::body;
use portico::handler::{HandlerResponse, RequestHandler};
use portico::request::IncomingRequest;
use portico::server::{Endpoint, Protocol};

struct Hello;

#[async_trait]
impl RequestHandler for Hello {
    async fn handle(
        &self,
        request: Arc<IncomingRequest>,
    ) -> Result<Option<HandlerResponse>, portico::BoxError> {
        let body = format!("hello from {}\n", request.logged_url());
        let response = Response::builder()
            .status(StatusCode::OK)
            .body(body::full(body))
            .unwrap();
        Ok(Some(HandlerResponse::Full(response)))
    }
}

#[tokio::main]
async fn main() -> Result<(), portico::BoxError> {
    tracing_subscriber::fmt::init();

    let endpoint = Endpoint::builder("hello")
        .bind("127.0.0.1:8080".parse()?)
        .protocol(Protocol::Http)
        .access_log(Arc::new(TracingAccessLog))
        .serve(Arc::new(Hello))?;

    let addr = endpoint.start().await?;
    println!("listening on http://{addr}");

    tokio::signal::ctrl_c().await?;
    endpoint.stop(false).await?;
    Ok(())
}
