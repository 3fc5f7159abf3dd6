//! Admission control: cap request throughput with a token bucket.

use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;

use portico::handler::{HandlerResponse, RequestHandler};
use portico::limit::{BucketRateLimiter, TokenBucket, TokenBucketConfig};
use portico::request::IncomingRequest;
use portico::server::Endpoint;

struct Ok204;

#[async_trait]
impl RequestHandler for Ok204 {
    async fn handle(
        &self,
        _request: Arc<IncomingRequest>,
    ) -> Result<Option<HandlerResponse>, portico::BoxError> {
        Ok(Some(HandlerResponse::Status(StatusCode::NO_CONTENT)))
    }
}

#[tokio::main]
async fn main() -> Result<(), portico::BoxError> {
    tracing_subscriber::fmt::init();

    // 10 requests per second steady state, bursts up to 50, and at most
    // 100 request tokens waiting at once.
    let requests = TokenBucket::new(
        TokenBucketConfig::new(10.0, 50.0).max_queue_size(100.0),
    )?;
    let limiter = BucketRateLimiter::new().requests(requests);

    let endpoint = Endpoint::builder("limited")
        .bind("127.0.0.1:8080".parse()?)
        .rate_limiter(Arc::new(limiter))
        .serve(Arc::new(Ok204))?;

    let addr = endpoint.start().await?;
    println!("listening on http://{addr}");
    endpoint.run().await?;
    Ok(())
}
