use std::net::SocketAddr;
use std::sync::Arc;

use integration_tests::{get, http1_exchange, try_http1_exchange, Hello};
use portico::limit::{BucketRateLimiter, TokenBucket, TokenBucketConfig};
use portico::server::Endpoint;

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// A bucket with one token and a refill rate slow enough that nothing
/// accrues during a test.
fn one_shot_bucket() -> TokenBucket {
    TokenBucket::new(
        TokenBucketConfig::new(0.001, 1.0)
            .initial_burst_size(1.0)
            .max_queue_size(0.5),
    )
    .unwrap()
}

#[tokio::test]
async fn rate_limited_requests_get_503_and_a_closed_connection() {
    let limiter = BucketRateLimiter::new().requests(one_shot_bucket());
    let endpoint = Endpoint::builder("limited")
        .bind(any_addr())
        .rate_limiter(Arc::new(limiter))
        .serve(Arc::new(Hello))
        .unwrap();
    let addr = endpoint.start().await.unwrap();

    let first = http1_exchange(addr, &get("/")).await;
    assert_eq!(first.status, 200);

    let second = http1_exchange(addr, &get("/")).await;
    assert_eq!(second.status, 503);
    assert!(second.body.starts_with("503 Service Unavailable"));
    assert!(second.head.to_ascii_lowercase().contains("connection: close"));

    endpoint.stop(false).await.unwrap();
}

#[tokio::test]
async fn refused_connections_are_dropped_without_a_response() {
    let limiter = BucketRateLimiter::new().connections(one_shot_bucket());
    let endpoint = Endpoint::builder("gated")
        .bind(any_addr())
        .rate_limiter(Arc::new(limiter))
        .serve(Arc::new(Hello))
        .unwrap();
    let addr = endpoint.start().await.unwrap();

    let first = try_http1_exchange(addr, &get("/")).await;
    assert_eq!(first.expect("admitted connection").status, 200);

    let second = try_http1_exchange(addr, &get("/")).await;
    assert!(second.is_none());

    endpoint.stop(false).await.unwrap();
}
