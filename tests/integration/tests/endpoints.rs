use std::net::SocketAddr;
use std::sync::Arc;

use integration_tests::{get, http1_exchange, EchoBody, Failing, Hello, Nothing};
use portico::server::{Endpoint, Protocol};

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[tokio::test]
async fn serves_a_basic_request() {
    let endpoint = Endpoint::builder("basic")
        .bind(any_addr())
        .protocol(Protocol::Http)
        .serve(Arc::new(Hello))
        .unwrap();
    let addr = endpoint.start().await.unwrap();

    let response = http1_exchange(addr, &get("/")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "hello, world");
    assert!(response
        .head
        .to_ascii_lowercase()
        .contains("server: portico/"));

    endpoint.stop(false).await.unwrap();
}

#[tokio::test]
async fn unhandled_requests_get_404_with_the_url() {
    let endpoint = Endpoint::builder("nothing")
        .bind(any_addr())
        .serve(Arc::new(Nothing))
        .unwrap();
    let addr = endpoint.start().await.unwrap();

    let response = http1_exchange(addr, &get("/absent/path")).await;
    assert_eq!(response.status, 404);
    assert!(response.body.starts_with("404 Not Found"));
    assert!(response.body.contains("http://test.example/absent/path"));

    endpoint.stop(false).await.unwrap();
}

#[tokio::test]
async fn asterisk_targets_get_400() {
    let endpoint = Endpoint::builder("asterisk")
        .bind(any_addr())
        .serve(Arc::new(Hello))
        .unwrap();
    let addr = endpoint.start().await.unwrap();

    let request = "OPTIONS * HTTP/1.1\r\nHost: test.example\r\nConnection: close\r\n\r\n";
    let response = http1_exchange(addr, request).await;
    assert_eq!(response.status, 400);
    assert!(response.body.starts_with("400 Bad Request"));

    endpoint.stop(false).await.unwrap();
}

#[tokio::test]
async fn request_bodies_reach_the_handler() {
    let endpoint = Endpoint::builder("echo")
        .bind(any_addr())
        .serve(Arc::new(EchoBody))
        .unwrap();
    let addr = endpoint.start().await.unwrap();

    let request = "POST /in HTTP/1.1\r\nHost: test.example\r\nContent-Length: 5\r\n\
                   Connection: close\r\n\r\n12345";
    let response = http1_exchange(addr, request).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "12345");

    endpoint.stop(false).await.unwrap();
}

#[tokio::test]
async fn oversized_bodies_get_400() {
    let endpoint = Endpoint::builder("capped")
        .bind(any_addr())
        .max_request_body_bytes(4)
        .serve(Arc::new(EchoBody))
        .unwrap();
    let addr = endpoint.start().await.unwrap();

    let request = "POST /in HTTP/1.1\r\nHost: test.example\r\nContent-Length: 16\r\n\
                   Connection: close\r\n\r\nway past the cap";
    let response = http1_exchange(addr, request).await;
    assert_eq!(response.status, 400);
    assert!(response.body.starts_with("400 Bad Request"));

    endpoint.stop(false).await.unwrap();
}

#[tokio::test]
async fn handler_failures_get_500_and_close_the_connection() {
    let endpoint = Endpoint::builder("failing")
        .bind(any_addr())
        .serve(Arc::new(Failing))
        .unwrap();
    let addr = endpoint.start().await.unwrap();

    // Keep-alive request; the server still closes after a 500.
    let request = "GET /boom HTTP/1.1\r\nHost: test.example\r\n\r\n";
    let response = http1_exchange(addr, request).await;
    assert_eq!(response.status, 500);
    assert!(response.body.starts_with("500 Internal Server Error"));
    assert!(response.head.to_ascii_lowercase().contains("connection: close"));

    endpoint.stop(false).await.unwrap();
}
