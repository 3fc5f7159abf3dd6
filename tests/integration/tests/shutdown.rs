use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use integration_tests::{get, http1_exchange, Hello, Sleepy};
use portico::server::Endpoint;
use tokio::net::TcpStream;

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[tokio::test]
async fn stop_drains_the_in_flight_request() {
    let endpoint = Endpoint::builder("drain")
        .bind(any_addr())
        .serve(Arc::new(Sleepy(Duration::from_millis(500))))
        .unwrap();
    let addr = endpoint.start().await.unwrap();

    let client = tokio::spawn(async move { http1_exchange(addr, &get("/slow")).await });
    // Let the request reach the handler before stopping.
    tokio::time::sleep(Duration::from_millis(150)).await;

    endpoint.stop(false).await.unwrap();
    assert!(!endpoint.is_running());

    // The in-flight request ran to completion with its normal response.
    let response = client.await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "slow done");

    // The listener is gone.
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn stop_with_reload_hint_still_drains() {
    let endpoint = Endpoint::builder("reload")
        .bind(any_addr())
        .serve(Arc::new(Hello))
        .unwrap();
    let addr = endpoint.start().await.unwrap();

    let response = http1_exchange(addr, &get("/")).await;
    assert_eq!(response.status, 200);

    endpoint.stop(true).await.unwrap();
    assert!(TcpStream::connect(addr).await.is_err());

    // The same endpoint can serve a fresh run after the reload.
    let addr = endpoint.start().await.unwrap();
    let response = http1_exchange(addr, &get("/")).await;
    assert_eq!(response.status, 200);
    endpoint.stop(false).await.unwrap();
}
