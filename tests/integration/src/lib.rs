//! Support code for the integration tests: canned request handlers and
//! a byte-level HTTP/1 client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{Response, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use portico::body;
use portico::handler::{HandlerResponse, RequestHandler};
use portico::request::IncomingRequest;
use portico::BoxError;

/// A parsed-enough HTTP/1 response: status code, raw header block,
/// body.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub body: String,
}

/// Send raw request bytes and read the connection to EOF.
///
/// Every test request either carries `Connection: close` or expects the
/// server to close, so reading to EOF always terminates.
pub async fn http1_exchange(addr: SocketAddr, request: &str) -> RawResponse {
    try_http1_exchange(addr, request)
        .await
        .expect("server sent a response")
}

/// Like [`http1_exchange`], but `None` when the server closed the
/// connection without sending a response.
pub async fn try_http1_exchange(addr: SocketAddr, request: &str) -> Option<RawResponse> {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(request.as_bytes()).await.expect("write");

    let mut raw = Vec::new();
    let _ = stream.read_to_end(&mut raw).await;
    if raw.is_empty() {
        return None;
    }
    Some(parse_response(&raw))
}

fn parse_response(raw: &[u8]) -> RawResponse {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .expect("response has a header block");
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("response has a status code");
    RawResponse {
        status,
        head: head.to_owned(),
        body: body.to_owned(),
    }
}

/// Build a GET with `Connection: close`.
pub fn get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: test.example\r\nConnection: close\r\n\r\n")
}

/// A handler answering every request with `200` and a fixed body.
pub struct Hello;

#[async_trait]
impl RequestHandler for Hello {
    async fn handle(
        &self,
        _request: Arc<IncomingRequest>,
    ) -> Result<Option<HandlerResponse>, BoxError> {
        let response = Response::builder()
            .status(StatusCode::OK)
            .body(body::full("hello, world"))
            .unwrap();
        Ok(Some(HandlerResponse::Full(response)))
    }
}

/// A handler that handles nothing.
pub struct Nothing;

#[async_trait]
impl RequestHandler for Nothing {
    async fn handle(
        &self,
        _request: Arc<IncomingRequest>,
    ) -> Result<Option<HandlerResponse>, BoxError> {
        Ok(None)
    }
}

/// A handler that always fails.
pub struct Failing;

#[async_trait]
impl RequestHandler for Failing {
    async fn handle(
        &self,
        _request: Arc<IncomingRequest>,
    ) -> Result<Option<HandlerResponse>, BoxError> {
        Err("deliberate failure".into())
    }
}

/// A handler that answers after a delay, for shutdown tests.
pub struct Sleepy(pub Duration);

#[async_trait]
impl RequestHandler for Sleepy {
    async fn handle(
        &self,
        _request: Arc<IncomingRequest>,
    ) -> Result<Option<HandlerResponse>, BoxError> {
        tokio::time::sleep(self.0).await;
        let response = Response::builder()
            .status(StatusCode::OK)
            .body(body::full("slow done"))
            .unwrap();
        Ok(Some(HandlerResponse::Full(response)))
    }
}

/// A handler echoing the collected request body back.
pub struct EchoBody;

#[async_trait]
impl RequestHandler for EchoBody {
    async fn handle(
        &self,
        request: Arc<IncomingRequest>,
    ) -> Result<Option<HandlerResponse>, BoxError> {
        let payload = request.body().unwrap_or_default();
        let response = Response::builder()
            .status(StatusCode::OK)
            .body(body::full(payload))
            .unwrap();
        Ok(Some(HandlerResponse::Full(response)))
    }
}
