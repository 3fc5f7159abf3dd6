//! Core concurrency and request-dispatch engine for a multi-protocol
//! HTTP fronting server.
//!
//! `portico` provides the pieces needed to run one or more independent
//! listening endpoints in a single process, each with its own protocol
//! (HTTP/1, HTTP/2, or TLS variants), and to shepherd every request
//! through admission control, a user-provided handler, and consistent
//! error handling and access logging:
//!
//! - [`task::TaskRunner`] — a reusable cooperative lifecycle primitive
//!   (start hook, main loop, stop signal, join semantics) that every
//!   long-running subsystem is built on.
//! - [`limit::TokenBucket`] — a token-bucket rate limiter with a FIFO
//!   wait queue, fractional accrual, and an orderly denial path.
//! - [`path::PathKey`] / [`path::TreePathMap`] — hierarchical keys and a
//!   radix-style map over them, used for host and route dispatch.
//! - [`server::Endpoint`] — one listening socket plus one protocol
//!   server, composed from the above, serving requests through a
//!   [`handler::RequestHandler`].
//!
//! Protocol framing is not implemented here; endpoints drive [`hyper`]
//! connections through [`hyper_util`]'s auto connection builder. TLS is
//! provided behind the `tls` feature via [`tokio-rustls`].
//!
//! # Example
//!
//! ```no_run
//! use portico::handler::{HandlerResponse, RequestHandler};
//! use portico::request::IncomingRequest;
//! use portico::server::{Endpoint, Protocol};
//! use std::sync::Arc;
//!
//! struct Hello;
//!
//! #[async_trait::async_trait]
//! impl RequestHandler for Hello {
//!     async fn handle(
//!         &self,
//!         _request: Arc<IncomingRequest>,
//!     ) -> Result<Option<HandlerResponse>, portico::BoxError> {
//!         Ok(Some(HandlerResponse::Status(http::StatusCode::NO_CONTENT)))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), portico::BoxError> {
//!     let endpoint = Endpoint::builder("main")
//!         .bind("127.0.0.1:8080".parse()?)
//!         .protocol(Protocol::Http)
//!         .serve(Arc::new(Hello))?;
//!     endpoint.start().await?;
//!     endpoint.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! [`tokio-rustls`]: https://docs.rs/tokio-rustls

#![warn(missing_debug_implementations)]

pub mod access;
pub mod body;
pub mod dispatch;
pub mod handler;
pub mod limit;
pub mod path;
pub mod request;
pub mod response;
pub mod server;
pub mod task;

mod error;

pub use error::Error;

/// A type-erased error, usable across every seam in the engine.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
