//! Host- and path-based dispatch: two sites on one endpoint, each with
//! its own routes.

use std::sync::Arc;

use async_trait::async_trait;
use http::{Response, StatusCode};

use portico::body;
use portico::dispatch::{HostRouter, PathRouter};
use portico::handler::{HandlerResponse, RequestHandler};
use portico::path::PathKey;
use portico::request::IncomingRequest;
use portico::server::Endpoint;

struct Text(&'static str);

#[async_trait]
impl RequestHandler for Text {
    async fn handle(
        &self,
        _request: Arc<IncomingRequest>,
    ) -> Result<Option<HandlerResponse>, portico::BoxError> {
        let response = Response::builder()
            .status(StatusCode::OK)
            .body(body::full(self.0))
            .unwrap();
        Ok(Some(HandlerResponse::Full(response)))
    }
}

fn site(name: &'static str) -> Result<Arc<PathRouter>, portico::BoxError> {
    let router = PathRouter::new()
        .route(
            &PathKey::new(["health"], false),
            Arc::new(Text("ok\n")),
        )?
        .route(
            &PathKey::empty().with_wildcard(true),
            Arc::new(Text(name)),
        )?;
    Ok(Arc::new(router))
}

#[tokio::main]
async fn main() -> Result<(), portico::BoxError> {
    tracing_subscriber::fmt::init();

    let hosts = HostRouter::new()
        .host("one.localhost", site("site one\n")?)?
        .host("*.two.localhost", site("site two\n")?)?;

    let endpoint = Endpoint::builder("sites")
        .bind("127.0.0.1:8080".parse()?)
        .serve(Arc::new(hosts))?;

    let addr = endpoint.start().await?;
    println!("listening on http://{addr} (try Host: one.localhost)");
    endpoint.run().await?;
    Ok(())
}
