//! Endpoints: one listening socket plus one protocol server.
//!
//! An [`Endpoint`] owns its lifecycle through a
//! [`TaskRunner`](crate::task::TaskRunner): the start phase builds the
//! protocol-server pieces and binds the socket, the main phase accepts
//! connections until a stop is requested, and the stop phase closes the
//! listener and drains in-flight connections in parallel. Each accepted
//! connection is recorded as a [`ConnectionContext`] and served through
//! the request pipeline.

mod conn;
mod incoming;
mod io;
mod pipeline;
#[cfg(feature = "tls")]
mod tls;

pub use conn::ConnectionContext;
pub use incoming::TcpIncoming;
#[cfg(feature = "tls")]
pub use tls::{Certificate, HostResolver, Identity, ServerTlsConfig};

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::pin::pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{error, fmt};

use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_stream::StreamExt as _;
use tracing::{debug, info, trace, warn};

use self::io::ServerIo;
use self::pipeline::PipelineService;
#[cfg(feature = "tls")]
use self::tls::TlsAcceptor;
use crate::access::AccessLogSink;
use crate::handler::RequestHandler;
use crate::limit::RateLimiter;
use crate::task::{RunnerAccess, TaskRunner};
use crate::{BoxError, Error};

/// The application protocol an endpoint speaks.
///
/// `Http2` serves cleartext prior-knowledge HTTP/2 without a TLS config
/// and ALPN-negotiated HTTP/2 with one; `Https` negotiates HTTP/1.1 or
/// HTTP/2 over TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
    Http2,
}

impl Protocol {
    #[cfg(feature = "tls")]
    fn alpn(&self) -> &'static [&'static [u8]] {
        match self {
            Protocol::Https => &[tls::ALPN_H2, tls::ALPN_HTTP11],
            Protocol::Http2 => &[tls::ALPN_H2],
            Protocol::Http => &[],
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Http2 => "http2",
        })
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Error> {
        match text {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "http2" => Ok(Protocol::Http2),
            _ => Err(Error::invalid_config("unknown protocol name")),
        }
    }
}

/// Where an endpoint listens.
enum Listen {
    Addr(SocketAddr),
    /// A pre-bound listener, e.g. handed down by a process supervisor.
    /// Consumed by the first run.
    Std(Option<StdTcpListener>),
}

/// Everything the accept loop and pipeline share.
pub(crate) struct EndpointShared {
    name: String,
    protocol: Protocol,
    pub(crate) scheme: &'static str,
    nodelay: bool,
    keepalive: Option<Duration>,
    pub(crate) max_request_body_bytes: Option<u64>,
    pub(crate) limiter: Option<Arc<dyn RateLimiter>>,
    pub(crate) access_log: Option<Arc<dyn AccessLogSink>>,
    pub(crate) handler: Arc<dyn RequestHandler>,
    /// Raised while the endpoint drains; new requests get `503`.
    pub(crate) stopping: watch::Sender<bool>,
    will_reload: AtomicBool,
    listen: Mutex<Listen>,
    armed: Mutex<Option<Armed>>,
    local_addr: Mutex<Option<SocketAddr>>,
    #[cfg(feature = "tls")]
    tls: Option<ServerTlsConfig>,
}

/// What the start phase hands to the main phase.
struct Armed {
    incoming: TcpIncoming,
    builder: ConnectionBuilder<TokioExecutor>,
    #[cfg(feature = "tls")]
    acceptor: Option<TlsAcceptor>,
}

/// One listening endpoint: a socket, a protocol server, and the request
/// pipeline between them.
pub struct Endpoint {
    shared: Arc<EndpointShared>,
    runner: TaskRunner<(), SocketAddr>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.shared.name)
            .field("protocol", &self.shared.protocol)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

impl Endpoint {
    /// Start configuring an endpoint.
    pub fn builder(name: impl Into<String>) -> EndpointBuilder {
        EndpointBuilder {
            name: name.into(),
            listen: None,
            protocol: Protocol::Http,
            nodelay: true,
            keepalive: None,
            max_request_body_bytes: None,
            limiter: None,
            access_log: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Start listening. Resolves with the bound address once the
    /// endpoint is accepting connections; serving continues in the
    /// background.
    pub async fn start(&self) -> Result<SocketAddr, Error> {
        match self.runner.start().await {
            Ok(Some(addr)) => Ok(addr),
            Ok(None) => Err(Error::runtime("endpoint start settled without an address")),
            Err(err) => Err(Error::runtime(err)),
        }
    }

    /// Start listening (if not already) and serve until stopped.
    pub async fn run(&self) -> Result<(), Error> {
        self.runner.run().await.map_err(Error::runtime)
    }

    /// Stop accepting, drain in-flight requests, and settle once the
    /// endpoint has fully wound down. `will_reload` is an advisory hint
    /// that the process intends to start a replacement endpoint.
    pub async fn stop(&self, will_reload: bool) -> Result<(), Error> {
        self.shared.will_reload.store(will_reload, Ordering::Relaxed);
        self.runner.stop().await.map(|_| ()).map_err(Error::runtime)
    }

    /// Whether a run is active, from `start`/`run` until the endpoint
    /// fully winds down.
    pub fn is_running(&self) -> bool {
        self.runner.is_running()
    }

    /// The bound address, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().unwrap()
    }

    /// The endpoint's configured name, for logs.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> Arc<EndpointShared> {
        self.shared.clone()
    }
}

/// Configures and assembles an [`Endpoint`].
pub struct EndpointBuilder {
    name: String,
    listen: Option<Listen>,
    protocol: Protocol,
    nodelay: bool,
    keepalive: Option<Duration>,
    max_request_body_bytes: Option<u64>,
    limiter: Option<Arc<dyn RateLimiter>>,
    access_log: Option<Arc<dyn AccessLogSink>>,
    #[cfg(feature = "tls")]
    tls: Option<ServerTlsConfig>,
}

impl fmt::Debug for EndpointBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointBuilder")
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl EndpointBuilder {
    /// Listen on the given socket address.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.listen = Some(Listen::Addr(addr));
        self
    }

    /// Listen on a pre-bound standard listener. Such an endpoint can be
    /// run only once.
    pub fn listener(mut self, listener: StdTcpListener) -> Self {
        self.listen = Some(Listen::Std(Some(listener)));
        self
    }

    #[must_use]
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Set the `TCP_NODELAY` option on accepted connections. Defaults
    /// to `true`.
    #[must_use]
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Set the TCP keepalive time on accepted connections.
    #[must_use]
    pub fn tcp_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Reject request bodies larger than this with `400 Bad Request`.
    #[must_use]
    pub fn max_request_body_bytes(mut self, limit: u64) -> Self {
        self.max_request_body_bytes = Some(limit);
        self
    }

    /// Consult this limiter for connection and request admission.
    #[must_use]
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Report request life cycle events to this sink.
    #[must_use]
    pub fn access_log(mut self, sink: Arc<dyn AccessLogSink>) -> Self {
        self.access_log = Some(sink);
        self
    }

    /// Configure TLS for this endpoint.
    #[cfg(feature = "tls")]
    #[must_use]
    pub fn tls_config(mut self, tls: ServerTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Validate the configuration and assemble the endpoint around the
    /// given handler. Nothing is bound until the endpoint is started.
    pub fn serve(self, handler: Arc<dyn RequestHandler>) -> Result<Endpoint, Error> {
        let listen = self
            .listen
            .ok_or_else(|| Error::invalid_config("endpoint needs an address or a listener"))?;

        #[cfg(feature = "tls")]
        let scheme = match (self.protocol, &self.tls) {
            (Protocol::Https, None) => {
                return Err(Error::invalid_config("https endpoints require a TLS config"))
            }
            (Protocol::Http, Some(_)) => {
                return Err(Error::invalid_config("http endpoints cannot use TLS"))
            }
            (Protocol::Https | Protocol::Http2, Some(_)) => "https",
            (Protocol::Http | Protocol::Http2, None) => "http",
        };
        #[cfg(not(feature = "tls"))]
        let scheme = match self.protocol {
            Protocol::Https => {
                return Err(Error::invalid_config(
                    "https endpoints require the tls feature",
                ))
            }
            Protocol::Http | Protocol::Http2 => "http",
        };

        let (stopping, _) = watch::channel(false);
        let shared = Arc::new(EndpointShared {
            name: self.name,
            protocol: self.protocol,
            scheme,
            nodelay: self.nodelay,
            keepalive: self.keepalive,
            max_request_body_bytes: self.max_request_body_bytes,
            limiter: self.limiter,
            access_log: self.access_log,
            handler,
            stopping,
            will_reload: AtomicBool::new(false),
            listen: Mutex::new(listen),
            armed: Mutex::new(None),
            local_addr: Mutex::new(None),
            #[cfg(feature = "tls")]
            tls: self.tls,
        });

        let start_shared = shared.clone();
        let main_shared = shared.clone();
        let runner = TaskRunner::with_start(
            move |_access| start_shared.clone().start(),
            move |access| main_shared.clone().serve(access),
        );

        Ok(Endpoint { shared, runner })
    }
}

impl EndpointShared {
    /// The start phase: protocol server pieces first, then the socket.
    async fn start(self: Arc<Self>) -> Result<SocketAddr, BoxError> {
        let builder = self.connection_builder();
        #[cfg(feature = "tls")]
        let acceptor = match &self.tls {
            Some(tls) => Some(tls.acceptor(self.protocol.alpn())?),
            None => None,
        };

        let incoming = self
            .open_listener()?
            .with_nodelay(Some(self.nodelay))
            .with_keepalive(self.keepalive);
        let addr = incoming.local_addr()?;

        self.stopping.send_replace(false);
        *self.local_addr.lock().unwrap() = Some(addr);
        *self.armed.lock().unwrap() = Some(Armed {
            incoming,
            builder,
            #[cfg(feature = "tls")]
            acceptor,
        });

        info!(
            endpoint = %self.name,
            protocol = %self.protocol,
            %addr,
            "endpoint listening"
        );
        Ok(addr)
    }

    fn open_listener(&self) -> Result<TcpIncoming, BoxError> {
        match &mut *self.listen.lock().unwrap() {
            Listen::Addr(addr) => Ok(TcpIncoming::bind(*addr)?),
            Listen::Std(slot) => {
                let listener = slot
                    .take()
                    .ok_or("a pre-bound listener can back only one run")?;
                Ok(TcpIncoming::from_std(listener)?)
            }
        }
    }

    fn connection_builder(&self) -> ConnectionBuilder<TokioExecutor> {
        let mut builder = ConnectionBuilder::new(TokioExecutor::new());
        match self.protocol {
            Protocol::Http => {
                builder = builder.http1_only();
            }
            Protocol::Http2 => {
                builder = builder.http2_only();
            }
            Protocol::Https => {}
        }
        builder.http2().timer(TokioTimer::new());
        builder
    }

    /// The main phase: accept until a stop is requested, then stop the
    /// socket and the protocol server in parallel.
    async fn serve(self: Arc<Self>, access: RunnerAccess) -> Result<(), BoxError> {
        let armed = self
            .armed
            .lock()
            .unwrap()
            .take()
            .ok_or("endpoint has not been started")?;
        let mut incoming = armed.incoming;
        let builder = armed.builder;
        #[cfg(feature = "tls")]
        let acceptor = armed.acceptor;

        let (drain_tx, drain_rx) = watch::channel(());

        loop {
            tokio::select! {
                _ = access.when_stop_requested() => {
                    trace!(endpoint = %self.name, "stop requested");
                    break;
                }
                accepted = incoming.next() => {
                    match accepted {
                        Some(Ok(stream)) => self.spawn_connection(
                            stream,
                            builder.clone(),
                            #[cfg(feature = "tls")]
                            acceptor.clone(),
                            drain_rx.clone(),
                        ),
                        Some(Err(err)) => {
                            debug!(endpoint = %self.name, %err, "error accepting connection");
                        }
                        None => break,
                    }
                }
            }
        }

        self.stopping.send_replace(true);
        let will_reload = self.will_reload.load(Ordering::Relaxed);

        let name = self.name.clone();
        let socket_stop = async move {
            drop(incoming);
            debug!(endpoint = %name, will_reload, "listener closed");
        };
        let name = self.name.clone();
        let protocol_stop = async move {
            drain_tx.send_replace(());
            drop(drain_rx);
            debug!(
                endpoint = %name,
                connections = drain_tx.receiver_count(),
                will_reload,
                "draining connections"
            );
            drain_tx.closed().await;
        };
        tokio::join!(socket_stop, protocol_stop);

        *self.local_addr.lock().unwrap() = None;
        info!(endpoint = %self.name, "endpoint stopped");
        Ok(())
    }

    fn spawn_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        builder: ConnectionBuilder<TokioExecutor>,
        #[cfg(feature = "tls")] acceptor: Option<TlsAcceptor>,
        drain: watch::Receiver<()>,
    ) {
        let (remote_addr, local_addr) = match (stream.peer_addr(), stream.local_addr()) {
            (Ok(remote), Ok(local)) => (remote, local),
            (Err(err), _) | (_, Err(err)) => {
                debug!(%err, "connection without a usable address; dropping");
                return;
            }
        };
        let context = Arc::new(ConnectionContext::new(remote_addr, local_addr));
        let shared = self.clone();

        tokio::spawn(async move {
            if let Some(limiter) = &shared.limiter {
                if !limiter.admit_connection().await {
                    debug!(
                        conn = context.id(),
                        remote = %context.remote_addr(),
                        "connection refused by rate limiter"
                    );
                    return;
                }
            }

            #[cfg(feature = "tls")]
            let io = match acceptor {
                None => ServerIo::Tcp(stream),
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls) => ServerIo::Tls(Box::new(tls)),
                    Err(err) => {
                        debug!(conn = context.id(), %err, "TLS handshake failed");
                        return;
                    }
                },
            };
            #[cfg(not(feature = "tls"))]
            let io = ServerIo::Tcp(stream);

            serve_connection(shared, context, io, builder, drain).await;
        });
    }
}

/// Serve one connection until it completes, draining gracefully when
/// the endpoint stops or the pipeline asks for a close-after-response.
async fn serve_connection(
    shared: Arc<EndpointShared>,
    context: Arc<ConnectionContext>,
    io: ServerIo,
    builder: ConnectionBuilder<TokioExecutor>,
    mut drain: watch::Receiver<()>,
) {
    trace!(conn = context.id(), remote = %context.remote_addr(), "connection accepted");

    let (close_tx, mut close_rx) = watch::channel(false);
    let service = TowerToHyperService::new(PipelineService::new(
        shared,
        context.clone(),
        close_tx,
    ));
    let mut conn = pin!(builder.serve_connection(TokioIo::new(io), service));

    let mut draining = false;
    let mut closing = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(err) = result {
                    log_connection_error(&context, err.as_ref());
                }
                break;
            }
            _ = drain.changed(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
            changed = close_rx.changed(), if !closing => {
                match changed {
                    Ok(()) => {
                        let close_now = *close_rx.borrow_and_update();
                        if close_now {
                            closing = true;
                            conn.as_mut().graceful_shutdown();
                        }
                    }
                    Err(_) => closing = true,
                }
            }
        }
    }

    drop(drain);
    trace!(conn = context.id(), "connection closed");
}

fn log_connection_error(context: &ConnectionContext, err: &(dyn error::Error + 'static)) {
    let went_away = err
        .downcast_ref::<hyper::Error>()
        .is_some_and(|err| err.is_incomplete_message());
    if went_away || is_connection_reset(err) {
        debug!(conn = context.id(), "connection reset by peer");
    } else {
        warn!(conn = context.id(), %err, "error serving connection");
    }
}

fn is_connection_reset(err: &(dyn error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            );
        }
        current = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerResponse;
    use crate::request::IncomingRequest;
    use async_trait::async_trait;
    use http::StatusCode;

    struct NoContent;

    #[async_trait]
    impl RequestHandler for NoContent {
        async fn handle(
            &self,
            _request: Arc<IncomingRequest>,
        ) -> Result<Option<HandlerResponse>, BoxError> {
            Ok(Some(HandlerResponse::Status(StatusCode::NO_CONTENT)))
        }
    }

    fn handler() -> Arc<dyn RequestHandler> {
        Arc::new(NoContent)
    }

    #[test]
    fn builder_requires_a_listen_source() {
        let err = Endpoint::builder("nowhere").serve(handler()).unwrap_err();
        assert!(err.to_string().contains("configuration"));
    }

    #[cfg(feature = "tls")]
    #[test]
    fn https_requires_a_tls_config() {
        let result = Endpoint::builder("secure")
            .bind("127.0.0.1:0".parse().unwrap())
            .protocol(Protocol::Https)
            .serve(handler());
        assert!(result.is_err());
    }

    #[cfg(feature = "tls")]
    #[test]
    fn http_refuses_a_tls_config() {
        let result = Endpoint::builder("plain")
            .bind("127.0.0.1:0".parse().unwrap())
            .protocol(Protocol::Http)
            .tls_config(ServerTlsConfig::new())
            .serve(handler());
        assert!(result.is_err());
    }

    #[test]
    fn protocol_names_parse() {
        assert_eq!("http".parse::<Protocol>().unwrap(), Protocol::Http);
        assert_eq!("https".parse::<Protocol>().unwrap(), Protocol::Https);
        assert_eq!("http2".parse::<Protocol>().unwrap(), Protocol::Http2);
        assert!("gopher".parse::<Protocol>().is_err());
    }

    #[tokio::test]
    async fn endpoint_starts_stops_and_restarts() {
        let endpoint = Endpoint::builder("cycle")
            .bind("127.0.0.1:0".parse().unwrap())
            .serve(handler())
            .unwrap();

        let addr = endpoint.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(endpoint.is_running());
        assert_eq!(endpoint.local_addr(), Some(addr));

        endpoint.stop(false).await.unwrap();
        assert!(!endpoint.is_running());
        assert_eq!(endpoint.local_addr(), None);

        // A bound-by-address endpoint can run again.
        let addr = endpoint.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        endpoint.stop(true).await.unwrap();
        assert!(!endpoint.is_running());
    }

    #[tokio::test]
    async fn prebound_listener_backs_a_single_run() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let endpoint = Endpoint::builder("fd")
            .listener(listener)
            .serve(handler())
            .unwrap();

        assert_eq!(endpoint.start().await.unwrap(), addr);
        endpoint.stop(false).await.unwrap();
        assert!(endpoint.start().await.is_err());
    }
}
