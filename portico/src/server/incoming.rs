use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::TcpKeepalive;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::{wrappers::TcpListenerStream, Stream};
use tracing::warn;

/// The stream of connections accepted on an endpoint's listening
/// socket.
///
/// Socket options configured here are applied to every accepted
/// connection.
#[derive(Debug)]
pub struct TcpIncoming {
    inner: TcpListenerStream,
    nodelay: Option<bool>,
    keepalive: Option<TcpKeepalive>,
}

impl TcpIncoming {
    /// Bind (open) the given socket address.
    pub fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let std_listener = StdTcpListener::bind(addr)?;
        Self::from_std(std_listener)
    }

    /// Adopt a pre-bound listener, e.g. one passed in by a process
    /// supervisor.
    pub fn from_std(std_listener: StdTcpListener) -> std::io::Result<Self> {
        std_listener.set_nonblocking(true)?;
        Ok(TcpListener::from_std(std_listener)?.into())
    }

    /// Sets the `TCP_NODELAY` option on accepted connections.
    pub fn with_nodelay(self, nodelay: Option<bool>) -> Self {
        Self { nodelay, ..self }
    }

    /// Sets the TCP keepalive time on accepted connections.
    pub fn with_keepalive(self, keepalive_time: Option<Duration>) -> Self {
        Self {
            keepalive: keepalive_time.map(|time| TcpKeepalive::new().with_time(time)),
            ..self
        }
    }

    /// The local address this listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.as_ref().local_addr()
    }
}

impl From<TcpListener> for TcpIncoming {
    fn from(listener: TcpListener) -> Self {
        Self {
            inner: TcpListenerStream::new(listener),
            nodelay: None,
            keepalive: None,
        }
    }
}

impl Stream for TcpIncoming {
    type Item = std::io::Result<TcpStream>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);

        if let Poll::Ready(Some(Ok(stream))) = &polled {
            set_accepted_socket_options(stream, self.nodelay, &self.keepalive);
        }

        polled
    }
}

// Socket-option failures are reported but do not fail the accept.
fn set_accepted_socket_options(
    stream: &TcpStream,
    nodelay: Option<bool>,
    keepalive: &Option<TcpKeepalive>,
) {
    if let Some(nodelay) = nodelay {
        if let Err(err) = stream.set_nodelay(nodelay) {
            warn!("error trying to set TCP_NODELAY: {err}");
        }
    }

    if let Some(keepalive) = keepalive {
        let sock_ref = socket2::SockRef::from(&stream);
        if let Err(err) = sock_ref.set_tcp_keepalive(keepalive) {
            warn!("error trying to set TCP_KEEPALIVE: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TcpIncoming;

    #[tokio::test]
    async fn one_listener_per_address_at_a_time() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let first = TcpIncoming::bind(addr).unwrap();
        let bound = first.local_addr().unwrap();
        {
            let _second = TcpIncoming::bind(bound).unwrap_err();
        }
        drop(first);
        let _third = TcpIncoming::bind(bound).unwrap();
    }
}
