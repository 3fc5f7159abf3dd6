use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one accepted connection.
///
/// Recorded explicitly at accept time and threaded to every request on
/// the connection, so nothing downstream needs ambient state to know
/// where a request came from.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    id: String,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl ConnectionContext {
    pub(crate) fn new(remote_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            id: next_connection_id(),
            remote_addr,
            local_addr,
        }
    }

    /// The per-process-unique connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The peer's address and port.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The receiving interface's address and port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn next_connection_id() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    format!("conn-{}", NEXT.fetch_add(1, Ordering::Relaxed))
}
