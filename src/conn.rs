//! Connection capability traits at the bridge's seams.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream as surfaced by the TUN backend or dialed by
/// the dispatcher.
pub trait FlowStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> FlowStream for T {}

/// A datagram connection as dialed by the dispatcher.
///
/// `close` is idempotent and swallows errors; after it, pending and future
/// operations fail and the owning read loop unwinds.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Receive one datagram. Returns the payload length and the peer it
    /// came from.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Send one datagram to `addr`.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    fn close(&self);
}

/// Callback handing a response datagram back to the TUN side.
///
/// The source address is `None` for DNS flows, where the TUN side expects
/// unsolicited responses.
pub type WriteBack = Arc<dyn Fn(&[u8], Option<SocketAddr>) -> io::Result<usize> + Send + Sync>;

/// TUN-side flow handle released when a UDP association ends.
pub trait Closeable: Send + Sync {
    fn close(&self);
}
