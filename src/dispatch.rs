//! Outbound dispatcher interface and the per-flow context handed to it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::conn::{FlowStream, PacketConn};
use crate::error::Result;

/// Inbound tag for ordinary flows.
pub const TAG_SOCKS: &str = "socks";
/// Inbound tag for flows addressed at the router sentinel or originated by
/// the DNS interceptor.
pub const TAG_DNS_IN: &str = "dns-in";

/// UI visibility of the owning application, used by the dispatcher for
/// priority routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppStatus {
    Foreground,
    Background,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Foreground => "foreground",
            Self::Background => "background",
        }
    }
}

/// Where a flow entered the bridge and what is known about its owner.
#[derive(Debug, Clone)]
pub struct InboundDescriptor {
    pub source: Option<SocketAddr>,
    pub tag: &'static str,
    pub uid: Option<u32>,
    pub app_status: Vec<AppStatus>,
    pub skip_fakedns: bool,
}

impl InboundDescriptor {
    pub fn new(source: Option<SocketAddr>, tag: &'static str) -> Self {
        Self {
            source,
            tag,
            uid: None,
            app_status: Vec::new(),
            skip_fakedns: false,
        }
    }
}

/// Protocols the dispatcher may sniff from the first bytes of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffProtocol {
    FakeDns,
    Http,
    Tls,
    Quic,
}

impl SniffProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FakeDns => "fakedns",
            Self::Http => "http",
            Self::Tls => "tls",
            Self::Quic => "quic",
        }
    }
}

/// Request to inspect the first bytes of a flow.
///
/// `route_only` limits the sniffed destination to routing decisions without
/// rewriting the flow's target.
#[derive(Debug, Clone, Default)]
pub struct SniffingRequest {
    pub enabled: bool,
    pub metadata_only: bool,
    pub route_only: bool,
    pub protocols: Vec<SniffProtocol>,
}

/// Per-flow context handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub inbound: InboundDescriptor,
    pub sniffing: Option<SniffingRequest>,
}

impl DispatchContext {
    pub fn new(inbound: InboundDescriptor) -> Self {
        Self {
            inbound,
            sniffing: None,
        }
    }
}

/// The two ends of a TCP flow as seen by the dispatcher: it reads
/// outbound-bound bytes from `reader` and writes response bytes into
/// `writer` (which points at the inbound conn).
pub struct Link {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

/// The outbound proxy engine.
///
/// All methods take the flow context so routing rules can see the inbound
/// tag, owner UID and sniffing request.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Accept a TCP flow. Returns once the link is wired up; the dispatcher
    /// keeps copying `reader` to the remote and the remote into `writer`
    /// until either side closes.
    async fn dispatch_link(
        &self,
        ctx: DispatchContext,
        destination: SocketAddr,
        link: Link,
    ) -> Result<()>;

    /// Dial a UDP association for `destination`. The returned conn honors
    /// `idle_timeout` internally; the bridge adds no timer of its own.
    async fn dial_udp(
        &self,
        ctx: DispatchContext,
        destination: SocketAddr,
        idle_timeout: Duration,
    ) -> Result<Arc<dyn PacketConn>>;

    /// Dial a byte stream for `destination`, used by the DNS interceptor.
    async fn dial_stream(
        &self,
        ctx: DispatchContext,
        destination: SocketAddr,
    ) -> Result<Box<dyn FlowStream>>;
}
