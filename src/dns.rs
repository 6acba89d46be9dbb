//! DNS interception and the process-wide dialer hooks.
//!
//! Resolver traffic originating inside the process is pushed through the
//! dispatcher tagged as DNS so routing rules stay uniform; name resolution
//! for the dispatcher's own dials goes through a protected dialer that
//! bypasses FakeDNS.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::conn::{FlowStream, PacketConn};
use crate::dispatch::{DispatchContext, Dispatcher, InboundDescriptor, TAG_DNS_IN};
use crate::error::{BridgeError, Result};

/// Public recursive resolver every intercepted dial targets.
pub const DNS_UPSTREAM: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)), 53);

/// DNS client supplied by the embedder.
#[async_trait]
pub trait DnsClient: Send + Sync {
    async fn lookup_ip(&self, domain: &str) -> Result<Vec<IpAddr>>;

    /// Toggle FakeDNS answers; a no-op for clients without FakeDNS support.
    fn set_fakedns(&self, _enabled: bool) {}
}

/// Plain system resolution, used for the system DNS dialer slot.
pub struct SystemResolver;

#[async_trait]
impl DnsClient for SystemResolver {
    async fn lookup_ip(&self, domain: &str) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((domain, 0u16))
            .await
            .map_err(|e| BridgeError::Resolve(format!("{domain}: {e}")))?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Dialer for the engine's own outbound connections: resolves through the
/// configured DNS client and connects outside the TUN.
pub struct ProtectedDialer {
    dns: Arc<dyn DnsClient>,
    bypass_fakedns: bool,
}

impl ProtectedDialer {
    pub fn new(dns: Arc<dyn DnsClient>, bypass_fakedns: bool) -> Self {
        Self {
            dns,
            bypass_fakedns,
        }
    }

    pub async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>> {
        if self.bypass_fakedns {
            // Synthetic addresses must never leak into real dials.
            self.dns.set_fakedns(false);
        }
        self.dns.lookup_ip(domain).await
    }

    pub async fn connect(&self, domain: &str, port: u16) -> io::Result<TcpStream> {
        let ips = self
            .resolve(domain)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))?;

        let mut last_err = None;
        for ip in ips {
            match TcpStream::connect((ip, port)).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {domain}"))
        }))
    }
}

/// Routes the system resolver's dials through the dispatcher, tagged as
/// DNS with FakeDNS skipped.
pub struct DnsInterceptor {
    dispatcher: Arc<dyn Dispatcher>,
}

impl DnsInterceptor {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Dial the DNS upstream through the dispatcher and expose the stream
    /// with packet-conn semantics.
    pub async fn dial(&self) -> Result<Arc<dyn PacketConn>> {
        let mut inbound = InboundDescriptor::new(None, TAG_DNS_IN);
        inbound.skip_fakedns = true;
        let ctx = DispatchContext::new(inbound);

        let stream = self.dispatcher.dial_stream(ctx, DNS_UPSTREAM).await?;
        debug!("dns interceptor dialed {}", DNS_UPSTREAM);
        Ok(Arc::new(StreamPacketConn::new(stream, DNS_UPSTREAM)))
    }
}

/// Packet-conn facade over a byte stream: reads report the fixed peer as
/// their source, writes ignore the target address.
pub struct StreamPacketConn {
    reader: tokio::sync::Mutex<ReadHalf<Box<dyn FlowStream>>>,
    writer: tokio::sync::Mutex<WriteHalf<Box<dyn FlowStream>>>,
    peer: SocketAddr,
    closed: AtomicBool,
}

impl StreamPacketConn {
    pub fn new(stream: Box<dyn FlowStream>, peer: SocketAddr) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            peer,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PacketConn for StreamPacketConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = self.reader.lock().await.read(buf).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok((n, self.peer))
    }

    async fn send_to(&self, buf: &[u8], _addr: SocketAddr) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(buf).await?;
        Ok(buf.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

static ALT_SYSTEM_DIALER: RwLock<Option<Arc<ProtectedDialer>>> = RwLock::new(None);
static ALT_SYSTEM_DNS_DIALER: RwLock<Option<Arc<ProtectedDialer>>> = RwLock::new(None);
static RESOLVER_HOOK: RwLock<Option<Arc<DnsInterceptor>>> = RwLock::new(None);

/// Install (or with `None`, clear) the dialer the dispatcher uses for its
/// own outbound connections. Process-wide.
pub fn use_alternative_system_dialer(dialer: Option<Arc<ProtectedDialer>>) {
    *ALT_SYSTEM_DIALER.write() = dialer;
}

pub fn alternative_system_dialer() -> Option<Arc<ProtectedDialer>> {
    ALT_SYSTEM_DIALER.read().clone()
}

/// Install (or clear) the dialer used for system DNS lookups. Process-wide.
pub fn use_alternative_system_dns_dialer(dialer: Option<Arc<ProtectedDialer>>) {
    *ALT_SYSTEM_DNS_DIALER.write() = dialer;
}

pub fn alternative_system_dns_dialer() -> Option<Arc<ProtectedDialer>> {
    ALT_SYSTEM_DNS_DIALER.read().clone()
}

/// Hook the system resolver's dials into the bridge. Acquired at bridge
/// construction, released at close. Process-wide.
pub fn install_resolver_hook(interceptor: Arc<DnsInterceptor>) {
    *RESOLVER_HOOK.write() = Some(interceptor);
    debug!("system resolver hook installed");
}

pub fn clear_resolver_hook() {
    *RESOLVER_HOOK.write() = None;
}

pub fn resolver_hook() -> Option<Arc<DnsInterceptor>> {
    RESOLVER_HOOK.read().clone()
}
