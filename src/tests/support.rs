//! Mock collaborators shared by the scenario tests.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use crate::bridge::{BridgeConfig, TunBridge};
use crate::conn::{Closeable, FlowStream, PacketConn};
use crate::dispatch::{DispatchContext, Dispatcher, Link};
use crate::dns::DnsClient;
use crate::error::{BridgeError, Result};
use crate::process::{UidInfo, UidResolver};
use crate::stats::{AppStats, TrafficListener};
use crate::tun::{StackBackend, TunDevice, TunFactory, TunHandler, TunOptions};

pub fn test_bridge(
    config: BridgeConfig,
    dispatcher: Arc<MockDispatcher>,
    resolver: Option<Arc<MockResolver>>,
    self_uid: u32,
) -> Arc<TunBridge> {
    let resolver = resolver.map(|r| r as Arc<dyn UidResolver>);
    Arc::new(TunBridge::build(&config, dispatcher, resolver, self_uid))
}

/// Datagram conn whose inbound direction is fed by the test through an
/// unbounded channel; dropping the sender ends the read loop.
pub struct MockPacketConn {
    pub sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    closed: AtomicBool,
}

impl MockPacketConn {
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        });
        (conn, tx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PacketConn for MockPacketConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self.rx.lock().await.recv().await {
            Some((data, addr)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, addr))
            }
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.sent.lock().push((buf.to_vec(), addr));
        Ok(buf.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Dispatcher double recording every context it sees.
///
/// TCP links are drained in a background task and answered with
/// `respond_with`; UDP dials hand out [`MockPacketConn`] pairs.
#[derive(Default)]
pub struct MockDispatcher {
    respond_with: Vec<u8>,
    fail_dispatch: bool,
    pub contexts: Mutex<Vec<DispatchContext>>,
    pub dial_udp_calls: AtomicUsize,
    pub uplink_seen: Arc<AtomicUsize>,
    pub udp_conns: Mutex<Vec<(Arc<MockPacketConn>, mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>)>>,
    pub stream_peers: Mutex<Vec<DuplexStream>>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, bytes: Vec<u8>) -> Self {
        self.respond_with = bytes;
        self
    }

    pub fn with_dispatch_failure(mut self) -> Self {
        self.fail_dispatch = true;
        self
    }
}

#[async_trait]
impl Dispatcher for MockDispatcher {
    async fn dispatch_link(
        &self,
        ctx: DispatchContext,
        _destination: SocketAddr,
        link: Link,
    ) -> Result<()> {
        self.contexts.lock().push(ctx);
        if self.fail_dispatch {
            return Err(BridgeError::Dispatch("rejected by rules".into()));
        }

        let respond = self.respond_with.clone();
        let uplink_seen = Arc::clone(&self.uplink_seen);
        tokio::spawn(async move {
            let mut reader = link.reader;
            let mut writer = link.writer;
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        uplink_seen.fetch_add(n, Ordering::SeqCst);
                    }
                }
            }
            if !respond.is_empty() {
                let _ = writer.write_all(&respond).await;
            }
            let _ = writer.shutdown().await;
        });
        Ok(())
    }

    async fn dial_udp(
        &self,
        ctx: DispatchContext,
        _destination: SocketAddr,
        _idle_timeout: Duration,
    ) -> Result<Arc<dyn PacketConn>> {
        self.contexts.lock().push(ctx);
        self.dial_udp_calls.fetch_add(1, Ordering::SeqCst);
        let (conn, tx) = MockPacketConn::pair();
        self.udp_conns.lock().push((Arc::clone(&conn), tx));
        Ok(conn)
    }

    async fn dial_stream(
        &self,
        ctx: DispatchContext,
        _destination: SocketAddr,
    ) -> Result<Box<dyn FlowStream>> {
        self.contexts.lock().push(ctx);
        let (near, far) = tokio::io::duplex(4096);
        self.stream_peers.lock().push(far);
        Ok(Box::new(near))
    }
}

pub struct MockResolver {
    pub uid: u32,
    pub fail: bool,
}

#[async_trait]
impl UidResolver for MockResolver {
    async fn dump_uid(
        &self,
        _ipv6: bool,
        _udp: bool,
        _source: SocketAddr,
        _destination: SocketAddr,
    ) -> Result<u32> {
        if self.fail {
            Err(BridgeError::Resolve("socket owner not found".into()))
        } else {
            Ok(self.uid)
        }
    }

    async fn uid_info(&self, uid: u32) -> Result<UidInfo> {
        Ok(UidInfo {
            label: format!("app-{uid}"),
            package_name: format!("com.example.app{uid}"),
        })
    }
}

#[derive(Default)]
pub struct CollectingListener {
    pub stats: Vec<AppStats>,
}

impl TrafficListener for CollectingListener {
    fn update_stats(&mut self, stats: &AppStats) {
        self.stats.push(stats.clone());
    }
}

#[derive(Default)]
pub struct FlagCloser {
    closed: AtomicBool,
}

impl FlagCloser {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Closeable for FlagCloser {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct NullDevice {
    closed: AtomicBool,
}

impl NullDevice {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TunDevice for NullDevice {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct RecordedOpen {
    pub fd: i32,
    pub mtu: i32,
    pub backend: StackBackend,
    pub pcap: bool,
    pub had_sink: bool,
}

#[derive(Default)]
pub struct RecordingTunFactory {
    pub opened: Mutex<Vec<RecordedOpen>>,
    pub devices: Mutex<Vec<Arc<NullDevice>>>,
}

impl TunFactory for RecordingTunFactory {
    fn open(
        &self,
        options: TunOptions,
        _handler: Arc<dyn TunHandler>,
    ) -> Result<Arc<dyn TunDevice>> {
        self.opened.lock().push(RecordedOpen {
            fd: options.fd,
            mtu: options.mtu,
            backend: options.backend,
            pcap: options.pcap,
            had_sink: options.pcap_sink.is_some(),
        });
        let device = Arc::new(NullDevice::default());
        self.devices.lock().push(Arc::clone(&device));
        Ok(device)
    }
}

#[derive(Default)]
pub struct NullDnsClient {
    pub fakedns: AtomicBool,
    pub lookups: Mutex<Vec<String>>,
}

#[async_trait]
impl DnsClient for NullDnsClient {
    async fn lookup_ip(&self, domain: &str) -> Result<Vec<IpAddr>> {
        self.lookups.lock().push(domain.to_string());
        Ok(Vec::new())
    }

    fn set_fakedns(&self, enabled: bool) {
        self.fakedns.store(enabled, Ordering::SeqCst);
    }
}
