//! TUN backend interface consumed by the bridge.
//!
//! The TCP/IP stack itself lives behind these traits; the bridge only
//! selects a backend, opens it with the options below and reacts to the
//! flows it surfaces.

use std::fs::File;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::conn::{Closeable, FlowStream, WriteBack};
use crate::error::Result;

/// NIC id handed to the backend when the embedder has no preference.
pub const DEFAULT_NIC: u32 = 1;
/// Per-endpoint packet budget; effectively unlimited.
pub const PACKET_BUDGET: u32 = u32::MAX;

/// Which userspace TCP/IP stack backs the TUN device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackBackend {
    /// smoltcp-based netstack.
    Smoltcp,
    /// ipstack-based compatibility stack.
    Ipstack,
}

/// Address family behavior of the TUN device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Ipv6Mode {
    Disable = 0,
    Enable = 1,
    Prefer = 2,
    Only = 3,
}

impl Ipv6Mode {
    fn from_i32(v: i32) -> Self {
        match v {
            1 => Self::Enable,
            2 => Self::Prefer,
            3 => Self::Only,
            _ => Self::Disable,
        }
    }
}

/// Process-wide IPv6 mode, written rarely by the embedder and read at TUN
/// open time.
static IPV6_MODE: AtomicI32 = AtomicI32::new(0);

pub fn set_ipv6_mode(mode: Ipv6Mode) {
    IPV6_MODE.store(mode as i32, Ordering::SeqCst);
}

pub fn ipv6_mode() -> Ipv6Mode {
    Ipv6Mode::from_i32(IPV6_MODE.load(Ordering::SeqCst))
}

/// Options handed to the backend at open time.
pub struct TunOptions {
    pub fd: i32,
    pub mtu: i32,
    pub backend: StackBackend,
    pub nic_id: u32,
    pub pcap: bool,
    pub pcap_sink: Option<File>,
    pub packet_budget: u32,
    pub ipv6_mode: Ipv6Mode,
}

/// An open TUN device. `close` is idempotent; closing unwinds every flow
/// handler by failing their reads and writes.
pub trait TunDevice: Send + Sync {
    fn close(&self);
}

/// The contract the backend invokes flows against.
#[async_trait]
pub trait TunHandler: Send + Sync {
    /// A new TCP connection terminated by the stack.
    async fn new_connection(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        stream: Box<dyn FlowStream>,
    );

    /// A UDP datagram for `source -> destination`. `writeback` returns
    /// response datagrams into the TUN; `closer` releases the TUN-side flow.
    async fn new_packet(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        payload: Bytes,
        writeback: WriteBack,
        closer: Arc<dyn Closeable>,
    );
}

/// Opens TUN devices; supplied by the embedder.
pub trait TunFactory: Send + Sync {
    fn open(&self, options: TunOptions, handler: Arc<dyn TunHandler>) -> Result<Arc<dyn TunDevice>>;
}
