//! The bridge owning the TUN device, the NAT table and the stats registry,
//! and implementing the TUN handler contract.

use std::fs::File;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::conn::{Closeable, FlowStream, WriteBack};
use crate::dispatch::Dispatcher;
use crate::dns::{
    clear_resolver_hook, install_resolver_hook, use_alternative_system_dialer,
    use_alternative_system_dns_dialer, DnsClient, DnsInterceptor, ProtectedDialer, SystemResolver,
};
use crate::error::{BridgeError, Result};
use crate::nat::NatTable;
use crate::process::{process_uid, UidResolver};
use crate::stats::{StatsRegistry, TrafficListener};
use crate::logging;
use crate::tun::{
    ipv6_mode, StackBackend, TunDevice, TunFactory, TunHandler, TunOptions, DEFAULT_NIC,
    PACKET_BUDGET,
};

/// Bridge configuration: boolean behavior flags plus the platform constants
/// the embedder supplies.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// File descriptor of the TUN device.
    pub fd: i32,
    pub mtu: i32,
    pub backend: StackBackend,
    /// Sentinel address treated as the device's local DNS endpoint.
    pub router: String,
    pub sniffing: bool,
    pub override_destination: bool,
    pub fakedns: bool,
    pub debug: bool,
    pub dump_uid: bool,
    pub traffic_stats: bool,
    pub pcap: bool,
    /// UID of the foreground application.
    pub foreground_uid: u16,
    /// UID of the foreground input method.
    pub foreground_ime_uid: u16,
    /// External assets directory; pcap files land under `<assets>/pcap/`.
    pub assets_path: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            fd: -1,
            mtu: 1500,
            backend: StackBackend::Smoltcp,
            router: String::new(),
            sniffing: false,
            override_destination: false,
            fakedns: false,
            debug: false,
            dump_uid: false,
            traffic_stats: false,
            pcap: false,
            foreground_uid: 0,
            foreground_ime_uid: 0,
            assets_path: PathBuf::from("."),
        }
    }
}

struct BridgeState {
    device: Option<Arc<dyn TunDevice>>,
    closed: bool,
}

/// TUN-to-proxy bridge.
///
/// One instance owns the whole per-flow machinery: it receives flows from
/// the TUN backend, attributes and accounts them, and forwards payloads
/// through the dispatcher.
pub struct TunBridge {
    pub(crate) router: String,
    pub(crate) sniffing: bool,
    pub(crate) override_destination: bool,
    pub(crate) fakedns: bool,
    pub(crate) debug: bool,
    pub(crate) dump_uid: bool,
    pub(crate) foreground_uid: u16,
    pub(crate) foreground_ime_uid: u16,
    pub(crate) self_uid: u32,

    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) uid_resolver: Option<Arc<dyn UidResolver>>,
    pub(crate) stats: StatsRegistry,
    pub(crate) nat: NatTable,

    state: Mutex<BridgeState>,
}

impl TunBridge {
    /// Open a bridge over the configured TUN backend and install the
    /// process-wide DNS hooks.
    ///
    /// Fails on TUN or pcap setup errors only; everything else is handled
    /// per flow.
    pub async fn new(
        config: BridgeConfig,
        tun: Arc<dyn TunFactory>,
        dispatcher: Arc<dyn Dispatcher>,
        uid_resolver: Option<Arc<dyn UidResolver>>,
        dns_client: Arc<dyn DnsClient>,
    ) -> Result<Arc<Self>> {
        logging::init(config.debug);

        let bridge = Arc::new(Self::build(
            &config,
            Arc::clone(&dispatcher),
            uid_resolver,
            process_uid(),
        ));

        let pcap_sink = if config.pcap {
            Some(create_pcap_file(&config.assets_path)?)
        } else {
            None
        };
        let options = TunOptions {
            fd: config.fd,
            mtu: config.mtu,
            backend: config.backend,
            nic_id: DEFAULT_NIC,
            pcap: config.pcap,
            pcap_sink,
            packet_budget: PACKET_BUDGET,
            ipv6_mode: ipv6_mode(),
        };
        let handler: Arc<dyn TunHandler> = Arc::clone(&bridge) as Arc<dyn TunHandler>;
        let device = tun.open(options, handler)?;
        bridge.state.lock().device = Some(device);

        if config.fakedns {
            dns_client.set_fakedns(true);
            let _ = dns_client.lookup_ip("placeholder").await;
        }
        use_alternative_system_dialer(Some(Arc::new(ProtectedDialer::new(
            Arc::clone(&dns_client),
            true,
        ))));
        use_alternative_system_dns_dialer(Some(Arc::new(ProtectedDialer::new(
            Arc::new(SystemResolver),
            false,
        ))));
        install_resolver_hook(Arc::new(DnsInterceptor::new(dispatcher)));

        Ok(bridge)
    }

    pub(crate) fn build(
        config: &BridgeConfig,
        dispatcher: Arc<dyn Dispatcher>,
        uid_resolver: Option<Arc<dyn UidResolver>>,
        self_uid: u32,
    ) -> Self {
        Self {
            router: config.router.clone(),
            sniffing: config.sniffing,
            override_destination: config.override_destination,
            fakedns: config.fakedns,
            debug: config.debug,
            dump_uid: config.dump_uid,
            foreground_uid: config.foreground_uid,
            foreground_ime_uid: config.foreground_ime_uid,
            self_uid,
            dispatcher,
            uid_resolver,
            stats: StatsRegistry::new(config.traffic_stats),
            nat: NatTable::new(),
            state: Mutex::new(BridgeState {
                device: None,
                closed: false,
            }),
        }
    }

    /// Tear the bridge down: detach the resolver hook and close the TUN
    /// device, which unwinds every flow handler. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        clear_resolver_hook();
        if let Some(device) = state.device.take() {
            device.close();
        }
        debug!("bridge closed");
    }

    pub fn traffic_stats_enabled(&self) -> bool {
        self.stats.enabled()
    }

    /// Deliver one snapshot record per live entry to `listener`; see
    /// [`StatsRegistry::read_traffics`].
    pub fn read_app_traffics(&self, listener: &mut dyn TrafficListener) {
        self.stats.read_traffics(listener);
    }

    /// Zero all per-app byte counters and drop idle entries.
    pub fn reset_app_traffics(&self) {
        self.stats.reset_traffics();
    }

    /// Whether `destination` targets the router sentinel, i.e. the local
    /// DNS endpoint.
    pub(crate) fn is_dns_destination(&self, destination: &SocketAddr) -> bool {
        destination.ip().to_string() == self.router
    }
}

#[async_trait]
impl TunHandler for TunBridge {
    async fn new_connection(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        stream: Box<dyn FlowStream>,
    ) {
        self.handle_tcp(source, destination, stream).await;
    }

    async fn new_packet(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        payload: Bytes,
        writeback: WriteBack,
        closer: Arc<dyn Closeable>,
    ) {
        self.handle_udp(source, destination, payload, writeback, closer)
            .await;
    }
}

fn create_pcap_file(assets: &Path) -> Result<File> {
    let dir = assets.join("pcap");
    std::fs::create_dir_all(&dir)
        .map_err(|e| BridgeError::Pcap(format!("unable to create pcap dir: {e}")))?;
    let name = format!(
        "{}.pcap",
        chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ")
    );
    File::create(dir.join(name))
        .map_err(|e| BridgeError::Pcap(format!("unable to create pcap file: {e}")))
}
