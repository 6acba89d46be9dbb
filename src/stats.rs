//! Per-application traffic accounting.
//!
//! Counters are keyed by the 16-bit owner UID and mutated only through
//! atomics; the map itself is guarded by a reader-writer lock with
//! double-checked inserts. Byte counting happens transparently through the
//! [`StatsStream`] / [`StatsPacketConn`] decorators.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::conn::PacketConn;

/// Flow protocol, for the live/total connection counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowProto {
    Tcp,
    Udp,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Live counter block for one UID.
///
/// `uplink`/`downlink` are windowed: each snapshot swaps them to zero and
/// folds the swapped amount into the monotonic totals. `deactivate_at` is 0
/// while any flow is live and the close timestamp otherwise.
#[derive(Default)]
pub struct AppFlowCounters {
    tcp_conn: AtomicI32,
    udp_conn: AtomicI32,
    tcp_conn_total: AtomicU32,
    udp_conn_total: AtomicU32,

    uplink: AtomicU64,
    downlink: AtomicU64,
    uplink_total: AtomicU64,
    downlink_total: AtomicU64,

    deactivate_at: AtomicI64,
}

impl AppFlowCounters {
    pub(crate) fn begin_flow(&self, proto: FlowProto) {
        match proto {
            FlowProto::Tcp => {
                self.tcp_conn.fetch_add(1, Ordering::SeqCst);
                self.tcp_conn_total.fetch_add(1, Ordering::SeqCst);
            }
            FlowProto::Udp => {
                self.udp_conn.fetch_add(1, Ordering::SeqCst);
                self.udp_conn_total.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.deactivate_at.store(0, Ordering::SeqCst);
    }

    pub(crate) fn end_flow(&self, proto: FlowProto) {
        let remaining = match proto {
            FlowProto::Tcp => {
                self.tcp_conn.fetch_sub(1, Ordering::SeqCst) - 1
                    + self.udp_conn.load(Ordering::SeqCst)
            }
            FlowProto::Udp => {
                self.udp_conn.fetch_sub(1, Ordering::SeqCst) - 1
                    + self.tcp_conn.load(Ordering::SeqCst)
            }
        };
        if remaining == 0 {
            self.deactivate_at.store(unix_now(), Ordering::SeqCst);
        }
    }

    pub(crate) fn add_uplink(&self, n: u64) {
        self.uplink.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_downlink(&self, n: u64) {
        self.downlink.fetch_add(n, Ordering::Relaxed);
    }

    fn is_idle(&self) -> bool {
        self.tcp_conn.load(Ordering::SeqCst) + self.udp_conn.load(Ordering::SeqCst) == 0
    }

    /// Swap the byte windows to zero, fold them into the totals and export
    /// everything as one record.
    ///
    /// The total is read only after the fold, so no reader of the record
    /// can observe a zeroed window whose bytes are missing from the total.
    fn snapshot(&self, uid: u16) -> AppStats {
        let uplink = self.uplink.swap(0, Ordering::SeqCst);
        let uplink_total = self.uplink_total.fetch_add(uplink, Ordering::SeqCst) + uplink;
        let downlink = self.downlink.swap(0, Ordering::SeqCst);
        let downlink_total = self.downlink_total.fetch_add(downlink, Ordering::SeqCst) + downlink;

        AppStats {
            uid,
            tcp_conn: self.tcp_conn.load(Ordering::SeqCst),
            udp_conn: self.udp_conn.load(Ordering::SeqCst),
            tcp_conn_total: self.tcp_conn_total.load(Ordering::SeqCst),
            udp_conn_total: self.udp_conn_total.load(Ordering::SeqCst),
            uplink,
            downlink,
            uplink_total,
            downlink_total,
            deactivate_at: self.deactivate_at.load(Ordering::SeqCst),
        }
    }

    fn reset_bytes(&self) {
        self.uplink.store(0, Ordering::SeqCst);
        self.downlink.store(0, Ordering::SeqCst);
        self.uplink_total.store(0, Ordering::SeqCst);
        self.downlink_total.store(0, Ordering::SeqCst);
    }
}

/// Immutable per-UID snapshot delivered to a [`TrafficListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStats {
    pub uid: u16,
    pub tcp_conn: i32,
    pub udp_conn: i32,
    pub tcp_conn_total: u32,
    pub udp_conn_total: u32,
    pub uplink: u64,
    pub downlink: u64,
    pub uplink_total: u64,
    pub downlink_total: u64,
    /// Unix seconds when the last flow closed; 0 while any flow is live.
    pub deactivate_at: i64,
}

/// Sink receiving one record per live entry per snapshot.
pub trait TrafficListener {
    fn update_stats(&mut self, stats: &AppStats);
}

/// Per-UID counter table with snapshot/reset cycles.
pub struct StatsRegistry {
    enabled: bool,
    table: RwLock<HashMap<u16, Arc<AppFlowCounters>>>,
}

impl StatsRegistry {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            table: RwLock::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Counter handle for `uid`, created on first use. Safe against
    /// concurrent attach for the same UID.
    pub fn attach(&self, uid: u16) -> Arc<AppFlowCounters> {
        if let Some(counters) = self.table.read().get(&uid) {
            return Arc::clone(counters);
        }
        let mut table = self.table.write();
        Arc::clone(table.entry(uid).or_default())
    }

    /// Snapshot every entry into `listener`, then drop entries with no live
    /// flow left.
    ///
    /// Records are delivered after the read lock is released; the GC pass
    /// re-checks liveness under the write lock so an attach racing the
    /// snapshot keeps its entry.
    pub fn read_traffics(&self, listener: &mut dyn TrafficListener) {
        if !self.enabled {
            return;
        }

        let snapshots: Vec<AppStats> = {
            let table = self.table.read();
            table.iter().map(|(uid, c)| c.snapshot(*uid)).collect()
        };
        for stats in &snapshots {
            listener.update_stats(stats);
        }

        self.table.write().retain(|_, c| !c.is_idle());
    }

    /// Zero all byte counters and drop idle entries.
    pub fn reset_traffics(&self) {
        if !self.enabled {
            return;
        }

        let idle: Vec<u16> = {
            let table = self.table.read();
            let mut idle = Vec::new();
            for (uid, counters) in table.iter() {
                counters.reset_bytes();
                if counters.is_idle() {
                    idle.push(*uid);
                }
            }
            idle
        };

        if !idle.is_empty() {
            let mut table = self.table.write();
            for uid in idle {
                if table.get(&uid).is_some_and(|c| c.is_idle()) {
                    table.remove(&uid);
                }
            }
        }
    }

    pub fn entry_count(&self) -> usize {
        self.table.read().len()
    }
}

/// Decrements the live counter for a flow on every exit path.
pub(crate) struct FlowGuard {
    counters: Arc<AppFlowCounters>,
    proto: FlowProto,
}

impl FlowGuard {
    pub(crate) fn new(counters: Arc<AppFlowCounters>, proto: FlowProto) -> Self {
        counters.begin_flow(proto);
        Self { counters, proto }
    }
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.counters.end_flow(self.proto);
    }
}

/// Transparent byte counter around a stream conn.
///
/// Reads count toward uplink, writes toward downlink: the wrapped conn is
/// the TUN-side conn, so bytes read out of it are application payload on
/// its way upstream. Reads count the bytes actually delivered to the
/// caller.
pub struct StatsStream<S> {
    inner: S,
    counters: Arc<AppFlowCounters>,
}

impl<S> StatsStream<S> {
    pub(crate) fn new(inner: S, counters: Arc<AppFlowCounters>) -> Self {
        Self { inner, counters }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for StatsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut me.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            me.counters.add_uplink((buf.filled().len() - before) as u64);
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for StatsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        let result = Pin::new(&mut me.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            me.counters.add_downlink(n as u64);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Transparent byte counter around a packet conn.
///
/// The wrapped conn is the upstream association, so received datagrams are
/// downlink and sent ones uplink. Datagram semantics are all-or-nothing:
/// nothing is counted on error.
pub struct StatsPacketConn {
    inner: Arc<dyn PacketConn>,
    counters: Arc<AppFlowCounters>,
}

impl StatsPacketConn {
    pub(crate) fn new(inner: Arc<dyn PacketConn>, counters: Arc<AppFlowCounters>) -> Self {
        Self { inner, counters }
    }
}

#[async_trait]
impl PacketConn for StatsPacketConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, addr) = self.inner.recv_from(buf).await?;
        self.counters.add_downlink(n as u64);
        Ok((n, addr))
    }

    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let n = self.inner.send_to(buf, addr).await?;
        self.counters.add_uplink(n as u64);
        Ok(n)
    }

    fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Collect(Vec<AppStats>);

    impl TrafficListener for Collect {
        fn update_stats(&mut self, stats: &AppStats) {
            self.0.push(stats.clone());
        }
    }

    #[test]
    fn attach_returns_the_same_entry() {
        let registry = StatsRegistry::new(true);
        let a = registry.attach(10_042);
        let b = registry.attach(10_042);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.entry_count(), 1);
    }

    #[test]
    fn attach_is_safe_under_contention() {
        let registry = Arc::new(StatsRegistry::new(true));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.attach(10_042).begin_flow(FlowProto::Tcp))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.entry_count(), 1);
        let counters = registry.attach(10_042);
        assert_eq!(counters.tcp_conn.load(Ordering::SeqCst), 8);
        assert_eq!(counters.tcp_conn_total.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn balanced_flows_return_to_zero_and_deactivate() {
        let counters = AppFlowCounters::default();
        for _ in 0..5 {
            counters.begin_flow(FlowProto::Tcp);
        }
        assert_eq!(counters.deactivate_at.load(Ordering::SeqCst), 0);
        for _ in 0..5 {
            counters.end_flow(FlowProto::Tcp);
        }
        assert_eq!(counters.tcp_conn.load(Ordering::SeqCst), 0);
        assert_eq!(counters.tcp_conn_total.load(Ordering::SeqCst), 5);
        assert_ne!(counters.deactivate_at.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn mixed_protocols_deactivate_only_when_both_drain() {
        let counters = AppFlowCounters::default();
        counters.begin_flow(FlowProto::Tcp);
        counters.begin_flow(FlowProto::Udp);
        counters.end_flow(FlowProto::Tcp);
        assert_eq!(counters.deactivate_at.load(Ordering::SeqCst), 0);
        counters.end_flow(FlowProto::Udp);
        assert_ne!(counters.deactivate_at.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn snapshot_moves_window_into_totals() {
        let registry = StatsRegistry::new(true);
        let counters = registry.attach(10_042);
        let _guard = FlowGuard::new(Arc::clone(&counters), FlowProto::Tcp);
        counters.add_uplink(4096);
        counters.add_downlink(2048);

        let mut sink = Collect(Vec::new());
        registry.read_traffics(&mut sink);
        assert_eq!(sink.0.len(), 1);
        let first = &sink.0[0];
        assert_eq!(first.uplink, 4096);
        assert_eq!(first.downlink, 2048);
        assert_eq!(first.uplink_total, 4096);
        assert_eq!(first.downlink_total, 2048);

        // Second snapshot with no traffic in between: window drained,
        // totals unchanged.
        let mut sink = Collect(Vec::new());
        registry.read_traffics(&mut sink);
        let second = &sink.0[0];
        assert_eq!(second.uplink, 0);
        assert_eq!(second.downlink, 0);
        assert_eq!(second.uplink_total, first.uplink_total);
        assert_eq!(second.downlink_total, first.downlink_total);
    }

    #[test]
    fn snapshot_drops_idle_entries_after_delivery() {
        let registry = StatsRegistry::new(true);
        let counters = registry.attach(10_042);
        counters.begin_flow(FlowProto::Udp);
        counters.add_uplink(100);
        counters.end_flow(FlowProto::Udp);

        let mut sink = Collect(Vec::new());
        registry.read_traffics(&mut sink);
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].uplink, 100);
        assert_eq!(registry.entry_count(), 0);
    }

    #[test]
    fn snapshot_keeps_live_entries() {
        let registry = StatsRegistry::new(true);
        let counters = registry.attach(10_042);
        let _guard = FlowGuard::new(counters, FlowProto::Tcp);

        let mut sink = Collect(Vec::new());
        registry.read_traffics(&mut sink);
        assert_eq!(registry.entry_count(), 1);
    }

    #[test]
    fn reset_zeroes_counters_and_drops_idle() {
        let registry = StatsRegistry::new(true);
        let live = registry.attach(10_042);
        live.begin_flow(FlowProto::Tcp);
        live.add_uplink(512);
        let idle = registry.attach(10_043);
        idle.add_downlink(256);

        registry.reset_traffics();
        assert_eq!(registry.entry_count(), 1);

        let mut sink = Collect(Vec::new());
        registry.read_traffics(&mut sink);
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].uid, 10_042);
        assert_eq!(sink.0[0].uplink, 0);
        assert_eq!(sink.0[0].uplink_total, 0);
        assert_eq!(sink.0[0].downlink_total, 0);
    }

    #[test]
    fn disabled_registry_is_a_no_op() {
        let registry = StatsRegistry::new(false);
        let mut sink = Collect(Vec::new());
        registry.read_traffics(&mut sink);
        registry.reset_traffics();
        assert!(sink.0.is_empty());
    }

    #[tokio::test]
    async fn stream_wrapper_counts_reads_as_uplink_and_writes_as_downlink() {
        let counters = Arc::new(AppFlowCounters::default());
        let (near, mut far) = tokio::io::duplex(8192);
        let mut wrapped = StatsStream::new(near, Arc::clone(&counters));

        far.write_all(&[7u8; 300]).await.unwrap();
        let mut buf = [0u8; 300];
        wrapped.read_exact(&mut buf).await.unwrap();
        assert_eq!(counters.uplink.load(Ordering::Relaxed), 300);

        wrapped.write_all(&[9u8; 120]).await.unwrap();
        let mut buf = [0u8; 120];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(counters.downlink.load(Ordering::Relaxed), 120);
    }
}
