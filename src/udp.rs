//! Per-UDP-flow handling with single-flight association creation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error};

use crate::bridge::TunBridge;
use crate::conn::{Closeable, PacketConn, WriteBack};
use crate::dispatch::{DispatchContext, InboundDescriptor, SniffProtocol, TAG_DNS_IN, TAG_SOCKS};
use crate::process::clamp_uid;
use crate::stats::{FlowGuard, FlowProto, StatsPacketConn};

/// Idle timeout handed to the dispatcher-provided UDP conn; the bridge
/// keeps no timer of its own.
pub(crate) const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const MAX_DATAGRAM: usize = 65_535;

/// Debug-log UID threshold for UDP flows.
const UDP_LOG_UID_FLOOR: u32 = 1_000;

impl TunBridge {
    pub(crate) async fn handle_udp(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        payload: Bytes,
        writeback: WriteBack,
        closer: Arc<dyn Closeable>,
    ) {
        let nat_key = source.to_string();

        // Fast path: the association already exists.
        if let Some(conn) = self.nat.get(&nat_key) {
            if conn.send_to(&payload, destination).await.is_err() {
                conn.close();
            }
            return;
        }

        let gate_key = format!("{nat_key}-lock");
        let (gate, loaded) = self.nat.get_or_create_gate(&gate_key);
        if loaded {
            // Another worker owns creation. Retry the fast path once it
            // signals; a miss drops the datagram, which UDP tolerates.
            gate.wait().await;
            if let Some(conn) = self.nat.get(&nat_key) {
                if conn.send_to(&payload, destination).await.is_err() {
                    conn.close();
                }
            }
            return;
        }

        // Creation owner. Release waiters before the long-running dial so
        // they retry promptly instead of queueing behind it.
        self.nat.remove(&gate_key);
        gate.open();

        let is_dns = self.is_dns_destination(&destination);
        let mut inbound =
            InboundDescriptor::new(Some(source), if is_dns { TAG_DNS_IN } else { TAG_SOCKS });

        let mut uid: u16 = 0;
        let mut is_self = false;

        if self.dump_uid || self.stats.enabled() {
            if let Some(resolver) = &self.uid_resolver {
                match resolver
                    .dump_uid(source.is_ipv6(), true, source, destination)
                    .await
                {
                    Ok(raw) => {
                        uid = raw as u16;
                        is_self = uid > 0 && raw == self.self_uid;

                        if self.debug && !is_self && raw >= UDP_LOG_UID_FLOOR {
                            let proto = if is_dns { "DNS" } else { "UDP" };
                            match resolver.uid_info(raw).await {
                                Ok(info) => debug!(
                                    "[{}][{} ({}/{})] {} ==> {}",
                                    proto, info.label, uid, info.package_name, source, destination
                                ),
                                Err(_) => debug!("[{}] {} ==> {}", proto, source, destination),
                            }
                        }

                        uid = clamp_uid(raw);
                        inbound.uid = Some(uid as u32);
                        inbound.app_status.push(self.app_status(uid));
                    }
                    Err(e) => debug!("[UDP] uid lookup failed for {}: {}", source, e),
                }
            }
        }

        let ctx = DispatchContext {
            inbound,
            sniffing: self.sniffing_request(is_dns, [SniffProtocol::Quic]),
        };

        let mut conn: Arc<dyn PacketConn> = match self
            .dispatcher
            .dial_udp(ctx, destination, UDP_IDLE_TIMEOUT)
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                error!("[UDP] dial failed for {} -> {}: {}", source, destination, e);
                return;
            }
        };

        let mut _flow_guard = None;
        if self.stats.enabled() && !is_self && !is_dns {
            let counters = self.stats.attach(uid);
            _flow_guard = Some(FlowGuard::new(Arc::clone(&counters), FlowProto::Udp));
            conn = Arc::new(StatsPacketConn::new(conn, counters));
        }

        self.nat.set(nat_key.clone(), Arc::clone(&conn));

        // Send the datagram that created the association from a side task
        // so the read loop starts immediately.
        {
            let conn = Arc::clone(&conn);
            let payload = payload.clone();
            tokio::spawn(async move {
                if conn.send_to(&payload, destination).await.is_err() {
                    conn.close();
                }
            });
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match conn.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    // The TUN side expects DNS responses unsolicited.
                    let from = if is_dns { None } else { Some(from) };
                    if writeback(&buf[..n], from).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        conn.close();
        closer.close();
        self.nat.remove(&nat_key);
    }
}
