//! Per-TCP-flow handling.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::bridge::TunBridge;
use crate::conn::FlowStream;
use crate::dispatch::{
    AppStatus, DispatchContext, InboundDescriptor, Link, SniffProtocol, SniffingRequest,
    TAG_DNS_IN, TAG_SOCKS,
};
use crate::process::{clamp_uid, SYSTEM_UID_CEILING};
use crate::stats::{FlowGuard, FlowProto, StatsStream};

/// Buffer between the inbound reader and the dispatcher's reader end.
const LINK_BUFFER_SIZE: usize = 64 * 1024;

impl TunBridge {
    pub(crate) async fn handle_tcp(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        stream: Box<dyn FlowStream>,
    ) {
        let is_dns = self.is_dns_destination(&destination);
        let mut inbound =
            InboundDescriptor::new(Some(source), if is_dns { TAG_DNS_IN } else { TAG_SOCKS });

        let mut uid: u16 = 0;
        let mut is_self = false;

        if self.dump_uid || self.stats.enabled() {
            if let Some(resolver) = &self.uid_resolver {
                match resolver
                    .dump_uid(destination.is_ipv6(), false, source, destination)
                    .await
                {
                    Ok(raw) => {
                        uid = raw as u16;
                        is_self = uid > 0 && raw == self.self_uid;

                        if self.debug && !is_self && raw >= SYSTEM_UID_CEILING {
                            match resolver.uid_info(raw).await {
                                Ok(info) => debug!(
                                    "[TCP][{} ({}/{})] {} ==> {}",
                                    info.label, uid, info.package_name, source, destination
                                ),
                                Err(_) => debug!("[TCP] {} ==> {}", source, destination),
                            }
                        }

                        uid = clamp_uid(raw);
                        inbound.uid = Some(uid as u32);
                        inbound.app_status.push(self.app_status(uid));
                    }
                    Err(e) => debug!("[TCP] uid lookup failed for {}: {}", source, e),
                }
            }
        }

        let ctx = DispatchContext {
            inbound,
            sniffing: self.sniffing_request(is_dns, [SniffProtocol::Http, SniffProtocol::Tls]),
        };

        let mut stream = stream;
        let mut _flow_guard = None;
        if self.stats.enabled() && !is_self && !is_dns {
            let counters = self.stats.attach(uid);
            _flow_guard = Some(FlowGuard::new(Arc::clone(&counters), FlowProto::Tcp));
            stream = Box::new(StatsStream::new(stream, counters));
        }

        // The dispatcher reads outbound-bound bytes from the pipe and
        // writes responses straight into the inbound write half; this side
        // only drives the uplink copy.
        let (mut read_half, write_half) = tokio::io::split(stream);
        let (pipe_reader, mut pipe_writer) = tokio::io::simplex(LINK_BUFFER_SIZE);
        let link = Link {
            reader: Box::new(pipe_reader),
            writer: Box::new(write_half),
        };

        match self.dispatcher.dispatch_link(ctx, destination, link).await {
            Err(e) => error!("[TCP] dispatch failed for {} -> {}: {}", source, destination, e),
            Ok(()) => {
                let _ = tokio::io::copy(&mut read_half, &mut pipe_writer).await;
            }
        }

        // Dropping the halves closes what the dispatcher has not already
        // closed; the explicit shutdown makes its reader see EOF first.
        let _ = pipe_writer.shutdown().await;
    }

    pub(crate) fn app_status(&self, uid: u16) -> AppStatus {
        if uid == self.foreground_uid || uid == self.foreground_ime_uid {
            AppStatus::Foreground
        } else {
            AppStatus::Background
        }
    }

    /// Sniffing request for a flow, `None` for DNS flows or when both
    /// sniffing and fakedns are off.
    pub(crate) fn sniffing_request<const N: usize>(
        &self,
        is_dns: bool,
        sniffed: [SniffProtocol; N],
    ) -> Option<SniffingRequest> {
        if is_dns || !(self.sniffing || self.fakedns) {
            return None;
        }
        let mut protocols = Vec::new();
        if self.fakedns {
            protocols.push(SniffProtocol::FakeDns);
        }
        if self.sniffing {
            protocols.extend(sniffed);
        }
        Some(SniffingRequest {
            enabled: true,
            metadata_only: self.fakedns && !self.sniffing,
            route_only: !self.override_destination,
            protocols,
        })
    }
}
