//! tunlink - TUN-to-proxy bridge
//!
//! This crate terminates the TCP and UDP flows surfaced by a userspace TUN
//! stack and forwards their payloads through a pluggable outbound
//! dispatcher, returning response traffic into the TUN.
//!
//! It provides:
//! - Per-flow NAT with single-flight UDP association creation
//! - Per-application traffic accounting with snapshot/reset cycles
//! - Transparent byte-counting conn decorators
//! - Optional protocol sniffing context for the dispatcher
//! - DNS interception for resolver traffic originating in-process
//!
//! # Architecture
//!
//! ```text
//! TUN backend --> TunBridge::new_connection / new_packet
//!                       |
//!        (UID resolver, stats attach, sniffing context)
//!                       |
//!                       v
//!                  Dispatcher --> upstream conn
//!                       |
//!              stats-wrapped reads
//!                       |
//!                       v
//!               writeback into TUN
//! ```
//!
//! The TUN driver, the dispatcher, the DNS client and the UID resolver are
//! external collaborators consumed through traits; the bridge owns only
//! the concurrent per-flow lifecycle between them.

pub mod bridge;
pub mod conn;
pub mod dispatch;
pub mod dns;
pub mod error;
pub mod logging;
pub mod nat;
pub mod process;
pub mod stats;
pub mod tcp;
pub mod tun;
pub mod udp;

// Re-exports for convenience
pub use bridge::{BridgeConfig, TunBridge};
pub use conn::{Closeable, FlowStream, PacketConn, WriteBack};
pub use dispatch::{
    AppStatus, DispatchContext, Dispatcher, InboundDescriptor, Link, SniffProtocol,
    SniffingRequest, TAG_DNS_IN, TAG_SOCKS,
};
pub use dns::{
    alternative_system_dialer, alternative_system_dns_dialer, clear_resolver_hook,
    install_resolver_hook, resolver_hook, use_alternative_system_dialer,
    use_alternative_system_dns_dialer, DnsClient, DnsInterceptor, ProtectedDialer,
    StreamPacketConn, SystemResolver, DNS_UPSTREAM,
};
pub use error::{BridgeError, Result};
pub use nat::{CreationGate, NatTable};
pub use process::{clamp_uid, process_uid, UidInfo, UidResolver, SYSTEM_BUCKET_UID,
    SYSTEM_UID_CEILING};
pub use stats::{AppStats, FlowProto, StatsRegistry, TrafficListener};
pub use tun::{
    ipv6_mode, set_ipv6_mode, Ipv6Mode, StackBackend, TunDevice, TunFactory, TunHandler,
    TunOptions, DEFAULT_NIC, PACKET_BUDGET,
};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::bridge::{BridgeConfig, TunBridge};
    pub use crate::dispatch::Dispatcher;
    pub use crate::error::{BridgeError, Result};
    pub use crate::stats::{AppStats, TrafficListener};
    pub use crate::tun::{StackBackend, TunFactory};
}

#[cfg(test)]
mod tests;
