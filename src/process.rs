//! Socket-owner lookup.
//!
//! The resolver is an OS-level collaborator supplied by the embedder; the
//! bridge only consumes it and never fails a flow on lookup errors.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::Result;

/// Human-readable identity of a UID, used in debug logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidInfo {
    pub label: String,
    pub package_name: String,
}

/// Resolves the owning UID of a socket from its endpoint pair.
#[async_trait]
pub trait UidResolver: Send + Sync {
    /// Look up the UID owning the socket `source -> destination`.
    async fn dump_uid(
        &self,
        ipv6: bool,
        udp: bool,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Result<u32>;

    /// Look up the label and package name of a UID.
    async fn uid_info(&self, uid: u32) -> Result<UidInfo>;
}

/// UIDs below this belong to OS services.
pub const SYSTEM_UID_CEILING: u32 = 10_000;
/// The single bucket all OS services collapse to for accounting.
pub const SYSTEM_BUCKET_UID: u16 = 1_000;

/// Collapse OS-service UIDs into one bucket; application UIDs keep their
/// low 16 bits.
pub fn clamp_uid(uid: u32) -> u16 {
    if uid < SYSTEM_UID_CEILING {
        SYSTEM_BUCKET_UID
    } else {
        uid as u16
    }
}

/// UID of the hosting process, used to exempt self-originated flows from
/// accounting.
#[cfg(unix)]
pub fn process_uid() -> u32 {
    // SAFETY: getuid has no failure modes and touches no memory.
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
pub fn process_uid() -> u32 {
    0
}
