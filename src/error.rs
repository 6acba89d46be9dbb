use thiserror::Error;

/// Bridge specific errors
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("TUN device error: {0}")]
    Tun(String),

    #[error("packet capture error: {0}")]
    Pcap(String),

    #[error("dispatch rejected: {0}")]
    Dispatch(String),

    #[error("resolve error: {0}")]
    Resolve(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bridge closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Setup errors are fatal at construction; everything else is per-flow.
    pub fn is_setup(&self) -> bool {
        matches!(self, Self::Tun(_) | Self::Pcap(_))
    }
}
