//! Error types.
//!

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Failed to bind the {service} socket to {addr}: {source}")]
    Bind {
        service: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("The {0} service is already running.")]
    AlreadyRunning(&'static str),
    #[error("The {0} service is not running.")]
    NotRunning(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Frame of {0} bytes exceeds the limit of {1} bytes.")]
    FrameTooLarge(usize, usize),
    #[error("Multicast address pool {0} is exhausted.")]
    PoolExhausted(String),
    #[error("Multicast address {0} is outside of the pool {1}.")]
    AddressOutsidePool(String, String),
    #[error("Multicast address {0} is already used by group {1}.")]
    AddressInUse(String, String),
    #[error("Peer is unreachable at {0}:{1}: {2}")]
    PeerUnreachable(String, u16, String),
    #[error("Timed out after {0:?} while {1}.")]
    Timeout(std::time::Duration, String),
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),
    #[error("Unknown group: {0}")]
    UnknownGroup(String),
    #[error("Message of {0} characters exceeds the limit of {1} characters.")]
    MessageTooLong(usize, usize),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Store error: {0}")]
    Store(String),
}

impl ChatError {
    /// Whether this error means the byte stream it came from can no longer be
    /// decoded, and the connection should be closed.
    pub fn is_stream_fatal(&self) -> bool {
        matches!(self, Self::FrameTooLarge(..))
    }
}
