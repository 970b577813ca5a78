//! Received datagrams awaiting processing by downstream consumers.
//!

use std::{io, net::SocketAddr};

use crate::build_error;

/// A received datagram with its sender and the time it was received.
///
/// This is an intermediate type: the listener does not know what the payload
/// represents, so decoding is left to the consumer through [`Self::decode`].
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    /// The raw payload, truncated to the packet size of the listener.
    pub payload: Vec<u8>,

    /// The sender from whom the datagram was received.
    pub sender: SocketAddr,

    /// The [timestamp] when the datagram was received by this process.
    ///
    /// [timestamp]: tokio::time::Instant
    pub received: tokio::time::Instant,
}

impl Datagram {
    /// Create a new datagram received just now.
    pub fn new(payload: Vec<u8>, sender: SocketAddr) -> Self {
        Self {
            payload,
            sender,
            received: tokio::time::Instant::now(),
        }
    }

    /// Deserialize the JSON payload into the intended type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> io::Result<T> {
        serde_json::from_slice(&self.payload).map_err(|err| {
            build_error(&format!(
                "Failed to deserialize datagram from {}: {}",
                self.sender, err
            ))
        })
    }

    /// The number of bytes in the payload.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
