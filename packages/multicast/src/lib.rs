//! Crate to handle UDP broadcast and multicast communication.
//!
//! This is the datagram plumbing shared by peer discovery (broadcast) and group
//! channels (multicast): socket construction, group membership, and a listener
//! task that hands every received [`Datagram`] to a handler.

pub mod datagram;
pub use datagram::Datagram;

pub mod socket;

/// The receive loop bound to a single socket.
mod listener;
pub use listener::*;

use std::io;
/// Builds a [`io::Error`] with the given message.
pub fn build_error(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
pub mod _tests;

/// Re-export the [`logger`] module.
pub use logger;
