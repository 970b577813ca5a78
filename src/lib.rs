//! LAN chat library.
//!
//! Peers find each other by UDP broadcast heartbeats, exchange direct messages
//! over short-lived TCP connections, and talk in groups over multicast.

#[cfg(test)]
mod _tests;

pub mod codec;

pub mod config;
pub use config::{CliArgs, NodeConfig};

pub mod discovery;
pub use discovery::DiscoveryService;

mod errors;
pub use errors::ChatError;

pub mod events;
pub use events::{ChatEvent, EventBus};

pub mod groups;
pub use groups::GroupService;

pub mod ids;

pub mod messaging;
pub use messaging::MessagingService;

pub mod models;

mod node;
pub use node::*;

pub mod registry;
pub use registry::PeerRegistry;

pub mod store;
pub use store::{ChatStore, MemoryStore};
