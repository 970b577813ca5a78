//! The channel group invites are announced on.
//!

use futures::future::BoxFuture;
use serde_json::Value;

use crate::{discovery::DiscoveryService, ChatError};

/// Carries a payload to every peer on the local segment.
///
/// Invitees are not members of the group's multicast channel yet, so invites need
/// a channel everyone already listens on.
pub trait BroadcastHook: Send + Sync {
    /// Send the payload; returns the number of bytes sent.
    fn broadcast<'a>(&'a self, payload: &'a Value) -> BoxFuture<'a, Result<usize, ChatError>>;
}

impl BroadcastHook for DiscoveryService {
    fn broadcast<'a>(&'a self, payload: &'a Value) -> BoxFuture<'a, Result<usize, ChatError>> {
        Box::pin(self.send_custom_broadcast(payload))
    }
}
