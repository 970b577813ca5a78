//! Generation of identifiers and timestamps.
//!
//! Identifiers carry a random suffix wide enough to be collision-free in practice
//! within one discovery domain.

use rand::Rng;

/// A peer identifier, unique across the mesh.
pub type PeerId = String;

/// Unix timestamp in seconds, as carried on the wire.
pub type Timestamp = i64;

/// Prefix of every generated message identifier.
pub const MESSAGE_ID_PREFIX: &str = "msg_";

/// Prefix of every generated group identifier.
pub const GROUP_ID_PREFIX: &str = "group_";

/// Generate `len` random lowercase hex characters, `len` at most 16.
fn random_hex(len: usize) -> String {
    let token: u64 = rand::thread_rng().gen();
    let hex = format!("{token:016x}");
    hex[..len.min(hex.len())].to_owned()
}

/// Generate a random peer identifier of 16 hex characters.
pub fn generate_peer_id() -> PeerId {
    random_hex(16)
}

/// Generate a random message identifier.
pub fn generate_message_id() -> String {
    format!("{MESSAGE_ID_PREFIX}{}", random_hex(12))
}

/// Generate a random group identifier.
pub fn generate_group_id() -> String {
    format!("{GROUP_ID_PREFIX}{}", random_hex(12))
}

/// The current time as a unix timestamp in seconds.
pub fn now_timestamp() -> Timestamp {
    chrono::Utc::now().timestamp()
}
