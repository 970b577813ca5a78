//! Peer records and the discovery channel payloads.
//!

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::{
    config,
    ids::{self, PeerId, Timestamp},
};

/// The protocol version announced in every discovery payload.
pub const PROTOCOL_VERSION: &str = "1.0";

fn protocol_version() -> String {
    PROTOCOL_VERSION.to_owned()
}

/// A peer as observed through its heartbeats.
///
/// The record is transient: it lives in the peer registry, never in the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub display_name: String,
    pub host_name: String,
    pub ip: String,
    pub tcp_port: u16,
    pub last_seen: Timestamp,
}

impl PeerRecord {
    /// Create a record for a peer seen just now.
    pub fn new(
        peer_id: impl ToString,
        display_name: impl ToString,
        host_name: impl ToString,
        ip: impl ToString,
        tcp_port: u16,
    ) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            display_name: display_name.to_string(),
            host_name: host_name.to_string(),
            ip: ip.to_string(),
            tcp_port,
            last_seen: ids::now_timestamp(),
        }
    }

    /// Create the record of this process, with a freshly generated identifier.
    ///
    /// An empty display name falls back to the host name, cut to the longest
    /// allowed display name.
    pub fn local(
        display_name: impl ToString,
        host_name: impl ToString,
        ip: impl ToString,
        tcp_port: u16,
    ) -> Self {
        let host_name = host_name.to_string();
        let display_name = match display_name.to_string() {
            name if name.trim().is_empty() => host_name
                .chars()
                .take(config::MAX_DISPLAY_NAME_LENGTH)
                .collect(),
            name => name,
        };

        Self::new(ids::generate_peer_id(), display_name, host_name, ip, tcp_port)
    }

    /// Build a record from a received heartbeat.
    ///
    /// A heartbeat that does not announce its IP is attributed to the address it
    /// was received from.
    pub fn from_heartbeat(heartbeat: Heartbeat, sender: &SocketAddr) -> Self {
        let ip = if heartbeat.ip.is_empty() {
            sender.ip().to_string()
        } else {
            heartbeat.ip
        };

        Self {
            peer_id: heartbeat.peer_id,
            display_name: heartbeat.display_name,
            host_name: heartbeat.host_name,
            ip,
            tcp_port: heartbeat.tcp_port,
            last_seen: if heartbeat.timestamp > 0 {
                heartbeat.timestamp
            } else {
                ids::now_timestamp()
            },
        }
    }

    /// The heartbeat announcing this record, stamped now.
    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            version: protocol_version(),
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
            host_name: self.host_name.clone(),
            ip: self.ip.clone(),
            tcp_port: self.tcp_port,
            timestamp: ids::now_timestamp(),
        }
    }

    /// The notice announcing this peer's departure, stamped now.
    pub fn bye(&self) -> Bye {
        Bye {
            version: protocol_version(),
            peer_id: self.peer_id.clone(),
            timestamp: ids::now_timestamp(),
        }
    }
}

/// The periodic liveness announcement of a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default = "protocol_version")]
    pub version: String,
    #[serde(rename = "user_id")]
    pub peer_id: PeerId,
    #[serde(rename = "username")]
    pub display_name: String,
    #[serde(rename = "hostname", default)]
    pub host_name: String,
    #[serde(default)]
    pub ip: String,
    pub tcp_port: u16,
    #[serde(default)]
    pub timestamp: Timestamp,
}

/// The one-off notice a peer sends when shutting down gracefully.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bye {
    #[serde(default = "protocol_version")]
    pub version: String,
    #[serde(rename = "user_id")]
    pub peer_id: PeerId,
    #[serde(default)]
    pub timestamp: Timestamp,
}

/// The records the discovery channel itself understands.
///
/// Anything else carried on the channel is passed through untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DiscoveryRecord {
    #[serde(rename = "HEARTBEAT")]
    Heartbeat(Heartbeat),
    #[serde(rename = "BYE")]
    Bye(Bye),
}

impl DiscoveryRecord {
    /// The `type` tag of a heartbeat.
    pub const HEARTBEAT: &'static str = "HEARTBEAT";

    /// The `type` tag of a departure notice.
    pub const BYE: &'static str = "BYE";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alice() -> PeerRecord {
        PeerRecord::new("a1b2c3d4e5f60718", "alice", "alice-laptop", "192.168.1.20", 10000)
    }

    #[test]
    fn heartbeat_wire_format() {
        let record = DiscoveryRecord::Heartbeat(alice().heartbeat());
        let value = serde_json::to_value(&record).expect("Failed to serialize.");

        assert_eq!(value["type"], "HEARTBEAT");
        assert_eq!(value["version"], "1.0");
        assert_eq!(value["user_id"], "a1b2c3d4e5f60718");
        assert_eq!(value["username"], "alice");
        assert_eq!(value["hostname"], "alice-laptop");
        assert_eq!(value["ip"], "192.168.1.20");
        assert_eq!(value["tcp_port"], 10000);
        assert!(value["timestamp"].as_i64().is_some());
    }

    #[test]
    fn bye_wire_format() {
        let value = serde_json::to_value(DiscoveryRecord::Bye(alice().bye()))
            .expect("Failed to serialize.");
        assert_eq!(value["type"], "BYE");
        assert_eq!(value["user_id"], "a1b2c3d4e5f60718");
    }

    #[test]
    fn parses_minimal_heartbeat() {
        let value = json!({
            "type": "HEARTBEAT",
            "user_id": "b0b",
            "username": "bob",
            "tcp_port": 10000,
        });
        let record: DiscoveryRecord = serde_json::from_value(value).expect("Failed to parse.");

        let DiscoveryRecord::Heartbeat(heartbeat) = record else {
            panic!("Expected a heartbeat.");
        };
        assert_eq!(heartbeat.version, PROTOCOL_VERSION);

        let sender = SocketAddr::from(([192, 168, 1, 30], 9999));
        let peer = PeerRecord::from_heartbeat(heartbeat, &sender);
        assert_eq!(peer.ip, "192.168.1.30");
        assert!(peer.last_seen > 0);
    }

    #[test]
    fn local_record_falls_back_to_host_name() {
        let local = PeerRecord::local("", "carol-desktop", "192.168.1.40", 10000);
        assert_eq!(local.display_name, "carol-desktop");
        assert_eq!(local.peer_id.len(), 16);

        let local = PeerRecord::local("  ", "ip-172-31-22-104.ec2.internal", "10.0.0.5", 10000);
        assert_eq!(local.display_name, "ip-172-31-22-104.ec2");
        assert_eq!(local.host_name, "ip-172-31-22-104.ec2.internal");
    }
}
