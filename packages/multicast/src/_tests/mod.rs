//! Unit test related configurations and functions.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// The multicast address used in unit tests in this crate.
pub const MULTICAST_ADDRESS: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 0, 0, 251)), 65432);

/// A unicast loopback address used in unit tests in this crate.
pub const LOOPBACK_ADDRESS: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 65431);

/// A simple struct to test serialization and deserialization.
#[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
pub struct TestStruct {
    pub kind: String,
    pub sequence: u64,
}

/// A payload used in unit tests.
pub fn sample() -> TestStruct {
    TestStruct {
        kind: "HEARTBEAT".to_owned(),
        sequence: 42,
    }
}
