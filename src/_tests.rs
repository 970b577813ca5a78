//! Shared testing parameters.
//!
//! Ports are distinct per service so that serial tests never collide with a
//! peer running on the default ports of the same host.

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use crate::{
    config::NodeConfig,
    events::{ChatEvent, EventBus},
};

/// The host every test service binds to or sends to.
pub const BASE_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// The discovery port used in unit tests.
pub const DISCOVERY_PORT: u16 = 39990;

/// The messaging port used in unit tests.
pub const MESSAGING_PORT: u16 = 39991;

/// The group channel port used in unit tests.
pub const MULTICAST_PORT: u16 = 39992;

/// How long a test waits for an event before giving up.
pub const WAIT_FOR_EVENT: Duration = Duration::from_secs(3);

/// A configuration for tests: loopback discovery, short poll intervals.
pub fn test_config() -> NodeConfig {
    let mut config = NodeConfig::new();

    config.discovery.port = DISCOVERY_PORT;
    config.discovery.broadcast_host = BASE_HOST;
    config.discovery.interval = Duration::from_millis(200);
    config.discovery.poll_interval = Duration::from_millis(100);
    config.messaging.host = BASE_HOST;
    config.messaging.port = MESSAGING_PORT;
    config.messaging.send_timeout = Duration::from_secs(1);
    config.messaging.poll_interval = Duration::from_millis(100);
    config.groups.port = MULTICAST_PORT;
    config.groups.ttl = 1;
    config.groups.poll_interval = Duration::from_millis(100);

    config
}

/// Wait for the first event on the bus matching `predicate`, discarding the others.
pub async fn wait_for_event<P>(bus: &Arc<EventBus>, predicate: P) -> Option<ChatEvent>
where
    P: Fn(&ChatEvent) -> bool,
{
    tokio::time::timeout(WAIT_FOR_EVENT, async {
        loop {
            let event = bus.next().await;
            if predicate(&event) {
                return event;
            }
            logger::trace!("Skipping event {}.", event.kind());
        }
    })
    .await
    .ok()
}
