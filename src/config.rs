//! Deployment-wide settings, and CLI configuration to override them.
//!
//! The ports and intervals are constants shared by every peer of a deployment;
//! nothing here is negotiated on the wire.
use crate::ChatError;
use clap::Parser;
use std::{net::Ipv4Addr, time::Duration};

/// Default UDP port of the discovery channel.
pub const DEFAULT_DISCOVERY_PORT: u16 = 9999;

/// Default broadcast address heartbeats are sent to.
pub const DEFAULT_BROADCAST_HOST: Ipv4Addr = Ipv4Addr::BROADCAST;

/// Default TCP port of the messaging service.
pub const DEFAULT_MESSAGING_PORT: u16 = 10000;

/// Default interval between two heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default silence after which a peer is considered offline.
pub const DEFAULT_OFFLINE_AFTER: Duration = Duration::from_secs(15);

/// Default silence after which a peer is forgotten.
pub const DEFAULT_REMOVE_AFTER: Duration = Duration::from_secs(30);

/// First address of the multicast pool.
pub const DEFAULT_POOL_FIRST: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 100);

/// Last address of the multicast pool, inclusive.
pub const DEFAULT_POOL_LAST: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 255);

/// UDP port shared by every group channel.
pub const DEFAULT_MULTICAST_PORT: u16 = 10001;

/// Time-to-live of multicast datagrams; large enough to cross the local segment.
pub const DEFAULT_MULTICAST_TTL: u32 = 32;

/// Longest message body accepted for sending, in characters.
pub const MAX_MESSAGE_LENGTH: usize = 5000;

/// Longest display name accepted, in characters.
pub const MAX_DISPLAY_NAME_LENGTH: usize = 20;

/// Connect and write timeout of an outbound message.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded wait when joining a background task on stop.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest a blocking receive or readiness wait lasts before the running flag is polled.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Receive buffer of the discovery socket.
pub const DISCOVERY_PACKET_SIZE: usize = 1024;

/// Receive buffer of a group socket.
pub const MULTICAST_PACKET_SIZE: usize = 65535;

/// Bytes read from a TCP connection per readiness event.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Largest TCP frame accepted.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Capacity of the event bus.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Default number of messages returned by history queries.
pub const MESSAGE_HISTORY_LIMIT: usize = 100;

/// Settings of the discovery channel.
#[derive(Clone, Debug, PartialEq)]
pub struct DiscoverySettings {
    pub port: u16,
    pub broadcast_host: Ipv4Addr,
    pub interval: Duration,
    pub packet_size: usize,
    pub poll_interval: Duration,
    pub join_timeout: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            broadcast_host: DEFAULT_BROADCAST_HOST,
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            packet_size: DISCOVERY_PACKET_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// Settings of the messaging service.
#[derive(Clone, Debug, PartialEq)]
pub struct MessagingSettings {
    pub host: Ipv4Addr,
    pub port: u16,
    pub send_timeout: Duration,
    pub read_chunk_size: usize,
    pub max_frame: usize,
    pub poll_interval: Duration,
    pub join_timeout: Duration,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED,
            port: DEFAULT_MESSAGING_PORT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            read_chunk_size: READ_CHUNK_SIZE,
            max_frame: DEFAULT_MAX_FRAME,
            poll_interval: DEFAULT_POLL_INTERVAL,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// Settings of the group channels.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupSettings {
    pub pool_first: Ipv4Addr,
    pub pool_last: Ipv4Addr,
    pub port: u16,
    pub ttl: u32,
    pub packet_size: usize,
    pub poll_interval: Duration,
    pub join_timeout: Duration,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            pool_first: DEFAULT_POOL_FIRST,
            pool_last: DEFAULT_POOL_LAST,
            port: DEFAULT_MULTICAST_PORT,
            ttl: DEFAULT_MULTICAST_TTL,
            packet_size: MULTICAST_PACKET_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// The liveness policy of the peer registry.
#[derive(Clone, Debug, PartialEq)]
pub struct LivenessSettings {
    pub offline_after: Duration,
    pub remove_after: Duration,
    pub sweep_interval: Duration,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            offline_after: DEFAULT_OFFLINE_AFTER,
            remove_after: DEFAULT_REMOVE_AFTER,
            sweep_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Every setting of a node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeConfig {
    pub discovery: DiscoverySettings,
    pub messaging: MessagingSettings,
    pub groups: GroupSettings,
    pub liveness: LivenessSettings,
    pub event_capacity: usize,
    pub max_message_length: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoverySettings::default(),
            messaging: MessagingSettings::default(),
            groups: GroupSettings::default(),
            liveness: LivenessSettings::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_message_length: MAX_MESSAGE_LENGTH,
        }
    }
}

impl NodeConfig {
    /// The default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the configuration for values the services cannot work with.
    pub fn validate(&self) -> Result<(), ChatError> {
        if !self.groups.pool_first.is_multicast() || !self.groups.pool_last.is_multicast() {
            return Err(ChatError::InvalidConfig(format!(
                "multicast pool {}-{} must only contain multicast addresses",
                self.groups.pool_first, self.groups.pool_last
            )));
        }
        if u32::from(self.groups.pool_first) > u32::from(self.groups.pool_last) {
            return Err(ChatError::InvalidConfig(format!(
                "multicast pool starts at {} after it ends at {}",
                self.groups.pool_first, self.groups.pool_last
            )));
        }
        if self.liveness.offline_after > self.liveness.remove_after {
            return Err(ChatError::InvalidConfig(
                "peers cannot be removed before they are marked offline".to_owned(),
            ));
        }
        if self.discovery.interval.is_zero() {
            return Err(ChatError::InvalidConfig(
                "heartbeat interval must be positive".to_owned(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ChatError::InvalidConfig(
                "event capacity must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Check a display name against [`MAX_DISPLAY_NAME_LENGTH`].
pub fn validate_display_name(name: &str) -> Result<(), ChatError> {
    let length = name.chars().count();
    if name.trim().is_empty() {
        Err(ChatError::InvalidConfig("display name is empty".to_owned()))
    } else if length > MAX_DISPLAY_NAME_LENGTH {
        Err(ChatError::InvalidConfig(format!(
            "display name of {length} characters exceeds {MAX_DISPLAY_NAME_LENGTH}"
        )))
    } else {
        Ok(())
    }
}

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct CliArgs {
    /// The name shown to other peers; defaults to the host name.
    #[arg(short, long)]
    pub name: Option<String>,
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    pub discovery_port: u16,
    #[arg(long, default_value_t = DEFAULT_BROADCAST_HOST)]
    pub broadcast_host: Ipv4Addr,
    #[arg(short, long, default_value_t = DEFAULT_MESSAGING_PORT)]
    pub port: u16,
    #[arg(long, default_value_t = DEFAULT_MULTICAST_PORT)]
    pub multicast_port: u16,
    #[arg(long, default_value_t = DEFAULT_POOL_FIRST)]
    pub pool_first: Ipv4Addr,
    #[arg(long, default_value_t = DEFAULT_POOL_LAST)]
    pub pool_last: Ipv4Addr,
    /// Seconds between two heartbeats.
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_INTERVAL.as_secs())]
    pub heartbeat_interval: u64,
    /// Seconds of silence before a peer is shown offline.
    #[arg(long, default_value_t = DEFAULT_OFFLINE_AFTER.as_secs())]
    pub offline_after: u64,
    /// Seconds of silence before a peer is forgotten.
    #[arg(long, default_value_t = DEFAULT_REMOVE_AFTER.as_secs())]
    pub remove_after: u64,
}

impl CliArgs {
    /// Return the [`NodeConfig`] described by these arguments.
    pub fn node_config(&self) -> Result<NodeConfig, ChatError> {
        let mut config = NodeConfig::new();

        config.discovery.port = self.discovery_port;
        config.discovery.broadcast_host = self.broadcast_host;
        config.discovery.interval = Duration::from_secs(self.heartbeat_interval);
        config.messaging.port = self.port;
        config.groups.port = self.multicast_port;
        config.groups.pool_first = self.pool_first;
        config.groups.pool_last = self.pool_last;
        config.liveness.offline_after = Duration::from_secs(self.offline_after);
        config.liveness.remove_after = Duration::from_secs(self.remove_after);
        config.liveness.sweep_interval = config.discovery.interval;

        if let Some(name) = &self.name {
            validate_display_name(name)?;
        }

        config.validate()?;
        Ok(config)
    }
}
