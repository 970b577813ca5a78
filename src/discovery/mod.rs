//! Peer discovery over UDP broadcast.
//!
//! Every live process broadcasts a heartbeat describing itself at a fixed interval,
//! and listens on the same port for everyone else's. Received records are reported
//! raw on the [`EventBus`]; deciding when a silent peer is offline is left to the
//! [`PeerRegistry`](crate::registry::PeerRegistry).
//!
//! The channel also carries opaque payloads, such as group invites: anything that is
//! neither a heartbeat nor a bye is published as [`ChatEvent::Broadcast`].

use multicast::{socket::*, Datagram, DatagramListener};
use serde_json::Value;
use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{Mutex, Notify, RwLock};

use crate::{
    config::DiscoverySettings,
    events::{ChatEvent, EventBus},
    models::{DiscoveryRecord, PeerRecord},
    ChatError,
};

const SERVICE: &str = "discovery";

/// Decode a datagram received on the discovery channel.
pub fn classify(payload: &[u8], sender: SocketAddr) -> Result<ChatEvent, ChatError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|err| ChatError::MalformedPayload(err.to_string()))?;

    match value.get("type").and_then(Value::as_str) {
        Some(DiscoveryRecord::HEARTBEAT) | Some(DiscoveryRecord::BYE) => {
            match serde_json::from_value::<DiscoveryRecord>(value)
                .map_err(|err| ChatError::MalformedPayload(err.to_string()))?
            {
                DiscoveryRecord::Heartbeat(heartbeat) => Ok(ChatEvent::PeerDiscovered {
                    peer: PeerRecord::from_heartbeat(heartbeat, &sender),
                    sender,
                }),
                DiscoveryRecord::Bye(bye) => Ok(ChatEvent::PeerDeparted {
                    peer_id: bye.peer_id,
                    sender,
                }),
            }
        }
        _ => Ok(ChatEvent::Broadcast {
            payload: value,
            sender,
        }),
    }
}

/// The tasks and socket of a started service.
struct Running {
    listener: DatagramListener,
    socket: Arc<AsyncSocket>,
    sender_handle: tokio::task::JoinHandle<()>,
    terminate: Arc<Notify>,
}

/// Broadcasts this process's heartbeat and reports everyone else's.
pub struct DiscoveryService {
    settings: DiscoverySettings,
    bus: Arc<EventBus>,
    self_record: Arc<RwLock<Option<PeerRecord>>>,
    running: Arc<AtomicBool>,
    state: Mutex<Option<Running>>,
}

impl DiscoveryService {
    pub fn new(settings: DiscoverySettings, bus: Arc<EventBus>) -> Self {
        Self {
            settings,
            bus,
            self_record: Arc::new(RwLock::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
        }
    }

    /// The address heartbeats are sent to.
    pub fn target(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.settings.broadcast_host), self.settings.port)
    }

    /// Set the record announced by heartbeats.
    ///
    /// This must be called before [`Self::start`]; calling it later changes the
    /// next heartbeat sent.
    pub async fn set_self_record(&self, record: PeerRecord) {
        *self.self_record.write().await = Some(record);
    }

    pub async fn self_record(&self) -> Option<PeerRecord> {
        self.self_record.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The address of the bound socket, if started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state
            .lock()
            .await
            .as_ref()
            .and_then(|running| running.listener.local_addr().ok())
    }

    /// Bind the socket, and spawn the heartbeat and receive loops.
    pub async fn start(&self) -> Result<(), ChatError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(ChatError::AlreadyRunning(SERVICE));
        }
        if self.self_record.read().await.is_none() {
            return Err(ChatError::InvalidConfig(
                "the local peer record must be set before discovery starts".to_owned(),
            ));
        }

        let listener = DatagramListener::bind_broadcast(self.settings.port)
            .map_err(|source| ChatError::Bind {
                service: SERVICE,
                addr: format!("0.0.0.0:{}", self.settings.port),
                source,
            })?
            .with_packet_size(self.settings.packet_size)
            .with_poll_interval(self.settings.poll_interval);

        let bus = Arc::clone(&self.bus);
        listener.start(move |datagram: Datagram| {
            match classify(&datagram.payload, datagram.sender) {
                Ok(event) => {
                    bus.publish(event);
                }
                Err(err) => logger::warn!(
                    "Ignoring discovery datagram from {}: {}",
                    datagram.sender,
                    err
                ),
            }
        });

        self.running.store(true, Ordering::Release);

        let socket = listener.socket();
        let terminate = Arc::new(Notify::new());
        let sender_handle = tokio::spawn(heartbeat_loop(
            Arc::clone(&socket),
            self.target(),
            Arc::clone(&self.self_record),
            self.settings.interval,
            Arc::clone(&self.running),
            Arc::clone(&terminate),
        ));

        logger::info!(
            "Discovery started on port {}, announcing to {}.",
            self.settings.port,
            self.target()
        );

        *state = Some(Running {
            listener,
            socket,
            sender_handle,
            terminate,
        });
        Ok(())
    }

    /// Encode and send a payload on the channel.
    async fn send_value(&self, payload: &[u8]) -> Result<usize, ChatError> {
        let socket = self
            .state
            .lock()
            .await
            .as_ref()
            .map(|running| Arc::clone(&running.socket))
            .ok_or(ChatError::NotRunning(SERVICE))?;

        if payload.len() > self.settings.packet_size {
            logger::warn!(
                "Broadcasting {} bytes; receivers truncate datagrams to {} bytes.",
                payload.len(),
                self.settings.packet_size
            );
        }

        let target = self.target();
        tokio::time::timeout(
            self.settings.join_timeout,
            send_datagram(&socket, &target, payload),
        )
        .await
        .map_err(|_| {
            ChatError::Timeout(
                self.settings.join_timeout,
                format!("broadcasting to {target}"),
            )
        })?
        .map_err(ChatError::from)
    }

    /// Announce this peer's departure, once.
    ///
    /// Best-effort: every failure is logged and reported as `false`, never raised.
    pub async fn send_bye(&self) -> bool {
        let Some(record) = self.self_record().await else {
            logger::warn!("No local peer record; not sending bye.");
            return false;
        };

        let payload = match serde_json::to_vec(&DiscoveryRecord::Bye(record.bye())) {
            Ok(payload) => payload,
            Err(err) => {
                logger::error!("Failed to encode bye: {}", err);
                return false;
            }
        };

        match self.send_value(&payload).await {
            Ok(_) => {
                logger::info!("Sent bye for {}.", record.peer_id);
                true
            }
            Err(err) => {
                logger::warn!("Failed to send bye: {}", err);
                false
            }
        }
    }

    /// Carry an arbitrary JSON payload on the discovery channel.
    pub async fn send_custom_broadcast(&self, payload: &Value) -> Result<usize, ChatError> {
        let bytes = serde_json::to_vec(payload)?;
        self.send_value(&bytes).await
    }

    /// Stop both loops, waiting for each at most the configured join timeout.
    ///
    /// Returns `false` if a loop had to be abandoned.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.state.lock().await.take() else {
            return true;
        };

        self.running.store(false, Ordering::Release);
        running.terminate.notify_one();

        let listener_finished = running.listener.stop(self.settings.join_timeout).await;
        let sender_finished =
            match tokio::time::timeout(self.settings.join_timeout, running.sender_handle).await {
                Ok(Ok(())) => true,
                Ok(Err(err)) => {
                    logger::warn!("Heartbeat task failed: {}", err);
                    true
                }
                Err(_elapsed) => {
                    logger::warn!("Heartbeat task did not exit in time; abandoning it.");
                    false
                }
            };

        logger::info!("Discovery stopped.");
        listener_finished && sender_finished
    }
}

/// Send a heartbeat, then sleep for `interval`, until told to stop.
async fn heartbeat_loop(
    socket: Arc<AsyncSocket>,
    target: SocketAddr,
    self_record: Arc<RwLock<Option<PeerRecord>>>,
    interval: Duration,
    running: Arc<AtomicBool>,
    terminate: Arc<Notify>,
) {
    while running.load(Ordering::Acquire) {
        let heartbeat = self_record
            .read()
            .await
            .as_ref()
            .map(|record| DiscoveryRecord::Heartbeat(record.heartbeat()));

        if let Some(heartbeat) = heartbeat {
            match serde_json::to_vec(&heartbeat) {
                Ok(payload) => {
                    if let Err(err) = send_datagram(&socket, &target, &payload).await {
                        if running.load(Ordering::Acquire) {
                            logger::warn!("Failed to send heartbeat to {}: {}", target, err);
                        }
                    }
                }
                Err(err) => logger::error!("Failed to encode heartbeat: {}", err),
            }
        }

        tokio::select! {
            _ = terminate.notified() => break,
            _ = tokio::time::sleep(interval) => {},
        }
    }
    logger::debug!("Heartbeat task exited.");
}
