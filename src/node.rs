//! A chat node: every service wired over one event bus.
//!
//! [`ChatNode`] is the single consumer of the bus. [`ChatNode::next_update`] turns
//! raw network events into [`NodeUpdate`]s, keeping the peer registry and the
//! store current along the way.

use std::{collections::VecDeque, sync::Arc};
use tokio::{
    sync::{Mutex, RwLock},
    time::Instant,
};

use crate::{
    config::{validate_display_name, NodeConfig},
    discovery::DiscoveryService,
    events::{ChatEvent, EventBus},
    groups::{BroadcastHook, CreatedGroup, GroupService, InviteRoute},
    ids::PeerId,
    messaging::MessagingService,
    models::{
        ChatMessage, GroupDescriptor, GroupInvite, GroupMember, GroupPayload, MessageStatus,
        PeerRecord,
    },
    registry::{Observation, PeerRegistry},
    store::ChatStore,
    ChatError,
};

/// Something the application should know about.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeUpdate {
    /// A peer was heard from for the first time, or again after being offline.
    PeerOnline(PeerRecord),

    /// A peer said bye, or has not been heard from for a while.
    PeerOffline(PeerRecord),

    /// A peer has been silent long enough to be forgotten.
    PeerRemoved(PeerRecord),

    /// A direct message arrived; it has been saved.
    DirectMessage(ChatMessage),

    /// A message arrived on a joined group; it has been saved.
    GroupMessage(ChatMessage),

    /// An invite concerning this peer was accepted.
    GroupJoined(GroupDescriptor),

    /// An invite for other peers was seen.
    InviteIgnored(GroupInvite),

    /// An unrecognised payload on the discovery channel.
    Broadcast(serde_json::Value),
}

/// The discovery, messaging and group services of one peer, with its registry
/// and store.
pub struct ChatNode {
    config: NodeConfig,
    local: RwLock<PeerRecord>,
    bus: Arc<EventBus>,
    store: Arc<dyn ChatStore>,
    registry: PeerRegistry,
    discovery: Arc<DiscoveryService>,
    messaging: MessagingService,
    groups: GroupService,
    pending: Mutex<VecDeque<NodeUpdate>>,
    next_sweep: Mutex<Instant>,
}

impl ChatNode {
    /// Create a node announcing itself as `display_name` at `ip`.
    ///
    /// An empty display name falls back to the host name.
    pub fn new(
        config: NodeConfig,
        display_name: &str,
        host_name: &str,
        ip: &str,
        store: Arc<dyn ChatStore>,
    ) -> Result<Self, ChatError> {
        config.validate()?;

        if !display_name.trim().is_empty() {
            validate_display_name(display_name)?;
        }
        let local = PeerRecord::local(display_name, host_name, ip, config.messaging.port);

        let bus = Arc::new(EventBus::new(config.event_capacity));
        let discovery = Arc::new(DiscoveryService::new(
            config.discovery.clone(),
            Arc::clone(&bus),
        ));
        let messaging = MessagingService::new(config.messaging.clone(), Arc::clone(&bus));
        let groups = GroupService::new(config.groups.clone(), Arc::clone(&bus), Arc::clone(&store))?
            .with_broadcast_hook(discovery.clone() as Arc<dyn BroadcastHook>);

        Ok(Self {
            registry: PeerRegistry::new(&local.peer_id),
            local: RwLock::new(local),
            next_sweep: Mutex::new(Instant::now() + config.liveness.sweep_interval),
            config,
            bus,
            store,
            discovery,
            messaging,
            groups,
            pending: Mutex::new(VecDeque::new()),
        })
    }

    /// Start discovery, then messaging, then groups.
    ///
    /// If a service fails to start, the ones already started are stopped again.
    pub async fn start(&self) -> Result<(), ChatError> {
        self.discovery.set_self_record(self.local().await).await;
        self.discovery.start().await?;

        let addr = match self.messaging.start().await {
            Ok(addr) => addr,
            Err(err) => {
                self.discovery.stop().await;
                return Err(err);
            }
        };

        // The configured port may have been 0.
        let record = {
            let mut local = self.local.write().await;
            local.tcp_port = addr.port();
            local.clone()
        };
        self.discovery.set_self_record(record).await;

        if let Err(err) = self.groups.start().await {
            self.messaging.stop().await;
            self.discovery.stop().await;
            return Err(err);
        }

        *self.next_sweep.lock().await = Instant::now() + self.config.liveness.sweep_interval;
        logger::info!("Node {} started.", self.local().await.peer_id);
        Ok(())
    }

    /// Say bye, then stop groups, messaging and discovery.
    ///
    /// Never fails; returns `false` if any task had to be abandoned.
    pub async fn shutdown(&self) -> bool {
        self.discovery.send_bye().await;

        let groups = self.groups.stop().await;
        let messaging = self.messaging.stop().await;
        let discovery = self.discovery.stop().await;

        logger::info!("Node shut down.");
        groups && messaging && discovery
    }

    /// The record this node announces.
    pub async fn local(&self) -> PeerRecord {
        self.local.read().await.clone()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }

    /// Wait for the next update.
    ///
    /// The liveness sweep of the registry runs from here, so this should be
    /// polled continuously.
    pub async fn next_update(&self) -> NodeUpdate {
        loop {
            if let Some(update) = self.pending.lock().await.pop_front() {
                return update;
            }

            let sweep_at = *self.next_sweep.lock().await;
            tokio::select! {
                event = self.bus.next() => {
                    if let Some(update) = self.handle_event(event).await {
                        return update;
                    }
                },
                _ = tokio::time::sleep_until(sweep_at) => self.sweep().await,
            }
        }
    }

    /// Mark silent peers offline, and forget long-silent ones.
    async fn sweep(&self) {
        let liveness = &self.config.liveness;
        let report = self
            .registry
            .sweep(liveness.offline_after, liveness.remove_after)
            .await;

        if !report.is_empty() {
            logger::debug!(
                "Sweep: {} peer(s) offline, {} removed.",
                report.offline.len(),
                report.removed.len()
            );
        }

        let mut pending = self.pending.lock().await;
        pending.extend(report.offline.into_iter().map(NodeUpdate::PeerOffline));
        pending.extend(report.removed.into_iter().map(NodeUpdate::PeerRemoved));
        drop(pending);

        *self.next_sweep.lock().await = Instant::now() + liveness.sweep_interval;
    }

    /// Apply one event; returns the update to report, if any.
    async fn handle_event(&self, event: ChatEvent) -> Option<NodeUpdate> {
        match event {
            ChatEvent::PeerDiscovered { peer, .. } => {
                match self.registry.observe(peer.clone()).await {
                    Observation::New | Observation::Returned => Some(NodeUpdate::PeerOnline(peer)),
                    Observation::Refreshed | Observation::Ignored => None,
                }
            }
            ChatEvent::PeerDeparted { peer_id, .. } => self
                .registry
                .mark_offline(&peer_id)
                .await
                .map(NodeUpdate::PeerOffline),
            ChatEvent::Broadcast { payload, sender } => {
                if payload.get("type").and_then(serde_json::Value::as_str)
                    == Some(GroupPayload::INVITE)
                {
                    match serde_json::from_value::<GroupPayload>(payload) {
                        Ok(GroupPayload::Invite(invite)) => self.handle_invite(invite).await,
                        Ok(GroupPayload::Message(_)) => None,
                        Err(err) => {
                            logger::warn!("Ignoring malformed invite from {}: {}", sender, err);
                            None
                        }
                    }
                } else {
                    Some(NodeUpdate::Broadcast(payload))
                }
            }
            ChatEvent::MessageReceived { message, sender } => {
                let local_id = self.local.read().await.peer_id.clone();
                if message.to_peer_id != local_id {
                    logger::warn!(
                        "Message {} from {} is addressed to {}, not to us.",
                        message.msg_id,
                        sender,
                        message.to_peer_id
                    );
                }

                let message = message.with_status(MessageStatus::Received);
                self.save(&message);
                Some(NodeUpdate::DirectMessage(message))
            }
            ChatEvent::GroupMessage { message, .. } => {
                // Our own transmission coming back; it was saved when sent.
                if message.from_peer_id == self.local.read().await.peer_id {
                    return None;
                }

                self.save(&message);
                Some(NodeUpdate::GroupMessage(message))
            }
            ChatEvent::GroupInvite { invite, .. } => self.handle_invite(invite).await,
        }
    }

    /// Join the group if the invite concerns us.
    async fn handle_invite(&self, invite: GroupInvite) -> Option<NodeUpdate> {
        let local_id = self.local.read().await.peer_id.clone();
        if !invite.concerns(&local_id) {
            return Some(NodeUpdate::InviteIgnored(invite));
        }

        match self.groups.join_group(invite.descriptor()).await {
            Ok(true) => self.groups.group(&invite.group_id).await.map(NodeUpdate::GroupJoined),
            Ok(false) => None,
            Err(err) => {
                logger::error!("Failed to join group {}: {}", invite.group_id, err);
                None
            }
        }
    }

    /// Save a received message; failures are logged.
    fn save(&self, message: &ChatMessage) {
        if let Err(err) = self.store.save_message(message) {
            logger::error!("Failed to save message {}: {}", message.msg_id, err);
        }
    }

    fn check_length(&self, body: &str) -> Result<(), ChatError> {
        let length = body.chars().count();
        if length > self.config.max_message_length {
            Err(ChatError::MessageTooLong(length, self.config.max_message_length))
        } else {
            Ok(())
        }
    }

    /// Send a text message to a peer, by identifier or display name.
    ///
    /// The message is saved as sent, or as failed with the error returned.
    pub async fn send_text(&self, peer: &str, body: &str) -> Result<ChatMessage, ChatError> {
        self.check_length(body)?;

        let peer = self
            .registry
            .resolve(peer)
            .await
            .ok_or_else(|| ChatError::UnknownPeer(peer.to_owned()))?;

        let message = ChatMessage::direct(
            &self.local().await,
            &peer.peer_id,
            &peer.display_name,
            body,
        );
        let sent = self
            .messaging
            .send_message(&peer.ip, peer.tcp_port, &message)
            .await;

        let message = message.with_status(match sent {
            Ok(_) => MessageStatus::Sent,
            Err(_) => MessageStatus::Failed,
        });
        self.save(&message);

        sent.map(|_| message)
    }

    /// Create a group owned by this peer and invite `member_ids`.
    pub async fn create_group(
        &self,
        name: &str,
        member_ids: impl IntoIterator<Item = PeerId>,
    ) -> Result<CreatedGroup, ChatError> {
        let local_id = self.local.read().await.peer_id.clone();
        self.groups.create_group(name, &local_id, member_ids).await
    }

    /// Invite more peers to a joined group.
    pub async fn invite_to_group(
        &self,
        group_id: &str,
        peer_ids: impl IntoIterator<Item = PeerId>,
    ) -> Result<InviteRoute, ChatError> {
        let local_id = self.local.read().await.peer_id.clone();
        self.groups.send_group_invite(group_id, &local_id, peer_ids).await
    }

    /// Send a text message to a joined group.
    pub async fn send_group_text(
        &self,
        group_id: &str,
        body: &str,
    ) -> Result<ChatMessage, ChatError> {
        self.check_length(body)?;

        let local = self.local().await;
        self.groups
            .send_group_message(group_id, &local.peer_id, &local.display_name, body)
            .await
    }

    pub async fn leave_group(&self, group_id: &str) -> Result<GroupDescriptor, ChatError> {
        self.groups.leave_group(group_id).await
    }

    /// Find a joined group by identifier, or failing that by name.
    pub async fn resolve_group(&self, key: &str) -> Option<GroupDescriptor> {
        match self.groups.group(key).await {
            Some(group) => Some(group),
            None => self
                .groups
                .groups()
                .await
                .into_iter()
                .find(|group| group.name == key),
        }
    }

    pub async fn groups(&self) -> Vec<GroupDescriptor> {
        self.groups.groups().await
    }

    /// Every online peer.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.registry.online_peers().await
    }

    /// The latest `limit` messages exchanged with a peer, oldest first.
    pub async fn history(
        &self,
        peer_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let local_id = self.local.read().await.peer_id.clone();
        self.store.get_messages(&local_id, peer_id, limit)
    }

    /// The latest `limit` messages of a group, oldest first.
    pub fn group_history(
        &self,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        self.store.get_group_messages(group_id, limit)
    }

    /// The stored members of a group with their roles.
    pub fn group_members(&self, group_id: &str) -> Result<Vec<GroupMember>, ChatError> {
        self.store.get_group_members(group_id)
    }

    /// Mark everything received from a peer as read.
    pub async fn mark_read(&self, peer_id: &str) -> Result<usize, ChatError> {
        let local_id = self.local.read().await.peer_id.clone();
        self.store.mark_read(peer_id, &local_id)
    }

    pub async fn unread_count(&self, peer_id: &str) -> Result<usize, ChatError> {
        let local_id = self.local.read().await.peer_id.clone();
        self.store.unread_count(peer_id, &local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{_tests::*, config::MAX_DISPLAY_NAME_LENGTH, store::MemoryStore};
    use serial_test::serial;
    use std::{net::SocketAddr, time::Duration};

    fn sender() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    fn node() -> ChatNode {
        let mut config = test_config();
        config.messaging.port = 0;
        config.liveness.offline_after = Duration::from_secs(15);
        config.liveness.remove_after = Duration::from_secs(30);
        config.liveness.sweep_interval = Duration::from_secs(5);

        ChatNode::new(config, "tester", "test-host", "127.0.0.1", Arc::new(MemoryStore::new()))
            .expect("Failed to create node.")
    }

    async fn update(node: &ChatNode) -> NodeUpdate {
        tokio::time::timeout(Duration::from_secs(60), node.next_update())
            .await
            .expect("No update.")
    }

    fn heartbeat(peer: &PeerRecord) -> ChatEvent {
        ChatEvent::PeerDiscovered {
            peer: peer.clone(),
            sender: sender(),
        }
    }

    #[test]
    fn rejects_long_names() {
        assert!(matches!(
            ChatNode::new(
                test_config(),
                "a name that is far too long to display",
                "host",
                "127.0.0.1",
                Arc::new(MemoryStore::new()),
            ),
            Err(ChatError::InvalidConfig(_))
        ));
    }

    #[test]
    fn long_host_name_is_cut_to_fit() {
        let node = ChatNode::new(
            test_config(),
            "",
            "ip-172-31-22-104.ec2.internal",
            "127.0.0.1",
            Arc::new(MemoryStore::new()),
        )
        .expect("Failed to create node.");

        let local = node.local.try_read().expect("Record is locked.").clone();
        assert_eq!(local.display_name.chars().count(), MAX_DISPLAY_NAME_LENGTH);
        assert_eq!(local.host_name, "ip-172-31-22-104.ec2.internal");
    }

    #[tokio::test(start_paused = true)]
    async fn peer_lifecycle() {
        let node = node();
        let bob = PeerRecord::new("bob", "Bob", "bob-pc", "127.0.0.1", 10000);

        node.bus().publish(heartbeat(&node.local().await));
        node.bus().publish(heartbeat(&bob));
        node.bus().publish(heartbeat(&bob));
        assert_eq!(update(&node).await, NodeUpdate::PeerOnline(bob.clone()));

        node.bus().publish(ChatEvent::PeerDeparted {
            peer_id: "bob".to_owned(),
            sender: sender(),
        });
        assert_eq!(update(&node).await, NodeUpdate::PeerOffline(bob.clone()));

        node.bus().publish(heartbeat(&bob));
        assert_eq!(update(&node).await, NodeUpdate::PeerOnline(bob.clone()));

        // Silence: offline after the sweep following 15 s, removed after 30 s.
        match update(&node).await {
            NodeUpdate::PeerOffline(peer) => assert_eq!(peer.peer_id, "bob"),
            other => panic!("Unexpected update {other:?}"),
        }
        match update(&node).await {
            NodeUpdate::PeerRemoved(peer) => assert_eq!(peer.peer_id, "bob"),
            other => panic!("Unexpected update {other:?}"),
        }
        assert!(node.peers().await.is_empty());
    }

    #[tokio::test]
    async fn direct_messages_are_saved_as_received() {
        let node = node();
        let local = node.local().await;
        let bob = PeerRecord::new("bob", "Bob", "bob-pc", "127.0.0.1", 10000);

        let message = ChatMessage::direct(&bob, &local.peer_id, &local.display_name, "hi");
        node.bus().publish(ChatEvent::MessageReceived {
            message: message.clone(),
            sender: sender(),
        });

        let received = message.with_status(MessageStatus::Received);
        assert_eq!(update(&node).await, NodeUpdate::DirectMessage(received.clone()));
        assert_eq!(
            node.history("bob", 10).await.expect("Failed to query."),
            vec![received]
        );
        assert_eq!(node.unread_count("bob").await.expect("Failed to count."), 1);
        assert_eq!(node.mark_read("bob").await.expect("Failed to mark."), 1);
    }

    #[tokio::test]
    async fn own_group_messages_are_not_saved_twice() {
        let node = node();
        let local = node.local().await;

        let own = ChatMessage::group("group_a", &local.peer_id, &local.display_name, "mine");
        let theirs = ChatMessage::group("group_a", "bob", "Bob", "theirs");
        node.bus().publish(ChatEvent::GroupMessage {
            message: own,
            sender: sender(),
        });
        node.bus().publish(ChatEvent::GroupMessage {
            message: theirs.clone(),
            sender: sender(),
        });

        assert_eq!(update(&node).await, NodeUpdate::GroupMessage(theirs.clone()));
        assert_eq!(
            node.group_history("group_a", 10).expect("Failed to query."),
            vec![theirs]
        );
    }

    #[tokio::test]
    async fn invites_for_others_and_other_broadcasts() {
        let node = node();
        let group = GroupDescriptor::new(
            "group_a",
            "friends",
            "carol",
            std::net::Ipv4Addr::new(239, 0, 0, 150),
            MULTICAST_PORT,
            vec!["dave".to_owned()],
        );
        let invite = GroupInvite::new(&group, "carol", vec!["dave".to_owned()]);

        let payload =
            serde_json::to_value(GroupPayload::Invite(invite.clone())).expect("Failed to encode.");
        node.bus().publish(ChatEvent::Broadcast {
            payload,
            sender: sender(),
        });
        assert_eq!(update(&node).await, NodeUpdate::InviteIgnored(invite));

        let other = serde_json::json!({"type": "FILE_OFFER", "name": "a.txt"});
        node.bus().publish(ChatEvent::Broadcast {
            payload: other.clone(),
            sender: sender(),
        });
        assert_eq!(update(&node).await, NodeUpdate::Broadcast(other));
    }

    #[tokio::test]
    async fn outbound_checks() {
        let node = node();

        let long = "x".repeat(node.config().max_message_length + 1);
        assert!(matches!(
            node.send_text("bob", &long).await,
            Err(ChatError::MessageTooLong(..))
        ));
        assert!(matches!(
            node.send_text("bob", "hello").await,
            Err(ChatError::UnknownPeer(_))
        ));
        assert!(matches!(
            node.send_group_text("group_a", "hello").await,
            Err(ChatError::UnknownGroup(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_send_is_saved_as_failed() {
        let node = node();
        // Nothing listens on this peer's port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind.");
        let port = listener.local_addr().expect("No local address.").port();
        drop(listener);

        let bob = PeerRecord::new("bob", "Bob", "bob-pc", "127.0.0.1", port);
        node.registry().observe(bob).await;

        assert!(node.send_text("Bob", "are you there?").await.is_err());
        let history = node.history("bob", 10).await.expect("Failed to query.");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, MessageStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[serial]
    async fn start_and_shutdown() {
        let node = node();
        node.start().await.expect("Failed to start.");

        // The heartbeat announces the bound port.
        let local = node.local().await;
        assert_ne!(local.tcp_port, 0);

        assert!(node.shutdown().await);
        // Shutting down twice is harmless.
        node.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[serial]
    async fn messaging_bind_failure_stops_discovery() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind.");

        let mut config = test_config();
        config.messaging.port = blocker.local_addr().expect("No local address.").port();
        let store = Arc::new(MemoryStore::new());
        let node = ChatNode::new(config, "tester", "test-host", "127.0.0.1", store)
            .expect("Failed to create node.");

        assert!(matches!(node.start().await, Err(ChatError::Bind { .. })));
        assert!(!node.discovery().is_running());
    }
}
