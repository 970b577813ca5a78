//! Group channels: one multicast listener per joined group.
//!

use fxhash::FxHashMap;
use multicast::{socket::*, Datagram, DatagramListener};
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::Mutex;

use super::{AddressPool, BroadcastHook};
use crate::{
    config::GroupSettings,
    events::{ChatEvent, EventBus},
    ids::{self, PeerId},
    models::{
        ChatMessage, GroupDescriptor, GroupInvite, GroupMessagePayload, GroupPayload,
        MessageStatus,
    },
    store::ChatStore,
    ChatError,
};

const SERVICE: &str = "groups";

/// The channel an invite went out on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InviteRoute {
    /// The discovery broadcast channel, which every peer listens on.
    Broadcast,

    /// The group's own multicast channel.
    ///
    /// Used only when no broadcast hook is wired in. Invitees have not joined the
    /// channel yet, so they will most likely miss it.
    Multicast,
}

/// The result of [`GroupService::create_group`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedGroup {
    pub descriptor: GroupDescriptor,

    /// How the invite was sent; `None` if sending it failed.
    pub invite: Option<InviteRoute>,
}

/// Decode a datagram received on the channel of `group_id`.
///
/// Returns `None` for a message addressed to another group.
pub fn decode_group_datagram(
    group_id: &str,
    payload: &[u8],
    sender: SocketAddr,
) -> Result<Option<ChatEvent>, ChatError> {
    let payload: GroupPayload = serde_json::from_slice(payload)
        .map_err(|err| ChatError::MalformedPayload(err.to_string()))?;

    match payload {
        GroupPayload::Message(message) if message.group_id != group_id => {
            logger::debug!(
                "Ignoring message for group {} on the channel of {}.",
                message.group_id,
                group_id
            );
            Ok(None)
        }
        GroupPayload::Message(message) => Ok(Some(ChatEvent::GroupMessage {
            message: message.into_message(),
            sender,
        })),
        GroupPayload::Invite(invite) => Ok(Some(ChatEvent::GroupInvite { invite, sender })),
    }
}

/// A joined group and the listener of its channel.
struct Membership {
    descriptor: GroupDescriptor,
    listener: DatagramListener,
}

/// Every mutable part of the service, guarded together.
struct GroupTable {
    pool: AddressPool,
    joined: FxHashMap<String, Membership>,
}

/// Creates, joins and leaves groups, and talks on their channels.
///
/// The table of joined groups and the address pool are only ever changed through
/// this service's methods, under one lock, so a join cannot race a leave.
pub struct GroupService {
    settings: GroupSettings,
    bus: Arc<EventBus>,
    store: Arc<dyn ChatStore>,
    hook: Option<Arc<dyn BroadcastHook>>,
    table: Mutex<GroupTable>,
    running: AtomicBool,
}

impl GroupService {
    pub fn new(
        settings: GroupSettings,
        bus: Arc<EventBus>,
        store: Arc<dyn ChatStore>,
    ) -> Result<Self, ChatError> {
        let pool = AddressPool::new(settings.pool_first, settings.pool_last)?;

        Ok(Self {
            settings,
            bus,
            store,
            hook: None,
            table: Mutex::new(GroupTable {
                pool,
                joined: FxHashMap::default(),
            }),
            running: AtomicBool::new(false),
        })
    }

    /// Announce invites through `hook` instead of the group channel.
    pub fn with_broadcast_hook(mut self, hook: Arc<dyn BroadcastHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), ChatError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ChatError::NotRunning(SERVICE))
        }
    }

    /// Rejoin every stored group.
    ///
    /// A group whose listener cannot be opened is logged and left un-joined; only a
    /// failure to read the store fails the start. Returns the number of groups joined.
    pub async fn start(&self) -> Result<usize, ChatError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ChatError::AlreadyRunning(SERVICE));
        }

        let stored = match self.store.get_all_groups() {
            Ok(stored) => stored,
            Err(err) => {
                self.running.store(false, Ordering::Release);
                return Err(err);
            }
        };

        let mut table = self.table.lock().await;
        let mut joined = 0;
        for descriptor in stored {
            let group_id = descriptor.group_id.clone();
            match self.join_locked(&mut table, descriptor, false).await {
                Ok(true) => joined += 1,
                Ok(false) => {}
                Err(err) => logger::error!("Failed to rejoin group {}: {}", group_id, err),
            }
        }

        logger::info!("Group service started with {} group(s).", joined);
        Ok(joined)
    }

    /// Open the listener of a group's channel.
    fn open_listener(&self, descriptor: &GroupDescriptor) -> Result<DatagramListener, ChatError> {
        let addr = descriptor.multicast_addr();
        let listener = DatagramListener::bind_multicast(&addr)
            .map_err(|source| ChatError::Bind {
                service: SERVICE,
                addr: addr.to_string(),
                source,
            })?
            .with_packet_size(self.settings.packet_size)
            .with_poll_interval(self.settings.poll_interval);

        let bus = Arc::clone(&self.bus);
        let group_id = descriptor.group_id.clone();
        listener.start(move |datagram: Datagram| {
            match decode_group_datagram(&group_id, &datagram.payload, datagram.sender) {
                Ok(Some(event)) => {
                    bus.publish(event);
                }
                Ok(None) => {}
                Err(err) => logger::warn!(
                    "Ignoring datagram from {} on group {}: {}",
                    datagram.sender,
                    group_id,
                    err
                ),
            }
        });

        logger::info!(
            "Listening to group {} ({}) on {}.",
            descriptor.name,
            descriptor.group_id,
            addr
        );
        Ok(listener)
    }

    /// Reserve the address, open the listener and optionally persist the descriptor.
    ///
    /// Every step is undone if a later one fails.
    async fn join_locked(
        &self,
        table: &mut GroupTable,
        descriptor: GroupDescriptor,
        persist: bool,
    ) -> Result<bool, ChatError> {
        if table.joined.contains_key(&descriptor.group_id) {
            logger::warn!("Already a member of group {}.", descriptor.group_id);
            return Ok(false);
        }

        let ip = descriptor.multicast_ip;
        if let Some(other) = table
            .joined
            .values()
            .find(|membership| membership.descriptor.multicast_ip == ip)
        {
            return Err(ChatError::AddressInUse(
                ip.to_string(),
                other.descriptor.group_id.clone(),
            ));
        }
        table.pool.reserve(ip)?;

        let listener = match self.open_listener(&descriptor) {
            Ok(listener) => listener,
            Err(err) => {
                table.pool.release(&ip);
                return Err(err);
            }
        };

        if persist {
            if let Err(err) = self.persist(&descriptor) {
                listener.stop(self.settings.join_timeout).await;
                table.pool.release(&ip);
                return Err(err);
            }
        }

        table.joined.insert(
            descriptor.group_id.clone(),
            Membership {
                descriptor,
                listener,
            },
        );
        Ok(true)
    }

    /// Save the descriptor, and record each member with its role.
    fn persist(&self, descriptor: &GroupDescriptor) -> Result<(), ChatError> {
        self.store.save_group(descriptor)?;
        descriptor
            .members()
            .iter()
            .try_for_each(|member| self.store.add_group_member(member).map(|_| ()))
    }

    /// Create a group owned by `owner_peer_id`, and invite the other members.
    pub async fn create_group(
        &self,
        name: &str,
        owner_peer_id: &str,
        member_ids: impl IntoIterator<Item = PeerId>,
    ) -> Result<CreatedGroup, ChatError> {
        self.ensure_running()?;

        let descriptor = {
            let mut table = self.table.lock().await;
            let ip = table.pool.allocate()?;

            let descriptor = GroupDescriptor::new(
                ids::generate_group_id(),
                name,
                owner_peer_id,
                ip,
                self.settings.port,
                member_ids,
            );

            let listener = match self.open_listener(&descriptor) {
                Ok(listener) => listener,
                Err(err) => {
                    table.pool.release(&ip);
                    return Err(err);
                }
            };

            if let Err(err) = self.persist(&descriptor) {
                listener.stop(self.settings.join_timeout).await;
                table.pool.release(&ip);
                return Err(err);
            }

            table.joined.insert(
                descriptor.group_id.clone(),
                Membership {
                    descriptor: descriptor.clone(),
                    listener,
                },
            );
            descriptor
        };

        logger::info!(
            "Created group {} ({}) on {}.",
            descriptor.name,
            descriptor.group_id,
            descriptor.multicast_addr()
        );

        let targets: Vec<PeerId> = descriptor
            .member_ids
            .iter()
            .filter(|member| *member != owner_peer_id)
            .cloned()
            .collect();

        let invite = match self
            .send_group_invite(&descriptor.group_id, owner_peer_id, targets)
            .await
        {
            Ok(route) => Some(route),
            Err(err) => {
                logger::warn!(
                    "Group {} was created, but its invite failed: {}",
                    descriptor.group_id,
                    err
                );
                None
            }
        };

        Ok(CreatedGroup { descriptor, invite })
    }

    /// Join a group someone else created.
    ///
    /// Returns `false` if the group is already joined.
    pub async fn join_group(&self, descriptor: GroupDescriptor) -> Result<bool, ChatError> {
        self.ensure_running()?;

        let mut table = self.table.lock().await;
        let group_id = descriptor.group_id.clone();
        let joined = self.join_locked(&mut table, descriptor, true).await?;
        if joined {
            logger::info!("Joined group {}.", group_id);
        }
        Ok(joined)
    }

    /// Stop listening to a group and release its address.
    ///
    /// History is kept, and other members are not told.
    pub async fn leave_group(&self, group_id: &str) -> Result<GroupDescriptor, ChatError> {
        let mut table = self.table.lock().await;
        let membership = table
            .joined
            .remove(group_id)
            .ok_or_else(|| ChatError::UnknownGroup(group_id.to_owned()))?;

        membership.listener.stop(self.settings.join_timeout).await;
        table.pool.release(&membership.descriptor.multicast_ip);

        logger::info!("Left group {}.", group_id);
        Ok(membership.descriptor)
    }

    /// Send one datagram to a group channel from a short-lived socket.
    async fn multicast<T: Serialize>(
        &self,
        addr: &SocketAddr,
        payload: &T,
    ) -> Result<usize, ChatError> {
        let bytes = serde_json::to_vec(payload)?;
        let socket = create_multicast_sender(self.settings.ttl)?;
        Ok(send_datagram(&socket, addr, &bytes).await?)
    }

    /// Send a text message to a joined group.
    ///
    /// The message is saved to the store exactly once, as sent or as failed, since
    /// the sender may not receive its own transmission.
    pub async fn send_group_message(
        &self,
        group_id: &str,
        from_peer_id: &str,
        from_name: &str,
        body: &str,
    ) -> Result<ChatMessage, ChatError> {
        let descriptor = self
            .group(group_id)
            .await
            .ok_or_else(|| ChatError::UnknownGroup(group_id.to_owned()))?;

        let message = ChatMessage::group(group_id, from_peer_id, from_name, body);
        let payload = GroupPayload::Message(GroupMessagePayload::new(&message, group_id));
        let sent = self.multicast(&descriptor.multicast_addr(), &payload).await;

        let message = message.with_status(match sent {
            Ok(_) => MessageStatus::Sent,
            Err(_) => MessageStatus::Failed,
        });
        let saved = self.store.save_message(&message);

        match (sent, saved) {
            (Ok(_), Ok(_)) => Ok(message),
            (Err(err), saved) => {
                if let Err(store_err) = saved {
                    logger::error!("Failed to save message {}: {}", message.msg_id, store_err);
                }
                logger::warn!("Failed to send to group {}: {}", group_id, err);
                Err(err)
            }
            (Ok(_), Err(err)) => Err(err),
        }
    }

    /// Invite peers to a joined group.
    pub async fn send_group_invite(
        &self,
        group_id: &str,
        inviter_peer_id: &str,
        target_peer_ids: impl IntoIterator<Item = PeerId>,
    ) -> Result<InviteRoute, ChatError> {
        let descriptor = self
            .group(group_id)
            .await
            .ok_or_else(|| ChatError::UnknownGroup(group_id.to_owned()))?;

        let payload =
            GroupPayload::Invite(GroupInvite::new(&descriptor, inviter_peer_id, target_peer_ids));

        match &self.hook {
            Some(hook) => {
                let value = serde_json::to_value(&payload)?;
                hook.broadcast(&value).await?;
                logger::info!("Broadcast invite to group {}.", group_id);
                Ok(InviteRoute::Broadcast)
            }
            None => {
                logger::warn!(
                    "No broadcast channel; sending the invite to group {} on its own channel, which invitees are unlikely to receive.",
                    group_id
                );
                self.multicast(&descriptor.multicast_addr(), &payload)
                    .await?;
                Ok(InviteRoute::Multicast)
            }
        }
    }

    /// The descriptor of a joined group.
    pub async fn group(&self, group_id: &str) -> Option<GroupDescriptor> {
        self.table
            .lock()
            .await
            .joined
            .get(group_id)
            .map(|membership| membership.descriptor.clone())
    }

    /// Every joined group, ordered by name.
    pub async fn groups(&self) -> Vec<GroupDescriptor> {
        let mut groups: Vec<_> = self
            .table
            .lock()
            .await
            .joined
            .values()
            .map(|membership| membership.descriptor.clone())
            .collect();

        groups.sort_by(|lhs, rhs| {
            lhs.name
                .cmp(&rhs.name)
                .then_with(|| lhs.group_id.cmp(&rhs.group_id))
        });
        groups
    }

    pub async fn is_joined(&self, group_id: &str) -> bool {
        self.table.lock().await.joined.contains_key(group_id)
    }

    /// Whether a listener is currently receiving for the group.
    pub async fn is_listening(&self, group_id: &str) -> bool {
        self.table
            .lock()
            .await
            .joined
            .get(group_id)
            .is_some_and(|membership| membership.listener.is_listening())
    }

    /// Addresses still free in the pool.
    pub async fn available_addresses(&self) -> usize {
        self.table.lock().await.pool.available()
    }

    /// Stop every listener and release every address.
    ///
    /// Returns `false` if a listener had to be abandoned.
    pub async fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return true;
        }

        let mut table = self.table.lock().await;
        let memberships: Vec<_> = table.joined.drain().map(|(_, membership)| membership).collect();
        for membership in &memberships {
            table.pool.release(&membership.descriptor.multicast_ip);
        }
        drop(table);

        let wait = self.settings.join_timeout;
        let finished = futures::future::join_all(
            memberships
                .iter()
                .map(|membership| membership.listener.stop(wait)),
        )
        .await
        .into_iter()
        .all(|finished| finished);

        logger::info!("Group service stopped.");
        finished
    }
}
