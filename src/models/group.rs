//! Group descriptors, invites, and the group channel payloads.
//!

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::{ChatMessage, MessageKind, MessageStatus};
use crate::ids::{self, PeerId, Timestamp};

/// Collect identifiers into an ordered list without duplicates.
fn ordered_unique(ids: impl IntoIterator<Item = PeerId>) -> Vec<PeerId> {
    let mut unique: Vec<PeerId> = Vec::new();
    for id in ids {
        if !unique.contains(&id) {
            unique.push(id);
        }
    }
    unique
}

/// A group and the multicast channel it talks on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub group_id: String,
    #[serde(rename = "group_name")]
    pub name: String,
    #[serde(rename = "owner_id")]
    pub owner_peer_id: PeerId,
    pub multicast_ip: Ipv4Addr,
    pub multicast_port: u16,
    /// Ordered, without duplicates, owner first.
    pub member_ids: Vec<PeerId>,
}

impl GroupDescriptor {
    /// Create a descriptor; the owner always leads the member list.
    pub fn new(
        group_id: impl ToString,
        name: impl ToString,
        owner_peer_id: impl ToString,
        multicast_ip: Ipv4Addr,
        multicast_port: u16,
        member_ids: impl IntoIterator<Item = PeerId>,
    ) -> Self {
        let owner_peer_id = owner_peer_id.to_string();
        let member_ids =
            ordered_unique(std::iter::once(owner_peer_id.clone()).chain(member_ids));

        Self {
            group_id: group_id.to_string(),
            name: name.to_string(),
            owner_peer_id,
            multicast_ip,
            multicast_port,
            member_ids,
        }
    }

    /// The socket address of the group channel.
    pub fn multicast_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.multicast_ip), self.multicast_port)
    }

    /// Whether the peer is listed as a member.
    pub fn is_member(&self, peer_id: &str) -> bool {
        self.member_ids.iter().any(|member| member == peer_id)
    }

    /// The role of a listed peer: the owner, or a plain member.
    pub fn role_of(&self, peer_id: &str) -> Option<GroupRole> {
        if self.owner_peer_id == peer_id {
            Some(GroupRole::Owner)
        } else if self.is_member(peer_id) {
            Some(GroupRole::Member)
        } else {
            None
        }
    }

    /// Every listed member with its role, owner first.
    pub fn members(&self) -> Vec<GroupMember> {
        self.member_ids
            .iter()
            .filter_map(|peer_id| {
                self.role_of(peer_id)
                    .map(|role| GroupMember::new(&self.group_id, peer_id, role))
            })
            .collect()
    }

    /// Add a member at the end of the list; returns if it was not there yet.
    pub fn add_member(&mut self, peer_id: impl ToString) -> bool {
        let peer_id = peer_id.to_string();
        if self.is_member(&peer_id) {
            false
        } else {
            self.member_ids.push(peer_id);
            true
        }
    }
}

/// The standing of a peer within a group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Owner,
    #[default]
    Member,
}

/// A stored group membership.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: String,
    #[serde(rename = "user_id")]
    pub peer_id: PeerId,
    #[serde(default)]
    pub role: GroupRole,
    pub joined_at: Timestamp,
}

impl GroupMember {
    /// A membership starting now.
    pub fn new(group_id: impl ToString, peer_id: impl ToString, role: GroupRole) -> Self {
        Self {
            group_id: group_id.to_string(),
            peer_id: peer_id.to_string(),
            role,
            joined_at: ids::now_timestamp(),
        }
    }
}

/// An invitation to a group, announced on the discovery channel.
///
/// Invitees are not multicast members yet, so this is the only way for them to
/// learn where the group talks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInvite {
    pub group_id: String,
    pub group_name: String,
    pub multicast_ip: Ipv4Addr,
    pub multicast_port: u16,
    #[serde(rename = "owner_id")]
    pub owner_peer_id: PeerId,
    #[serde(rename = "inviter_id")]
    pub inviter_peer_id: PeerId,
    #[serde(rename = "target_user_ids", default)]
    pub target_peer_ids: Vec<PeerId>,
    #[serde(default)]
    pub timestamp: Timestamp,
}

impl GroupInvite {
    /// Create an invite to the described group, stamped now.
    pub fn new(
        group: &GroupDescriptor,
        inviter_peer_id: impl ToString,
        target_peer_ids: impl IntoIterator<Item = PeerId>,
    ) -> Self {
        Self {
            group_id: group.group_id.clone(),
            group_name: group.name.clone(),
            multicast_ip: group.multicast_ip,
            multicast_port: group.multicast_port,
            owner_peer_id: group.owner_peer_id.clone(),
            inviter_peer_id: inviter_peer_id.to_string(),
            target_peer_ids: ordered_unique(target_peer_ids),
            timestamp: ids::now_timestamp(),
        }
    }

    /// Whether the invite is addressed to the peer: as a target, or as the owner.
    pub fn concerns(&self, peer_id: &str) -> bool {
        self.owner_peer_id == peer_id || self.target_peer_ids.iter().any(|id| id == peer_id)
    }

    /// The descriptor of the group this invite is for.
    pub fn descriptor(&self) -> GroupDescriptor {
        GroupDescriptor::new(
            &self.group_id,
            &self.group_name,
            &self.owner_peer_id,
            self.multicast_ip,
            self.multicast_port,
            self.target_peer_ids.iter().cloned(),
        )
    }
}

/// A chat message as multicast to a group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessagePayload {
    pub msg_id: String,
    #[serde(default)]
    pub msg_type: MessageKind,
    pub group_id: String,
    #[serde(rename = "from_user_id")]
    pub from_peer_id: PeerId,
    #[serde(rename = "from_username", default)]
    pub from_name: String,
    #[serde(rename = "content")]
    pub body: String,
    #[serde(default)]
    pub timestamp: Timestamp,
}

impl GroupMessagePayload {
    /// The payload carrying `message` to `group_id`.
    pub fn new(message: &ChatMessage, group_id: impl ToString) -> Self {
        Self {
            msg_id: message.msg_id.clone(),
            msg_type: message.kind,
            group_id: group_id.to_string(),
            from_peer_id: message.from_peer_id.clone(),
            from_name: message.from_name.clone(),
            body: message.body.clone(),
            timestamp: message.timestamp,
        }
    }

    /// The received chat message; a missing timestamp is replaced by now.
    pub fn into_message(self) -> ChatMessage {
        ChatMessage {
            msg_id: self.msg_id,
            kind: self.msg_type,
            from_peer_id: self.from_peer_id,
            from_name: self.from_name,
            to_peer_id: PeerId::new(),
            to_name: String::new(),
            body: self.body,
            timestamp: if self.timestamp > 0 {
                self.timestamp
            } else {
                ids::now_timestamp()
            },
            is_group: true,
            group_id: Some(self.group_id),
            status: MessageStatus::Received,
        }
    }
}

/// The records a group channel carries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GroupPayload {
    #[serde(rename = "GROUP_MESSAGE")]
    Message(GroupMessagePayload),
    #[serde(rename = "GROUP_INVITE")]
    Invite(GroupInvite),
}

impl GroupPayload {
    /// The `type` tag of a group invite.
    pub const INVITE: &'static str = "GROUP_INVITE";

    /// The `type` tag of a group message.
    pub const MESSAGE: &'static str = "GROUP_MESSAGE";
}
