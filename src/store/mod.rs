//! The persistence collaborator the services save into.
//!
//! The services only ever call through [`ChatStore`]; what backs it is up to the
//! application. [`MemoryStore`] keeps everything in process.

use crate::{
    models::{ChatMessage, GroupDescriptor, GroupMember},
    ChatError,
};

mod memory;
pub use memory::MemoryStore;

/// Storage of messages and group descriptors.
pub trait ChatStore: Send + Sync {
    /// Save a message. A message whose `msg_id` is already stored is ignored.
    ///
    /// Returns whether the message was inserted.
    fn save_message(&self, message: &ChatMessage) -> Result<bool, ChatError>;

    /// The latest `limit` direct messages between two peers, oldest first.
    fn get_messages(
        &self,
        peer_a: &str,
        peer_b: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ChatError>;

    /// Insert or replace a group descriptor.
    fn save_group(&self, group: &GroupDescriptor) -> Result<(), ChatError>;

    fn get_group(&self, group_id: &str) -> Result<Option<GroupDescriptor>, ChatError>;

    /// Every stored group, most recently saved first.
    fn get_all_groups(&self) -> Result<Vec<GroupDescriptor>, ChatError>;

    /// Record a membership. A peer already listed in the group keeps its entry.
    ///
    /// Returns whether the membership was inserted.
    fn add_group_member(&self, member: &GroupMember) -> Result<bool, ChatError>;

    /// Returns whether the peer was listed.
    fn remove_group_member(&self, group_id: &str, peer_id: &str) -> Result<bool, ChatError>;

    /// The memberships of a group in the order they were recorded.
    fn get_group_members(&self, group_id: &str) -> Result<Vec<GroupMember>, ChatError>;

    /// The latest `limit` messages of a group, oldest first.
    fn get_group_messages(
        &self,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ChatError>;

    /// Mark every unread message from `from_peer_id` to `to_peer_id` as read.
    ///
    /// Returns the number of messages changed.
    fn mark_read(&self, from_peer_id: &str, to_peer_id: &str) -> Result<usize, ChatError>;

    /// The number of unread messages from `from_peer_id` to `to_peer_id`.
    fn unread_count(&self, from_peer_id: &str, to_peer_id: &str) -> Result<usize, ChatError>;
}
