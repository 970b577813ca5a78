//! An in-process [`ChatStore`].
//!

use fxhash::{FxHashMap, FxHashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::ChatStore;
use crate::{
    models::{ChatMessage, GroupDescriptor, GroupMember, MessageStatus},
    ChatError,
};

#[derive(Debug, Default)]
struct Tables {
    messages: Vec<ChatMessage>,
    message_ids: FxHashSet<String>,

    /// Descriptors with the revision they were last saved at.
    groups: FxHashMap<String, (u64, GroupDescriptor)>,
    revision: u64,

    members: FxHashMap<String, Vec<GroupMember>>,
}

/// Keeps messages and groups in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

/// The latest `limit` of `messages` by timestamp, oldest first.
///
/// Messages sharing a timestamp keep the order they were saved in.
fn latest(mut messages: Vec<ChatMessage>, limit: usize) -> Vec<ChatMessage> {
    messages.sort_by_key(|message| message.timestamp);
    let skip = messages.len().saturating_sub(limit);
    messages.split_off(skip)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, ChatError> {
        self.tables
            .read()
            .map_err(|_| ChatError::Store("store lock is poisoned".to_owned()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, ChatError> {
        self.tables
            .write()
            .map_err(|_| ChatError::Store("store lock is poisoned".to_owned()))
    }

    /// Find a stored message by its identifier.
    pub fn get_message(&self, msg_id: &str) -> Result<Option<ChatMessage>, ChatError> {
        Ok(self
            .read()?
            .messages
            .iter()
            .find(|message| message.msg_id == msg_id)
            .cloned())
    }

    /// Total number of stored messages.
    pub fn message_count(&self) -> Result<usize, ChatError> {
        Ok(self.read()?.messages.len())
    }
}

impl ChatStore for MemoryStore {
    fn save_message(&self, message: &ChatMessage) -> Result<bool, ChatError> {
        let mut tables = self.write()?;
        if !tables.message_ids.insert(message.msg_id.clone()) {
            logger::debug!("Message {} is already stored; ignoring.", message.msg_id);
            return Ok(false);
        }

        tables.messages.push(message.clone());
        Ok(true)
    }

    fn get_messages(
        &self,
        peer_a: &str,
        peer_b: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let matching = self
            .read()?
            .messages
            .iter()
            .filter(|message| message.is_between(peer_a, peer_b))
            .cloned()
            .collect();

        Ok(latest(matching, limit))
    }

    fn save_group(&self, group: &GroupDescriptor) -> Result<(), ChatError> {
        let mut tables = self.write()?;
        tables.revision += 1;
        let revision = tables.revision;
        tables
            .groups
            .insert(group.group_id.clone(), (revision, group.clone()));
        Ok(())
    }

    fn get_group(&self, group_id: &str) -> Result<Option<GroupDescriptor>, ChatError> {
        Ok(self
            .read()?
            .groups
            .get(group_id)
            .map(|(_, group)| group.clone()))
    }

    fn get_all_groups(&self) -> Result<Vec<GroupDescriptor>, ChatError> {
        let tables = self.read()?;
        let mut groups: Vec<_> = tables.groups.values().collect();
        groups.sort_by(|(lhs, _), (rhs, _)| rhs.cmp(lhs));

        Ok(groups.into_iter().map(|(_, group)| group.clone()).collect())
    }

    fn add_group_member(&self, member: &GroupMember) -> Result<bool, ChatError> {
        let mut tables = self.write()?;
        let members = tables.members.entry(member.group_id.clone()).or_default();
        if members.iter().any(|listed| listed.peer_id == member.peer_id) {
            return Ok(false);
        }

        members.push(member.clone());
        Ok(true)
    }

    fn remove_group_member(&self, group_id: &str, peer_id: &str) -> Result<bool, ChatError> {
        let mut tables = self.write()?;
        let Some(members) = tables.members.get_mut(group_id) else {
            return Ok(false);
        };

        let before = members.len();
        members.retain(|member| member.peer_id != peer_id);
        Ok(members.len() < before)
    }

    fn get_group_members(&self, group_id: &str) -> Result<Vec<GroupMember>, ChatError> {
        Ok(self
            .read()?
            .members
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    fn get_group_messages(
        &self,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let matching = self
            .read()?
            .messages
            .iter()
            .filter(|message| message.is_group && message.group_id.as_deref() == Some(group_id))
            .cloned()
            .collect();

        Ok(latest(matching, limit))
    }

    fn mark_read(&self, from_peer_id: &str, to_peer_id: &str) -> Result<usize, ChatError> {
        let mut tables = self.write()?;
        let mut changed = 0;

        tables
            .messages
            .iter_mut()
            .filter(|message| {
                !message.is_group
                    && message.from_peer_id == from_peer_id
                    && message.to_peer_id == to_peer_id
                    && message.status != MessageStatus::Read
            })
            .for_each(|message| {
                message.status = MessageStatus::Read;
                changed += 1;
            });

        Ok(changed)
    }

    fn unread_count(&self, from_peer_id: &str, to_peer_id: &str) -> Result<usize, ChatError> {
        Ok(self
            .read()?
            .messages
            .iter()
            .filter(|message| {
                !message.is_group
                    && message.from_peer_id == from_peer_id
                    && message.to_peer_id == to_peer_id
                    && message.status != MessageStatus::Read
            })
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GroupRole, PeerRecord};
    use std::net::Ipv4Addr;

    fn alice() -> PeerRecord {
        PeerRecord::new("alice", "Alice", "alice-pc", "10.0.0.1", 10000)
    }

    fn bob() -> PeerRecord {
        PeerRecord::new("bob", "Bob", "bob-pc", "10.0.0.2", 10000)
    }

    fn message(from: &PeerRecord, to: &PeerRecord, body: &str, timestamp: i64) -> ChatMessage {
        let mut message = ChatMessage::direct(from, &to.peer_id, &to.display_name, body)
            .with_status(MessageStatus::Received);
        message.timestamp = timestamp;
        message
    }

    fn group(group_id: &str, last_octet: u8) -> GroupDescriptor {
        GroupDescriptor::new(
            group_id,
            "friends",
            "alice",
            Ipv4Addr::new(239, 0, 0, last_octet),
            10001,
            vec!["bob".to_owned()],
        )
    }

    #[test]
    fn duplicate_message_is_ignored() {
        let store = MemoryStore::new();
        let message = message(&alice(), &bob(), "hi", 1);

        assert!(store.save_message(&message).expect("Failed to save."));
        assert!(!store.save_message(&message).expect("Failed to save."));
        assert_eq!(store.message_count().expect("Failed to count."), 1);
    }

    #[test]
    fn history_is_latest_oldest_first() {
        let store = MemoryStore::new();
        let (alice, bob) = (alice(), bob());

        for (index, body) in ["one", "two", "three", "four"].iter().enumerate() {
            let (from, to) = if index % 2 == 0 {
                (&alice, &bob)
            } else {
                (&bob, &alice)
            };
            store
                .save_message(&message(from, to, body, index as i64))
                .expect("Failed to save.");
        }
        let stranger = PeerRecord::new("carol", "Carol", "carol-pc", "10.0.0.3", 10000);
        store
            .save_message(&message(&stranger, &alice, "unrelated", 100))
            .expect("Failed to save.");

        let bodies: Vec<_> = store
            .get_messages("bob", "alice", 3)
            .expect("Failed to query.")
            .into_iter()
            .map(|message| message.body)
            .collect();

        assert_eq!(bodies, vec!["two", "three", "four"]);
    }

    #[test]
    fn read_tracking() {
        let store = MemoryStore::new();
        let (alice, bob) = (alice(), bob());

        store.save_message(&message(&bob, &alice, "a", 1)).expect("Failed to save.");
        store.save_message(&message(&bob, &alice, "b", 2)).expect("Failed to save.");
        store.save_message(&message(&alice, &bob, "c", 3)).expect("Failed to save.");

        assert_eq!(store.unread_count("bob", "alice").expect("Failed to count."), 2);
        assert_eq!(store.mark_read("bob", "alice").expect("Failed to mark."), 2);
        assert_eq!(store.unread_count("bob", "alice").expect("Failed to count."), 0);
        assert_eq!(store.mark_read("bob", "alice").expect("Failed to mark."), 0);
        assert_eq!(store.unread_count("alice", "bob").expect("Failed to count."), 1);
    }

    #[test]
    fn groups_insert_or_replace() {
        let store = MemoryStore::new();
        store.save_group(&group("group_a", 100)).expect("Failed to save.");
        store.save_group(&group("group_b", 101)).expect("Failed to save.");

        let mut renamed = group("group_a", 100);
        renamed.name = "renamed".to_owned();
        store.save_group(&renamed).expect("Failed to save.");

        let all = store.get_all_groups().expect("Failed to query.");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], renamed);
        assert_eq!(
            store.get_group("group_b").expect("Failed to query."),
            Some(group("group_b", 101))
        );
        assert!(store.get_group("group_c").expect("Failed to query.").is_none());
    }

    #[test]
    fn group_members_with_roles() {
        let store = MemoryStore::new();
        let owner = GroupMember::new("group_a", "alice", GroupRole::Owner);

        assert!(store.add_group_member(&owner).expect("Failed to add."));
        assert!(store
            .add_group_member(&GroupMember::new("group_a", "bob", GroupRole::Member))
            .expect("Failed to add."));
        assert!(!store
            .add_group_member(&GroupMember::new("group_a", "alice", GroupRole::Member))
            .expect("Failed to add."));

        let members = store.get_group_members("group_a").expect("Failed to query.");
        assert_eq!(members.len(), 2);
        assert_eq!(members[0], owner);
        assert_eq!(members[1].role, GroupRole::Member);

        assert!(store.remove_group_member("group_a", "bob").expect("Failed to remove."));
        assert!(!store.remove_group_member("group_a", "bob").expect("Failed to remove."));
        assert!(!store.remove_group_member("group_b", "bob").expect("Failed to remove."));
        assert_eq!(
            store.get_group_members("group_a").expect("Failed to query."),
            vec![owner]
        );
        assert!(store.get_group_members("group_b").expect("Failed to query.").is_empty());
    }

    #[test]
    fn group_history() {
        let store = MemoryStore::new();
        for (index, group_id) in ["group_a", "group_b", "group_a"].iter().enumerate() {
            let mut message = ChatMessage::group(group_id, "alice", "Alice", index.to_string());
            message.timestamp = index as i64;
            store.save_message(&message).expect("Failed to save.");
        }

        let bodies: Vec<_> = store
            .get_group_messages("group_a", 10)
            .expect("Failed to query.")
            .into_iter()
            .map(|message| message.body)
            .collect();
        assert_eq!(bodies, vec!["0", "2"]);
    }
}
