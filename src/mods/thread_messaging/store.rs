//! The Thread Messaging mod's four stores (channel, message, attachment,
//! DM) and the operations spec §4.6 names on top of them.
//!
//! Grounded on `message_router/implementations/conversation_manager.rs`'s
//! `DashMap`-backed store with atomic counters, generalized from a flat
//! conversation to channels/threads/reactions/attachments/DMs. Per spec §5,
//! writers serialize per key: `DashMap::get_mut`/`entry` on a channel or
//! message id gives exactly that, without a crate-wide lock.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use dashmap::DashMap;
use serde_json::{json, Value};

use crate::config::ThreadMessagingConfig;
use crate::domain_types::{
    AgentId, AttachmentId, ChannelHistoryCap, ChannelName, FileName, MessageContent, MessageId,
    ReactionType, ThreadLevel, Timestamp,
};
use crate::error::ThreadMessagingError;

use super::domain::{dm_key, guess_mime_type, Attachment, Channel, DmKey, MessageRecord, RetrievedMessage, ThreadInfo};

/// Outcome of a successful store mutation that produced a new message: the
/// record itself and the set of local agents it should be delivered to.
pub struct SendOutcome {
    /// The newly created message.
    pub message: MessageRecord,
    /// Channel members to forward to, excluding the sender (empty for DMs,
    /// which are forwarded through topology routing instead).
    pub forward_to: Vec<AgentId>,
}

/// Owns all four Thread Messaging stores for one node.
pub struct ThreadStore {
    channels: DashMap<ChannelName, Channel>,
    messages: DashMap<MessageId, MessageRecord>,
    dms: DashMap<DmKey, Vec<MessageId>>,
    attachments: DashMap<AttachmentId, Attachment>,
    attachment_bytes_used: AtomicU64,
    config: ThreadMessagingConfig,
}

impl ThreadStore {
    /// Builds an empty store from mod configuration.
    #[must_use]
    pub fn new(config: ThreadMessagingConfig) -> Self {
        Self {
            channels: DashMap::new(),
            messages: DashMap::new(),
            dms: DashMap::new(),
            attachments: DashMap::new(),
            attachment_bytes_used: AtomicU64::new(0),
            config,
        }
    }

    /// Creates the channels named in configuration at startup, regardless
    /// of auto-create.
    pub fn create_default_channels(&self) {
        for name in &self.config.default_channels {
            if let Ok(channel_name) = ChannelName::try_new(name.clone()) {
                self.channels
                    .entry(channel_name.clone())
                    .or_insert_with(|| Channel::new(channel_name, String::new()));
            }
        }
    }

    fn history_cap(&self) -> ChannelHistoryCap {
        ChannelHistoryCap::try_new(self.config.max_message_history)
            .unwrap_or_else(|_| ChannelHistoryCap::default())
    }

    // -- send_direct_message --------------------------------------------

    /// Creates a DM root message from `sender` to `target` and appends it
    /// to their conversation. The caller is responsible for checking that
    /// `target` is registered and for forwarding the resulting message via
    /// topology routing.
    #[must_use]
    pub fn send_direct_message(
        &self,
        sender: AgentId,
        target: AgentId,
        content: Value,
        quoted_message_id: Option<MessageId>,
    ) -> MessageRecord {
        let quoted_excerpt = quoted_message_id.and_then(|id| self.excerpt_of(id));
        let message = MessageRecord {
            id: MessageId::generate(),
            sender,
            target_id: Some(target.clone()),
            channel: None,
            content,
            created_at: Timestamp::now(),
            reply_to_id: None,
            thread_level: ThreadLevel::root(),
            quoted_message_id,
            quoted_excerpt,
            reactions: std::collections::HashMap::new(),
            attachments: Vec::new(),
            children: Vec::new(),
        };
        self.messages.insert(message.id, message.clone());
        let key = dm_key(&message.sender, &target);
        self.dms.entry(key).or_default().push(message.id);
        message
    }

    // -- send_channel_message --------------------------------------------

    /// Creates a channel root message, evicting the oldest root (and its
    /// subtree) if the channel is now over its history cap.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadMessagingError::ChannelMissing`] if `channel` does
    /// not exist and auto-create is disabled.
    pub fn send_channel_message(
        &self,
        sender: AgentId,
        channel_name: ChannelName,
        content: Value,
        mentioned_agent_id: Option<AgentId>,
        quoted_message_id: Option<MessageId>,
    ) -> Result<SendOutcome, ThreadMessagingError> {
        if !self.channels.contains_key(&channel_name) {
            if self.config.auto_create_channels {
                self.channels
                    .entry(channel_name.clone())
                    .or_insert_with(|| Channel::new(channel_name.clone(), String::new()));
            } else {
                return Err(ThreadMessagingError::ChannelMissing(channel_name));
            }
        }

        let quoted_excerpt = quoted_message_id.and_then(|id| self.excerpt_of(id));
        let message = MessageRecord {
            id: MessageId::generate(),
            sender: sender.clone(),
            target_id: mentioned_agent_id,
            channel: Some(channel_name.clone()),
            content,
            created_at: Timestamp::now(),
            reply_to_id: None,
            thread_level: ThreadLevel::root(),
            quoted_message_id,
            quoted_excerpt,
            reactions: std::collections::HashMap::new(),
            attachments: Vec::new(),
            children: Vec::new(),
        };
        self.messages.insert(message.id, message.clone());

        let cap = self.history_cap().as_usize();
        let forward_to = {
            let mut channel = self
                .channels
                .get_mut(&channel_name)
                .expect("channel was just inserted or already existed");
            channel.members.insert(sender.clone());
            channel.roots.push_back(message.id);
            channel.message_count += 1;
            while channel.roots.len() > cap {
                if let Some(evicted_root) = channel.roots.pop_front() {
                    let removed = self.remove_subtree(evicted_root);
                    channel.message_count = channel.message_count.saturating_sub(removed);
                }
            }
            channel
                .members
                .iter()
                .filter(|agent| **agent != sender)
                .cloned()
                .collect()
        };

        Ok(SendOutcome { message, forward_to })
    }

    // -- reply_message -----------------------------------------------------

    /// Creates a reply to `reply_to_id`, inheriting its parent's channel
    /// (if any) or DM target, and pushes the new id into the parent's
    /// children list.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadMessagingError::ParentMissing`] if the parent does
    /// not exist, or [`ThreadMessagingError::DepthExceeded`] if the parent
    /// is already at the structural maximum depth. Neither mutates the
    /// store.
    pub fn reply_message(
        &self,
        sender: AgentId,
        reply_to_id: MessageId,
        content: Value,
        explicit_target: Option<AgentId>,
        quoted_message_id: Option<MessageId>,
    ) -> Result<SendOutcome, ThreadMessagingError> {
        let parent = self
            .messages
            .get(&reply_to_id)
            .map(|entry| entry.clone())
            .ok_or(ThreadMessagingError::ParentMissing(reply_to_id))?;
        let child_level = parent
            .thread_level
            .child()
            .map_err(|_| ThreadMessagingError::DepthExceeded)?;

        let channel = parent.channel.clone();
        let target = explicit_target.or_else(|| {
            if channel.is_none() {
                Some(if parent.sender == sender {
                    parent.target_id.clone().unwrap_or_else(|| parent.sender.clone())
                } else {
                    parent.sender.clone()
                })
            } else {
                None
            }
        });

        let quoted_excerpt = quoted_message_id.and_then(|id| self.excerpt_of(id));
        let message = MessageRecord {
            id: MessageId::generate(),
            sender: sender.clone(),
            target_id: target.clone(),
            channel: channel.clone(),
            content,
            created_at: Timestamp::now(),
            reply_to_id: Some(reply_to_id),
            thread_level: child_level,
            quoted_message_id,
            quoted_excerpt,
            reactions: std::collections::HashMap::new(),
            attachments: Vec::new(),
            children: Vec::new(),
        };
        self.messages.insert(message.id, message.clone());

        if let Some(mut parent_entry) = self.messages.get_mut(&reply_to_id) {
            parent_entry.children.push(message.id);
        }

        let forward_to = if let Some(channel_name) = &channel {
            if let Some(mut channel_entry) = self.channels.get_mut(channel_name) {
                channel_entry.message_count += 1;
                channel_entry
                    .members
                    .iter()
                    .filter(|agent| **agent != sender)
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            }
        } else if let Some(target_agent) = &target {
            let key = dm_key(&sender, target_agent);
            self.dms.entry(key).or_default().push(message.id);
            Vec::new()
        } else {
            Vec::new()
        };

        Ok(SendOutcome { message, forward_to })
    }

    // -- reaction ------------------------------------------------------------

    /// Applies `add`/`remove` of `reaction_type` by `agent` to
    /// `target_message_id`, idempotently.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadMessagingError::InvalidReaction`] if `reaction_type`
    /// is not in the configured supported set, or
    /// [`ThreadMessagingError::MessageMissing`] if the target does not
    /// exist (including because it was evicted).
    ///
    /// Returns the message's author, for the caller to notify, plus the
    /// updated reaction count for `reaction_type`.
    pub fn reaction(
        &self,
        agent: AgentId,
        target_message_id: MessageId,
        reaction_type: ReactionType,
        add: bool,
    ) -> Result<(AgentId, usize), ThreadMessagingError> {
        if !self
            .config
            .supported_reactions
            .iter()
            .any(|r| *r == reaction_type.to_string())
        {
            return Err(ThreadMessagingError::InvalidReaction(reaction_type.to_string()));
        }
        let mut entry = self
            .messages
            .get_mut(&target_message_id)
            .ok_or(ThreadMessagingError::MessageMissing(target_message_id))?;
        let agents = entry.reactions.entry(reaction_type).or_default();
        if add {
            agents.insert(agent);
        } else {
            agents.remove(&agent);
        }
        let count = agents.len();
        Ok((entry.sender.clone(), count))
    }

    // -- list_channels --------------------------------------------------

    /// Returns a descriptor for every known channel.
    #[must_use]
    pub fn list_channels(&self) -> Vec<Value> {
        self.channels
            .iter()
            .map(|entry| {
                json!({
                    "name": entry.name.to_string(),
                    "description": entry.description,
                    "member_count": entry.members.len(),
                    "message_count": entry.message_count,
                    "thread_count": entry.roots.len(),
                })
            })
            .collect()
    }

    // -- retrieve_channel_messages ----------------------------------------

    /// Returns the `limit` newest roots after `offset`, each with its
    /// subtree reconstructed depth-first if `include_threads` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadMessagingError::ChannelMissing`] if `channel` is
    /// unknown.
    pub fn retrieve_channel_messages(
        &self,
        channel_name: &ChannelName,
        limit: usize,
        offset: usize,
        include_threads: bool,
    ) -> Result<Vec<RetrievedMessage>, ThreadMessagingError> {
        let channel = self
            .channels
            .get(channel_name)
            .ok_or_else(|| ThreadMessagingError::ChannelMissing(channel_name.clone()))?;
        let newest_first: Vec<MessageId> = channel.roots.iter().rev().copied().collect();
        drop(channel);
        let page: Vec<MessageId> = newest_first.into_iter().skip(offset).take(limit).collect();

        let mut out = Vec::new();
        for root_id in page {
            self.walk_preorder(root_id, include_threads, &mut out);
        }
        Ok(out)
    }

    // -- retrieve_direct_messages -------------------------------------------

    /// Returns the `limit` newest messages in the DM conversation between
    /// `a` and `b` after `offset`, with thread reconstruction.
    #[must_use]
    pub fn retrieve_direct_messages(
        &self,
        a: &AgentId,
        b: &AgentId,
        limit: usize,
        offset: usize,
        include_threads: bool,
    ) -> Vec<RetrievedMessage> {
        let key = dm_key(a, b);
        let Some(ids) = self.dms.get(&key).map(|entry| entry.clone()) else {
            return Vec::new();
        };
        let roots: Vec<MessageId> = ids
            .iter()
            .rev()
            .filter(|id| {
                self.messages
                    .get(id)
                    .map(|m| m.is_root())
                    .unwrap_or(false)
            })
            .copied()
            .collect();
        let page: Vec<MessageId> = roots.into_iter().skip(offset).take(limit).collect();

        let mut out = Vec::new();
        for root_id in page {
            self.walk_preorder(root_id, include_threads, &mut out);
        }
        out
    }

    fn walk_preorder(&self, id: MessageId, include_threads: bool, out: &mut Vec<RetrievedMessage>) {
        let Some(record) = self.messages.get(&id).map(|entry| entry.clone()) else {
            return;
        };
        let thread_info = ThreadInfo {
            is_root: record.is_root(),
            thread_level: record.thread_level,
            children_count: record.children.len(),
        };
        let children = record.children.clone();
        out.push(RetrievedMessage { message: record, thread_info });
        if include_threads {
            for child_id in children {
                self.walk_preorder(child_id, include_threads, out);
            }
        }
    }

    // -- file_upload_message ----------------------------------------------

    /// Decodes `base64_data`, enforces the size and storage caps, and
    /// stores the resulting attachment.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadMessagingError::InvalidPayload`] if the data is not
    /// valid base64, [`ThreadMessagingError::TooLarge`] if it exceeds the
    /// configured per-file cap, or
    /// [`ThreadMessagingError::QuotaExhausted`] if storing it would exceed
    /// the node-wide attachment storage cap.
    pub fn file_upload_message(
        &self,
        owner: AgentId,
        file_name: FileName,
        base64_data: &str,
    ) -> Result<Attachment, ThreadMessagingError> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(base64_data)
            .map_err(|e| ThreadMessagingError::InvalidPayload(format!("invalid base64: {e}")))?;
        let size = data.len();
        if size > self.config.max_file_size {
            return Err(ThreadMessagingError::TooLarge {
                size,
                limit: self.config.max_file_size,
            });
        }
        let used = self.attachment_bytes_used.load(Ordering::Relaxed);
        if used.saturating_add(size as u64) > self.config.max_attachment_storage_bytes {
            return Err(ThreadMessagingError::QuotaExhausted);
        }
        let mime_type = guess_mime_type(&file_name.to_string());
        let attachment = Attachment {
            id: AttachmentId::generate(),
            file_name,
            mime_type,
            size,
            data,
            uploaded_at: Timestamp::now(),
            owner,
        };
        self.attachments.insert(attachment.id, attachment.clone());
        self.attachment_bytes_used.fetch_add(size as u64, Ordering::Relaxed);
        Ok(attachment)
    }

    // -- helpers -----------------------------------------------------------

    fn excerpt_of(&self, id: MessageId) -> Option<String> {
        self.messages.get(&id).and_then(|entry| {
            entry
                .content
                .get("text")
                .and_then(Value::as_str)
                .map(|text| text.chars().take(120).collect::<String>())
        })
    }

    /// Removes `root_id` and its full transitive descendant set from the
    /// message store. Returns the number of messages removed, for the
    /// caller to adjust the channel's running total.
    fn remove_subtree(&self, root_id: MessageId) -> usize {
        let mut queue = VecDeque::from([root_id]);
        let mut removed = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !removed.insert(id) {
                continue;
            }
            if let Some((_, record)) = self.messages.remove(&id) {
                for child in record.children {
                    queue.push_back(child);
                }
            }
        }
        removed.len()
    }

    /// Validates free-text content against the envelope size bound shared
    /// by every message-creating action, returning the normalized text.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadMessagingError::InvalidPayload`] if `content.text` is
    /// missing, empty, or exceeds the envelope size cap.
    pub fn validate_text(value: &Value) -> Result<String, ThreadMessagingError> {
        let text = value
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| ThreadMessagingError::InvalidPayload("content.text is required".to_string()))?;
        MessageContent::try_new(text.to_string())
            .map_err(|e| ThreadMessagingError::InvalidPayload(e.to_string()))?;
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn agent(s: &str) -> AgentId {
        AgentId::try_new(s.to_string()).unwrap()
    }
    fn channel(s: &str) -> ChannelName {
        ChannelName::try_new(s.to_string()).unwrap()
    }
    fn reaction(s: &str) -> ReactionType {
        ReactionType::try_new(s.to_string()).unwrap()
    }
    fn text(s: &str) -> Value {
        json!({"text": s})
    }

    fn store() -> ThreadStore {
        ThreadStore::new(ThreadMessagingConfig::default())
    }

    #[test]
    fn reply_chain_tracks_level_and_children() {
        let store = store();
        let root = store
            .send_channel_message(agent("alpha"), channel("dev"), text("Q?"), None, None)
            .unwrap()
            .message;
        let r1 = store
            .reply_message(agent("beta"), root.id, text("A1"), None, None)
            .unwrap()
            .message;
        assert_eq!(r1.thread_level.into_inner(), 1);
        let r2 = store
            .reply_message(agent("gamma"), r1.id, text("A2"), None, None)
            .unwrap()
            .message;
        assert_eq!(r2.thread_level.into_inner(), 2);

        let retrieved = store
            .retrieve_channel_messages(&channel("dev"), 10, 0, true)
            .unwrap();
        let ids: Vec<MessageId> = retrieved.iter().map(|r| r.message.id).collect();
        assert_eq!(ids, vec![root.id, r1.id, r2.id]);
        assert_eq!(retrieved[0].thread_info.children_count, 1);
        assert_eq!(retrieved[1].thread_info.children_count, 1);
        assert_eq!(retrieved[2].thread_info.children_count, 0);
    }

    #[test]
    fn reply_past_depth_five_is_rejected_without_mutation() {
        let store = store();
        let mut current = store
            .send_channel_message(agent("alpha"), channel("dev"), text("root"), None, None)
            .unwrap()
            .message;
        for i in 0..5 {
            current = store
                .reply_message(agent("alpha"), current.id, text(&format!("reply-{i}")), None, None)
                .unwrap()
                .message;
        }
        assert_eq!(current.thread_level.into_inner(), 5);
        let result = store.reply_message(agent("alpha"), current.id, text("too deep"), None, None);
        assert!(matches!(result, Err(ThreadMessagingError::DepthExceeded)));
        let unchanged = store.messages.get(&current.id).unwrap();
        assert!(unchanged.children.is_empty());
    }

    #[test]
    fn reaction_add_is_idempotent_and_remove_on_absent_is_noop() {
        let store = store();
        let root = store
            .send_channel_message(agent("alpha"), channel("dev"), text("hi"), None, None)
            .unwrap()
            .message;
        let like = reaction("like");
        let (_, count) = store.reaction(agent("beta"), root.id, like.clone(), true).unwrap();
        assert_eq!(count, 1);
        let (_, count) = store.reaction(agent("beta"), root.id, like.clone(), true).unwrap();
        assert_eq!(count, 1, "adding twice must not double-count");
        let (_, count) = store.reaction(agent("beta"), root.id, like.clone(), false).unwrap();
        assert_eq!(count, 0);
        let (_, count) = store.reaction(agent("gamma"), root.id, like, false).unwrap();
        assert_eq!(count, 0, "removing an absent reaction is a no-op");
    }

    #[test]
    fn eviction_removes_the_whole_subtree_and_no_dangling_references_remain() {
        let mut config = ThreadMessagingConfig::default();
        config.max_message_history = 1;
        let store = ThreadStore::new(config);
        let first_root = store
            .send_channel_message(agent("alpha"), channel("dev"), text("first"), None, None)
            .unwrap()
            .message;
        let first_child = store
            .reply_message(agent("beta"), first_root.id, text("child"), None, None)
            .unwrap()
            .message;
        store
            .send_channel_message(agent("alpha"), channel("dev"), text("second"), None, None)
            .unwrap();

        assert!(store.messages.get(&first_root.id).is_none());
        assert!(store.messages.get(&first_child.id).is_none());
        let remaining = store.retrieve_channel_messages(&channel("dev"), 10, 0, true).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(
            store.reaction(agent("gamma"), first_root.id, reaction("like"), true),
            Err(ThreadMessagingError::MessageMissing(first_root.id))
        );
    }

    #[test]
    fn dm_conversation_is_symmetric_regardless_of_sender_order() {
        let store = store();
        let m1 = store.send_direct_message(agent("alpha"), agent("beta"), text("hi"), None);
        let retrieved_as_beta = store.retrieve_direct_messages(&agent("beta"), &agent("alpha"), 10, 0, true);
        assert_eq!(retrieved_as_beta.len(), 1);
        assert_eq!(retrieved_as_beta[0].message.id, m1.id);
    }

    #[test]
    fn unsupported_reaction_is_rejected() {
        let store = store();
        let root = store
            .send_channel_message(agent("alpha"), channel("dev"), text("hi"), None, None)
            .unwrap()
            .message;
        let result = store.reaction(agent("beta"), root.id, reaction("not-a-real-one"), true);
        assert!(matches!(result, Err(ThreadMessagingError::InvalidReaction(_))));
    }

    #[test]
    fn file_upload_enforces_size_cap() {
        let mut config = ThreadMessagingConfig::default();
        config.max_file_size = 4;
        let store = ThreadStore::new(config);
        let data = base64::engine::general_purpose::STANDARD.encode("too many bytes");
        let result = store.file_upload_message(agent("alpha"), FileName::try_new("f.txt".to_string()).unwrap(), &data);
        assert!(matches!(result, Err(ThreadMessagingError::TooLarge { .. })));
    }

    proptest! {
        /// P4: any stored non-root message's level is parent.level + 1, never
        /// exceeding 5; a reply past that rejects with `depth_exceeded` and
        /// leaves the parent's children untouched.
        #[test]
        fn thread_depth_never_exceeds_five(reply_attempts in 0usize..12) {
            let store = store();
            let mut current = store
                .send_channel_message(agent("alpha"), channel("dev"), text("root"), None, None)
                .unwrap()
                .message;
            let mut level: u8 = 0;
            for i in 0..reply_attempts {
                let before = store.messages.get(&current.id).unwrap().children.len();
                match store.reply_message(agent("alpha"), current.id, text(&format!("r{i}")), None, None) {
                    Ok(outcome) => {
                        level += 1;
                        prop_assert_eq!(outcome.message.thread_level.into_inner(), level);
                        prop_assert!(level <= 5);
                        current = outcome.message;
                    }
                    Err(ThreadMessagingError::DepthExceeded) => {
                        prop_assert_eq!(level, 5);
                        let after = store.messages.get(&current.id).unwrap().children.len();
                        prop_assert_eq!(after, before, "a rejected reply must not mutate the parent");
                    }
                    Err(other) => prop_assert!(false, "unexpected error: {other:?}"),
                }
            }
        }

        /// P5: applying `add` twice leaves the reaction count identical to
        /// applying it once; `remove` on an absent reaction is a no-op.
        #[test]
        fn reaction_add_remove_is_idempotent(add_twice in any::<bool>(), remove_when_absent in any::<bool>()) {
            let store = store();
            let root = store
                .send_channel_message(agent("alpha"), channel("dev"), text("hi"), None, None)
                .unwrap()
                .message;
            let like = reaction("like");

            let (_, count) = store.reaction(agent("beta"), root.id, like.clone(), true).unwrap();
            prop_assert_eq!(count, 1);
            if add_twice {
                let (_, count) = store.reaction(agent("beta"), root.id, like.clone(), true).unwrap();
                prop_assert_eq!(count, 1);
            }
            let (_, count) = store.reaction(agent("beta"), root.id, like.clone(), false).unwrap();
            prop_assert_eq!(count, 0);
            if remove_when_absent {
                let (_, count) = store.reaction(agent("gamma"), root.id, like, false).unwrap();
                prop_assert_eq!(count, 0);
            }
        }
    }
}
