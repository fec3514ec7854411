//! Thread Messaging: channels, direct messages, nested replies, reactions,
//! and file attachments, all invoked by agents via `mod_message` envelopes
//! carrying an `action` field.
//!
//! Grounded on `src/mods/mod.rs`'s `Mod` trait and
//! `message_router/implementations/message_router_impl.rs`'s dispatch-by-
//! action-string shape, generalized from FIPA performatives to the eight
//! tools in spec §4.6.

mod domain;
mod store;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ThreadMessagingConfig;
use crate::domain_types::{AgentId, ChannelName, FileName, MessageId, ModName, ReactionType};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::ThreadMessagingError;
use crate::orchestrator::Network;

use super::{Mod, ModError};
use store::ThreadStore;

/// The Thread Messaging mod: channel/DM/thread/reaction/attachment stores
/// behind the eight actions agents invoke over `mod_message` envelopes.
pub struct ThreadMessagingMod {
    name: ModName,
    store: ThreadStore,
}

impl ThreadMessagingMod {
    /// Builds the mod from its configuration section.
    #[must_use]
    pub fn new(name: ModName, config: ThreadMessagingConfig) -> Self {
        Self {
            name,
            store: ThreadStore::new(config),
        }
    }

    fn error_response(&self, original: &Envelope, err: &ThreadMessagingError) -> Envelope {
        Envelope::new(
            EnvelopeKind::ModMessage,
            original.target_id.clone().unwrap_or_else(|| original.sender_id.clone()),
            json!({
                "action": action_of(original),
                "success": false,
                "error_kind": err.error_kind(),
                "error": err.to_string(),
                "in_reply_to": original.envelope_id,
            }),
        )
        .with_target(original.sender_id.clone())
        .with_mod(self.name.clone())
    }

    fn ack(&self, original: &Envelope, body: Value) -> Envelope {
        let mut payload = json!({
            "action": action_of(original),
            "success": true,
            "in_reply_to": original.envelope_id,
        });
        if let (Value::Object(map), Value::Object(extra)) = (&mut payload, body) {
            map.extend(extra);
        }
        Envelope::new(EnvelopeKind::ModMessage, original.sender_id.clone(), payload)
            .with_target(original.sender_id.clone())
            .with_mod(self.name.clone())
    }

    async fn reply_to_sender(&self, network: &Network, sender_peer: crate::domain_types::PeerHandle, envelope: Envelope) {
        if let Err(err) = network.send_to_peer(sender_peer, envelope).await {
            debug!(%err, "failed to reply to sender; peer likely disconnected");
        }
    }

    async fn forward_direct(&self, network: &Network, sender: &AgentId, target: &AgentId, message: &Value, kind_action: &str) {
        let envelope = Envelope::new(
            EnvelopeKind::Direct,
            sender.clone(),
            json!({ "mod": self.name.to_string(), "action": kind_action, "message": message }),
        )
        .with_target(target.clone())
        .with_mod(self.name.clone());
        if let Err(err) = network.route(envelope).await {
            debug!(%err, target = %target, "could not forward thread message to target");
        }
    }

    async fn forward_to_channel_members(&self, network: &Network, members: &[AgentId], message: &Value, kind_action: &str) {
        for member in members {
            let Some(peer) = network.registry().lookup(member) else {
                continue;
            };
            let envelope = Envelope::new(
                EnvelopeKind::ModMessage,
                member.clone(),
                json!({ "action": kind_action, "message": message }),
            )
            .with_target(member.clone())
            .with_mod(self.name.clone());
            if network.send_to_peer(peer, envelope).await.is_err() {
                debug!(member = %member, "channel member peer gone; skipping this forward only");
            }
        }
    }

    async fn handle_send_direct_message(
        &self,
        network: &Network,
        envelope: &Envelope,
    ) -> Result<(Value, AgentId), ThreadMessagingError> {
        let payload = &envelope.payload;
        let target = parse_agent_id(payload, "target_agent_id")?;
        if network.registry().lookup(&target).is_none() {
            return Err(ThreadMessagingError::TargetNotRegistered(target));
        }
        let content = payload
            .get("content")
            .cloned()
            .ok_or_else(|| ThreadMessagingError::InvalidPayload("content is required".to_string()))?;
        ThreadStore::validate_text(&content)?;
        let quoted = parse_optional_message_id(payload, "quoted_message_id")?;
        let message = self
            .store
            .send_direct_message(envelope.sender_id.clone(), target.clone(), content, quoted);
        let wire = message_to_wire(&message);
        Ok((wire, target))
    }

    async fn handle_send_channel_message(
        &self,
        envelope: &Envelope,
    ) -> Result<store::SendOutcome, ThreadMessagingError> {
        let payload = &envelope.payload;
        let channel = parse_channel_name(payload, "channel")?;
        let content = payload
            .get("content")
            .cloned()
            .ok_or_else(|| ThreadMessagingError::InvalidPayload("content is required".to_string()))?;
        ThreadStore::validate_text(&content)?;
        let mentioned = parse_optional_agent_id(payload, "mentioned_agent_id")?;
        let quoted = parse_optional_message_id(payload, "quoted_message_id")?;
        self.store
            .send_channel_message(envelope.sender_id.clone(), channel, content, mentioned, quoted)
    }

    async fn handle_reply_message(
        &self,
        envelope: &Envelope,
    ) -> Result<store::SendOutcome, ThreadMessagingError> {
        let payload = &envelope.payload;
        let reply_to_id = parse_message_id(payload, "reply_to_id")?;
        let content = payload
            .get("content")
            .cloned()
            .ok_or_else(|| ThreadMessagingError::InvalidPayload("content is required".to_string()))?;
        ThreadStore::validate_text(&content)?;
        let target = parse_optional_agent_id(payload, "target_agent_id")?;
        let quoted = parse_optional_message_id(payload, "quoted_message_id")?;
        self.store
            .reply_message(envelope.sender_id.clone(), reply_to_id, content, target, quoted)
    }

    async fn handle_reaction(
        &self,
        network: &Network,
        envelope: &Envelope,
    ) -> Result<(AgentId, usize, ReactionType), ThreadMessagingError> {
        let payload = &envelope.payload;
        let target_message_id = parse_message_id(payload, "target_message_id")?;
        let reaction_type = parse_reaction_type(payload)?;
        let add = payload.get("action_kind").and_then(Value::as_str) != Some("remove");
        let (author, count) =
            self.store
                .reaction(envelope.sender_id.clone(), target_message_id, reaction_type.clone(), add)?;
        if author != envelope.sender_id {
            if let Some(peer) = network.registry().lookup(&author) {
                let notify = Envelope::new(
                    EnvelopeKind::ModMessage,
                    author.clone(),
                    json!({
                        "action": "reaction_notification",
                        "target_message_id": target_message_id,
                        "reaction_type": reaction_type.to_string(),
                        "count": count,
                        "by": envelope.sender_id.to_string(),
                    }),
                )
                .with_target(author)
                .with_mod(self.name.clone());
                let _ = network.send_to_peer(peer, notify).await;
            }
        }
        Ok((envelope.sender_id.clone(), count, reaction_type))
    }

    async fn handle_retrieve_channel_messages(
        &self,
        envelope: &Envelope,
    ) -> Result<Value, ThreadMessagingError> {
        let payload = &envelope.payload;
        let channel = parse_channel_name(payload, "channel")?;
        let limit = payload.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize;
        let offset = payload.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
        let include_threads = payload
            .get("include_threads")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let messages = self
            .store
            .retrieve_channel_messages(&channel, limit, offset, include_threads)?;
        Ok(json!({ "messages": messages }))
    }

    fn handle_retrieve_direct_messages(&self, envelope: &Envelope) -> Result<Value, ThreadMessagingError> {
        let payload = &envelope.payload;
        let target = parse_agent_id(payload, "target_agent_id")?;
        let limit = payload.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize;
        let offset = payload.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
        let include_threads = payload
            .get("include_threads")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let messages = self
            .store
            .retrieve_direct_messages(&envelope.sender_id, &target, limit, offset, include_threads);
        Ok(json!({ "messages": messages }))
    }

    fn handle_file_upload(&self, envelope: &Envelope) -> Result<Value, ThreadMessagingError> {
        let payload = &envelope.payload;
        let file_name_raw = payload
            .get("file_name")
            .and_then(Value::as_str)
            .ok_or_else(|| ThreadMessagingError::InvalidPayload("file_name is required".to_string()))?;
        let file_name = FileName::try_new(file_name_raw.to_string())
            .map_err(|e| ThreadMessagingError::InvalidPayload(e.to_string()))?;
        let data = payload
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| ThreadMessagingError::InvalidPayload("data is required".to_string()))?;
        let attachment = self
            .store
            .file_upload_message(envelope.sender_id.clone(), file_name, data)?;
        Ok(json!({
            "attachment_id": attachment.id,
            "mime_type": attachment.mime_type,
            "size": attachment.size,
        }))
    }
}

#[async_trait]
impl Mod for ThreadMessagingMod {
    fn name(&self) -> &ModName {
        &self.name
    }

    async fn on_start(&self, _network: Arc<Network>) -> Result<(), ModError> {
        self.store.create_default_channels();
        Ok(())
    }

    async fn on_envelope(
        &self,
        network: &Network,
        sender_peer: crate::domain_types::PeerHandle,
        envelope: Envelope,
    ) -> Result<(), ModError> {
        let Some(action) = action_of(&envelope) else {
            let err = ThreadMessagingError::InvalidPayload("action is required".to_string());
            let response = self.error_response(&envelope, &err);
            self.reply_to_sender(network, sender_peer, response).await;
            return Ok(());
        };

        match action.as_str() {
            "send_direct_message" => match self.handle_send_direct_message(network, &envelope).await {
                Ok((wire, target)) => {
                    let ack = self.ack(&envelope, json!({ "message": wire.clone() }));
                    self.reply_to_sender(network, sender_peer, ack).await;
                    self.forward_direct(network, &envelope.sender_id, &target, &wire, "direct_message").await;
                }
                Err(err) => self.reply_to_sender(network, sender_peer, self.error_response(&envelope, &err)).await,
            },
            "send_channel_message" => match self.handle_send_channel_message(&envelope).await {
                Ok(outcome) => {
                    let wire = message_to_wire(&outcome.message);
                    let ack = self.ack(&envelope, json!({ "message": wire.clone() }));
                    self.reply_to_sender(network, sender_peer, ack).await;
                    self.forward_to_channel_members(network, &outcome.forward_to, &wire, "channel_message").await;
                }
                Err(err) => self.reply_to_sender(network, sender_peer, self.error_response(&envelope, &err)).await,
            },
            "reply_message" => match self.handle_reply_message(&envelope).await {
                Ok(outcome) => {
                    let wire = message_to_wire(&outcome.message);
                    let ack = self.ack(&envelope, json!({ "message": wire.clone() }));
                    self.reply_to_sender(network, sender_peer, ack).await;
                    if !outcome.forward_to.is_empty() {
                        self.forward_to_channel_members(network, &outcome.forward_to, &wire, "reply_message").await;
                    } else if let Some(target) = outcome.message.target_id.clone() {
                        if target != envelope.sender_id {
                            self.forward_direct(network, &envelope.sender_id, &target, &wire, "reply_message").await;
                        }
                    }
                }
                Err(err) => self.reply_to_sender(network, sender_peer, self.error_response(&envelope, &err)).await,
            },
            "reaction" => match self.handle_reaction(network, &envelope).await {
                Ok((_, count, reaction_type)) => {
                    let ack = self.ack(
                        &envelope,
                        json!({ "reaction_type": reaction_type.to_string(), "count": count }),
                    );
                    self.reply_to_sender(network, sender_peer, ack).await;
                }
                Err(err) => self.reply_to_sender(network, sender_peer, self.error_response(&envelope, &err)).await,
            },
            "list_channels" => {
                let channels = self.store.list_channels();
                let ack = self.ack(&envelope, json!({ "channels": channels }));
                self.reply_to_sender(network, sender_peer, ack).await;
            }
            "retrieve_channel_messages" => match self.handle_retrieve_channel_messages(&envelope).await {
                Ok(body) => {
                    let ack = self.ack(&envelope, body);
                    self.reply_to_sender(network, sender_peer, ack).await;
                }
                Err(err) => self.reply_to_sender(network, sender_peer, self.error_response(&envelope, &err)).await,
            },
            "retrieve_direct_messages" => match self.handle_retrieve_direct_messages(&envelope) {
                Ok(body) => {
                    let ack = self.ack(&envelope, body);
                    self.reply_to_sender(network, sender_peer, ack).await;
                }
                Err(err) => self.reply_to_sender(network, sender_peer, self.error_response(&envelope, &err)).await,
            },
            "file_upload_message" => match self.handle_file_upload(&envelope) {
                Ok(body) => {
                    let ack = self.ack(&envelope, body);
                    self.reply_to_sender(network, sender_peer, ack).await;
                }
                Err(err) => self.reply_to_sender(network, sender_peer, self.error_response(&envelope, &err)).await,
            },
            other => {
                warn!(action = other, "unknown thread_messaging action");
                let err = ThreadMessagingError::InvalidPayload(format!("unknown action: {other}"));
                self.reply_to_sender(network, sender_peer, self.error_response(&envelope, &err)).await;
            }
        }
        Ok(())
    }

    async fn on_shutdown(&self) {}
}

fn action_of(envelope: &Envelope) -> Option<String> {
    envelope
        .payload
        .get("action")
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn message_to_wire(message: &domain::MessageRecord) -> Value {
    serde_json::to_value(message).unwrap_or(Value::Null)
}

fn parse_agent_id(payload: &Value, field: &str) -> Result<AgentId, ThreadMessagingError> {
    let raw = payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ThreadMessagingError::InvalidPayload(format!("{field} is required")))?;
    AgentId::try_new(raw.to_string()).map_err(|e| ThreadMessagingError::InvalidPayload(e.to_string()))
}

fn parse_optional_agent_id(payload: &Value, field: &str) -> Result<Option<AgentId>, ThreadMessagingError> {
    match payload.get(field).and_then(Value::as_str) {
        Some(raw) => AgentId::try_new(raw.to_string())
            .map(Some)
            .map_err(|e| ThreadMessagingError::InvalidPayload(e.to_string())),
        None => Ok(None),
    }
}

fn parse_channel_name(payload: &Value, field: &str) -> Result<ChannelName, ThreadMessagingError> {
    let raw = payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ThreadMessagingError::InvalidPayload(format!("{field} is required")))?;
    ChannelName::try_new(raw.to_string()).map_err(|e| ThreadMessagingError::InvalidPayload(e.to_string()))
}

fn parse_message_id(payload: &Value, field: &str) -> Result<MessageId, ThreadMessagingError> {
    let raw = payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ThreadMessagingError::InvalidPayload(format!("{field} is required")))?;
    let uuid = uuid::Uuid::parse_str(raw)
        .map_err(|e| ThreadMessagingError::InvalidPayload(format!("{field} is not a valid message id: {e}")))?;
    Ok(MessageId::new(uuid))
}

fn parse_optional_message_id(payload: &Value, field: &str) -> Result<Option<MessageId>, ThreadMessagingError> {
    if payload.get(field).and_then(Value::as_str).is_some() {
        parse_message_id(payload, field).map(Some)
    } else {
        Ok(None)
    }
}

fn parse_reaction_type(payload: &Value) -> Result<ReactionType, ThreadMessagingError> {
    let raw = payload
        .get("reaction_type")
        .and_then(Value::as_str)
        .ok_or_else(|| ThreadMessagingError::InvalidPayload("reaction_type is required".to_string()))?;
    ReactionType::try_new(raw.to_string()).map_err(|e| ThreadMessagingError::InvalidPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_of_reads_the_action_field() {
        let envelope = Envelope::new(
            EnvelopeKind::ModMessage,
            AgentId::try_new("alpha".to_string()).unwrap(),
            json!({"action": "list_channels"}),
        );
        assert_eq!(action_of(&envelope), Some("list_channels".to_string()));
    }

    #[test]
    fn action_of_is_none_without_the_field() {
        let envelope = Envelope::new(
            EnvelopeKind::ModMessage,
            AgentId::try_new("alpha".to_string()).unwrap(),
            json!({}),
        );
        assert_eq!(action_of(&envelope), None);
    }

    #[test]
    fn parse_message_id_rejects_non_uuid() {
        let payload = json!({"target_message_id": "not-a-uuid"});
        assert!(parse_message_id(&payload, "target_message_id").is_err());
    }
}
