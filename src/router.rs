//! Inbound message routing
//!
//! Turns hub events into transcript entries: every payload is decrypted
//! and every user-supplied text field is sanitized before it reaches the
//! consumer. Single messages append in arrival order; a history snapshot
//! replaces the transcript in one step.

use std::time::SystemTime;

use tracing::debug;

use crate::crypto::EncryptionCodec;
use crate::error::ChatError;
use crate::membership::MembershipController;
use crate::message::{HistoryEntry, HubEvent, Invocation};
use crate::types::{Direction, RoomId};

/// One chat message as shown to the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub sender: String,
    /// Plaintext, after decryption
    pub payload: String,
    pub direction: Direction,
    /// Client-observed time
    pub timestamp: Option<SystemTime>,
}

impl MessageEnvelope {
    pub fn inbound(sender: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            payload: payload.into(),
            direction: Direction::Inbound,
            timestamp: Some(SystemTime::now()),
        }
    }

    pub fn outbound(sender: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            payload: payload.into(),
            direction: Direction::Outbound,
            timestamp: Some(SystemTime::now()),
        }
    }
}

/// Ordered messages of the active channel
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<MessageEnvelope>,
}

impl Transcript {
    pub fn entries(&self) -> &[MessageEnvelope] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn append(&mut self, envelope: MessageEnvelope) {
        self.entries.push(envelope);
    }

    fn replace(&mut self, entries: Vec<MessageEnvelope>) {
        self.entries = entries;
    }
}

/// Result of routing one hub event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// A message was appended to the transcript
    Appended(MessageEnvelope),
    /// The transcript was replaced by a history snapshot
    Replaced { room_id: RoomId, len: usize },
}

/// Strip active markup from user-supplied text
pub fn sanitize(text: &str) -> String {
    ammonia::clean(text)
}

/// Routes hub events for one channel
///
/// A router built with a room serves that room; without one it serves the
/// public channel.
#[derive(Debug)]
pub struct MessageRouter {
    codec: EncryptionCodec,
    room: Option<RoomId>,
    transcript: Transcript,
}

impl MessageRouter {
    pub fn public(codec: EncryptionCodec) -> Self {
        Self {
            codec,
            room: None,
            transcript: Transcript::default(),
        }
    }

    pub fn room(codec: EncryptionCodec, room_id: RoomId) -> Self {
        Self {
            codec,
            room: Some(room_id),
            transcript: Transcript::default(),
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    pub async fn route(
        &mut self,
        event: HubEvent,
        membership: &MembershipController,
    ) -> Option<Routed> {
        match event {
            HubEvent::ReceiveMessage { sender, payload } => match self.room {
                None => Some(self.direct_message(sender, payload).await),
                Some(_) => self.room_message(sender, payload, membership).await,
            },
            HubEvent::RoomHistory { room_id, batch } => self.room_history(room_id, batch).await,
        }
    }

    async fn direct_message(&mut self, sender: String, payload: String) -> Routed {
        let envelope = self.open(&sender, &payload).await;
        self.transcript.append(envelope.clone());
        Routed::Appended(envelope)
    }

    async fn room_message(
        &mut self,
        sender: String,
        payload: String,
        membership: &MembershipController,
    ) -> Option<Routed> {
        if !membership.is_joined() {
            debug!("Dropping room message from {} received before join", sender);
            return None;
        }
        Some(self.direct_message(sender, payload).await)
    }

    async fn room_history(&mut self, room_id: RoomId, batch: Vec<HistoryEntry>) -> Option<Routed> {
        if self.room.as_ref() != Some(&room_id) {
            debug!("Ignoring history for room {}", room_id);
            return None;
        }

        let mut entries = Vec::with_capacity(batch.len());
        for entry in &batch {
            entries.push(self.open(&entry.sender, &entry.payload).await);
        }
        let len = entries.len();
        self.transcript.replace(entries);
        debug!("Transcript for room {} replaced with {} messages", room_id, len);
        Some(Routed::Replaced { room_id, len })
    }

    async fn open(&self, sender: &str, payload: &str) -> MessageEnvelope {
        let plaintext = self.codec.decrypt(payload).await;
        MessageEnvelope::inbound(sanitize(sender), sanitize(&plaintext))
    }

    /// Build the invocation that posts `text` on this router's channel
    ///
    /// Room posts are refused locally unless the join was acknowledged.
    pub async fn outbound(
        &self,
        text: &str,
        membership: &MembershipController,
    ) -> Result<Invocation, ChatError> {
        match &self.room {
            None => Ok(Invocation::SendMessage {
                ciphertext: self.codec.encrypt(text).await?,
            }),
            Some(room_id) => {
                let joined = membership.ensure_joined()?;
                if joined != room_id {
                    return Err(ChatError::NotJoined(room_id.clone()));
                }
                Ok(Invocation::SendMessageToRoom {
                    room_id: room_id.clone(),
                    ciphertext: self.codec.encrypt(text).await?,
                })
            }
        }
    }
}
