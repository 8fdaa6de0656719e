//! Room membership
//!
//! Tracks the selected room and whether the hub has acknowledged our join.
//! `joined` is only ever set from a join completion, never optimistically,
//! and is cleared whenever the connection drops.

use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::message::Invocation;
use crate::session::{PendingInvocation, SessionManager};
use crate::types::RoomId;

/// Membership in one room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMembership {
    pub room_id: RoomId,
    pub joined: bool,
}

impl RoomMembership {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            joined: false,
        }
    }
}

/// Join/leave bookkeeping for the current room
#[derive(Debug, Default)]
pub struct MembershipController {
    current: Option<RoomMembership>,
}

impl MembershipController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a room without joining it
    pub fn select(&mut self, room_id: RoomId) {
        if self.room_id() != Some(&room_id) {
            debug!("Selected room {}", room_id);
        }
        self.current = Some(RoomMembership::new(room_id));
    }

    pub fn current(&self) -> Option<&RoomMembership> {
        self.current.as_ref()
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.current.as_ref().map(|m| &m.room_id)
    }

    pub fn is_joined(&self) -> bool {
        self.current.as_ref().is_some_and(|m| m.joined)
    }

    /// The joined room, or the reason sends must be refused
    pub fn ensure_joined(&self) -> Result<&RoomId, ChatError> {
        match &self.current {
            Some(m) if m.joined => Ok(&m.room_id),
            Some(m) => Err(ChatError::NotJoined(m.room_id.clone())),
            None => Err(ChatError::NoRoom),
        }
    }

    /// Issue `JoinRoom` for the selected room
    ///
    /// Membership stays un-joined until the returned completion is passed
    /// to [`complete_join`](Self::complete_join).
    pub async fn begin_join(&mut self, session: &SessionManager) -> Result<PendingInvocation, ChatError> {
        let membership = self.current.as_mut().ok_or(ChatError::NoRoom)?;
        membership.joined = false;
        let room_id = membership.room_id.clone();
        debug!("Joining room {}", room_id);
        session.begin_send(Invocation::JoinRoom { room_id }).await
    }

    /// Apply the outcome of a join started for `room_id`
    pub fn complete_join(
        &mut self,
        room_id: &RoomId,
        outcome: Result<(), ChatError>,
    ) -> Result<(), ChatError> {
        let membership = match self.current.as_mut() {
            Some(m) if &m.room_id == room_id => m,
            _ => {
                debug!("Ignoring join completion for deselected room {}", room_id);
                return Err(ChatError::NotJoined(room_id.clone()));
            }
        };

        match outcome {
            Ok(()) => {
                membership.joined = true;
                info!("Joined room {}", room_id);
                Ok(())
            }
            Err(e) => {
                membership.joined = false;
                warn!("Failed to join room {}: {}", room_id, e);
                Err(e)
            }
        }
    }

    /// Select `room_id` and join it, waiting for the acknowledgement
    pub async fn join(&mut self, session: &SessionManager, room_id: RoomId) -> Result<(), ChatError> {
        self.select(room_id.clone());
        let outcome = match self.begin_join(session).await {
            Ok(pending) => pending.await,
            Err(e) => Err(e),
        };
        self.complete_join(&room_id, outcome)
    }

    /// Connection lost or closed: membership must be re-derived
    pub fn reset(&mut self) {
        if let Some(m) = self.current.as_mut() {
            if m.joined {
                debug!("Membership of room {} cleared", m.room_id);
            }
            m.joined = false;
        }
    }

    /// Best-effort `LeaveRoom`; the membership is cleared either way
    pub async fn leave(&mut self, session: &SessionManager) -> Result<(), ChatError> {
        let Some(membership) = self.current.take() else {
            return Ok(());
        };
        info!("Leaving room {}", membership.room_id);
        let result = session
            .send(Invocation::LeaveRoom {
                room_id: membership.room_id.clone(),
            })
            .await;
        if let Err(e) = &result {
            warn!("LeaveRoom for {} failed: {}", membership.room_id, e);
        }
        result
    }
}
