//! Chat client facade
//!
//! `ChatClient` ties one session, its room membership and its message
//! router together and turns the session's event stream into
//! consumer-facing [`ChatUpdate`]s. It owns the identity handshake: the
//! public channel announces the username, a room channel joins the room,
//! and both are repeated after every successful reconnect.

use std::collections::VecDeque;

use futures_util::FutureExt;
use tracing::{debug, info, warn};

use crate::crypto::EncryptionCodec;
use crate::error::ChatError;
use crate::membership::MembershipController;
use crate::message::Invocation;
use crate::negotiate::ConnectionDescriptor;
use crate::router::{MessageEnvelope, MessageRouter, Routed, Transcript};
use crate::session::{
    ChatSession, PendingInvocation, SessionEvent, SessionEvents, SessionManager,
};
use crate::types::{ConnectionState, RoomId};

/// Which hub channel a client talks on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatScope {
    /// The public lobby
    Public,
    /// A private room
    Room(RoomId),
}

/// Severity of a [`Notice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    /// Something failed but the session carries on or retries
    Warning,
    /// The session is over; the user has to reconnect manually
    Terminal,
}

/// Human-readable status notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

impl Notice {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            text: text.into(),
        }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            text: text.into(),
        }
    }

    pub fn terminal(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Terminal,
            text: text.into(),
        }
    }
}

impl From<&ChatError> for Notice {
    fn from(err: &ChatError) -> Self {
        if err.is_terminal() {
            Notice::terminal(format!("{}. Please reconnect.", err))
        } else {
            Notice::warning(err.to_string())
        }
    }
}

/// What the consumer sees
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatUpdate {
    /// Session state transition
    State(ConnectionState),
    /// A message was appended to the transcript
    Message(MessageEnvelope),
    /// The transcript was replaced by the room's history
    HistoryReplaced { room_id: RoomId, len: usize },
    /// The hub acknowledged our join
    Joined(RoomId),
    Notice(Notice),
}

/// One user's chat client on one channel
pub struct ChatClient {
    session: SessionManager,
    username: String,
    scope: ChatScope,
    membership: MembershipController,
    router: MessageRouter,
    events: Option<SessionEvents>,
    /// Identity call issued but not yet acknowledged
    pending: Option<(Handshake, PendingInvocation)>,
    /// Identity outcome waiting for the events published before it
    settled: Option<Settled>,
    /// Session events handled since connect
    events_seen: u64,
    queued: VecDeque<ChatUpdate>,
}

impl ChatClient {
    pub fn new(
        session: SessionManager,
        codec: EncryptionCodec,
        username: impl Into<String>,
        scope: ChatScope,
    ) -> Self {
        let router = match &scope {
            ChatScope::Public => MessageRouter::public(codec),
            ChatScope::Room(room_id) => MessageRouter::room(codec, room_id.clone()),
        };
        Self {
            session,
            username: username.into(),
            scope,
            membership: MembershipController::new(),
            router,
            events: None,
            pending: None,
            settled: None,
            events_seen: 0,
            queued: VecDeque::new(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn scope(&self) -> &ChatScope {
        &self.scope
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn transcript(&self) -> &Transcript {
        self.router.transcript()
    }

    pub fn membership(&self) -> &MembershipController {
        &self.membership
    }

    /// Snapshot of the session, with the joined room filled in
    pub fn session(&self) -> Option<ChatSession> {
        self.session.session().map(|mut snapshot| {
            snapshot.current_room = self.membership.ensure_joined().ok().cloned();
            snapshot
        })
    }

    /// Connect and establish identity
    ///
    /// On the public channel this waits for the hub to accept the
    /// username. In a room the join is only issued here; its
    /// acknowledgement arrives through [`next_update`](Self::next_update)
    /// as [`ChatUpdate::Joined`].
    pub async fn connect(&mut self, descriptor: ConnectionDescriptor) -> Result<(), ChatError> {
        self.clear_handshake();
        self.membership.reset();
        let events = self.session.connect(descriptor).await?;
        self.events = Some(events);
        self.events_seen = 0;

        if let Err(e) = self.establish_identity().await {
            warn!("Identity handshake failed: {}", e);
            self.disconnect().await;
            return Err(e);
        }
        Ok(())
    }

    /// Issue the identity call; the username is also awaited
    async fn establish_identity(&mut self) -> Result<(), ChatError> {
        self.begin_identity().await?;
        if !matches!(self.pending, Some((Handshake::Username, _))) {
            return Ok(());
        }
        if let Some((_, pending)) = self.pending.take() {
            pending.await?;
            info!("Username set to {}", self.username);
        }
        Ok(())
    }

    /// Issue the call that identifies us on this channel
    async fn begin_identity(&mut self) -> Result<(), ChatError> {
        let pending = match &self.scope {
            ChatScope::Public => {
                let call = Invocation::SetUsername {
                    username: self.username.clone(),
                };
                (Handshake::Username, self.session.begin_send(call).await?)
            }
            ChatScope::Room(room_id) => {
                let room_id = room_id.clone();
                self.membership.select(room_id.clone());
                let invocation = self.membership.begin_join(&self.session).await?;
                (Handshake::Join(room_id), invocation)
            }
        };
        self.pending = Some(pending);
        Ok(())
    }

    /// Wait for the next update
    ///
    /// Returns `None` once the session has ended and every update has
    /// been delivered. An identity completion is applied exactly between
    /// the events the session published before and after it, so a room
    /// message is accepted only if the hub sent it after acknowledging
    /// our join.
    pub async fn next_update(&mut self) -> Option<ChatUpdate> {
        loop {
            if let Some(update) = self.queued.pop_front() {
                return Some(update);
            }

            if self.apply_due_handshake() {
                continue;
            }

            // A resolved completion must be picked up before any event
            // published after it is received
            let events = self.events.as_mut()?;
            let step = tokio::select! {
                biased;
                settled = wait_for_handshake(&mut self.pending) => Step::Settled(settled),
                event = events.recv() => Step::Event(event),
            };

            match step {
                Step::Event(Some(event)) => {
                    // The completion may have been resolved between the two
                    // polls above; it still precedes this event
                    self.poll_pending_now();
                    self.apply_due_handshake();
                    self.events_seen += 1;
                    self.handle_event(event).await;
                }
                Step::Event(None) => {
                    debug!("Session event stream ended");
                    self.events = None;
                }
                Step::Settled(settled) => self.settled = Some(settled),
            }
        }
    }

    /// Move an already resolved identity call into `settled`
    fn poll_pending_now(&mut self) {
        if self.settled.is_some() {
            return;
        }
        if let Some(settled) = wait_for_handshake(&mut self.pending).now_or_never() {
            self.settled = Some(settled);
        }
    }

    /// Apply the settled identity call once every event published before
    /// it has been handled
    fn apply_due_handshake(&mut self) -> bool {
        let due = self
            .settled
            .as_ref()
            .is_some_and(|settled| settled.is_due(self.events_seen));
        if !due {
            return false;
        }
        match self.settled.take() {
            Some(settled) => {
                self.finish_handshake(settled.handshake, settled.outcome);
                true
            }
            None => false,
        }
    }

    fn clear_handshake(&mut self) {
        self.pending = None;
        self.settled = None;
    }

    fn finish_handshake(&mut self, handshake: Handshake, outcome: Result<(), ChatError>) {
        match handshake {
            Handshake::Join(room_id) => match self.membership.complete_join(&room_id, outcome) {
                Ok(()) => self.queued.push_back(ChatUpdate::Joined(room_id)),
                Err(e) => self.notice(Notice::from(&e)),
            },
            Handshake::Username => match outcome {
                Ok(()) => info!("Username set to {}", self.username),
                Err(e) => {
                    warn!("SetUsername failed: {}", e);
                    self.notice(Notice::from(&e));
                }
            },
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged(state) => {
                self.queued.push_back(ChatUpdate::State(state));
            }
            SessionEvent::Connected => {
                self.notice(Notice::info(format!("Connected as {}", self.username)));
            }
            SessionEvent::Reconnecting { reason } => {
                self.membership.reset();
                self.clear_handshake();
                self.notice(Notice::warning(format!("Connection lost ({}), reconnecting", reason)));
            }
            SessionEvent::Reconnected => {
                self.notice(Notice::info("Reconnected"));
                if let Err(e) = self.begin_identity().await {
                    warn!("Failed to restore identity after reconnect: {}", e);
                    self.notice(Notice::from(&e));
                }
            }
            SessionEvent::Closed { reason } => {
                self.membership.reset();
                self.clear_handshake();
                let notice = match reason {
                    Some(reason) => Notice::terminal(format!(
                        "Connection closed: {}. Please reconnect.",
                        reason
                    )),
                    None => Notice::info("Disconnected"),
                };
                self.notice(notice);
            }
            SessionEvent::Inbound(event) => match self.router.route(event, &self.membership).await {
                Some(Routed::Appended(envelope)) => {
                    self.queued.push_back(ChatUpdate::Message(envelope));
                }
                Some(Routed::Replaced { room_id, len }) => {
                    self.queued
                        .push_back(ChatUpdate::HistoryReplaced { room_id, len });
                }
                None => {}
            },
        }
    }

    fn notice(&mut self, notice: Notice) {
        self.queued.push_back(ChatUpdate::Notice(notice));
    }

    /// Encrypt and post `text` on this client's channel
    ///
    /// The hub echoes posted messages back to every member, so the
    /// transcript picks this message up when the echo arrives.
    pub async fn send(&mut self, text: &str) -> Result<MessageEnvelope, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let call = self.router.outbound(text, &self.membership).await?;
        self.session.send(call).await?;
        Ok(MessageEnvelope::outbound(self.username.clone(), text))
    }

    /// Leave the room (best effort) and disconnect regardless
    ///
    /// Returns the outcome of the remote `LeaveRoom`; the session is
    /// disconnected either way.
    pub async fn leave(&mut self) -> Result<(), ChatError> {
        self.clear_handshake();
        let result = self.membership.leave(&self.session).await;
        self.disconnect().await;
        result
    }

    pub async fn disconnect(&mut self) {
        self.clear_handshake();
        self.session.disconnect().await;
        self.membership.reset();
    }
}

/// Call that establishes who we are on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
enum Handshake {
    Username,
    Join(RoomId),
}

/// Resolved identity call
struct Settled {
    handshake: Handshake,
    outcome: Result<(), ChatError>,
    /// Events the session published before resolving it
    events_before: Option<u64>,
}

impl Settled {
    fn is_due(&self, events_seen: u64) -> bool {
        self.events_before.map_or(true, |before| events_seen >= before)
    }
}

enum Step {
    Event(Option<SessionEvent>),
    Settled(Settled),
}

/// Resolve the pending identity call, or never when there is none
async fn wait_for_handshake(pending: &mut Option<(Handshake, PendingInvocation)>) -> Settled {
    let Some((handshake, invocation)) = pending.as_mut() else {
        return std::future::pending().await;
    };
    let handshake = handshake.clone();
    let (outcome, events_before) = std::future::poll_fn(|cx| invocation.poll_sequenced(cx)).await;
    *pending = None;
    Settled {
        handshake,
        outcome,
        events_before,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use url::Url;

    use super::*;
    use crate::crypto::{SharedSecret, KEY_LEN};
    use crate::memory::{HubPeer, MemoryConnector};
    use crate::message::HubEvent;
    use crate::negotiate::{resolve, TransportKind, WireEncoding};
    use crate::transport::Anonymous;

    fn codec() -> EncryptionCodec {
        EncryptionCodec::from_secret(SharedSecret::from_bytes(&[9u8; KEY_LEN]))
    }

    fn descriptor() -> ConnectionDescriptor {
        let endpoint = Url::parse("http://hub.test/privatechathub").unwrap();
        resolve(&endpoint, TransportKind::WebSockets, WireEncoding::Text)
    }

    fn room_client() -> (ChatClient, tokio::sync::mpsc::UnboundedReceiver<HubPeer>) {
        let (connector, peers) = MemoryConnector::new();
        let session = SessionManager::new(Arc::new(connector), Arc::new(Anonymous));
        let client = ChatClient::new(session, codec(), "alice", ChatScope::Room(RoomId::from("lobby")));
        (client, peers)
    }

    /// Pump updates until the join lands; fails instead of hanging
    async fn until_joined(client: &mut ChatClient) -> Vec<ChatUpdate> {
        let pump = async {
            let mut updates = Vec::new();
            while let Some(update) = client.next_update().await {
                let joined = matches!(update, ChatUpdate::Joined(_));
                updates.push(update);
                if joined {
                    break;
                }
            }
            updates
        };
        tokio::time::timeout(Duration::from_secs(10), pump)
            .await
            .expect("join never surfaced")
    }

    #[test]
    fn test_notice_from_error() {
        let exhausted = Notice::from(&ChatError::RetriesExhausted { attempts: 4 });
        assert_eq!(exhausted.level, NoticeLevel::Terminal);
        let not_joined = Notice::from(&ChatError::NotJoined(RoomId::from("lobby")));
        assert_eq!(not_joined.level, NoticeLevel::Warning);
    }

    #[tokio::test]
    async fn test_send_rejects_empty_text() {
        let (mut client, _peers) = room_client();
        assert!(matches!(client.send("   ").await, Err(ChatError::EmptyMessage)));
    }

    #[tokio::test]
    async fn test_room_send_before_ack_fails_fast() {
        let (mut client, mut peers) = room_client();
        client.connect(descriptor()).await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        let (_, call) = peer.next_invocation().await.unwrap();
        assert_eq!(call, Invocation::JoinRoom { room_id: RoomId::from("lobby") });

        let err = client.send("hello").await.unwrap_err();
        assert!(matches!(err, ChatError::NotJoined(_)));
        assert!(client.session().unwrap().current_room.is_none());
    }

    #[tokio::test]
    async fn test_join_ack_surfaces_as_update() {
        let (mut client, mut peers) = room_client();
        client.connect(descriptor()).await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        let (id, _) = peer.next_invocation().await.unwrap();
        peer.ack(id).await.unwrap();

        let updates = until_joined(&mut client).await;
        assert_eq!(updates[0], ChatUpdate::State(ConnectionState::Connecting));
        assert_eq!(updates.last(), Some(&ChatUpdate::Joined(RoomId::from("lobby"))));
        assert!(client.membership().is_joined());
        assert_eq!(
            client.session().unwrap().current_room,
            Some(RoomId::from("lobby"))
        );
    }

    #[tokio::test]
    async fn test_leave_disconnects_even_if_leave_fails() {
        let (mut client, mut peers) = room_client();
        client.connect(descriptor()).await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        let hub = tokio::spawn(async move {
            let (id, _) = peer.next_invocation().await.unwrap();
            peer.ack(id).await.unwrap();
            let (id, call) = peer.next_invocation().await.unwrap();
            assert!(matches!(call, Invocation::LeaveRoom { .. }));
            peer.reject(id, "not a member").await.unwrap();
            peer
        });

        until_joined(&mut client).await;
        let err = client.leave().await.unwrap_err();
        assert!(matches!(err, ChatError::Invocation { target: "LeaveRoom", .. }));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.membership().current().is_none());
        let _peer = hub.await.unwrap();
    }

    #[tokio::test]
    async fn test_room_connect_keeps_join_pending_until_ack() {
        let (mut client, mut peers) = room_client();
        client.connect(descriptor()).await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        let (id, call) = peer.next_invocation().await.unwrap();
        assert_eq!(call, Invocation::JoinRoom { room_id: RoomId::from("lobby") });

        // Ack arrives after connect returned; it must still be applied
        peer.ack(id).await.unwrap();
        let updates = until_joined(&mut client).await;
        assert_eq!(updates.last(), Some(&ChatUpdate::Joined(RoomId::from("lobby"))));

        let hub = tokio::spawn(async move {
            let (id, call) = peer.next_invocation().await.unwrap();
            assert!(matches!(call, Invocation::SendMessageToRoom { .. }));
            peer.ack(id).await.unwrap();
            peer
        });
        client.send("hi").await.unwrap();
        let _peer = hub.await.unwrap();
    }

    #[tokio::test]
    async fn test_message_queued_behind_ack_is_delivered() {
        let (mut client, mut peers) = room_client();
        client.connect(descriptor()).await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        let (id, _) = peer.next_invocation().await.unwrap();

        // Completion and the next event are both ready before the client looks
        peer.ack(id).await.unwrap();
        peer.push(HubEvent::ReceiveMessage {
            sender: "bob".to_string(),
            payload: codec().encrypt("right after").await.unwrap(),
        })
        .await
        .unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let pump = async {
            let mut updates = Vec::new();
            while let Some(update) = client.next_update().await {
                let done = matches!(update, ChatUpdate::Message(_));
                updates.push(update);
                if done {
                    break;
                }
            }
            updates
        };
        let updates = tokio::time::timeout(Duration::from_secs(10), pump)
            .await
            .expect("message was dropped");
        let joined_at = updates
            .iter()
            .position(|u| matches!(u, ChatUpdate::Joined(_)))
            .unwrap();
        assert!(matches!(updates.last(), Some(ChatUpdate::Message(m)) if m.payload == "right after"));
        assert!(joined_at < updates.len() - 1);
    }
}
