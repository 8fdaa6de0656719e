//! Session manager
//!
//! Owns the connection state machine for one chat session. The live
//! connection is driven by a session actor task; the `SessionManager`
//! handle talks to it over an mpsc command channel and observes its state
//! through a `watch` channel. Everything the actor observes (state
//! transitions, lifecycle hooks, inbound hub events) is published in
//! transport order on a single event channel.
//!
//! ```text
//!                 connect()
//!  Disconnected ───────────► Connecting ──handshake ok──► Connected
//!       ▲                        │                          │   ▲
//!       │◄──handshake failed─────┘        unexpected close  │   │ retry ok
//!       │◄──disconnect() / non-reconnectable close──────────┤   │
//!       │                                                   ▼   │
//!       └──────────────backoff exhausted / disconnect()── Reconnecting
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Timeout};
use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::message::{ClientFrame, HubEvent, Invocation, ServerFrame};
use crate::negotiate::{ConnectionDescriptor, TransportKind, WireEncoding};
use crate::transport::{Connector, CredentialProvider, HubLink};
use crate::types::{ConnectionState, RoomId, SessionId};

/// Channel buffer size for session commands
const COMMAND_BUFFER_SIZE: usize = 32;

/// Default time to wait for a hub completion
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How often an idle session pings the hub
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Ordered reconnect delays
///
/// Delay `n` is waited before reconnect attempt `n + 1`. When every delay
/// has been used without success the session is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_millis(delays: &[u64]) -> Self {
        Self::new(delays.iter().copied().map(Duration::from_millis).collect())
    }

    /// Never reconnect automatically
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Delay before the given 0-based attempt, or `None` once exhausted
    pub fn delay_for(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt).copied()
    }

    pub fn max_attempts(&self) -> usize {
        self.delays.len()
    }

    pub fn is_disabled(&self) -> bool {
        self.delays.is_empty()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_millis(&[0, 2_000, 10_000, 30_000])
    }
}

/// Notifications published by a session, in the order they happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Every state transition
    StateChanged(ConnectionState),
    /// Initial handshake succeeded
    Connected,
    /// Transport was lost; retrying
    Reconnecting { reason: String },
    /// A retry succeeded; membership must be re-established
    Reconnected,
    /// Session is over. `reason` is `None` after an explicit disconnect.
    Closed { reason: Option<String> },
    /// Event pushed by the hub
    Inbound(HubEvent),
}

/// Receiver half of a session's event stream
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Snapshot of one logical connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSession {
    pub id: SessionId,
    pub state: ConnectionState,
    pub transport_kind: TransportKind,
    pub wire_encoding: WireEncoding,
    pub current_room: Option<RoomId>,
}

/// Outcome of an invocation as seen by the actor
#[derive(Debug)]
struct Completion {
    result: Result<(), ChatError>,
    /// Session events published before this completion
    events_before: u64,
}

type CompletionSender = oneshot::Sender<Completion>;

/// Commands sent from the manager handle to the session actor
#[derive(Debug)]
enum SessionCommand {
    /// Dispatch an invocation and report its completion
    Invoke {
        call: Invocation,
        reply: CompletionSender,
    },
    /// Tear the session down
    Stop { done: oneshot::Sender<()> },
}

/// Completion of a dispatched invocation
///
/// Resolves when the hub acknowledges or rejects the call, when the
/// transport goes away, or when the invoke timeout elapses.
pub struct PendingInvocation {
    target: &'static str,
    reply: Pin<Box<Timeout<oneshot::Receiver<Completion>>>>,
}

impl PendingInvocation {
    fn new(target: &'static str, reply: oneshot::Receiver<Completion>, timeout: Duration) -> Self {
        Self {
            target,
            reply: Box::pin(tokio::time::timeout(timeout, reply)),
        }
    }

    pub fn target(&self) -> &'static str {
        self.target
    }

    /// Poll for the outcome together with its position in the event stream
    ///
    /// The position is the number of [`SessionEvent`]s published before
    /// the session resolved this invocation. It is `None` when the
    /// outcome was decided locally (timeout, session gone).
    pub fn poll_sequenced(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<(Result<(), ChatError>, Option<u64>)> {
        let target = self.target;
        self.reply.as_mut().poll(cx).map(|outcome| match outcome {
            Ok(Ok(completion)) => (completion.result, Some(completion.events_before)),
            Ok(Err(_)) => (Err(ChatError::ConnectionClosed), None),
            Err(_) => (Err(ChatError::InvocationTimeout(target)), None),
        })
    }
}

impl Future for PendingInvocation {
    type Output = Result<(), ChatError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.poll_sequenced(cx).map(|(result, _)| result)
    }
}

impl std::fmt::Debug for PendingInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingInvocation")
            .field("target", &self.target)
            .finish()
    }
}

/// The running actor plus the handles needed to reach it
struct ActiveSession {
    id: SessionId,
    descriptor: ConnectionDescriptor,
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Owner of the (at most one) active chat session
pub struct SessionManager {
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    retry: RetryPolicy,
    invoke_timeout: Duration,
    active: Option<ActiveSession>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn Connector>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            connector,
            credentials,
            retry: RetryPolicy::default(),
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
            active: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Current state; `Disconnected` when no session exists
    pub fn state(&self) -> ConnectionState {
        self.active
            .as_ref()
            .map(|active| *active.state.borrow())
            .unwrap_or_default()
    }

    /// Snapshot of the active session; `None` once it has closed
    pub fn session(&self) -> Option<ChatSession> {
        let active = self.active.as_ref()?;
        let state = *active.state.borrow();
        if state == ConnectionState::Disconnected {
            return None;
        }
        Some(ChatSession {
            id: active.id,
            state,
            transport_kind: active.descriptor.transport,
            wire_encoding: active.descriptor.encoding,
            current_room: None,
        })
    }

    /// Open a new session
    ///
    /// Any existing session is stopped first. On success the session is
    /// Connected and the returned receiver yields its events, starting
    /// with `StateChanged(Connecting)`.
    pub async fn connect(&mut self, descriptor: ConnectionDescriptor) -> Result<SessionEvents, ChatError> {
        if self.active.is_some() {
            info!("Stopping previous session before reconnecting");
            self.disconnect().await;
        }

        let id = SessionId::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let mut publisher = Publisher {
            id,
            events: event_tx,
            state: state_tx,
            published: 0,
        };

        info!(
            "Session {} connecting to {} ({}, {})",
            id, descriptor.endpoint, descriptor.transport, descriptor.encoding
        );
        publisher.transition(ConnectionState::Connecting);

        let link = match open_link(self.connector.as_ref(), self.credentials.as_ref(), &descriptor).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Session {} handshake failed: {}", id, e);
                publisher.transition(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        publisher.transition(ConnectionState::Connected);
        publisher.emit(SessionEvent::Connected);
        info!("Session {} connected", id);

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let actor = SessionActor {
            id,
            descriptor: descriptor.clone(),
            link,
            commands: cmd_rx,
            publisher,
            connector: Arc::clone(&self.connector),
            credentials: Arc::clone(&self.credentials),
            retry: self.retry.clone(),
            pending: HashMap::new(),
            next_invocation_id: 1,
            keep_alive: keep_alive_timer(),
        };
        let task = tokio::spawn(actor.run());

        self.active = Some(ActiveSession {
            id,
            descriptor,
            commands: cmd_tx,
            state: state_rx,
            task,
        });
        Ok(event_rx)
    }

    /// Stop the session and release its resources
    ///
    /// Cancels any pending retry wait. A no-op when nothing is active.
    pub async fn disconnect(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        if active
            .commands
            .send(SessionCommand::Stop { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
        let _ = (&mut active.task).await;
        debug!("Session {} released", active.id);
    }

    /// Invoke a hub method and wait for its completion
    ///
    /// Fails with `NotConnected` unless the session is Connected.
    pub async fn send(&self, call: Invocation) -> Result<(), ChatError> {
        self.begin_send(call).await?.await
    }

    /// Dispatch a hub invocation without waiting for its completion
    pub async fn begin_send(&self, call: Invocation) -> Result<PendingInvocation, ChatError> {
        let active = self
            .active
            .as_ref()
            .ok_or(ChatError::NotConnected(ConnectionState::Disconnected))?;
        let state = *active.state.borrow();
        if !state.is_connected() {
            return Err(ChatError::NotConnected(state));
        }

        let target = call.target();
        let (reply_tx, reply_rx) = oneshot::channel();
        active
            .commands
            .send(SessionCommand::Invoke {
                call,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ChatError::SessionClosed)?;
        Ok(PendingInvocation::new(target, reply_rx, self.invoke_timeout))
    }
}

/// Dial once, fetching a fresh token for the attempt
async fn open_link(
    connector: &dyn Connector,
    credentials: &dyn CredentialProvider,
    descriptor: &ConnectionDescriptor,
) -> Result<HubLink, ChatError> {
    let token = credentials.bearer_token().await?;
    connector.connect(descriptor, token.as_deref()).await
}

/// First tick one period from now; late ticks are not bunched up
fn keep_alive_timer() -> Interval {
    let mut timer = tokio::time::interval_at(Instant::now() + KEEP_ALIVE_INTERVAL, KEEP_ALIVE_INTERVAL);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// Publishes state and events for one session
struct Publisher {
    id: SessionId,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Sender<ConnectionState>,
    published: u64,
}

impl Publisher {
    fn transition(&mut self, to: ConnectionState) {
        let from = self.state.send_replace(to);
        debug!("Session {} state {} -> {}", self.id, from, to);
        self.emit(SessionEvent::StateChanged(to));
    }

    fn emit(&mut self, event: SessionEvent) {
        self.published += 1;
        // Consumer may have stopped listening; the session carries on regardless
        let _ = self.events.send(event);
    }

    /// Resolve an invocation at the current position of the event stream
    fn complete(&self, reply: CompletionSender, result: Result<(), ChatError>) {
        let _ = reply.send(Completion {
            result,
            events_before: self.published,
        });
    }
}

/// What the actor does after handling one step
enum Flow {
    Continue,
    Break,
}

/// One wake-up of the actor's main loop
enum Step {
    Command(Option<SessionCommand>),
    Frame(Option<ServerFrame>),
    KeepAlive,
}

/// A stop request that interrupted a retry wait or dial
struct Interrupted(Option<oneshot::Sender<()>>);

struct SessionActor {
    id: SessionId,
    descriptor: ConnectionDescriptor,
    link: HubLink,
    commands: mpsc::Receiver<SessionCommand>,
    publisher: Publisher,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    retry: RetryPolicy,
    /// Invocations awaiting a completion: id -> (target, reply)
    pending: HashMap<u64, (&'static str, CompletionSender)>,
    next_invocation_id: u64,
    keep_alive: Interval,
}

impl SessionActor {
    /// Run the session event loop until it is stopped or gives up
    async fn run(mut self) {
        debug!("Session {} actor started", self.id);

        loop {
            let step = tokio::select! {
                cmd = self.commands.recv() => Step::Command(cmd),
                frame = self.link.inbound.recv() => Step::Frame(frame),
                _ = self.keep_alive.tick() => Step::KeepAlive,
            };

            let flow = match step {
                Step::Command(Some(SessionCommand::Invoke { call, reply })) => {
                    self.dispatch(call, reply).await;
                    Flow::Continue
                }
                Step::Command(Some(SessionCommand::Stop { done })) => self.stop(Some(done)),
                Step::Command(None) => self.stop(None),
                Step::Frame(Some(frame)) => self.handle_frame(frame).await,
                Step::Frame(None) => self.recover("transport closed".to_string()).await,
                Step::KeepAlive => {
                    self.ping();
                    Flow::Continue
                }
            };

            if let Flow::Break = flow {
                break;
            }
        }

        debug!("Session {} actor ended", self.id);
    }

    async fn dispatch(&mut self, call: Invocation, reply: CompletionSender) {
        let invocation_id = self.next_invocation_id;
        self.next_invocation_id += 1;
        let target = call.target();

        debug!("Session {} invoking {} (#{})", self.id, target, invocation_id);
        let frame = ClientFrame::Invoke { invocation_id, call };
        if self.link.outbound.send(frame).await.is_err() {
            self.publisher.complete(reply, Err(ChatError::ConnectionClosed));
            return;
        }
        self.pending.insert(invocation_id, (target, reply));
    }

    /// Never waits on a full outbound buffer; the ping is skipped instead
    fn ping(&mut self) {
        match self.link.outbound.try_send(ClientFrame::Ping) {
            Ok(()) => debug!("Session {} sent keep-alive", self.id),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Session {} outbound busy, skipping keep-alive", self.id)
            }
            // The read side reports the loss
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    async fn handle_frame(&mut self, frame: ServerFrame) -> Flow {
        match frame {
            ServerFrame::Completion {
                invocation_id,
                error,
            } => {
                let Some((target, reply)) = self.pending.remove(&invocation_id) else {
                    warn!("Session {} got completion for unknown invocation #{}", self.id, invocation_id);
                    return Flow::Continue;
                };
                let result = match error {
                    None => Ok(()),
                    Some(message) => {
                        warn!("Session {} {} rejected: {}", self.id, target, message);
                        Err(ChatError::Invocation { target, message })
                    }
                };
                self.publisher.complete(reply, result);
                Flow::Continue
            }
            ServerFrame::Event(event) => {
                self.publisher.emit(SessionEvent::Inbound(event));
                Flow::Continue
            }
            ServerFrame::Ping => Flow::Continue,
            ServerFrame::Close {
                error,
                allow_reconnect,
            } => {
                let reason = error.unwrap_or_else(|| "hub closed the connection".to_string());
                if allow_reconnect {
                    self.recover(reason).await
                } else {
                    info!("Session {} closed by hub: {}", self.id, reason);
                    self.fail_pending();
                    self.close(Some(reason));
                    Flow::Break
                }
            }
        }
    }

    /// Walk the retry policy after an unexpected close
    async fn recover(&mut self, reason: String) -> Flow {
        self.fail_pending();

        if self.retry.is_disabled() {
            warn!("Session {} lost transport ({}), reconnect disabled", self.id, reason);
            self.close(Some(reason));
            return Flow::Break;
        }

        warn!("Session {} lost transport: {}", self.id, reason);
        self.publisher.transition(ConnectionState::Reconnecting);
        self.publisher.emit(SessionEvent::Reconnecting { reason });

        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;
        while let Some(delay) = self.retry.delay_for(attempt) {
            attempt += 1;

            if let Err(Interrupted(done)) = self.interruptible(tokio::time::sleep(delay)).await {
                return self.stop(done);
            }

            info!(
                "Session {} reconnect attempt {}/{} after {:?}",
                self.id, attempt, max_attempts, delay
            );
            let connector = Arc::clone(&self.connector);
            let credentials = Arc::clone(&self.credentials);
            let descriptor = self.descriptor.clone();
            let dial = async move { open_link(connector.as_ref(), credentials.as_ref(), &descriptor).await };

            match self.interruptible(dial).await {
                Err(Interrupted(done)) => return self.stop(done),
                Ok(Ok(link)) => {
                    self.link = link;
                    self.keep_alive.reset();
                    self.publisher.transition(ConnectionState::Connected);
                    self.publisher.emit(SessionEvent::Reconnected);
                    info!("Session {} reconnected on attempt {}", self.id, attempt);
                    return Flow::Continue;
                }
                Ok(Err(e)) => {
                    warn!("Session {} reconnect attempt {} failed: {}", self.id, attempt, e);
                }
            }
        }

        let exhausted = ChatError::RetriesExhausted { attempts: attempt };
        warn!("Session {} {}", self.id, exhausted);
        self.close(Some(exhausted.to_string()));
        Flow::Break
    }

    /// Await `fut` while answering commands
    ///
    /// Invocations are refused (the session is not Connected while this
    /// runs); a stop request abandons `fut`.
    async fn interruptible<F: Future>(&mut self, fut: F) -> Result<F::Output, Interrupted> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return Ok(output),
                cmd = self.commands.recv() => match cmd {
                    Some(SessionCommand::Invoke { reply, .. }) => {
                        self.publisher.complete(reply, Err(ChatError::NotConnected(ConnectionState::Reconnecting)));
                    }
                    Some(SessionCommand::Stop { done }) => return Err(Interrupted(Some(done))),
                    None => return Err(Interrupted(None)),
                },
            }
        }
    }

    /// Explicit stop: close and acknowledge
    fn stop(&mut self, done: Option<oneshot::Sender<()>>) -> Flow {
        info!("Session {} disconnecting", self.id);
        self.fail_pending();
        self.close(None);
        if let Some(done) = done {
            let _ = done.send(());
        }
        Flow::Break
    }

    fn close(&mut self, reason: Option<String>) {
        self.publisher.transition(ConnectionState::Disconnected);
        self.publisher.emit(SessionEvent::Closed { reason });
    }

    /// Fail every in-flight invocation; their transport is gone
    fn fail_pending(&mut self) {
        for (_, (target, reply)) in self.pending.drain() {
            debug!("Session {} dropping in-flight {}", self.id, target);
            self.publisher.complete(reply, Err(ChatError::ConnectionClosed));
        }
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::memory::MemoryConnector;
    use crate::negotiate::resolve;
    use crate::transport::{Anonymous, StaticToken};

    fn descriptor() -> ConnectionDescriptor {
        let endpoint = Url::parse("http://hub.test/privatechathub").unwrap();
        resolve(&endpoint, TransportKind::WebSockets, WireEncoding::Text)
    }

    fn manager(connector: &MemoryConnector) -> SessionManager {
        SessionManager::new(Arc::new(connector.clone()), Arc::new(Anonymous))
    }

    fn drain(events: &mut SessionEvents) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[test]
    fn test_retry_policy_sequence() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Some(Duration::ZERO));
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay_for(4), None);
        assert_eq!(policy.max_attempts(), 4);
        assert!(RetryPolicy::disabled().is_disabled());
    }

    #[tokio::test]
    async fn test_connect_publishes_connecting_then_connected() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut session = manager(&connector);

        let mut events = session.connect(descriptor()).await.unwrap();
        let _peer = peers.recv().await.unwrap();

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(
            drain(&mut events),
            vec![
                SessionEvent::StateChanged(ConnectionState::Connecting),
                SessionEvent::StateChanged(ConnectionState::Connected),
                SessionEvent::Connected,
            ]
        );
        let info = session.session().unwrap();
        assert_eq!(info.transport_kind, TransportKind::WebSockets);
        assert_eq!(info.state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_handshake_failure_leaves_disconnected() {
        let (connector, _peers) = MemoryConnector::new();
        connector.refuse_next(1);
        let mut session = manager(&connector);

        let err = session.connect(descriptor()).await.unwrap_err();
        assert!(matches!(err, ChatError::Handshake(_)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.session().is_none());
    }

    #[tokio::test]
    async fn test_send_rejected_when_not_connected() {
        let (connector, _peers) = MemoryConnector::new();
        let session = manager(&connector);
        let err = session
            .send(Invocation::SetUsername {
                username: "alice".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChatError::NotConnected(ConnectionState::Disconnected)
        ));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_send_resolves_on_completion() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut session = manager(&connector);
        let _events = session.connect(descriptor()).await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        let hub = tokio::spawn(async move {
            let (id, call) = peer.next_invocation().await.unwrap();
            assert_eq!(call, Invocation::JoinRoom { room_id: RoomId::from("lobby") });
            peer.ack(id).await.unwrap();
            let (id, _) = peer.next_invocation().await.unwrap();
            peer.reject(id, "room is full").await.unwrap();
            peer
        });

        session
            .send(Invocation::JoinRoom { room_id: RoomId::from("lobby") })
            .await
            .unwrap();
        let err = session
            .send(Invocation::JoinRoom { room_id: RoomId::from("attic") })
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Invocation { target: "JoinRoom", .. }));
        let _peer = hub.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_invocation_times_out() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut session = manager(&connector).with_invoke_timeout(Duration::from_secs(5));
        let _events = session.connect(descriptor()).await.unwrap();
        let _peer = peers.recv().await.unwrap();

        let err = session
            .send(Invocation::LeaveRoom { room_id: RoomId::from("lobby") })
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvocationTimeout("LeaveRoom")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_invocation_fails_when_transport_drops() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut session = manager(&connector).with_retry_policy(RetryPolicy::disabled());
        let _events = session.connect(descriptor()).await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        let pending = session
            .begin_send(Invocation::SendMessage { ciphertext: "x".to_string() })
            .await
            .unwrap();
        peer.next_invocation().await.unwrap();
        drop(peer);

        assert!(matches!(pending.await, Err(ChatError::ConnectionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_and_fetches_fresh_token() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut session = SessionManager::new(
            Arc::new(connector.clone()),
            Arc::new(StaticToken("jwt".to_string())),
        );
        let mut events = session.connect(descriptor()).await.unwrap();
        let peer = peers.recv().await.unwrap();
        drain(&mut events);

        connector.refuse_next(1);
        drop(peer);

        let _second = peers.recv().await.unwrap();
        // Give the actor a chance to publish after the successful dial
        while session.state() != ConnectionState::Connected {
            tokio::task::yield_now().await;
        }

        let seen = drain(&mut events);
        assert_eq!(seen[0], SessionEvent::StateChanged(ConnectionState::Reconnecting));
        assert!(matches!(seen[1], SessionEvent::Reconnecting { .. }));
        assert_eq!(
            &seen[2..],
            &[
                SessionEvent::StateChanged(ConnectionState::Connected),
                SessionEvent::Reconnected,
            ]
        );
        assert_eq!(connector.attempts(), 3);
        assert!(connector.tokens().iter().all(|t| t.as_deref() == Some("jwt")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut session = manager(&connector).with_retry_policy(RetryPolicy::from_millis(&[60_000]));
        let mut events = session.connect(descriptor()).await.unwrap();
        let peer = peers.recv().await.unwrap();
        drop(peer);

        while session.state() != ConnectionState::Reconnecting {
            tokio::task::yield_now().await;
        }
        session.disconnect().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(connector.attempts(), 1);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        let seen = drain(&mut events);
        assert_eq!(seen.last(), Some(&SessionEvent::Closed { reason: None }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_reconnectable_close_ends_session() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut session = manager(&connector);
        let mut events = session.connect(descriptor()).await.unwrap();
        let peer = peers.recv().await.unwrap();

        peer.close(Some("token expired".to_string()), false).await.unwrap();

        let mut last = None;
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(SessionEvent::Closed {
                reason: Some("token expired".to_string())
            })
        );
        assert_eq!(connector.attempts(), 1);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_sends_keep_alive() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut session = manager(&connector);
        let _events = session.connect(descriptor()).await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        let started = Instant::now();
        let frame = tokio::time::timeout(Duration::from_secs(60), peer.next_frame())
            .await
            .expect("no keep-alive within a minute");
        assert_eq!(frame, Some(ClientFrame::Ping));
        assert!(started.elapsed() >= KEEP_ALIVE_INTERVAL);

        // Invocations still flow between pings
        let pending = session
            .begin_send(Invocation::SetUsername { username: "alice".to_string() })
            .await
            .unwrap();
        let (id, _) = peer.next_invocation().await.unwrap();
        peer.ack(id).await.unwrap();
        pending.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_twice_stops_first_session() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut session = manager(&connector);

        let mut first = session.connect(descriptor()).await.unwrap();
        let _p1 = peers.recv().await.unwrap();
        let first_id = session.session().unwrap().id;

        let _second = session.connect(descriptor()).await.unwrap();
        let _p2 = peers.recv().await.unwrap();

        assert_ne!(session.session().unwrap().id, first_id);
        let seen = drain(&mut first);
        assert_eq!(seen.last(), Some(&SessionEvent::Closed { reason: None }));
    }
}
