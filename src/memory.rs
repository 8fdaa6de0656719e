//! In-process hub connector
//!
//! `MemoryConnector` hands every accepted connection to the caller as a
//! [`HubPeer`], which plays the hub's side of the link: it reads the
//! client's invocations, acknowledges or rejects them, pushes events and
//! closes the connection. Attempts can be scripted to fail, which is how
//! the reconnect policy is exercised without a network.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ChatError;
use crate::message::{ClientFrame, HubEvent, Invocation, ServerFrame};
use crate::negotiate::ConnectionDescriptor;
use crate::transport::{Connector, HubLink, LINK_BUFFER_SIZE};

#[derive(Debug, Default)]
struct MemoryState {
    attempts: usize,
    tokens: Vec<Option<String>>,
    refusals: VecDeque<String>,
}

/// Connector whose "hub" is the test holding the peer receiver
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
    peers: mpsc::UnboundedSender<HubPeer>,
}

impl MemoryConnector {
    /// Create a connector and the receiver on which accepted peers arrive
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HubPeer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        let connector = Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            peers,
        };
        (connector, peer_rx)
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_next(&self, count: usize) {
        let mut state = self.lock();
        for _ in 0..count {
            state.refusals.push_back("hub unavailable".to_string());
        }
    }

    /// Total connection attempts seen, refused ones included
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    /// Bearer token presented on each attempt, in order
    pub fn tokens(&self) -> Vec<Option<String>> {
        self.lock().tokens.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        token: Option<&str>,
    ) -> Result<HubLink, ChatError> {
        {
            let mut state = self.lock();
            state.attempts += 1;
            state.tokens.push(token.map(str::to_string));
            if let Some(reason) = state.refusals.pop_front() {
                return Err(ChatError::Handshake(reason));
            }
        }

        let (out_tx, out_rx) = mpsc::channel(LINK_BUFFER_SIZE);
        let (in_tx, in_rx) = mpsc::channel(LINK_BUFFER_SIZE);
        let peer = HubPeer {
            descriptor: descriptor.clone(),
            token: token.map(str::to_string),
            from_client: out_rx,
            to_client: in_tx,
        };
        self.peers
            .send(peer)
            .map_err(|_| ChatError::Handshake("memory hub is gone".to_string()))?;
        Ok(HubLink::new(out_tx, in_rx))
    }
}

/// Hub side of one in-memory connection
///
/// Dropping the peer closes the link abruptly (an unexpected close from
/// the client's point of view).
#[derive(Debug)]
pub struct HubPeer {
    pub descriptor: ConnectionDescriptor,
    pub token: Option<String>,
    from_client: mpsc::Receiver<ClientFrame>,
    to_client: mpsc::Sender<ServerFrame>,
}

impl HubPeer {
    /// Next invocation from the client, skipping keep-alives
    pub async fn next_invocation(&mut self) -> Option<(u64, Invocation)> {
        while let Some(frame) = self.from_client.recv().await {
            if let ClientFrame::Invoke {
                invocation_id,
                call,
            } = frame
            {
                return Some((invocation_id, call));
            }
        }
        None
    }

    /// Next raw frame from the client, keep-alives included
    pub async fn next_frame(&mut self) -> Option<ClientFrame> {
        self.from_client.recv().await
    }

    /// Acknowledge an invocation
    pub async fn ack(&self, invocation_id: u64) -> Result<(), ChatError> {
        self.push_frame(ServerFrame::Completion {
            invocation_id,
            error: None,
        })
        .await
    }

    /// Reject an invocation with a hub error
    pub async fn reject(&self, invocation_id: u64, error: impl Into<String>) -> Result<(), ChatError> {
        self.push_frame(ServerFrame::Completion {
            invocation_id,
            error: Some(error.into()),
        })
        .await
    }

    /// Push an event to the client
    pub async fn push(&self, event: HubEvent) -> Result<(), ChatError> {
        self.push_frame(ServerFrame::Event(event)).await
    }

    /// Close the connection with an explicit close frame
    pub async fn close(self, error: Option<String>, allow_reconnect: bool) -> Result<(), ChatError> {
        self.push_frame(ServerFrame::Close {
            error,
            allow_reconnect,
        })
        .await
    }

    pub async fn push_frame(&self, frame: ServerFrame) -> Result<(), ChatError> {
        self.to_client
            .send(frame)
            .await
            .map_err(|_| ChatError::ConnectionClosed)
    }
}
