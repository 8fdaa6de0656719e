//! Real-time Chat Hub Client Library
//!
//! Client side of a hub-based chat service: a public lobby channel and
//! private rooms, carried over a persistent connection with automatic
//! reconnection. Message bodies are end-to-end encrypted with AES-256-GCM.
//!
//! # Features
//! - Transport and wire encoding negotiation
//! - Four-state session lifecycle with a fixed reconnect backoff
//! - Room join/leave with acknowledgement-gated membership
//! - Rejoin after reconnect before room messages are accepted again
//! - Encrypted payloads with a lenient decrypt path
//! - Sanitized, ordered transcripts with atomic history replacement
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - Each session is a task owning the live `HubLink`
//! - `SessionManager` talks to it over a command channel and observes
//!   its state through a `watch` channel
//! - Everything the session sees is published in order on one event
//!   channel, which `ChatClient` turns into `ChatUpdate`s
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use hub_chat_client::{ChannelKind, ChatClient, ChatScope, ClientConfig, RoomId, WebSocketConnector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), hub_chat_client::ChatError> {
//!     let config = ClientConfig::from_env()?;
//!     let session = config.session_manager(Arc::new(WebSocketConnector));
//!     let scope = ChatScope::Room(RoomId::from("lobby"));
//!     let mut client = ChatClient::new(session, config.codec()?, "alice", scope);
//!
//!     client.connect(config.descriptor(ChannelKind::Room)?).await?;
//!     while let Some(update) = client.next_update().await {
//!         println!("{:?}", update);
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod membership;
pub mod memory;
pub mod message;
pub mod negotiate;
pub mod router;
pub mod session;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use client::{ChatClient, ChatScope, ChatUpdate, Notice, NoticeLevel};
pub use config::{ChannelKind, ClientConfig};
pub use crypto::{EncryptionCodec, EncryptionKey, KeySource, SharedSecret};
pub use error::{ChatError, ErrorKind};
pub use membership::{MembershipController, RoomMembership};
pub use memory::{HubPeer, MemoryConnector};
pub use message::{ClientFrame, HistoryEntry, HubEvent, Invocation, ServerFrame};
pub use negotiate::{resolve, ConnectionDescriptor, TransportKind, WireEncoding};
pub use router::{MessageEnvelope, MessageRouter, Routed, Transcript};
pub use session::{
    ChatSession, PendingInvocation, RetryPolicy, SessionEvent, SessionEvents, SessionManager,
};
pub use transport::{Anonymous, Connector, CredentialProvider, HubLink, StaticToken, WebSocketConnector};
pub use types::{ConnectionState, Direction, RoomId, SessionId};
