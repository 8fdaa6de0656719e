//! Error types for the chat client
//!
//! A single `ChatError` covers transport, membership, crypto and
//! configuration failures. `ErrorKind` groups them the way the consumer
//! layer reacts to them.

use thiserror::Error;

use crate::negotiate::TransportKind;
use crate::types::{ConnectionState, RoomId};

/// Client-level errors
#[derive(Debug, Error)]
pub enum ChatError {
    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary frame serialization/deserialization error
    #[error("Binary serialization error: {0}")]
    Binary(#[from] bincode::Error),

    /// Configuration file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Endpoint could not be parsed
    #[error("Invalid endpoint URL: {0}")]
    Url(#[from] url::ParseError),

    /// Payload was not valid base64
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Transport handshake was refused or failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The connector cannot carry this transport kind
    #[error("Transport '{0}' is not supported by this connector")]
    UnsupportedTransport(TransportKind),

    /// Frame arrived in the wrong encoding
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invocation attempted while the session is not Connected
    #[error("Not connected (session is {0})")]
    NotConnected(ConnectionState),

    /// Transport went away while an invocation was in flight
    #[error("Connection closed")]
    ConnectionClosed,

    /// Session actor is no longer running
    #[error("Session task has stopped")]
    SessionClosed,

    /// Hub answered an invocation with an error
    #[error("{target} failed: {message}")]
    Invocation {
        target: &'static str,
        message: String,
    },

    /// Hub did not answer an invocation in time
    #[error("{0} timed out")]
    InvocationTimeout(&'static str),

    /// Room send attempted without an acknowledged join
    #[error("Not joined to room {0}")]
    NotJoined(RoomId),

    /// Room operation attempted with no room selected
    #[error("No room selected")]
    NoRoom,

    /// Reconnect backoff sequence ran out
    #[error("Reconnection gave up after {attempts} attempts")]
    RetriesExhausted { attempts: usize },

    /// Key source produced unusable key material
    #[error("Invalid key material: {0}")]
    KeyMaterial(String),

    /// AEAD encryption failed
    #[error("Encryption failed")]
    Encryption,

    /// AEAD decryption failed (never surfaced by the codec's lenient path)
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Refused to send an empty message
    #[error("Message is empty")]
    EmptyMessage,

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

/// How the consumer layer should treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect, handshake, mid-session close, send while not connected
    Transport,
    /// Join/leave failures and room sends without membership
    Membership,
    /// Key material or encryption failures
    Crypto,
    /// Reconnect attempts exhausted; session is over
    Exhausted,
    /// Malformed frames and invalid input
    Protocol,
    /// Bad configuration
    Config,
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::WebSocket(_)
            | ChatError::Handshake(_)
            | ChatError::UnsupportedTransport(_)
            | ChatError::NotConnected(_)
            | ChatError::ConnectionClosed
            | ChatError::SessionClosed
            | ChatError::InvocationTimeout(_) => ErrorKind::Transport,
            // Hub refused a join or leave
            ChatError::Invocation {
                target: "JoinRoom" | "LeaveRoom",
                ..
            } => ErrorKind::Membership,
            ChatError::Invocation { .. } => ErrorKind::Transport,
            ChatError::NotJoined(_) | ChatError::NoRoom => ErrorKind::Membership,
            ChatError::KeyMaterial(_) | ChatError::Encryption | ChatError::Decryption(_) => {
                ErrorKind::Crypto
            }
            ChatError::RetriesExhausted { .. } => ErrorKind::Exhausted,
            ChatError::Json(_)
            | ChatError::Binary(_)
            | ChatError::Base64(_)
            | ChatError::Protocol(_)
            | ChatError::EmptyMessage => ErrorKind::Protocol,
            ChatError::Io(_) | ChatError::Url(_) | ChatError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the session cannot continue without a new `connect`
    pub fn is_terminal(&self) -> bool {
        self.kind() == ErrorKind::Exhausted
    }
}
