//! Hub wire protocol
//!
//! Client → hub invocations and hub → client events, plus the frame codec
//! for both wire encodings. Text frames carry JSON, binary frames carry
//! bincode. Enums are externally tagged so the same types serialize under
//! both formats.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use crate::error::ChatError;
use crate::negotiate::WireEncoding;
use crate::types::RoomId;

/// Remote hub operations this client invokes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invocation {
    /// Establish display identity on the public channel
    SetUsername { username: String },
    /// Enter a scoped room
    JoinRoom { room_id: RoomId },
    /// Leave a scoped room
    LeaveRoom { room_id: RoomId },
    /// Post to the public channel
    SendMessage { ciphertext: String },
    /// Post to a scoped room
    SendMessageToRoom { room_id: RoomId, ciphertext: String },
}

impl Invocation {
    /// Hub method name
    pub fn target(&self) -> &'static str {
        match self {
            Invocation::SetUsername { .. } => "SetUsername",
            Invocation::JoinRoom { .. } => "JoinRoom",
            Invocation::LeaveRoom { .. } => "LeaveRoom",
            Invocation::SendMessage { .. } => "SendMessage",
            Invocation::SendMessageToRoom { .. } => "SendMessageToRoom",
        }
    }
}

/// One message of a room history snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(alias = "username")]
    pub sender: String,
    #[serde(alias = "message")]
    pub payload: String,
}

impl HistoryEntry {
    pub fn new(sender: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            payload: payload.into(),
        }
    }
}

/// Events pushed by the hub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubEvent {
    /// Single message on the channel this connection serves
    ReceiveMessage { sender: String, payload: String },
    /// Full transcript snapshot, sent on join/rejoin
    RoomHistory {
        room_id: RoomId,
        batch: Vec<HistoryEntry>,
    },
}

/// Client → hub frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientFrame {
    /// Invoke a hub method; answered by a `ServerFrame::Completion`
    Invoke { invocation_id: u64, call: Invocation },
    /// Keep-alive
    Ping,
}

/// Hub → client frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerFrame {
    /// Acknowledgement (or rejection, when `error` is set) of an invocation
    Completion {
        invocation_id: u64,
        error: Option<String>,
    },
    /// Pushed event
    Event(HubEvent),
    /// Keep-alive
    Ping,
    /// Hub is closing the connection
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

/// Serialize a client frame into a WebSocket message
pub fn encode_frame(encoding: WireEncoding, frame: &ClientFrame) -> Result<Message, ChatError> {
    match encoding {
        WireEncoding::Text => Ok(Message::Text(serde_json::to_string(frame)?.into())),
        WireEncoding::Binary => Ok(Message::Binary(bincode::serialize(frame)?.into())),
    }
}

/// Deserialize a hub frame from a WebSocket data message
pub fn decode_frame(encoding: WireEncoding, msg: Message) -> Result<ServerFrame, ChatError> {
    match (encoding, msg) {
        (WireEncoding::Text, Message::Text(text)) => Ok(serde_json::from_str(&text)?),
        (WireEncoding::Binary, Message::Binary(data)) => Ok(bincode::deserialize(&data)?),
        (encoding, other) => Err(ChatError::Protocol(format!(
            "unexpected {} frame under {} encoding",
            frame_kind(&other),
            encoding
        ))),
    }
}

fn frame_kind(msg: &Message) -> &'static str {
    match msg {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "raw",
    }
}
