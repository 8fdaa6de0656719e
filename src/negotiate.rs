//! Transport negotiation
//!
//! Resolves the transport kind and wire encoding the caller asked for into a
//! `ConnectionDescriptor`. Resolution is pure: every combination is legal and
//! the descriptor is handed to the session manager as-is.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

/// Underlying duplex mechanism used to carry hub traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Persistent full-duplex socket
    #[default]
    WebSockets,
    /// Server-initiated push stream
    ServerSentEvents,
    /// Polling fallback
    LongPolling,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::WebSockets => "websockets",
            TransportKind::ServerSentEvents => "server-sent-events",
            TransportKind::LongPolling => "long-polling",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "websockets" | "websocket" | "ws" => Ok(TransportKind::WebSockets),
            "server-sent-events" | "sse" => Ok(TransportKind::ServerSentEvents),
            "long-polling" | "polling" => Ok(TransportKind::LongPolling),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

/// Serialization format for hub frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireEncoding {
    /// Human-readable structured text (JSON text frames)
    #[default]
    Text,
    /// Compact binary (bincode binary frames)
    Binary,
}

impl WireEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            WireEncoding::Text => "text",
            WireEncoding::Binary => "binary",
        }
    }
}

impl std::fmt::Display for WireEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "json" => Ok(WireEncoding::Text),
            "binary" | "msgpack" => Ok(WireEncoding::Binary),
            other => Err(format!("unknown encoding '{}'", other)),
        }
    }
}

/// Everything the session manager needs to dial the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub endpoint: Url,
    pub transport: TransportKind,
    pub encoding: WireEncoding,
}

impl ConnectionDescriptor {
    /// URL actually dialled for this descriptor
    ///
    /// Socket transports get the `ws`/`wss` scheme. The transport and
    /// encoding are advertised as query parameters.
    pub fn connect_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        if self.transport == TransportKind::WebSockets {
            let scheme = match url.scheme() {
                "http" => Some("ws"),
                "https" => Some("wss"),
                _ => None,
            };
            if let Some(scheme) = scheme {
                // http(s) -> ws(s) stays within the special schemes, so this cannot fail
                let _ = url.set_scheme(scheme);
            }
        }
        url.query_pairs_mut()
            .append_pair("transport", self.transport.as_str())
            .append_pair("encoding", self.encoding.as_str());
        url
    }
}

/// Resolve a connection descriptor from the caller's preferences
pub fn resolve(
    endpoint: &Url,
    transport: TransportKind,
    encoding: WireEncoding,
) -> ConnectionDescriptor {
    ConnectionDescriptor {
        endpoint: endpoint.clone(),
        transport,
        encoding,
    }
}
