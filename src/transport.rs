//! Transport seam
//!
//! A [`Connector`] dials the hub described by a `ConnectionDescriptor` and
//! returns a [`HubLink`]: a pair of channels carrying decoded frames, with
//! the socket I/O running in background tasks. The session manager only
//! ever talks to links, so tests can swap in the in-memory connector.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

use crate::error::ChatError;
use crate::message::{decode_frame, encode_frame, ClientFrame, ServerFrame};
use crate::negotiate::{ConnectionDescriptor, TransportKind};

/// Frame buffer size in each direction of a link
pub const LINK_BUFFER_SIZE: usize = 32;

/// Live connection to the hub
///
/// Dropping the link aborts its reader task and closes the outbound
/// channel, which lets the writer send a close frame and exit.
#[derive(Debug)]
pub struct HubLink {
    pub(crate) outbound: mpsc::Sender<ClientFrame>,
    pub(crate) inbound: mpsc::Receiver<ServerFrame>,
    tasks: Vec<AbortHandle>,
}

impl HubLink {
    pub fn new(outbound: mpsc::Sender<ClientFrame>, inbound: mpsc::Receiver<ServerFrame>) -> Self {
        Self {
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }

    /// Tie a background task's lifetime to this link
    pub fn with_task(mut self, task: AbortHandle) -> Self {
        self.tasks.push(task);
        self
    }
}

impl Drop for HubLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Dials the hub
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        token: Option<&str>,
    ) -> Result<HubLink, ChatError>;
}

/// Supplies the bearer token for each connection attempt
///
/// Called again before every retry so a refreshed token is used.
#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    async fn bearer_token(&self) -> Result<Option<String>, ChatError>;
}

/// No credentials (guest access to the public channel)
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

#[async_trait]
impl CredentialProvider for Anonymous {
    async fn bearer_token(&self) -> Result<Option<String>, ChatError> {
        Ok(None)
    }
}

/// Fixed bearer token issued by the identity service
#[derive(Clone)]
pub struct StaticToken(pub String);

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(<redacted>)")
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn bearer_token(&self) -> Result<Option<String>, ChatError> {
        Ok(Some(self.0.clone()))
    }
}

/// Full-duplex socket connector built on tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        token: Option<&str>,
    ) -> Result<HubLink, ChatError> {
        if descriptor.transport != TransportKind::WebSockets {
            return Err(ChatError::UnsupportedTransport(descriptor.transport));
        }

        let url = descriptor.connect_url();
        let mut request = url.as_str().into_client_request()?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ChatError::Handshake(format!("invalid bearer token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        // WebSocket handshake
        let (ws_stream, response) = tokio_tungstenite::connect_async(request).await?;
        debug!("Connected to {} (HTTP {})", url, response.status());
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(LINK_BUFFER_SIZE);
        let (in_tx, in_rx) = mpsc::channel::<ServerFrame>(LINK_BUFFER_SIZE);
        let encoding = descriptor.encoding;

        // Spawn read task (WebSocket -> ServerFrame)
        let read_task = tokio::spawn(async move {
            while let Some(msg_result) = ws_receiver.next().await {
                match msg_result {
                    Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                        match decode_frame(encoding, msg) {
                            Ok(frame) => {
                                if in_tx.send(frame).await.is_err() {
                                    debug!("Link dropped, ending read task");
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Invalid frame from hub: {}", e);
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!("Hub sent close frame: {:?}", frame);
                        // A normal closure is final; anything else counts as a lost transport
                        if matches!(&frame, Some(f) if f.code == CloseCode::Normal) {
                            let _ = in_tx
                                .send(ServerFrame::Close {
                                    error: None,
                                    allow_reconnect: false,
                                })
                                .await;
                        }
                        break;
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                        // Pong replies are handled by tungstenite
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
            debug!("Read task ended");
        });

        // Spawn write task (ClientFrame -> WebSocket)
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match encode_frame(encoding, &frame) {
                    Ok(msg) => {
                        if ws_sender.send(msg).await.is_err() {
                            debug!("WebSocket send failed, ending write task");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Failed to serialize frame: {}", e);
                    }
                }
            }
            debug!("Write task ended");

            // Send close frame when done
            let _ = ws_sender.close().await;
        });

        Ok(HubLink::new(out_tx, in_rx).with_task(read_task.abort_handle()))
    }
}
