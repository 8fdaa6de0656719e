//! Client configuration
//!
//! Loaded from a JSON file body or from `CHAT_*` environment variables,
//! with defaults pointing at a local development hub.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::crypto::{EncryptionCodec, SharedSecret};
use crate::error::ChatError;
use crate::negotiate::{resolve, ConnectionDescriptor, TransportKind, WireEncoding};
use crate::session::{RetryPolicy, SessionManager};
use crate::transport::{Anonymous, Connector, CredentialProvider, StaticToken};

const DEFAULT_PUBLIC_HUB: &str = "http://localhost:5214/publicchathub";
const DEFAULT_ROOM_HUB: &str = "http://localhost:5214/privatechathub";

/// Which hub endpoint to dial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Public,
    Room,
}

/// Connection settings for the chat client
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Public channel endpoint
    pub public_hub: String,
    /// Room channel endpoint
    pub room_hub: String,
    pub transport: TransportKind,
    pub encoding: WireEncoding,
    /// Reconnect delays in milliseconds; empty disables reconnecting
    pub reconnect_delays_ms: Vec<u64>,
    pub invoke_timeout_ms: u64,
    /// Base64 32-byte pre-shared message key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<String>,
    /// Static bearer token for authenticated hubs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            public_hub: DEFAULT_PUBLIC_HUB.to_string(),
            room_hub: DEFAULT_ROOM_HUB.to_string(),
            transport: TransportKind::default(),
            encoding: WireEncoding::default(),
            reconnect_delays_ms: vec![0, 2_000, 10_000, 30_000],
            invoke_timeout_ms: 30_000,
            shared_secret: None,
            access_token: None,
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("public_hub", &self.public_hub)
            .field("room_hub", &self.room_hub)
            .field("transport", &self.transport)
            .field("encoding", &self.encoding)
            .field("reconnect_delays_ms", &self.reconnect_delays_ms)
            .field("invoke_timeout_ms", &self.invoke_timeout_ms)
            .field("shared_secret", &self.shared_secret.as_ref().map(|_| "<redacted>"))
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ClientConfig {
    /// Defaults overridden by `CHAT_*` environment variables
    pub fn from_env() -> Result<Self, ChatError> {
        Self::default().apply_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ChatError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::default().apply_lookup(lookup)
    }

    /// Parse a JSON configuration body; missing keys take their defaults
    pub fn from_json(body: &str) -> Result<Self, ChatError> {
        Ok(serde_json::from_str(body)?)
    }

    /// Read a JSON configuration file, then apply `CHAT_*` environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ChatError> {
        let body = std::fs::read_to_string(path)?;
        Self::from_json(&body)?.apply_lookup(|key| std::env::var(key).ok())
    }

    /// Override fields from `CHAT_*` keys present in `lookup`
    pub fn apply_lookup<F>(mut self, lookup: F) -> Result<Self, ChatError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("CHAT_PUBLIC_HUB") {
            self.public_hub = value;
        }
        if let Some(value) = lookup("CHAT_ROOM_HUB") {
            self.room_hub = value;
        }
        if let Some(value) = lookup("CHAT_TRANSPORT") {
            self.transport = value.parse().map_err(ChatError::Config)?;
        }
        if let Some(value) = lookup("CHAT_ENCODING") {
            self.encoding = value.parse().map_err(ChatError::Config)?;
        }
        if let Some(value) = lookup("CHAT_RECONNECT_DELAYS") {
            self.reconnect_delays_ms = parse_delays(&value)?;
        }
        if let Some(value) = lookup("CHAT_INVOKE_TIMEOUT_MS") {
            self.invoke_timeout_ms = value
                .trim()
                .parse()
                .map_err(|e| ChatError::Config(format!("CHAT_INVOKE_TIMEOUT_MS: {}", e)))?;
        }
        if let Some(value) = lookup("CHAT_SHARED_SECRET") {
            self.shared_secret = Some(value);
        }
        if let Some(value) = lookup("CHAT_ACCESS_TOKEN") {
            self.access_token = Some(value);
        }
        Ok(self)
    }

    /// Endpoint for a channel, validated
    pub fn endpoint(&self, channel: ChannelKind) -> Result<Url, ChatError> {
        let raw = match channel {
            ChannelKind::Public => &self.public_hub,
            ChannelKind::Room => &self.room_hub,
        };
        Ok(Url::parse(raw)?)
    }

    pub fn descriptor(&self, channel: ChannelKind) -> Result<ConnectionDescriptor, ChatError> {
        let endpoint = self.endpoint(channel)?;
        Ok(resolve(&endpoint, self.transport, self.encoding))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_millis(&self.reconnect_delays_ms)
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }

    /// Message codec keyed by the configured shared secret
    ///
    /// The key itself is only decoded on first use.
    pub fn codec(&self) -> Result<EncryptionCodec, ChatError> {
        let secret = self
            .shared_secret
            .as_ref()
            .ok_or_else(|| ChatError::Config("no shared secret configured".to_string()))?;
        Ok(EncryptionCodec::from_secret(SharedSecret::from_base64(secret.clone())))
    }

    pub fn credentials(&self) -> Arc<dyn CredentialProvider> {
        match &self.access_token {
            Some(token) => Arc::new(StaticToken(token.clone())),
            None => Arc::new(Anonymous),
        }
    }

    /// Session manager using this configuration's retry policy and timeout
    pub fn session_manager(&self, connector: Arc<dyn Connector>) -> SessionManager {
        SessionManager::new(connector, self.credentials())
            .with_retry_policy(self.retry_policy())
            .with_invoke_timeout(self.invoke_timeout())
    }
}

/// Parse `"0, 2000, 10000"`; an empty string disables reconnecting
fn parse_delays(value: &str) -> Result<Vec<u64>, ChatError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u64>()
                .map_err(|e| ChatError::Config(format!("CHAT_RECONNECT_DELAYS '{}': {}", part, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.transport, TransportKind::WebSockets);
        assert_eq!(config.encoding, WireEncoding::Text);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.invoke_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.endpoint(ChannelKind::Room).unwrap().path(),
            "/privatechathub"
        );
    }

    #[test]
    fn test_lookup_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("CHAT_PUBLIC_HUB", "https://chat.example.com/publicchathub"),
            ("CHAT_TRANSPORT", "sse"),
            ("CHAT_ENCODING", "msgpack"),
            ("CHAT_RECONNECT_DELAYS", "0, 500"),
            ("CHAT_ACCESS_TOKEN", "jwt"),
        ]))
        .unwrap();

        assert_eq!(config.transport, TransportKind::ServerSentEvents);
        assert_eq!(config.encoding, WireEncoding::Binary);
        assert_eq!(config.reconnect_delays_ms, vec![0, 500]);
        assert_eq!(config.access_token.as_deref(), Some("jwt"));

        let descriptor = config.descriptor(ChannelKind::Public).unwrap();
        assert_eq!(descriptor.endpoint.host_str(), Some("chat.example.com"));
        assert_eq!(descriptor.transport, TransportKind::ServerSentEvents);
    }

    #[test]
    fn test_empty_delay_list_disables_reconnect() {
        let config = ClientConfig::from_lookup(lookup(&[("CHAT_RECONNECT_DELAYS", "")])).unwrap();
        assert!(config.retry_policy().is_disabled());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ClientConfig::from_lookup(lookup(&[("CHAT_TRANSPORT", "carrier-pigeon")])).unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));

        let err = ClientConfig::from_lookup(lookup(&[("CHAT_RECONNECT_DELAYS", "0,soon")])).unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));

        let config = ClientConfig::from_lookup(lookup(&[("CHAT_ROOM_HUB", "not a url")])).unwrap();
        assert!(matches!(config.descriptor(ChannelKind::Room), Err(ChatError::Url(_))));
    }

    #[test]
    fn test_from_json_partial() {
        let config = ClientConfig::from_json(
            r#"{ "room_hub": "http://hub.test/rooms", "transport": "long-polling", "invoke_timeout_ms": 5000 }"#,
        )
        .unwrap();
        assert_eq!(config.room_hub, "http://hub.test/rooms");
        assert_eq!(config.transport, TransportKind::LongPolling);
        assert_eq!(config.invoke_timeout(), Duration::from_secs(5));
        assert_eq!(config.public_hub, DEFAULT_PUBLIC_HUB);
    }

    #[test]
    fn test_missing_config_file_is_io_error() {
        let err = ClientConfig::from_file("/nonexistent/hub_chat_client.json").unwrap_err();
        assert!(matches!(err, ChatError::Io(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn test_codec_requires_secret() {
        assert!(matches!(ClientConfig::default().codec(), Err(ChatError::Config(_))));

        let config = ClientConfig {
            shared_secret: Some("c2VjcmV0".to_string()),
            ..ClientConfig::default()
        };
        assert!(config.codec().is_ok());
        assert!(!format!("{:?}", config).contains("c2VjcmV0"));
    }
}
