//! The `error` module defines the error taxonomy used across `geobroker`.
//!
//! Every per-message failure is represented by a typed error so callers can
//! branch on it; none of these abort the broker. Only `StartupError` is fatal,
//! and only before the listeners are running.

use thiserror::Error;

/// Connection refused at CONNECT time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("bad username or password")]
    BadCredentials,
    #[error("client identifier rejected")]
    InvalidClientId,
    #[error("connection limit of {0} reached")]
    ServerFull(usize),
}

/// Authenticated decryption failed. Never carries key or plaintext bytes.
#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("ciphertext is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("ciphertext is shorter than nonce and tag")]
    Truncated,
    #[error("authentication failed (wrong key or corrupted data)")]
    Authentication,
}

/// Sealing a payload failed.
#[derive(Debug, Error)]
pub enum EncryptError {
    #[error("payload could not be sealed")]
    Seal,
}

/// Errors raised while building an outbound command payload.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("command encryption error: {0}")]
    Encrypt(#[from] EncryptError),
}

/// Errors raised while turning one application payload into an event.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("topic '{0}' does not identify a reporting user")]
    Topic(String),
    #[error("received encrypted payload but no encryption key is configured")]
    MissingKey,
    #[error("could not decrypt payload: {0}")]
    Decrypt(#[from] DecryptError),
    #[error("decrypted payload is itself an encrypted envelope")]
    NestedEnvelope,
}

/// MQTT frame decoding failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed packet")]
    MalformedPacket,
    #[error("invalid length")]
    InvalidLength,
    #[error("packet exceeds maximum size")]
    MaxSizeExceeded,
    #[error("unsupported packet type")]
    UnsupportedPacketType,
    #[error("invalid protocol name")]
    InvalidProtocol,
    #[error("unsupported protocol level")]
    UnsupportedProtocolLevel,
    #[error("reserved connect flag set")]
    ConnectReservedFlagSet,
    #[error("invalid utf-8 string")]
    Utf8Error,
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DecodeError {
    fn from(e: std::io::Error) -> Self {
        DecodeError::Io(e.to_string())
    }
}

/// MQTT frame encoding failures.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("packet id required for QoS > 0")]
    PacketIdRequired,
    #[error("string or payload field too long")]
    FieldTooLong,
    #[error("packet too large")]
    OverMaxPacketSize,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Socket-level failures. The session is torn down; nothing else is affected.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("keep-alive timeout")]
    KeepAlive,
}

/// Failures of the snapshot store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("record serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Conditions that stop the process before it starts serving.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}
