//! Error types for the chat relay
//!
//! Defines connection-level, delivery, configuration and application errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::types::Username;

/// Errors raised by a single WebSocket connection
///
/// Every variant is scoped to one connection; none of them is fatal to the
/// broker.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Reading a frame from the socket failed
    #[error("read error: {0}")]
    Read(#[source] tokio_tungstenite::tungstenite::Error),

    /// Writing a frame to the socket failed
    #[error("write error: {0}")]
    Write(#[source] tokio_tungstenite::tungstenite::Error),

    /// Inbound frame was not the expected JSON shape
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// Outbound message could not be serialized
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// Write did not complete within the write deadline
    #[error("write timed out")]
    WriteTimeout,

    /// Peer sent a close frame, the stream ended, or the other half closed it
    #[error("connection closed")]
    Closed,
}

/// Mailbox delivery errors
///
/// Occurs when the registry cannot enqueue onto a session's mailbox.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Mailbox is at capacity (stalled writer), message dropped
    #[error("mailbox full")]
    MailboxFull,

    /// The writer has already exited
    #[error("mailbox closed")]
    MailboxClosed,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Application-level errors
///
/// Covers both fatal errors (listener setup) and per-connection failures
/// that are logged at the task boundary and never reported to other clients.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket upgrade failed
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error (fatal when binding)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// No username claim arrived within the handshake window
    #[error("no username claimed before handshake timeout")]
    HandshakeTimeout,

    /// First message was unreadable or not a username claim
    #[error("handshake failed: {0}")]
    HandshakeDecode(#[source] ConnectionError),

    /// Claimed username is not acceptable
    #[error("invalid username: {0:?}")]
    InvalidUsername(String),

    /// Username already held by an active session
    #[error("username '{0}' is already taken")]
    UsernameConflict(Username),

    /// Forward target is not an active session
    #[error("recipient '{0}' not found")]
    RecipientNotFound(Username),

    /// Registry actor has stopped (internal channel broken)
    #[error("registry closed")]
    RegistryClosed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}
