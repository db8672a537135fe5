//! Error types for the relay server
//!
//! One enum per concern, aggregated into `AppError` for the server and
//! binary. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Fatal to whatever produced them: a connection task, the server loop,
/// or the process.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal to the connection)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Relay channel failure
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// `serve` was called twice on the same server
    #[error("Server is already serving")]
    AlreadyServing,
}

/// Handshake rejection
///
/// User-visible as a refused upgrade; never logged as a server fault.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No `token` query parameter on the upgrade request
    #[error("Missing token")]
    MissingToken,

    /// Bad signature, malformed, expired, or without an id claim
    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

/// Malformed envelope from a connection or from the relay channel
///
/// Recovered by dropping the single message.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Envelope is not a JSON object")]
    NotAnObject,

    #[error("Missing type tag '{0}'")]
    MissingTag(String),

    #[error("Type tag '{0}' must be a string or an integer")]
    InvalidTag(String),

    #[error("Binary frame is not valid UTF-8")]
    NotUtf8,
}

/// Relay channel errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Redis connection or command failure
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The publisher task is gone (server stopped)
    #[error("Relay publisher closed")]
    PublisherClosed,

    /// The publish queue is at capacity
    #[error("Relay publish queue full")]
    QueueFull,

    /// A Redis connect or publish did not finish in time
    #[error("Relay operation timed out")]
    Timeout,

    /// Waiting out the backoff delay after a failure
    #[error("Relay reconnect pending")]
    Reconnecting,

    /// The subscription stream ended without a shutdown request
    #[error("Relay subscription lost")]
    SubscriptionLost,

    /// The subscriber gave up reconnecting
    #[error("Relay subscriber failed after {0} attempts")]
    RetriesExhausted(u32),

    #[error("Relay envelope encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Message send errors
///
/// Occurs when enqueueing an outbound message for a connection fails.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The connection's writer has gone away
    #[error("Channel closed")]
    ChannelClosed,

    /// The connection is not draining its queue fast enough
    #[error("Outbound queue full")]
    QueueFull,
}
