//! Typed error hierarchy for the realtime connection layer.
//!
//! Three top-level enums cover the three seams:
//! - `TransportError`: socket construction, send and close failures
//! - `DispatchError`: inbound frames that cannot be applied to the store
//! - `ConnectionError`: failures reported back to `ManagerHandle` callers

use thiserror::Error;

/// Errors from the transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid endpoint '{url}': {message}")]
    InvalidEndpoint { url: String, message: String },

    #[error("Failed to connect to {url}: {message}")]
    ConnectFailed { url: String, message: String },

    #[error("Connection to {url} timed out after {millis}ms")]
    ConnectTimeout { url: String, millis: u64 },

    #[error("Failed to send frame: {0}")]
    SendFailed(String),

    #[error("Transport is closed")]
    Closed,
}

/// Errors from applying an inbound envelope.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Frame has no string 'type' field")]
    MissingType,

    #[error("'{kind}' frame is missing field '{field}'")]
    MissingField { kind: String, field: String },

    #[error("'{kind}' frame has an invalid payload: {message}")]
    InvalidPayload { kind: String, message: String },
}

/// Errors surfaced to callers of the connection manager.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Not connected to the conversational engine")]
    NotConnected,

    #[error("Connection manager has shut down")]
    ManagerStopped,

    #[error("Failed to encode outbound frame: {0}")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
