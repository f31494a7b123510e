//! Transport adapter seam.
//!
//! A [`Connector`] establishes a [`Link`]; the link owns exactly one
//! underlying socket and reports everything that happens to it as a
//! [`LinkEvent`]. Construction failures come back as `Err` from
//! [`Connector::connect`] and are treated by the manager exactly like an
//! `error` event.
//!
//! A link torn down by the manager is dropped immediately, so no event from
//! a deliberately closed link can ever reach the reconnection policy.

use async_trait::async_trait;

use crate::errors::TransportError;

mod ws;

#[cfg(test)]
pub(crate) mod mock;

pub use ws::WsConnector;

/// Close code for a normal, intentional shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when the peer vanished without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Close code sent when the keepalive deadline passes without a pong.
pub const CLOSE_KEEPALIVE_TIMEOUT: u16 = 4000;

/// Something that happened on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A text frame from the engine.
    Frame(String),
    /// The peer closed the connection (or it dropped: code 1006).
    Closed { code: u16, reason: String },
    /// Transport-level failure; the link is unusable afterwards.
    Error(String),
}

/// Opens links to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>, TransportError>;
}

/// One established connection.
#[async_trait]
pub trait Link: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Wait for the next event. Must be cancel-safe: the manager polls it
    /// inside `tokio::select!` and drops it whenever another input wins.
    async fn recv(&mut self) -> LinkEvent;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}
