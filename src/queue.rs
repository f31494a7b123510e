//! Outbound queue for sends issued while disconnected.
//!
//! Delivery is at-least-once per connected session from the client's
//! point of view: nothing is deduplicated across reconnects, and the engine
//! is the source of truth for idempotency.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use crate::errors::TransportError;

/// A user message waiting for a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    /// Id of the optimistic chat record rendered with status `sending`
    pub id: String,
    pub content: String,
    pub project_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

/// Result of a flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Ids sent, in send order
    pub sent: Vec<String>,
    /// Items left queued because a send failed
    pub remaining: usize,
}

#[derive(Debug, Default)]
pub struct OutboundQueue {
    items: VecDeque<PendingMessage>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, message: PendingMessage) {
        self.items.push_back(message);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingMessage> {
        self.items.iter()
    }

    /// Send queued items in insertion order. On the first failure the
    /// failed item and everything after it stay queued.
    pub async fn flush<S>(&mut self, sink: &mut S) -> FlushReport
    where
        S: PendingSink + ?Sized,
    {
        let mut report = FlushReport::default();
        while let Some(item) = self.items.front() {
            match sink.send_pending(item).await {
                Ok(()) => {
                    if let Some(sent) = self.items.pop_front() {
                        report.sent.push(sent.id);
                    }
                }
                Err(e) => {
                    tracing::warn!(message_id = %item.id, error = %e, "Flush interrupted, keeping remaining messages queued");
                    break;
                }
            }
        }
        report.remaining = self.items.len();
        report
    }
}

/// Destination for flushed messages.
#[async_trait]
pub trait PendingSink: Send {
    async fn send_pending(&mut self, message: &PendingMessage) -> Result<(), TransportError>;
}
