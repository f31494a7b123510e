//! Scripted connector for driving the manager under a paused clock.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{CLOSE_ABNORMAL, Connector, Link, LinkEvent};
use crate::errors::TransportError;

/// Outcome of the next connect call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Accept,
    Refuse,
    /// Record the attempt, then never finish the handshake.
    Stall,
}

/// One connect call as observed by the test.
pub struct Attempt {
    pub at: Instant,
    pub url: String,
    /// Present when the attempt was accepted.
    pub remote: Option<Remote>,
}

/// Test-side end of an accepted link.
pub struct Remote {
    pub inbound: mpsc::UnboundedSender<LinkEvent>,
    pub sent: mpsc::UnboundedReceiver<String>,
    pub closed: mpsc::UnboundedReceiver<(u16, String)>,
    pub fail_sends: Arc<AtomicBool>,
}

impl Remote {
    pub fn push_frame(&self, raw: &str) {
        let _ = self.inbound.send(LinkEvent::Frame(raw.to_string()));
    }

    pub fn drop_connection(&self) {
        let _ = self.inbound.send(LinkEvent::Closed {
            code: CLOSE_ABNORMAL,
            reason: String::new(),
        });
    }
}

#[derive(Clone)]
pub struct MockConnector {
    script: Arc<Mutex<VecDeque<Script>>>,
    attempts: mpsc::UnboundedSender<Attempt>,
}

impl MockConnector {
    /// Once the script runs out every connect is refused.
    pub fn new(script: &[Script]) -> (Self, mpsc::UnboundedReceiver<Attempt>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            script: Arc::new(Mutex::new(script.iter().copied().collect())),
            attempts: tx,
        };
        (connector, rx)
    }

    pub fn push(&self, step: Script) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(step);
        }
    }

    fn next_step(&self) -> Script {
        self.script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or(Script::Refuse)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>, TransportError> {
        let at = Instant::now();
        match self.next_step() {
            Script::Refuse => {
                let _ = self.attempts.send(Attempt {
                    at,
                    url: url.to_string(),
                    remote: None,
                });
                Err(TransportError::ConnectFailed {
                    url: url.to_string(),
                    message: "connection refused".to_string(),
                })
            }
            Script::Stall => {
                let _ = self.attempts.send(Attempt {
                    at,
                    url: url.to_string(),
                    remote: None,
                });
                std::future::pending().await
            }
            Script::Accept => {
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                let (sent_tx, sent_rx) = mpsc::unbounded_channel();
                let (closed_tx, closed_rx) = mpsc::unbounded_channel();
                let fail_sends = Arc::new(AtomicBool::new(false));
                let _ = self.attempts.send(Attempt {
                    at,
                    url: url.to_string(),
                    remote: Some(Remote {
                        inbound: inbound_tx,
                        sent: sent_rx,
                        closed: closed_rx,
                        fail_sends: fail_sends.clone(),
                    }),
                });
                Ok(Box::new(MockLink {
                    inbound: inbound_rx,
                    sent: sent_tx,
                    closed: closed_tx,
                    fail_sends,
                }))
            }
        }
    }
}

struct MockLink {
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
    sent: mpsc::UnboundedSender<String>,
    closed: mpsc::UnboundedSender<(u16, String)>,
    fail_sends: Arc<AtomicBool>,
}

#[async_trait]
impl Link for MockLink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("broken pipe".to_string()));
        }
        let _ = self.sent.send(frame);
        Ok(())
    }

    async fn recv(&mut self) -> LinkEvent {
        // A dropped Remote looks like the peer vanishing.
        self.inbound.recv().await.unwrap_or(LinkEvent::Closed {
            code: CLOSE_ABNORMAL,
            reason: "remote dropped".to_string(),
        })
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let _ = self.closed.send((code, reason.to_string()));
        Ok(())
    }
}
