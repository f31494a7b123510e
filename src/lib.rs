//! Realtime connection layer between a conversational client and the
//! project-generation engine.
//!
//! The [`manager::ConnectionManager`] owns a single WebSocket link and keeps
//! it alive with capped exponential backoff and application-level
//! ping/pong. Inbound frames go through [`dispatcher`] into an
//! [`store::AppStore`]; sends issued while offline wait in the
//! [`queue::OutboundQueue`] until the next successful open.

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod manager;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod store;
pub mod timers;
pub mod transport;
pub mod ui;
