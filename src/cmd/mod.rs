//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `chat`   | `Chat`, `Send`   |
//! | `engine` | `Engine`         |
//! | `config` | `Config`         |

pub mod chat;
pub mod config;
pub mod engine;

pub use chat::{cmd_chat, cmd_send};
pub use config::cmd_config;
pub use engine::cmd_engine;
