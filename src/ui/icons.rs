//! Shared UI icons.
//!
//! Each icon carries a plain-text fallback for terminals without emoji.

use console::Emoji;

// Connection indicators
pub static LINK_UP: Emoji<'_, '_> = Emoji("🟢 ", "[UP]");
pub static LINK_DOWN: Emoji<'_, '_> = Emoji("🔴 ", "[DOWN]");
pub static LINK_WAIT: Emoji<'_, '_> = Emoji("🟡 ", "[..]");

// Conversation indicators
pub static ASSISTANT: Emoji<'_, '_> = Emoji("🤖 ", ">");
pub static SYSTEM: Emoji<'_, '_> = Emoji("⚙️  ", "#");
pub static TYPING: Emoji<'_, '_> = Emoji("💭 ", "...");
pub static QUEUED: Emoji<'_, '_> = Emoji("📮 ", "[Q]");

// Status indicators
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[!]");
pub static PROGRESS: Emoji<'_, '_> = Emoji("📊 ", "[PROG]");
pub static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");
