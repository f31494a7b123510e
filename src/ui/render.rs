//! Line rendering for store events and connection status.

use console::style;

use crate::backoff::PolicyPhase;
use crate::manager::{ConnectionState, ConnectionStatus};
use crate::store::{MessageStatus, Role, StoreEvent};
use crate::ui::icons::{
    ASSISTANT, CROSS, FOLDER, LINK_DOWN, LINK_UP, LINK_WAIT, PROGRESS, SYSTEM, TYPING, WARN,
};

const BAR_WIDTH: usize = 20;

/// One terminal line for a store change, or `None` when nothing should be
/// printed (the user's own messages, successful delivery, typing stopped).
pub fn render_event(event: &StoreEvent) -> Option<String> {
    match event {
        StoreEvent::ChatAppended(message) => match message.role {
            Role::User => None,
            Role::Assistant => Some(format!("{}{}", ASSISTANT, style(&message.content).cyan())),
            Role::System if message.status == MessageStatus::Error => {
                Some(format!("{}{}", SYSTEM, style(&message.content).red()))
            }
            Role::System => Some(format!("{}{}", SYSTEM, style(&message.content).dim())),
        },
        StoreEvent::ChatStatus {
            id,
            status: MessageStatus::Error,
        } => Some(format!(
            "{}{}",
            CROSS,
            style(format!("message {} was not delivered", id)).red()
        )),
        StoreEvent::ChatStatus { .. } => None,
        StoreEvent::Progress(entry) => Some(format!(
            "{}[{}] {:>3}% {}{}",
            PROGRESS,
            progress_bar(entry.progress),
            entry.progress,
            style(&entry.step).yellow(),
            if entry.message.is_empty() {
                String::new()
            } else {
                format!(": {}", entry.message)
            }
        )),
        StoreEvent::ProjectUpserted { project, is_new } => Some(format!(
            "{}project {} [{}]{}",
            FOLDER,
            style(&project.name).bold(),
            project.status,
            if *is_new {
                style(" now active").green().to_string()
            } else {
                String::new()
            }
        )),
        StoreEvent::Typing(true) => Some(format!("{}{}", TYPING, style("engine is typing...").dim())),
        StoreEvent::Typing(false) => None,
        StoreEvent::Notice(notice) if notice.persistent => Some(format!(
            "{}{}",
            CROSS,
            style(&notice.message).red().bold()
        )),
        StoreEvent::Notice(notice) => Some(format!("{}{}", WARN, style(&notice.message).yellow())),
        StoreEvent::Connection(state) => Some(format!(
            "{}{}",
            state_icon(*state),
            style(format!("connection {}", state)).dim()
        )),
    }
}

pub fn render_status(status: &ConnectionStatus) -> String {
    let phase = match status.phase {
        PolicyPhase::GivenUp => style(status.phase.to_string()).red().to_string(),
        PolicyPhase::Waiting => style(status.phase.to_string()).yellow().to_string(),
        _ => status.phase.to_string(),
    };
    format!(
        "{}{}\n  endpoint: {}\n  session:  {}\n  phase:    {}\n  attempts: {}/{}\n  queued:   {}\n  timers:   {}",
        state_icon(status.state),
        style(status.state.to_string()).bold(),
        status.endpoint,
        status.session_id,
        phase,
        status.attempts,
        status.max_attempts,
        status.queued,
        status.pending_timers,
    )
}

fn state_icon(state: ConnectionState) -> console::Emoji<'static, 'static> {
    match state {
        ConnectionState::Connected => LINK_UP,
        ConnectionState::Connecting => LINK_WAIT,
        ConnectionState::Disconnected | ConnectionState::Error => LINK_DOWN,
    }
}

fn progress_bar(percent: u8) -> String {
    let filled = (percent.min(100) as usize * BAR_WIDTH) / 100;
    format!("{}{}", "█".repeat(filled), "░".repeat(BAR_WIDTH - filled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChatMessage, ErrorNotice, ProgressEntry};
    use chrono::Utc;
    use console::strip_ansi_codes;

    fn plain(event: &StoreEvent) -> Option<String> {
        render_event(event).map(|line| strip_ansi_codes(&line).to_string())
    }

    fn chat(role: Role, content: &str) -> ChatMessage {
        ChatMessage {
            id: "m1".to_string(),
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
            status: MessageStatus::Received,
        }
    }

    #[test]
    fn test_own_messages_are_not_echoed() {
        assert_eq!(plain(&StoreEvent::ChatAppended(chat(Role::User, "hi"))), None);
        let line = plain(&StoreEvent::ChatAppended(chat(Role::Assistant, "hello"))).unwrap();
        assert!(line.ends_with("hello"));
    }

    #[test]
    fn test_progress_line_has_bar_and_percent() {
        let line = plain(&StoreEvent::Progress(ProgressEntry {
            id: "p".to_string(),
            step: "analyzing".to_string(),
            progress: 50,
            total: None,
            message: "Reading request".to_string(),
            timestamp: Utc::now(),
        }))
        .unwrap();
        assert!(line.contains(" 50% analyzing: Reading request"));
        assert_eq!(line.matches('█').count(), BAR_WIDTH / 2);
    }

    #[test]
    fn test_typing_only_rendered_when_started() {
        assert!(plain(&StoreEvent::Typing(true)).is_some());
        assert!(plain(&StoreEvent::Typing(false)).is_none());
    }

    #[test]
    fn test_notice_and_delivery_failure() {
        let line = plain(&StoreEvent::Notice(ErrorNotice::persistent("gave up"))).unwrap();
        assert!(line.contains("gave up"));
        let line = plain(&StoreEvent::ChatStatus {
            id: "m9".to_string(),
            status: MessageStatus::Error,
        })
        .unwrap();
        assert!(line.contains("m9 was not delivered"));
        assert!(
            plain(&StoreEvent::ChatStatus {
                id: "m9".to_string(),
                status: MessageStatus::Sent,
            })
            .is_none()
        );
    }

    #[test]
    fn test_status_block() {
        let status = ConnectionStatus {
            state: ConnectionState::Error,
            phase: PolicyPhase::Waiting,
            attempts: 2,
            max_attempts: 5,
            session_id: "user-1-abc".to_string(),
            endpoint: "ws://localhost:8087".to_string(),
            queued: 3,
            pending_timers: 1,
        };
        let text = strip_ansi_codes(&render_status(&status)).to_string();
        assert!(text.contains("error"));
        assert!(text.contains("attempts: 2/5"));
        assert!(text.contains("queued:   3"));
        assert!(text.contains("session:  user-1-abc"));
    }
}
