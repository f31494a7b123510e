//! Application state store written to by the dispatcher and the manager.
//!
//! [`AppStore`] is the seam: every effect is one method call, and
//! implementations must apply each call atomically. [`ConversationStore`] is
//! the in-memory implementation used by the CLI; it also broadcasts a
//! [`StoreEvent`] after every mutation so a front end can render changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::manager::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Lenient parse; anything unrecognised is treated as the assistant.
    pub fn parse_lenient(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "user" => Role::User,
            "system" => Role::System,
            _ => Role::Assistant,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Received,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub id: String,
    pub step: String,
    /// Completion percentage, always within 0..=100
    pub progress: u8,
    #[serde(default)]
    pub total: Option<u64>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub version: String,
    #[serde(rename = "lastModified")]
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
    /// Fields the client does not model (architecture, etc.)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Partial project record as carried by a `project_update` frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectPatch {
    pub id: String,
    pub name: Option<String>,
    pub kind: Option<String>,
    pub status: Option<String>,
    pub version: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub extra: Map<String, Value>,
}

impl ProjectPatch {
    fn into_project(self) -> Project {
        Project {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            kind: self.kind.unwrap_or_else(|| "unknown".to_string()),
            status: self.status.unwrap_or_else(|| "idle".to_string()),
            version: self.version.unwrap_or_else(|| "0.1.0".to_string()),
            last_modified: self.last_modified.unwrap_or_else(Utc::now),
            description: self.description,
            extra: self.extra,
        }
    }

    fn apply_to(self, project: &mut Project) {
        if let Some(name) = self.name {
            project.name = name;
        }
        if let Some(kind) = self.kind {
            project.kind = kind;
        }
        if let Some(status) = self.status {
            project.status = status;
        }
        if let Some(version) = self.version {
            project.version = version;
        }
        project.last_modified = self.last_modified.unwrap_or_else(Utc::now);
        if self.description.is_some() {
            project.description = self.description;
        }
        project.extra.extend(self.extra);
    }
}

/// User-visible error notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
    /// Stays visible until the user acts (e.g. "cannot connect")
    pub persistent: bool,
    pub timestamp: DateTime<Utc>,
}

impl ErrorNotice {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            persistent: false,
            timestamp: Utc::now(),
        }
    }

    pub fn persistent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            persistent: true,
            timestamp: Utc::now(),
        }
    }
}

/// State-update interface consumed by the dispatcher and the manager.
pub trait AppStore: Send + Sync {
    fn append_chat(&self, message: ChatMessage);
    fn update_chat_status(&self, id: &str, status: MessageStatus);
    fn append_progress(&self, entry: ProgressEntry);
    /// Insert or merge a project. Returns `true` when the id was unseen, in
    /// which case the project also becomes the active one.
    fn upsert_project(&self, patch: ProjectPatch) -> bool;
    fn set_typing(&self, typing: bool);
    fn notify_error(&self, notice: ErrorNotice);
    /// Post a notice together with the system chat record describing it.
    /// Both land under one update.
    fn report_error(&self, notice: ErrorNotice, message: ChatMessage);
    fn set_connection_state(&self, state: ConnectionState);
}

/// Change notification emitted by [`ConversationStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    ChatAppended(ChatMessage),
    ChatStatus { id: String, status: MessageStatus },
    Progress(ProgressEntry),
    ProjectUpserted { project: Project, is_new: bool },
    Typing(bool),
    Notice(ErrorNotice),
    Connection(ConnectionState),
}

/// Snapshot of everything the store holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationState {
    pub messages: Vec<ChatMessage>,
    pub progress: Vec<ProgressEntry>,
    pub projects: Vec<Project>,
    pub current_project: Option<String>,
    pub is_typing: bool,
    pub connection: ConnectionState,
    pub notices: Vec<ErrorNotice>,
}

impl ConversationState {
    pub fn current_project(&self) -> Option<&Project> {
        let id = self.current_project.as_deref()?;
        self.projects.iter().find(|p| p.id == id)
    }
}

const EVENT_CAPACITY: usize = 256;

/// Shared in-memory store.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<Mutex<ConversationState>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(ConversationState::default())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> ConversationState {
        self.lock().clone()
    }

    pub fn current_project_id(&self) -> Option<String> {
        self.lock().current_project.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ConversationState> {
        // A panic while holding the lock cannot leave a half-applied update:
        // every mutation below is a single push/assign.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mutate under the lock and publish the resulting event before
    /// releasing it, so subscribers see events in mutation order.
    fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut ConversationState) -> Option<StoreEvent>,
    {
        let mut state = self.lock();
        if let Some(event) = f(&mut state) {
            let _ = self.events.send(event); // Ignore error if no receivers
        }
    }
}

impl AppStore for ConversationStore {
    fn append_chat(&self, message: ChatMessage) {
        self.mutate(|state| {
            state.messages.push(message.clone());
            Some(StoreEvent::ChatAppended(message))
        });
    }

    fn update_chat_status(&self, id: &str, status: MessageStatus) {
        self.mutate(|state| {
            let message = state.messages.iter_mut().find(|m| m.id == id)?;
            message.status = status;
            Some(StoreEvent::ChatStatus {
                id: id.to_string(),
                status,
            })
        });
    }

    fn append_progress(&self, entry: ProgressEntry) {
        self.mutate(|state| {
            state.progress.push(entry.clone());
            Some(StoreEvent::Progress(entry))
        });
    }

    fn upsert_project(&self, patch: ProjectPatch) -> bool {
        let mut inserted = false;
        self.mutate(|state| {
            let project = match state.projects.iter_mut().find(|p| p.id == patch.id) {
                Some(existing) => {
                    patch.apply_to(existing);
                    existing.clone()
                }
                None => {
                    let project = patch.into_project();
                    state.current_project = Some(project.id.clone());
                    state.projects.push(project.clone());
                    inserted = true;
                    project
                }
            };
            Some(StoreEvent::ProjectUpserted {
                project,
                is_new: inserted,
            })
        });
        inserted
    }

    fn set_typing(&self, typing: bool) {
        self.mutate(|state| {
            state.is_typing = typing;
            Some(StoreEvent::Typing(typing))
        });
    }

    fn notify_error(&self, notice: ErrorNotice) {
        self.mutate(|state| {
            state.notices.push(notice.clone());
            Some(StoreEvent::Notice(notice))
        });
    }

    fn report_error(&self, notice: ErrorNotice, message: ChatMessage) {
        let mut state = self.lock();
        state.notices.push(notice.clone());
        state.messages.push(message.clone());
        let _ = self.events.send(StoreEvent::Notice(notice));
        let _ = self.events.send(StoreEvent::ChatAppended(message));
    }

    fn set_connection_state(&self, connection: ConnectionState) {
        self.mutate(|state| {
            if state.connection == connection {
                return None;
            }
            state.connection = connection;
            Some(StoreEvent::Connection(connection))
        });
    }
}
