//! Inbound message dispatch.
//!
//! A fixed table maps each `type` tag to a pure handler that reads fields
//! from the frame and applies exactly one store call. Liveness (`pong`) and
//! session confirmation (`connected`) never touch the store; they are
//! reported back to the manager through [`Dispatched`].
//!
//! Unknown tags and malformed payloads are logged and dropped; nothing here
//! can fail the caller.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::errors::DispatchError;
use crate::protocol::InboundEnvelope;
use crate::store::{
    AppStore, ChatMessage, ErrorNotice, MessageStatus, ProgressEntry, ProjectPatch, Role,
};

/// What the manager should do after a frame was dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// The store was updated.
    Applied,
    /// Keepalive answer; feeds the liveness check.
    Pong,
    /// Engine accepted the session, optionally assigning its own id.
    SessionConfirmed(Option<String>),
    /// Frame was dropped (unknown tag or bad payload).
    Ignored,
}

type Handler = fn(&Value, &dyn AppStore) -> Result<Dispatched, DispatchError>;

const ROUTES: &[(&str, Handler)] = &[
    ("message", apply_chat),
    ("chat_response", apply_chat),
    ("progress", apply_progress),
    ("project_update", apply_project_update),
    ("error", apply_error),
    ("typing", apply_typing),
    ("pong", ack_pong),
    ("connected", ack_connected),
];

fn route(kind: &str) -> Option<Handler> {
    ROUTES
        .iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, handler)| *handler)
}

/// Whether `kind` has a handler.
pub fn is_known(kind: &str) -> bool {
    route(kind).is_some()
}

/// Apply an envelope, surfacing handler errors to the caller.
pub fn try_dispatch(
    envelope: &InboundEnvelope,
    store: &dyn AppStore,
) -> Result<Dispatched, DispatchError> {
    match route(&envelope.kind) {
        Some(handler) => handler(&envelope.body, store),
        None => {
            tracing::warn!(kind = %envelope.kind, "Unknown message type");
            Ok(Dispatched::Ignored)
        }
    }
}

/// Apply an envelope; errors are logged and the frame dropped.
pub fn dispatch(envelope: &InboundEnvelope, store: &dyn AppStore) -> Dispatched {
    try_dispatch(envelope, store).unwrap_or_else(|e| {
        tracing::warn!(kind = %envelope.kind, error = %e, "Dropping inbound frame");
        Dispatched::Ignored
    })
}

/// Parse a raw text frame and dispatch it.
pub fn dispatch_frame(raw: &str, store: &dyn AppStore) -> Dispatched {
    match InboundEnvelope::parse(raw) {
        Ok(envelope) => dispatch(&envelope, store),
        Err(e) => {
            tracing::warn!(error = %e, "Dropping unparseable frame");
            Dispatched::Ignored
        }
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

fn apply_chat(body: &Value, store: &dyn AppStore) -> Result<Dispatched, DispatchError> {
    let content = str_field(body, "content")
        .or_else(|| str_field(body, "message"))
        .ok_or_else(|| missing(body, "content"))?;

    store.append_chat(ChatMessage {
        id: str_field(body, "id").unwrap_or_else(|| generated_id("msg")),
        role: str_field(body, "role")
            .map(|r| Role::parse_lenient(&r))
            .unwrap_or(Role::Assistant),
        content,
        timestamp: timestamp_field(body),
        status: MessageStatus::Received,
    });
    Ok(Dispatched::Applied)
}

fn apply_progress(body: &Value, store: &dyn AppStore) -> Result<Dispatched, DispatchError> {
    let raw = body
        .get("progress")
        .and_then(Value::as_f64)
        .ok_or_else(|| missing(body, "progress"))?;
    let total = body.get("total").and_then(Value::as_u64);

    store.append_progress(ProgressEntry {
        id: str_field(body, "id").unwrap_or_else(|| generated_id("progress")),
        step: str_field(body, "step")
            .or_else(|| str_field(body, "progressType"))
            .unwrap_or_else(|| "info".to_string()),
        progress: percentage(raw, total),
        total,
        message: str_field(body, "message").unwrap_or_default(),
        timestamp: timestamp_field(body),
    });
    Ok(Dispatched::Applied)
}

fn apply_project_update(body: &Value, store: &dyn AppStore) -> Result<Dispatched, DispatchError> {
    let patch = match body.get("project") {
        Some(Value::Object(project)) => project_patch(project),
        Some(_) => {
            return Err(DispatchError::InvalidPayload {
                kind: "project_update".to_string(),
                message: "`project` is not an object".to_string(),
            });
        }
        None => flat_project_patch(body),
    }
    .ok_or_else(|| DispatchError::MissingField {
        kind: "project_update".to_string(),
        field: "project.id".to_string(),
    })?;

    let id = patch.id.clone();
    if store.upsert_project(patch) {
        tracing::info!(project = %id, "New project is now active");
    }
    Ok(Dispatched::Applied)
}

fn apply_error(body: &Value, store: &dyn AppStore) -> Result<Dispatched, DispatchError> {
    let message = str_field(body, "message").unwrap_or_else(|| "An error occurred".to_string());

    let record = ChatMessage {
        id: generated_id("error"),
        role: Role::System,
        content: format!("Error: {}", message),
        timestamp: Utc::now(),
        status: MessageStatus::Error,
    };
    store.report_error(ErrorNotice::transient(message), record);
    Ok(Dispatched::Applied)
}

fn apply_typing(body: &Value, store: &dyn AppStore) -> Result<Dispatched, DispatchError> {
    let typing = body
        .get("isTyping")
        .and_then(Value::as_bool)
        .ok_or_else(|| missing(body, "isTyping"))?;
    store.set_typing(typing);
    Ok(Dispatched::Applied)
}

fn ack_pong(_body: &Value, _store: &dyn AppStore) -> Result<Dispatched, DispatchError> {
    Ok(Dispatched::Pong)
}

fn ack_connected(body: &Value, _store: &dyn AppStore) -> Result<Dispatched, DispatchError> {
    Ok(Dispatched::SessionConfirmed(str_field(body, "session_id")))
}

// ── Field helpers ────────────────────────────────────────────────────

fn missing(body: &Value, field: &str) -> DispatchError {
    DispatchError::MissingField {
        kind: str_field(body, "type").unwrap_or_default(),
        field: field.to_string(),
    }
}

fn str_field(body: &Value, key: &str) -> Option<String> {
    body.get(key).and_then(Value::as_str).map(str::to_string)
}

fn generated_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

fn timestamp_field(body: &Value) -> DateTime<Utc> {
    body.get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now)
}

/// Accepts RFC 3339 and the engine's naive UTC form (`2024-05-01T12:00:00.123456`).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Completion percentage in 0..=100. With a positive `total` the raw value
/// is a step count out of `total`; otherwise it is already a percentage.
fn percentage(raw: f64, total: Option<u64>) -> u8 {
    let pct = match total {
        Some(total) if total > 0 => raw / total as f64 * 100.0,
        _ => raw,
    };
    if pct.is_nan() {
        return 0;
    }
    pct.round().clamp(0.0, 100.0) as u8
}

/// Project fields sent at the top level of the frame instead of nested.
fn flat_project_patch(body: &Value) -> Option<ProjectPatch> {
    let mut fields = body.as_object()?.clone();
    fields.remove("type");
    fields.remove("timestamp");
    if !fields.contains_key("id") {
        let id = fields.remove("projectId")?;
        fields.insert("id".to_string(), id);
    }
    project_patch(&fields)
}

fn project_patch(project: &Map<String, Value>) -> Option<ProjectPatch> {
    let id = match project.get("id")? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let text = |key: &str| project.get(key).and_then(Value::as_str).map(str::to_string);

    let known = [
        "id",
        "name",
        "type",
        "status",
        "version",
        "lastModified",
        "description",
    ];
    let extra = project
        .iter()
        .filter(|(key, _)| !known.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Some(ProjectPatch {
        id,
        name: text("name"),
        kind: text("type"),
        status: text("status"),
        version: text("version"),
        last_modified: text("lastModified").as_deref().and_then(parse_timestamp),
        description: text("description"),
        extra,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ConnectionState;
    use crate::store::{ConversationStore, StoreEvent};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelope(body: Value) -> InboundEnvelope {
        InboundEnvelope::parse(&body.to_string()).unwrap()
    }

    /// Counts store calls and forwards them to a real store.
    #[derive(Default)]
    struct CountingStore {
        inner: ConversationStore,
        calls: AtomicUsize,
    }

    impl CountingStore {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn hit(&self) -> &ConversationStore {
            self.calls.fetch_add(1, Ordering::SeqCst);
            &self.inner
        }
    }

    impl AppStore for CountingStore {
        fn append_chat(&self, message: ChatMessage) {
            self.hit().append_chat(message)
        }
        fn update_chat_status(&self, id: &str, status: MessageStatus) {
            self.hit().update_chat_status(id, status)
        }
        fn append_progress(&self, entry: ProgressEntry) {
            self.hit().append_progress(entry)
        }
        fn upsert_project(&self, patch: ProjectPatch) -> bool {
            self.hit().upsert_project(patch)
        }
        fn set_typing(&self, typing: bool) {
            self.hit().set_typing(typing)
        }
        fn notify_error(&self, notice: ErrorNotice) {
            self.hit().notify_error(notice)
        }
        fn report_error(&self, notice: ErrorNotice, message: ChatMessage) {
            self.hit().report_error(notice, message)
        }
        fn set_connection_state(&self, state: ConnectionState) {
            self.hit().set_connection_state(state)
        }
    }

    #[test]
    fn test_routing_table_covers_protocol() {
        for kind in [
            "message",
            "chat_response",
            "progress",
            "project_update",
            "error",
            "typing",
            "pong",
            "connected",
        ] {
            assert!(is_known(kind), "{} should be routed", kind);
        }
        assert!(!is_known("ping"));
    }

    #[test]
    fn test_chat_response_appends_received_message() {
        let store = ConversationStore::new();
        let outcome = dispatch(
            &envelope(json!({
                "type": "chat_response",
                "id": "ai-1",
                "role": "assistant",
                "content": "Here is your project",
                "timestamp": "2024-05-01T12:00:00.123456"
            })),
            &store,
        );
        assert_eq!(outcome, Dispatched::Applied);
        let snap = store.snapshot();
        assert_eq!(snap.messages.len(), 1);
        let msg = &snap.messages[0];
        assert_eq!(msg.id, "ai-1");
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.status, MessageStatus::Received);
        assert_eq!(msg.timestamp.to_rfc3339(), "2024-05-01T12:00:00.123456+00:00");
    }

    #[test]
    fn test_message_falls_back_to_message_field_and_defaults() {
        let store = ConversationStore::new();
        dispatch(&envelope(json!({"type": "message", "message": "hi"})), &store);
        let msg = &store.snapshot().messages[0];
        assert_eq!(msg.content, "hi");
        assert_eq!(msg.role, Role::Assistant);
        assert!(msg.id.starts_with("msg-"));
    }

    #[test]
    fn test_chat_without_content_is_dropped() {
        let store = ConversationStore::new();
        let env = envelope(json!({"type": "message", "role": "assistant"}));
        assert!(matches!(
            try_dispatch(&env, &store),
            Err(DispatchError::MissingField { .. })
        ));
        assert_eq!(dispatch(&env, &store), Dispatched::Ignored);
        assert!(store.snapshot().messages.is_empty());
    }

    #[test]
    fn test_progress_percentage_handling() {
        let store = ConversationStore::new();
        dispatch(
            &envelope(json!({"type": "progress", "step": "schema", "progress": 42, "message": "Designing"})),
            &store,
        );
        dispatch(
            &envelope(json!({"type": "progress", "progressType": "build", "progress": 3, "total": 4})),
            &store,
        );
        dispatch(&envelope(json!({"type": "progress", "progress": 250})), &store);
        dispatch(&envelope(json!({"type": "progress", "progress": -5})), &store);

        let snap = store.snapshot();
        let pct: Vec<u8> = snap.progress.iter().map(|p| p.progress).collect();
        assert_eq!(pct, vec![42, 75, 100, 0]);
        assert_eq!(snap.progress[0].step, "schema");
        assert_eq!(snap.progress[0].message, "Designing");
        assert_eq!(snap.progress[1].step, "build");
        assert_eq!(snap.progress[1].total, Some(4));
        assert_eq!(snap.progress[2].step, "info");
    }

    #[test]
    fn test_project_update_upserts_and_activates_new() {
        let store = ConversationStore::new();
        dispatch(
            &envelope(json!({
                "type": "project_update",
                "project": {"id": "p-1", "name": "Shop", "type": "web", "status": "generating",
                            "architecture": {"backend": "spring"}}
            })),
            &store,
        );
        dispatch(
            &envelope(json!({
                "type": "project_update",
                "project": {"id": "p-1", "status": "completed", "lastModified": "2024-05-01T10:00:00Z"}
            })),
            &store,
        );
        let snap = store.snapshot();
        assert_eq!(snap.projects.len(), 1);
        let project = &snap.projects[0];
        assert_eq!(project.name, "Shop");
        assert_eq!(project.status, "completed");
        assert_eq!(project.extra["architecture"]["backend"], "spring");
        assert_eq!(project.last_modified.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert_eq!(snap.current_project.as_deref(), Some("p-1"));
    }

    #[test]
    fn test_project_update_accepts_flat_frame() {
        let store = ConversationStore::new();
        let outcome = dispatch(
            &envelope(json!({
                "type": "project_update",
                "projectId": 42,
                "name": "Flat",
                "status": "building",
                "timestamp": "2024-05-01T10:00:00Z"
            })),
            &store,
        );
        assert_eq!(outcome, Dispatched::Applied);
        let snap = store.snapshot();
        let project = &snap.projects[0];
        assert_eq!(project.id, "42");
        assert_eq!(project.name, "Flat");
        assert_eq!(project.kind, "unknown");
        assert!(project.extra.is_empty());
    }

    #[test]
    fn test_project_update_without_id_is_dropped() {
        let store = ConversationStore::new();
        let outcome = dispatch(
            &envelope(json!({"type": "project_update", "project": {"name": "x"}})),
            &store,
        );
        assert_eq!(outcome, Dispatched::Ignored);
        assert!(store.snapshot().projects.is_empty());
    }

    #[test]
    fn test_error_notifies_and_appends_system_message() {
        let store = CountingStore::default();
        let mut rx = store.inner.subscribe();
        dispatch(&envelope(json!({"type": "error", "message": "Model overloaded"})), &store);
        assert_eq!(store.calls(), 1);

        let snap = store.inner.snapshot();
        assert_eq!(snap.notices.len(), 1);
        assert_eq!(snap.notices[0].message, "Model overloaded");
        assert!(!snap.notices[0].persistent);
        let msg = &snap.messages[0];
        assert_eq!(msg.role, Role::System);
        assert_eq!(msg.status, MessageStatus::Error);
        assert_eq!(msg.content, "Error: Model overloaded");

        assert!(matches!(rx.try_recv().unwrap(), StoreEvent::Notice(_)));
        assert!(matches!(rx.try_recv().unwrap(), StoreEvent::ChatAppended(_)));
    }

    #[test]
    fn test_each_effect_is_one_store_call() {
        let frames = [
            json!({"type": "chat_response", "message": "hi"}),
            json!({"type": "progress", "progress": 3, "total": 4, "step": "build"}),
            json!({"type": "project_update", "project": {"id": "p-9", "name": "X"}}),
            json!({"type": "error", "message": "boom"}),
            json!({"type": "typing", "isTyping": true}),
        ];
        for frame in frames {
            let store = CountingStore::default();
            dispatch(&envelope(frame.clone()), &store);
            assert_eq!(store.calls(), 1, "{} should touch the store once", frame["type"]);
        }

        let store = CountingStore::default();
        dispatch(&envelope(json!({"type": "pong"})), &store);
        dispatch(&envelope(json!({"type": "mystery"})), &store);
        assert_eq!(store.calls(), 0);
    }

    #[test]
    fn test_error_without_message_uses_default() {
        let store = ConversationStore::new();
        dispatch(&envelope(json!({"type": "error"})), &store);
        assert_eq!(store.snapshot().notices[0].message, "An error occurred");
    }

    #[test]
    fn test_typing_sets_flag() {
        let store = ConversationStore::new();
        dispatch(&envelope(json!({"type": "typing", "isTyping": true})), &store);
        assert!(store.snapshot().is_typing);
        dispatch(&envelope(json!({"type": "typing", "isTyping": false})), &store);
        assert!(!store.snapshot().is_typing);
    }

    #[test]
    fn test_pong_and_connected_do_not_touch_store() {
        let store = ConversationStore::new();
        let mut rx = store.subscribe();
        assert_eq!(dispatch(&envelope(json!({"type": "pong"})), &store), Dispatched::Pong);
        assert_eq!(
            dispatch(
                &envelope(json!({"type": "connected", "session_id": "user-7-abc"})),
                &store
            ),
            Dispatched::SessionConfirmed(Some("user-7-abc".to_string()))
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(store.snapshot(), Default::default());
    }

    #[test]
    fn test_unknown_type_leaves_state_unchanged() {
        let store = ConversationStore::new();
        store.set_typing(true);
        let before = store.snapshot();
        let outcome = try_dispatch(
            &envelope(json!({"type": "deployment_started", "target": "k8s"})),
            &store,
        );
        assert_eq!(outcome.unwrap(), Dispatched::Ignored);
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_dispatch_frame_drops_garbage() {
        let store = ConversationStore::new();
        assert_eq!(dispatch_frame("{not json", &store), Dispatched::Ignored);
        assert_eq!(dispatch_frame("[1,2,3]", &store), Dispatched::Ignored);
        assert_eq!(store.snapshot(), Default::default());
    }

    #[test]
    fn test_parse_timestamp_variants() {
        assert!(parse_timestamp("2024-05-01T12:00:00Z").is_some());
        assert!(parse_timestamp("2024-05-01T12:00:00+09:00").is_some());
        assert!(parse_timestamp("2024-05-01T12:00:00").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
