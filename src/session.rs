use serde::{Deserialize, Serialize};

/// Client-generated identity correlating this client with the engine's
/// conversational context. Shaped `user-<unix millis>-<9 alphanumerics>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(9).collect();
        Self(format!("user-{}-{}", millis, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Realtime endpoint for a session: `<base>/api/v1/realtime/ws/<session>`.
pub fn session_endpoint(base_url: &str, session: &SessionId) -> String {
    format!(
        "{}/api/v1/realtime/ws/{}",
        base_url.trim_end_matches('/'),
        session
    )
}
