//! Wire protocol: JSON text frames carrying a `type` discriminator.
//!
//! ## Client → engine
//!
//! | Frame            | Shape                                                                  |
//! |------------------|------------------------------------------------------------------------|
//! | `chat`           | `{type, message, context: {projectId?, sessionId}, timestamp}`         |
//! | `project_action` | `{type, action, payload, context: {sessionId}, timestamp}`             |
//! | `ping`           | `{type}`                                                               |
//!
//! ## Engine → client
//!
//! Any object with a string `type`; see [`EngineFrame`] for the frames the
//! engine is known to send. Field names vary per type, so the client side
//! keeps inbound frames as an [`InboundEnvelope`] and lets the dispatcher
//! pick fields out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DispatchError;
use crate::session::SessionId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatContext {
    #[serde(rename = "projectId", default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionContext {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
}

/// Frames the client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Chat {
        message: String,
        context: ChatContext,
        timestamp: DateTime<Utc>,
    },
    ProjectAction {
        action: String,
        #[serde(default)]
        payload: Value,
        context: ActionContext,
        timestamp: DateTime<Utc>,
    },
    Ping,
}

impl OutboundFrame {
    pub fn chat(message: impl Into<String>, project_id: Option<String>, session_id: SessionId) -> Self {
        OutboundFrame::Chat {
            message: message.into(),
            context: ChatContext {
                project_id,
                session_id,
            },
            timestamp: Utc::now(),
        }
    }

    pub fn project_action(action: impl Into<String>, payload: Value, session_id: SessionId) -> Self {
        OutboundFrame::ProjectAction {
            action: action.into(),
            payload,
            context: ActionContext { session_id },
            timestamp: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Inbound frame split into its discriminator and the full object.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub kind: String,
    pub body: Value,
}

impl InboundEnvelope {
    pub fn parse(raw: &str) -> Result<Self, DispatchError> {
        let body: Value = serde_json::from_str(raw).map_err(DispatchError::InvalidJson)?;
        let kind = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DispatchError::MissingType)?
            .to_string();
        Ok(Self { kind, body })
    }
}

/// Frames the conversational engine sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineFrame {
    Connected {
        session_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Typing {
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    ChatResponse {
        id: String,
        role: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
    Progress {
        id: String,
        step: String,
        progress: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<u32>,
        message: String,
        timestamp: DateTime<Utc>,
    },
    ProjectUpdate {
        project: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<String>,
        status: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

impl EngineFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionId {
        SessionId::from("user-1-abcdefghi")
    }

    #[test]
    fn test_chat_frame_shape() {
        let frame = OutboundFrame::chat("hello", Some("p-1".to_string()), session());
        let json: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "chat");
        assert_eq!(json["message"], "hello");
        assert_eq!(json["context"]["projectId"], "p-1");
        assert_eq!(json["context"]["sessionId"], "user-1-abcdefghi");
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_chat_frame_omits_missing_project() {
        let frame = OutboundFrame::chat("hi", None, session());
        let json: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert!(json["context"].get("projectId").is_none());
    }

    #[test]
    fn test_project_action_frame_shape() {
        let frame = OutboundFrame::project_action(
            "regenerate",
            serde_json::json!({"component": "backend"}),
            session(),
        );
        let json: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "project_action");
        assert_eq!(json["action"], "regenerate");
        assert_eq!(json["payload"]["component"], "backend");
        assert_eq!(json["context"]["sessionId"], "user-1-abcdefghi");
    }

    #[test]
    fn test_ping_frame_is_bare() {
        assert_eq!(OutboundFrame::Ping.encode().unwrap(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_engine_parses_client_ping() {
        let frame: OutboundFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame, OutboundFrame::Ping);
    }

    #[test]
    fn test_envelope_parse_extracts_type() {
        let env = InboundEnvelope::parse(r#"{"type":"typing","isTyping":true}"#).unwrap();
        assert_eq!(env.kind, "typing");
        assert_eq!(env.body["isTyping"], true);
    }

    #[test]
    fn test_envelope_parse_rejects_bad_input() {
        assert!(matches!(
            InboundEnvelope::parse("not json"),
            Err(DispatchError::InvalidJson(_))
        ));
        assert!(matches!(
            InboundEnvelope::parse(r#"{"kind":"typing"}"#),
            Err(DispatchError::MissingType)
        ));
        assert!(matches!(
            InboundEnvelope::parse(r#"{"type":7}"#),
            Err(DispatchError::MissingType)
        ));
    }

    #[test]
    fn test_engine_typing_uses_camel_case_flag() {
        let json = EngineFrame::Typing { is_typing: true }.encode().unwrap();
        assert_eq!(json, r#"{"type":"typing","isTyping":true}"#);
    }
}
