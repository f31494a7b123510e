//! Local stand-in for the conversational engine.
//!
//! Serves `/api/v1/realtime/ws/{session_id}` and answers the client's
//! frames with the same frame kinds the real engine emits: a `connected`
//! greeting, `pong` for `ping`, a typing/progress/response sequence for
//! `chat`, and `project_update` for `project_action`. Used by the `engine`
//! command for manual testing and by the end-to-end tests.

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

use crate::protocol::{EngineFrame, OutboundFrame};

/// Configuration for the stand-in engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub host: String,
    pub port: u16,
    /// When false, `ping` frames go unanswered (exercises client keepalive).
    pub answer_pings: bool,
    /// Pause between the frames of a chat reply.
    pub step_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8087,
            answer_pings: true,
            step_delay: Duration::from_millis(250),
        }
    }
}

pub struct EngineState {
    answer_pings: bool,
    step_delay: Duration,
    connections: AtomicUsize,
}

impl EngineState {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            answer_pings: config.answer_pings,
            step_delay: config.step_delay,
            connections: AtomicUsize::new(0),
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

pub fn build_router(state: Arc<EngineState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/realtime/ws/{session_id}", get(ws_handler))
        .with_state(state)
}

async fn health(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.connections(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<Arc<EngineState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

async fn handle_socket(socket: WebSocket, session_id: String, state: Arc<EngineState>) {
    let active = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::info!(session_id = %session_id, active, "Client connected");

    let (mut sender, mut receiver) = socket.split();
    let greeting = EngineFrame::Connected {
        session_id: session_id.clone(),
        message: "Connected to conversational engine".to_string(),
        timestamp: Utc::now(),
    };

    if send_frame(&mut sender, &greeting).await {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let frames = respond(&session_id, text.as_str(), state.answer_pings);
                    if !send_reply(&mut sender, &frames, state.step_delay).await {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                // Protocol-level pings are answered by the socket itself.
                Ok(_) => {}
            }
        }
    }

    let active = state.connections.fetch_sub(1, Ordering::SeqCst) - 1;
    tracing::info!(session_id = %session_id, active, "Client disconnected");
}

async fn send_reply(
    sender: &mut SplitSink<WebSocket, Message>,
    frames: &[EngineFrame],
    step_delay: Duration,
) -> bool {
    for (i, frame) in frames.iter().enumerate() {
        if i > 0 && !step_delay.is_zero() {
            tokio::time::sleep(step_delay).await;
        }
        if !send_frame(sender, frame).await {
            return false;
        }
    }
    true
}

async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &EngineFrame) -> bool {
    match frame.encode() {
        Ok(raw) => sender.send(Message::Text(raw.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode engine frame");
            true
        }
    }
}

/// Frames the engine sends back for one client frame.
pub fn respond(session_id: &str, raw: &str, answer_pings: bool) -> Vec<EngineFrame> {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return vec![error_frame("Invalid JSON format")];
    };
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    if !matches!(kind, "chat" | "project_action" | "ping") {
        return vec![error_frame(format!("Unknown message type: {}", kind))];
    }

    let frame = match serde_json::from_value::<OutboundFrame>(value.clone()) {
        Ok(frame) => frame,
        Err(e) => return vec![error_frame(format!("Invalid {} frame: {}", kind, e))],
    };

    let now = Utc::now();
    match frame {
        OutboundFrame::Ping if answer_pings => vec![EngineFrame::Pong { timestamp: now }],
        OutboundFrame::Ping => Vec::new(),
        OutboundFrame::Chat {
            message, context, ..
        } => {
            let step_id = format!("progress-{}", now.timestamp_millis());
            let scope = context
                .project_id
                .map(|p| format!(" for project {}", p))
                .unwrap_or_default();
            vec![
                EngineFrame::Typing { is_typing: true },
                EngineFrame::Progress {
                    id: step_id,
                    step: "analyzing".to_string(),
                    progress: 50,
                    total: None,
                    message: format!("Analyzing request{}", scope),
                    timestamp: now,
                },
                EngineFrame::Typing { is_typing: false },
                EngineFrame::ChatResponse {
                    id: format!("ai-{}-{}", session_id, now.timestamp_millis()),
                    role: "assistant".to_string(),
                    content: format!("Echo: {}", message),
                    timestamp: now,
                },
            ]
        }
        OutboundFrame::ProjectAction {
            action, payload, ..
        } => {
            let project_id = payload
                .get("projectId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("project-{}", session_id));
            vec![EngineFrame::ProjectUpdate {
                project: json!({
                    "id": project_id,
                    "name": project_id,
                    "status": "building",
                    "lastModified": now,
                }),
                action: Some(action),
                status: "success".to_string(),
                timestamp: now,
            }]
        }
    }
}

fn error_frame(message: impl Into<String>) -> EngineFrame {
    EngineFrame::Error {
        message: message.into(),
    }
}

/// Serve on an already-bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, config: &EngineConfig) -> Result<()> {
    let app = build_router(Arc::new(EngineState::new(config)));
    axum::serve(listener, app).await.context("Engine server error")
}

/// Bind to an ephemeral localhost port and serve in the background.
pub async fn spawn_local(config: EngineConfig) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("Failed to bind engine listener")?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = serve(listener, &config).await {
            tracing::error!(error = %e, "Engine stopped");
        }
    });
    Ok(addr)
}

/// Run the engine in the foreground until Ctrl+C.
pub async fn start_engine(config: EngineConfig) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    println!("Engine stand-in listening on ws://{}", local_addr);

    let app = build_router(Arc::new(EngineState::new(&config)));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Engine server error")?;

    println!("Engine shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
