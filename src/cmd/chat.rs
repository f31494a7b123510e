//! Interactive and one-shot conversation commands: `convo-link chat`,
//! `convo-link send`.

use anyhow::{Context, Result, bail};
use console::style;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use convo_link::backoff::PolicyPhase;
use convo_link::config::ConvoConfig;
use convo_link::manager::{ConnectionManager, ConnectionState, ManagerHandle, SendReceipt};
use convo_link::store::{ConversationStore, Role, StoreEvent};
use convo_link::transport::WsConnector;
use convo_link::ui::icons::QUEUED;
use convo_link::ui::{render_event, render_status};

const HELP: &str = "\
Commands:
  /status                   show connection status
  /connect                  connect (or retry after giving up)
  /reconnect                drop the link and connect again
  /disconnect               close the link and stop reconnecting
  /action <name> [json]     send a project action
  /help                     show this help
  /quit                     exit
Anything else is sent as a chat message.";

/// A parsed line of interactive input.
#[derive(Debug, Clone, PartialEq)]
enum Input {
    Empty,
    Message(String),
    Action { name: String, payload: Value },
    Status,
    Connect,
    Reconnect,
    Disconnect,
    Help,
    Quit,
    Invalid(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Message(line.to_string());
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map(|(n, r)| (n, r.trim()))
        .unwrap_or((command, ""));
    match name {
        "status" => Input::Status,
        "connect" => Input::Connect,
        "reconnect" => Input::Reconnect,
        "disconnect" => Input::Disconnect,
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        "action" => parse_action(rest),
        other => Input::Invalid(format!("Unknown command '/{}'. Try /help.", other)),
    }
}

fn parse_action(rest: &str) -> Input {
    let (name, raw_payload) = rest
        .split_once(char::is_whitespace)
        .map(|(n, p)| (n, p.trim()))
        .unwrap_or((rest, ""));
    if name.is_empty() {
        return Input::Invalid("Usage: /action <name> [json payload]".to_string());
    }
    let payload = if raw_payload.is_empty() {
        Value::Object(Map::new())
    } else {
        match serde_json::from_str(raw_payload) {
            Ok(value) => value,
            Err(e) => return Input::Invalid(format!("Invalid JSON payload: {}", e)),
        }
    };
    Input::Action {
        name: name.to_string(),
        payload,
    }
}

/// Fill in `projectId` from the active project when the payload lacks one.
fn with_project(mut payload: Value, project_id: Option<String>) -> Value {
    if let (Value::Object(map), Some(id)) = (&mut payload, project_id) {
        map.entry("projectId").or_insert(Value::String(id));
    }
    payload
}

fn start_manager(config: &ConvoConfig, store: Arc<ConversationStore>) -> ManagerHandle {
    let manager_config = config.manager_config();
    let connector = WsConnector::new(manager_config.connect_timeout);
    ConnectionManager::new(manager_config, Arc::new(connector), store).start()
}

pub async fn cmd_chat(config: &ConvoConfig, project: Option<String>) -> Result<()> {
    let store = Arc::new(ConversationStore::new());
    let mut events = store.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(line) = render_event(&event) {
                        println!("{}", line);
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "Display fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let handle = start_manager(config, store.clone());
    println!(
        "Connecting to {} (type /help for commands)",
        style(&config.toml.connection.url).bold()
    );
    handle.connect().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let active_project = || project.clone().or_else(|| store.current_project_id());
        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::Help => println!("{}", HELP),
            Input::Invalid(message) => eprintln!("{}", style(message).red()),
            Input::Status => println!("{}", render_status(&handle.status().await?)),
            Input::Connect => handle.connect().await?,
            Input::Reconnect => handle.reconnect().await?,
            Input::Disconnect => handle.disconnect().await?,
            Input::Action { name, payload } => {
                let payload = with_project(payload, active_project());
                if let Err(e) = handle.send_project_action(name, payload).await {
                    eprintln!("{}", style(e).red());
                }
            }
            Input::Message(text) => match handle.send_message(text, active_project()).await {
                Ok(SendReceipt::Queued { .. }) => {
                    println!("{}{}", QUEUED, style("queued until the connection is back").dim())
                }
                Ok(SendReceipt::Sent { .. }) => {}
                Err(e) => eprintln!("{}", style(e).red()),
            },
        }
    }

    handle.shutdown().await?;
    printer.abort();
    Ok(())
}

/// Connect, send one message, print the engine's reply, exit.
pub async fn cmd_send(
    config: &ConvoConfig,
    message: String,
    project: Option<String>,
    wait: Duration,
) -> Result<()> {
    let store = Arc::new(ConversationStore::new());
    let mut events = store.subscribe();
    let handle = start_manager(config, store.clone());
    let endpoint = config.toml.connection.url.clone();

    handle.connect().await?;
    let mut status = handle.subscribe();
    let connected = tokio::time::timeout(
        wait,
        status.wait_for(|s| s.state == ConnectionState::Connected || s.phase == PolicyPhase::GivenUp),
    )
    .await
    .ok()
    .and_then(|r| r.ok().map(|s| s.state == ConnectionState::Connected))
    .unwrap_or(false);
    if !connected {
        let _ = handle.shutdown().await;
        bail!("Could not connect to the conversational engine at {}", endpoint);
    }

    handle.send_message(message, project).await?;

    let reply = tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(StoreEvent::ChatAppended(msg)) if msg.role != Role::User => {
                    return Some(msg);
                }
                Ok(event) => {
                    tracing::debug!(?event, "Store event while waiting for reply");
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await;

    let _ = handle.shutdown().await;
    match reply {
        Ok(Some(msg)) if msg.role == Role::Assistant => {
            println!("{}", msg.content);
            Ok(())
        }
        Ok(Some(msg)) => bail!("{}", msg.content),
        Ok(None) | Err(_) => bail!("No reply within {}s", wait.as_secs()),
    }
}
