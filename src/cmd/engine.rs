//! Local engine stand-in: `convo-link engine`.

use anyhow::Result;
use std::time::Duration;

use convo_link::engine::{EngineConfig, start_engine};

pub async fn cmd_engine(host: String, port: u16, no_pong: bool, step_delay_ms: u64) -> Result<()> {
    let config = EngineConfig {
        host,
        port,
        answer_pings: !no_pong,
        step_delay: Duration::from_millis(step_delay_ms),
    };
    if no_pong {
        println!("Pings will not be answered; clients should time out and reconnect.");
    }
    start_engine(config).await
}
