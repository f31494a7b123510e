use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use convo_link::config::ConvoConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "convo-link")]
#[command(version, about = "Realtime connection client for the conversational engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Engine base URL. Overrides convo.toml and CONVO_WS_URL.
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// Reconnect attempts before giving up. Overrides convo.toml and CONVO_MAX_ATTEMPTS.
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Interactive conversation with the engine
    Chat {
        /// Project id attached to every message
        #[arg(short, long)]
        project: Option<String>,
    },
    /// Send one message and print the reply
    Send {
        message: String,

        #[arg(short, long)]
        project: Option<String>,

        /// Seconds to wait for the connection and for the reply
        #[arg(long, default_value = "15")]
        wait_secs: u64,
    },
    /// Run a local engine stand-in for development
    Engine {
        #[arg(short, long, default_value = "8087")]
        port: u16,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Leave pings unanswered to exercise client keepalive
        #[arg(long)]
        no_pong: bool,

        /// Delay between the frames of a chat reply
        #[arg(long, default_value = "250")]
        step_delay_ms: u64,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    Show,
    Validate,
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = ConvoConfig::load(&project_dir)?.with_cli_args(cli.url.clone(), cli.max_attempts);
    convo_link::logging::init(&config.toml.logging, cli.verbose);
    for warning in &config.env_warnings {
        tracing::warn!("{}", warning);
    }

    match &cli.command {
        Commands::Chat { project } => cmd::cmd_chat(&config, project.clone()).await?,
        Commands::Send {
            message,
            project,
            wait_secs,
        } => {
            cmd::cmd_send(
                &config,
                message.clone(),
                project.clone(),
                Duration::from_secs(*wait_secs),
            )
            .await?
        }
        Commands::Engine {
            port,
            host,
            no_pong,
            step_delay_ms,
        } => cmd::cmd_engine(host.clone(), *port, *no_pong, *step_delay_ms).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, &config, command.clone())?,
    }

    Ok(())
}
