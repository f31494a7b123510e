//! Configuration view and validation commands: `convo-link config`.

use anyhow::Result;
use std::path::Path;

use convo_link::config::{CONFIG_DIR, CONFIG_FILE, ConvoConfig, ConvoToml};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, config: &ConvoConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Connection Configuration");
            println!("========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
                println!();
                print_toml(&ConvoToml::load(&config_path)?);
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!();
                println!("Using default configuration:");
                print_toml(&ConvoToml::default());
                println!("Run 'convo-link config init' to create a {} file.", CONFIG_FILE);
                println!();
            }

            println!("Effective values (with env/CLI overrides):");
            let effective = config.manager_config();
            println!("  url = \"{}\"", effective.endpoint);
            println!("  max_attempts = {}", effective.policy.max_attempts);
            println!("  log format = \"{}\"", config.toml.logging.format);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }

            let toml = ConvoToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !config_dir.exists() {
                std::fs::create_dir_all(&config_dir)?;
            }

            ConvoToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [connection] url, retry delays, max_attempts, keepalive timings");
            println!("  - [logging] format (pretty|json), filter");
            println!();
        }
    }

    Ok(())
}

fn print_toml(toml: &ConvoToml) {
    let conn = &toml.connection;
    println!("[connection]");
    println!("  url = \"{}\"", conn.url);
    println!("  base_delay_ms = {}", conn.base_delay_ms);
    println!("  max_delay_ms = {}", conn.max_delay_ms);
    println!("  max_attempts = {}", conn.max_attempts);
    println!("  ping_interval_ms = {}", conn.ping_interval_ms);
    println!("  pong_timeout_ms = {}", conn.pong_timeout_ms);
    println!("  connect_timeout_ms = {}", conn.connect_timeout_ms);
    println!();
    println!("[logging]");
    println!("  format = \"{}\"", toml.logging.format);
    println!("  filter = \"{}\"", toml.logging.filter);
    println!();
}
