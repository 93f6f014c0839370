//! Command-line interface for the Habitat device bridge.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use habitat_bridge::{available_adapters, BridgeManager};
use habitat_core::{BridgeConfig, BridgeEvent, CommandPriority, DeviceCommand};
use serde_json::Value;
use tracing::{info, warn};

/// Habitat bridge - drive home devices over MQTT, KNX and HTTP.
#[derive(Parser, Debug)]
#[command(name = "habitat")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Bridge config file (.toml or .json).
    #[arg(short, long, global = true, default_value = "habitat.toml")]
    config: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect every configured adapter and log bridge events until Ctrl-C.
    Run,
    /// Load and validate the config, then print a summary.
    CheckConfig,
    /// Send one command and print the result.
    Send {
        device_id: String,
        command: String,
        /// Parameter as `name=value`; values are parsed as JSON when possible.
        #[arg(short, long = "param")]
        params: Vec<String>,
        #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
        priority: PriorityArg,
    },
    /// Connect and print adapter health.
    Health,
    /// Connect and run device discovery on every adapter.
    Discover,
    /// List the adapters this build can create.
    Adapters,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PriorityArg {
    Low,
    Normal,
    High,
    Critical,
}

impl From<PriorityArg> for CommandPriority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Self::Low,
            PriorityArg::Normal => Self::Normal,
            PriorityArg::High => Self::High,
            PriorityArg::Critical => Self::Critical,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // JSON output for containers
    let json_logging = std::env::var("HABITAT_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("habitat=info"));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }

    match args.command {
        Command::Run => run_bridge(&args.config).await,
        Command::CheckConfig => check_config(&args.config),
        Command::Send {
            device_id,
            command,
            params,
            priority,
        } => send_command(&args.config, device_id, command, params, priority.into()).await,
        Command::Health => print_health(&args.config).await,
        Command::Discover => discover(&args.config).await,
        Command::Adapters => {
            for name in available_adapters() {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

fn load_config(path: &PathBuf) -> Result<BridgeConfig> {
    let mut config = BridgeConfig::from_file(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Build the bridge from config and connect everything it names.
async fn start_bridge(path: &PathBuf) -> Result<BridgeManager> {
    let bridge = BridgeManager::new(load_config(path)?);
    let protocols = bridge.register_configured_adapters().await?;
    info!(count = protocols.len(), "Adapters registered");

    for (protocol, result) in bridge.connect_all().await {
        if let Err(e) = result {
            warn!(protocol = %protocol, error = %e, "Adapter not connected; reconnect pending");
        }
    }
    Ok(bridge)
}

async fn run_bridge(path: &PathBuf) -> Result<()> {
    let bridge = start_bridge(path).await?;
    let events = bridge.subscribe(Arc::new(|event: &BridgeEvent| match event {
        BridgeEvent::DeviceState { device_id, state } => {
            info!(event = event.kind(), device_id = %device_id, online = state.online, values = %serde_json::Value::Object(state.values.clone()))
        }
        BridgeEvent::CommandCompleted { result } => {
            info!(event = event.kind(), device_id = %result.device_id, success = result.success, duration_ms = result.duration_ms)
        }
        other => info!(event = other.kind(), "{:?}", other),
    }));

    info!("Bridge running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    events.unsubscribe();
    bridge.destroy().await;
    info!("Bridge stopped");
    Ok(())
}

fn check_config(path: &PathBuf) -> Result<()> {
    let config = load_config(path)?;
    let mut protocols: Vec<_> = config.adapters.iter().collect();
    protocols.sort_by(|a, b| a.0.cmp(b.0));

    println!("Config OK: {}", path.display());
    for (protocol, adapter) in protocols {
        let state = if adapter.enabled { "enabled" } else { "disabled" };
        println!("  adapter {:<10} {}", protocol.to_string(), state);
    }
    println!("  devices  {}", config.devices.len());
    println!(
        "  queue    max {} / concurrency {}",
        config.message_queue.max_size, config.message_queue.processing_concurrency
    );
    Ok(())
}

fn parse_param(raw: &str) -> Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .with_context(|| format!("Parameter must be name=value: {}", raw))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.trim().to_string(), value))
}

async fn send_command(
    path: &PathBuf,
    device_id: String,
    command: String,
    params: Vec<String>,
    priority: CommandPriority,
) -> Result<()> {
    let mut device_command = DeviceCommand::new(device_id, command).with_priority(priority);
    for raw in &params {
        let (name, value) = parse_param(raw)?;
        device_command = device_command.with_parameter(name, value);
    }

    let bridge = start_bridge(path).await?;
    let result = bridge.send_command(device_command).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    bridge.destroy().await;

    if result.success {
        Ok(())
    } else {
        anyhow::bail!(result.error.unwrap_or_else(|| "command failed".to_string()))
    }
}

async fn print_health(path: &PathBuf) -> Result<()> {
    let bridge = start_bridge(path).await?;
    println!("{}", serde_json::to_string_pretty(&bridge.all_adapter_health())?);
    println!("{}", serde_json::to_string_pretty(&bridge.queue_stats())?);
    bridge.destroy().await;
    Ok(())
}

async fn discover(path: &PathBuf) -> Result<()> {
    let bridge = start_bridge(path).await?;
    let devices = bridge.discover_devices().await;
    println!("{}", serde_json::to_string_pretty(&devices)?);
    bridge.destroy().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("level=40").unwrap(), ("level".to_string(), json!(40)));
        assert_eq!(parse_param("on=true").unwrap(), ("on".to_string(), json!(true)));
        assert_eq!(parse_param("mode=eco").unwrap(), ("mode".to_string(), json!("eco")));
        assert!(parse_param("broken").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "habitat", "--config", "home.toml", "send", "lamp", "set_level", "-p", "level=60",
            "--priority", "high",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("home.toml"));
        match args.command {
            Command::Send { device_id, params, priority, .. } => {
                assert_eq!(device_id, "lamp");
                assert_eq!(params, vec!["level=60".to_string()]);
                assert_eq!(CommandPriority::from(priority), CommandPriority::High);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
