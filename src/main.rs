//! Channel Session CLI - connect to a Phoenix socket and watch channels.
//!
//! This is the main binary entry point. See the `channel_session` library
//! for the core functionality.

// Rust guideline compliant 2026-01

use anyhow::{Context, Result};
use channel_session::{
    ChannelMessage, ConnectionState, Params, PhoenixTransport, SessionConfig, SessionManager,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

// CLI
#[derive(Parser)]
#[command(name = "channel-session")]
#[command(version)]
#[command(about = "Connect to a Phoenix-style socket and stream channel events")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level (including every transport event)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, join channels and print state changes and messages as JSON lines
    Listen {
        /// Socket endpoint (overrides config and CHANNEL_SESSION_URL)
        #[arg(long)]
        url: Option<String>,
        /// Connection parameter as key=value (repeatable)
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
        /// Channel to join as topic or topic=alias (repeatable)
        #[arg(long = "join", value_name = "TOPIC[=ALIAS]")]
        joins: Vec<String>,
    },
    /// Print the effective configuration
    Config,
}

/// Parse `key=value`; the value is taken as JSON when it parses, else as a string.
fn parse_param(raw: &str) -> Result<(String, serde_json::Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("parameter must be key=value: {raw}"))?;
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_not_json| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Parse `topic` or `topic=alias`.
fn parse_join(raw: &str) -> (String, Option<String>) {
    match raw.split_once('=') {
        Some((topic, alias)) if !alias.is_empty() => (topic.to_string(), Some(alias.to_string())),
        Some((topic, _)) => (topic.to_string(), None),
        None => (raw.to_string(), None),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<SessionConfig> {
    match path {
        Some(path) => SessionConfig::load(path),
        None => Ok(SessionConfig::from_env()),
    }
}

fn state_line(state: &ConnectionState) -> serde_json::Value {
    serde_json::json!({
        "type": "state",
        "version": state.version(),
        "status": state.status().to_string(),
        "socket": state.socket().map(|s| s.id().to_string()),
        "channels": state
            .channels()
            .iter()
            .map(|(alias, channel)| {
                let status = state.channel_status(alias).map(ToString::to_string);
                (alias.clone(), serde_json::json!({"topic": channel.topic(), "status": status}))
            })
            .collect::<serde_json::Map<_, _>>(),
    })
}

fn message_line(alias: &str, msg: &ChannelMessage) -> serde_json::Value {
    serde_json::json!({
        "type": "message",
        "alias": alias,
        "topic": msg.topic,
        "event": msg.event,
        "payload": msg.payload,
    })
}

async fn listen(
    mut config: SessionConfig,
    url: Option<String>,
    params: &[String],
    joins: &[String],
) -> Result<()> {
    if let Some(url) = url {
        config.endpoint = url;
    }
    for raw in params {
        let (key, value) = parse_param(raw)?;
        config.params.insert(key, value);
    }

    let transport = PhoenixTransport::new(config.endpoint.clone(), config.heartbeat_interval());
    let session = SessionManager::spawn(Arc::new(transport), config);

    let mut states = session.subscribe();
    let printer = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = Arc::clone(&states.borrow_and_update());
            println!("{}", state_line(&state));
        }
    });

    session.connect().await.context("Failed to connect")?;

    for raw in joins {
        let (topic, alias) = parse_join(raw);
        let key = alias.clone().unwrap_or_else(|| topic.clone());
        let label = key.clone();
        session.on(&key, move |msg| println!("{}", message_line(&label, msg)))?;
        match session.join(&topic, alias.as_deref(), None).await {
            Ok(_) => log::info!("Joined {} as {}", topic, key),
            Err(e) => log::error!("Failed to join {}: {}", topic, e),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Shutting down...");

    session.shutdown().await;
    printer.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Listen { url, params, joins } => listen(config, url, &params, &joins).await?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}
