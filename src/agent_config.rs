//! `tether agent` arguments and the optional YAML config file

use anyhow::{Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tether_agent::{AgentConfig, Plugin};
use tracing::info;

#[derive(Args, Debug, Default)]
pub struct AgentArgs {
    /// Relay agent URL (e.g., ws://relay.example.com:8080/ws)
    #[arg(long, env = "TETHER_RELAY")]
    pub relay: Option<String>,

    /// Name reported to the relay (defaults to the hostname)
    #[arg(long, env = "TETHER_AGENT_NAME")]
    pub name: Option<String>,

    /// Token presented to the relay
    #[arg(long, env = "TETHER_TOKEN")]
    pub token: Option<String>,

    /// Extra metadata label (key=value), repeatable
    #[arg(
        long = "label",
        env = "TETHER_LABELS",
        value_delimiter = ',',
        value_parser = parse_label
    )]
    pub labels: Vec<(String, String)>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "TETHER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Reconnect when the relay connection is lost
    #[arg(long, env = "TETHER_RECONNECT")]
    pub reconnect: bool,

    /// Give up after this many failed attempts in a row (0 = never)
    #[arg(long, env = "TETHER_MAX_RECONNECT_ATTEMPTS", default_value = "0")]
    pub max_reconnect_attempts: usize,
}

/// Configuration file format
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub relay: RelaySection,

    #[serde(default)]
    pub agent: AgentSection,

    /// Catalog served on `GET /v1/plugins`
    #[serde(default)]
    pub plugins: Vec<Plugin>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelaySection {
    pub url: String,

    /// Environment variable holding the token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token_env: Option<String>,

    /// Direct token (prefer auth_token_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Everything `tether agent` needs to run
#[derive(Debug)]
pub struct AgentSettings {
    pub config: AgentConfig,
    pub plugins: Vec<Plugin>,
    /// (max attempts, initial delay, max delay) when reconnecting is enabled
    pub reconnect: Option<(usize, Duration, Duration)>,
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

/// Load configuration from YAML file
pub fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

fn validate_relay_url(url: &str) -> Result<()> {
    if !(url.starts_with("ws://") || url.starts_with("wss://")) {
        anyhow::bail!(
            "Invalid relay URL: '{}' (expected ws://host:port/path or wss://...)",
            url
        );
    }
    Ok(())
}

/// Merge CLI args with config file, giving precedence to CLI args
pub fn build_agent_settings(args: AgentArgs) -> Result<AgentSettings> {
    let mut config = AgentConfig::default();
    let mut plugins = Vec::new();
    let mut relay_url = None;

    if let Some(config_path) = &args.config {
        info!("Loading configuration from: {}", config_path.display());
        let file = load_config_file(config_path)?;

        config.auth_token = if let Some(env_var) = &file.relay.auth_token_env {
            Some(
                std::env::var(env_var)
                    .with_context(|| format!("Environment variable {} not set", env_var))?,
            )
        } else {
            file.relay.auth_token
        };

        relay_url = Some(file.relay.url);
        if let Some(name) = file.agent.name {
            config.name = name;
        }
        config.labels = file.agent.labels;
        plugins = file.plugins;
    }

    // CLI args override config file
    let relay_url = args.relay.or(relay_url).ok_or_else(|| {
        anyhow::anyhow!("Relay URL is required (use --relay or config file)")
    })?;
    validate_relay_url(&relay_url)?;
    config.relay_url = relay_url;

    if let Some(name) = args.name {
        config.name = name;
    }
    if config.name.trim().is_empty() {
        anyhow::bail!("Agent name cannot be empty");
    }

    if args.token.is_some() {
        config.auth_token = args.token;
    }
    config.labels.extend(args.labels);

    let reconnect = args.reconnect.then(|| {
        (
            args.max_reconnect_attempts,
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
    });

    Ok(AgentSettings {
        config,
        plugins,
        reconnect,
    })
}
