//! Tether CLI - expose agents' REST APIs through a central relay
//!
//! `tether relay` accepts agent connections and routes HTTP requests to them;
//! `tether agent` dials a relay and serves its local API through the tunnel.

mod agent_config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tether_agent::{catalog_router, Agent, AgentConfig, TowerService};
use tether_relay::{RelayConfig, RelayServer, SessionConfig};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::agent_config::{build_agent_settings, AgentArgs};

/// Tether - reach agents behind NAT through one relay
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Tether - reach agents behind NAT through one relay")]
#[command(version)]
struct Cli {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "TETHER_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay
    #[command(long_about = r#"
Run the relay. Agents connect to the agent path over WebSocket; external
callers reach an agent's API with ?proxy_node=<name>.

EXAMPLES:
  # Plain HTTP on port 8080
  tether relay --listen 0.0.0.0:8080

  # HTTPS/WSS, agents must present a token
  tether relay --listen 0.0.0.0:443 \
    --tls-cert cert.pem --tls-key key.pem \
    --agent-token $AGENT_TOKEN

ENVIRONMENT VARIABLES:
  TETHER_LISTEN        Listen address
  TETHER_AGENT_TOKEN   Token agents must present
  TETHER_TLS_CERT      PEM certificate
  TETHER_TLS_KEY       PEM private key
  TETHER_HEARTBEAT_INTERVAL_MS  Heartbeat interval
  TETHER_FORWARD_TIMEOUT        Tunneled request timeout (seconds)
"#)]
    Relay {
        /// Address to listen on
        #[arg(long, env = "TETHER_LISTEN", default_value = "0.0.0.0:8080")]
        listen: SocketAddr,

        /// Path agents connect to
        #[arg(long, env = "TETHER_AGENT_PATH", default_value = "/ws")]
        agent_path: String,

        /// PEM certificate (enables TLS together with --tls-key)
        #[arg(long, env = "TETHER_TLS_CERT", requires = "tls_key")]
        tls_cert: Option<PathBuf>,

        /// PEM private key
        #[arg(long, env = "TETHER_TLS_KEY", requires = "tls_cert")]
        tls_key: Option<PathBuf>,

        /// Bearer token agents must present
        #[arg(long, env = "TETHER_AGENT_TOKEN")]
        agent_token: Option<String>,

        /// Agent endpoint merged by GET /catalog
        #[arg(long, env = "TETHER_CATALOG_PATH", default_value = "/v1/plugins")]
        catalog_path: String,

        /// Heartbeat interval in milliseconds
        #[arg(long, env = "TETHER_HEARTBEAT_INTERVAL_MS", default_value = "1000")]
        heartbeat_interval_ms: u64,

        /// Timeout for one tunneled request in seconds
        #[arg(long, env = "TETHER_FORWARD_TIMEOUT", default_value = "30")]
        forward_timeout: u64,
    },

    /// Connect to a relay and serve the local API
    #[command(long_about = r#"
Connect to a relay and serve the agent's local API through the tunnel.

EXAMPLES:
  # Connect with flags only
  tether agent --relay ws://relay.example.com:8080/ws --name node-a

  # Use a config file, reconnecting when the relay goes away
  tether agent --config agent.yaml --reconnect

ENVIRONMENT VARIABLES:
  TETHER_RELAY         Relay agent URL (ws:// or wss://)
  TETHER_AGENT_NAME    Name reported to the relay
  TETHER_TOKEN         Token presented to the relay
  TETHER_CONFIG        Configuration file
  TETHER_LABELS        Comma-separated key=value labels
"#)]
    Agent(AgentArgs),
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down...");
}

async fn run_relay(config: RelayConfig) -> Result<()> {
    info!("Relay: {}", config.listen_addr);
    if config.agent_token.is_none() {
        warn!("No agent token configured; any agent may connect");
    }

    RelayServer::new(config)
        .run(shutdown_signal())
        .await
        .context("Relay failed")
}

/// Keep an agent connected, reconnecting with exponential backoff when asked to
async fn run_agent(
    config: AgentConfig,
    service: TowerService<axum::Router>,
    reconnect: Option<(usize, Duration, Duration)>,
) -> Result<()> {
    let mut attempt = 0;
    let (max_attempts, initial_delay, max_delay) =
        reconnect.unwrap_or((1, Duration::ZERO, Duration::ZERO));
    let mut current_delay = initial_delay;

    loop {
        attempt += 1;

        match Agent::connect(config.clone(), service.clone()).await {
            Ok(handle) => {
                attempt = 0;
                current_delay = initial_delay;

                match handle.closed().await {
                    Ok(()) => warn!("Relay closed the connection"),
                    Err(e) => error!("Connection lost: {:#}", e),
                }

                if reconnect.is_none() {
                    return Ok(());
                }
            }
            Err(e) => {
                if reconnect.is_none() {
                    return Err(e).context("Failed to connect to relay");
                }
                error!("Agent error: {:#}", e);

                if max_attempts > 0 && attempt >= max_attempts {
                    anyhow::bail!("Failed to connect after {} attempts", max_attempts);
                }
            }
        }

        warn!("Reconnecting in {} seconds...", current_delay.as_secs());
        tokio::time::sleep(current_delay).await;

        // Exponential backoff with max cap
        current_delay = std::cmp::min(current_delay * 2, max_delay);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    if rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    match cli.command {
        Commands::Relay {
            listen,
            agent_path,
            tls_cert,
            tls_key,
            agent_token,
            catalog_path,
            heartbeat_interval_ms,
            forward_timeout,
        } => {
            info!("Tether relay starting...");

            let config = RelayConfig {
                listen_addr: listen,
                agent_path,
                tls_cert,
                tls_key,
                agent_token,
                catalog_path,
                session: SessionConfig {
                    heartbeat_interval: Duration::from_millis(heartbeat_interval_ms.max(1)),
                    forward_timeout: Duration::from_secs(forward_timeout),
                    ..SessionConfig::default()
                },
                ..RelayConfig::default()
            };

            run_relay(config).await
        }
        Commands::Agent(args) => {
            info!("Tether agent starting...");

            let settings = build_agent_settings(args)?;
            info!("Agent name: {}", settings.config.name);
            info!("Relay: {}", settings.config.relay_url);
            info!("Serving {} plugin(s)", settings.plugins.len());

            let service = TowerService::router(catalog_router(settings.plugins));

            tokio::select! {
                _ = shutdown_signal() => Ok(()),
                result = run_agent(settings.config, service, settings.reconnect) => result,
            }
        }
    }
}
