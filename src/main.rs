use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use a2a_relay::bus::{create_bus, TopologyError};
use a2a_relay::config::{Config, ProxyRole};
use a2a_relay::routing;

/// Transparent A2A proxy: JSON-RPC and SSE between agents, relayed over a
/// session-ordered message bus.
#[derive(Parser, Debug)]
#[command(name = "a2a-relay")]
#[command(version)]
#[command(about = "Transparent A2A transport proxy over a message bus", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy
    Run {
        /// Path to the proxy configuration file
        #[arg(long, default_value = "relay.toml")]
        config: PathBuf,
    },
    /// Validate a configuration file and exit
    Check {
        /// Path to the proxy configuration file
        #[arg(long, default_value = "relay.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run { config } => run(&config).await,
        Commands::Check { config } => check(&config).await,
    };
    std::process::exit(code);
}

async fn check(path: &Path) -> i32 {
    match Config::load(path).await {
        Ok(config) => {
            info!(
                proxy_id = %config.proxy.id,
                groups = config.groups.len(),
                agents = config.agents.len(),
                "config OK"
            );
            0
        }
        Err(e) => {
            error!("invalid config: {e:#}");
            1
        }
    }
}

/// Exit codes: 0 normal, 1 fatal start-up, 2 topology creation refused.
async fn run(path: &Path) -> i32 {
    let config = match Config::load(path).await {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config: {e:#}");
            return 1;
        }
    };

    let bus = match create_bus(&config.bus) {
        Ok(bus) => bus,
        Err(e) => {
            error!("failed to create bus: {e:#}");
            return 1;
        }
    };

    // Topology creation is a one-shot coordinator duty. The in-process
    // backend has nothing pre-existing to attach to, so followers on it
    // create their local topology as well.
    if config.proxy.role == ProxyRole::Coordinator || config.bus.backend == "memory" {
        match bus.ensure_topology(&config.groups).await {
            Ok(report) => {
                info!(
                    created = report.created.len(),
                    existing = report.existing.len(),
                    "bus topology ensured"
                );
                for topic in &report.divergent {
                    warn!(topic = %topic, "existing topic diverges from configured properties, left untouched");
                }
            }
            Err(TopologyError::Refused(reason)) => {
                error!("topology creation refused: {reason}");
                return 2;
            }
            Err(e) => {
                error!("topology creation failed: {e:#}");
                return 1;
            }
        }
    }

    match routing::serve(config, bus).await {
        Ok(()) => 0,
        Err(e) => {
            error!("proxy terminated: {e:#}");
            1
        }
    }
}
