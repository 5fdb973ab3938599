//! graphiti-memory CLI
//!
//! Long-term memory sidecar for an agent host. Speaks JSON-RPC lines on
//! stdin/stdout with the host plugin; logs go to stderr.

use clap::Parser;
use graphiti_memory::config::load_config;
use graphiti_memory::graph::McpGraphClient;
use graphiti_memory::host::HttpHostClient;
use graphiti_memory::{Interceptor, MemoryEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// graphiti-memory - long-term memory for coding-agent sessions
#[derive(Parser, Debug)]
#[command(name = "graphiti-memory")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MCP endpoint of the graph memory service
    #[arg(long)]
    endpoint: Option<String>,

    /// Base URL of the host session API
    #[arg(long)]
    host_url: Option<String>,

    /// Project directory (defaults to the current directory)
    #[arg(short = 'C', long)]
    project_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(endpoint) = cli.endpoint {
        config = config.with_endpoint(endpoint);
    }
    if let Some(host_url) = cli.host_url {
        config = config.with_host_url(host_url);
    }
    config.project_dir = match cli.project_dir {
        Some(dir) => std::fs::canonicalize(dir)?,
        None => std::fs::canonicalize(&config.project_dir)?,
    };
    config.validate()?;

    info!(
        endpoint = %config.endpoint,
        project_group = %config.project_group_id(),
        "Starting graphiti-memory"
    );

    let graph = McpGraphClient::new(config.endpoint.clone())?;
    if let Err(e) = graph.connect().await {
        warn!("Graph service unavailable, memory calls will be skipped until it answers: {}", e);
    }
    let host = HttpHostClient::new(config.host_url.clone())?;

    let engine = MemoryEngine::new(config, Arc::new(graph), Arc::new(host));
    let interceptor = Interceptor::new(Arc::new(engine));

    interceptor
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await?;

    info!("graphiti-memory stopped");
    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "graphiti_memory=debug"
    } else {
        "graphiti_memory=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
