//! microvmd CLI entry point.

use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use microvmd::{api, AgentConfig, Error, Manager};

/// microvmd - single-host microVM orchestration agent
#[derive(Parser, Debug)]
#[command(name = "microvmd")]
#[command(about = "Single-host microVM orchestration agent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent and serve the HTTP control plane
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Listen address, overriding the configured one
    #[arg(long)]
    listen: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    init_logging();

    tracing::debug!(version = microvmd::VERSION, "starting microvmd");

    let result = match cli.command {
        Commands::Serve(args) => serve(args),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("microvmd=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Construct the manager, then serve the control plane until shutdown.
fn serve(args: ServeArgs) -> microvmd::Result<()> {
    let mut cfg = AgentConfig::load()?;
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }
    let listen = cfg.listen.clone();

    // Built before the runtime: startup does blocking work (directory
    // creation, snapshot load, the public-IP probe).
    let manager = Arc::new(Manager::new(cfg)?);

    let runtime = tokio::runtime::Runtime::new().map_err(Error::Io)?;
    runtime
        .block_on(async move {
            let app = api::create_router(manager);
            let listener = tokio::net::TcpListener::bind(&listen).await?;
            tracing::info!(listen = %listen, "control plane listening");
            axum::serve(listener, app).await
        })
        .map_err(Error::Io)?;

    Ok(())
}
