use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use terrane::config::Config;
use terrane::server::Server;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "terraned", about = "In-memory geospatial database server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Cmd>,

    /// Path to the config file (default: $TERRANE data dir / config.json)
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the server (default if no subcommand is given)
    Run,
    /// Compact the append-only log against the current in-memory snapshot
    Shrink,
    /// Print the version and exit
    Version,
}

fn default_config_path() -> std::path::PathBuf {
    terrane::data_dir().join("config.json")
}

#[tokio::main]
async fn main() -> Result<()> {
    terrane::telemetry::init_tracing().context("initializing logging")?;

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command.unwrap_or(Cmd::Run) {
        Cmd::Version => {
            println!("terraned {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Cmd::Run => run(config_path).await,
        Cmd::Shrink => shrink(config_path).await,
    }
}

async fn run(config_path: std::path::PathBuf) -> Result<()> {
    let _instance_lock = terrane::instance_lock::InstanceLock::new("terraned").context("acquiring instance lock")?;

    let config = Config::load(&config_path).context("loading config")?;
    let socket_path = terrane::socket_path();

    let server = Server::open(config).await.context("opening server")?;
    terrane::sweeper::spawn(server.clone());
    spawn_outbox_workers(server.clone()).await;

    let listener = terrane::wire::NativeSocketServer::start(&socket_path)
        .await
        .context("starting native socket listener")?;

    info!(socket = ?socket_path, "terraned ready");

    let accept = tokio::spawn(listener.accept_loop(server.clone()));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    server.shutdown_gracefully().await;
    accept.abort();
    Ok(())
}

async fn shrink(config_path: std::path::PathBuf) -> Result<()> {
    let config = Config::load(&config_path).context("loading config")?;
    let server = Server::open(config).await.context("opening server")?;
    let mut session = terrane::dispatcher::Session::default();
    terrane::dispatcher::execute(&server, &mut session, vec!["AOFSHRINK".to_string()])
        .await
        .map_err(|e| anyhow::anyhow!("shrink failed: {e}"))?;
    info!("append-only log shrunk");
    Ok(())
}

/// Spawn one delivery worker per webhook hook loaded from the replayed AOL.
/// Hooks created afterwards (`SETHOOK` on a running server) get their
/// worker immediately via `Server::spawn_hook_worker`, called directly from
/// the dispatcher.
async fn spawn_outbox_workers(server: Arc<Server>) {
    let hooks: Vec<(String, Vec<String>)> = {
        let registry = server.hooks.read().await;
        registry
            .matching("*")
            .into_iter()
            .filter_map(|name| match registry.get(&name)?.delivery.clone() {
                terrane::hook::Delivery::Webhooks(endpoints) => Some((name, endpoints)),
                terrane::hook::Delivery::Channel(_) => None,
            })
            .collect()
    };
    for (name, endpoints) in hooks {
        server.spawn_hook_worker(name, endpoints).await;
    }
}
