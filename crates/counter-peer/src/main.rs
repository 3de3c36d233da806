//! Counter Peer
//!
//! Demo application for the shared store: a counter replicated between one
//! host and any number of guests over WebSocket.
//! Commands are read from stdin; every applied action prints the new value.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use shared_store::{ActionBus, SessionDriver, SharedStore, WsGuestBus, WsHostBus};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod counter;

use config::PeerConfig;
use counter::{Command, Counter};

/// Session role
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Host mode - owns the state and orders every action
    Host,
    /// Guest mode - mirrors the host's state
    Guest,
}

/// Replicated counter peer
#[derive(Parser, Debug)]
#[command(name = "counter-peer")]
#[command(about = "Counter replicated between a host and its guests", long_about = None)]
struct Args {
    /// Peer mode (host or guest)
    #[arg(long, value_enum, default_value = "host")]
    mode: Mode,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address (host) or host address (guest)
    #[arg(long)]
    addr: Option<String>,

    /// Application id; only peers with the same id share state
    #[arg(long)]
    app_id: Option<String>,

    /// Guest bootstrap timeout in milliseconds
    #[arg(long)]
    bootstrap_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Config file (or defaults) with command line overrides applied
    fn peer_config(&self) -> Result<PeerConfig> {
        let mut config = match &self.config {
            Some(path) => PeerConfig::load(path)?,
            None => PeerConfig::default(),
        };
        if let Some(addr) = &self.addr {
            config.addr = addr.clone();
        }
        if let Some(app_id) = &self.app_id {
            config.app_id = app_id.clone();
        }
        if let Some(timeout_ms) = self.bootstrap_timeout_ms {
            config.bootstrap_timeout_ms = timeout_ms;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.peer_config()?;
    let store = SharedStore::builder(counter::reduce, Counter::default())
        .config(config.replication())
        .build();

    match args.mode {
        Mode::Host => run_host(config, store).await,
        Mode::Guest => run_guest(config, store).await,
    }
}

/// Run in host mode - accept guests and order all actions
async fn run_host(config: PeerConfig, store: SharedStore<Counter>) -> Result<()> {
    tracing::info!("Starting counter peer - HOST MODE");
    tracing::info!("  App id: {}", config.app_id);

    let bus = Arc::new(WsHostBus::new());
    let addr = bus.start(&config.addr).await?;
    tracing::info!("Guests can connect to {}", addr);

    run_session(store, bus.clone()).await?;

    bus.stop();
    tracing::info!("Host stopped");
    Ok(())
}

/// Run in guest mode - mirror the host's counter
async fn run_guest(config: PeerConfig, store: SharedStore<Counter>) -> Result<()> {
    tracing::info!("Starting counter peer - GUEST MODE");
    tracing::info!("  Connecting to host: {}", config.addr);

    let bus = Arc::new(WsGuestBus::connect(&config.addr).await?);
    run_session(store, bus).await?;

    tracing::info!("Guest stopped");
    Ok(())
}

/// Drive the session and the console until quit or Ctrl+C
async fn run_session(store: SharedStore<Counter>, bus: Arc<dyn ActionBus>) -> Result<()> {
    let driver = SessionDriver::new(store.clone(), bus).spawn();

    let mut updates = store.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(event) => println!("Counter: {}", event.state.counter),
                Err(RecvError::Lagged(n)) => tracing::warn!("Skipped {} state updates", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("Commands: increment, decrement, increment-if-odd, increment-async, status, quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(Command::Quit) => break,
                    Ok(Command::Status) => {
                        println!("Counter: {}", store.state().counter);
                        println!("{}", serde_json::to_string_pretty(&store.stats())?);
                    }
                    Ok(command) => {
                        if let Err(e) = counter::execute(&store, command) {
                            tracing::warn!("Command failed: {}", e);
                        }
                    }
                    Err(e) => println!("{}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
        }
    }

    printer.abort();
    driver.abort();
    Ok(())
}
