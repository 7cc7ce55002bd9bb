//! Custos Server
//!
//! A custodial escrow orchestrator for two-party token trades settled
//! over chat venues.

mod api;
mod config;
mod server;
mod shutdown;
mod state;
mod telegram;

use clap::Parser;
use config::{ConfigLoader, get_database_url};
use server::{build_router, run_server};
use shutdown::spawn_config_reload_handler;
use sqlx::postgres::PgPoolOptions;
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use custos_core::chain::ChainRegistry;
use custos_core::config::SharedConfig;
use custos_core::engine::{
    DeadlineSweeper, Notifier, Reconciler, Scheduler, TimerDispatch, TradeFlow,
};
use custos_core::events::{notification_channel, timer_channel};
use custos_core::store::PgStore;
use telegram::TelegramGateway;

/// Custos - Custodial escrow orchestrator for chat-based token trades
#[derive(Parser, Debug)]
#[command(name = "custos-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./custos-config.toml")]
    config: PathBuf,

    /// Override the listen address (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Run database migrations on startup
    #[arg(long, default_value = "false")]
    migrate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    // Parse command line arguments
    let args = Args::parse();

    tracing::info!("Starting custos-server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_loader = Arc::new(ConfigLoader::new(&args.config, args.listen));
    let loaded = config_loader.load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;

    let listen_addr = loaded.listen;
    tracing::info!("Configuration loaded from {:?}", args.config);

    // Get database URL from environment
    let database_url = get_database_url().map_err(|e| {
        tracing::error!("DATABASE_URL environment variable not set");
        e
    })?;

    // Create database connection pool
    tracing::info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;
    tracing::info!("Database connection established");

    // Run migrations if requested
    if args.migrate {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&db_pool)
            .await
            .map_err(|e| {
                tracing::error!("Failed to run migrations: {}", e);
                e
            })?;
        tracing::info!("Migrations completed successfully");
    }

    // Shared config: the admin roster sits behind a live lock, the rest is
    // fixed until restart
    let shared_config =
        SharedConfig::new(loaded.admin, loaded.escrow, loaded.chains, loaded.contracts);
    let sweep_interval = shared_config.escrow.sweep_interval;

    // Build one chain client per configured network
    let chains = ChainRegistry::from_endpoints(&shared_config.chains).map_err(|e| {
        tracing::error!("Failed to build chain clients: {}", e);
        e
    })?;

    // Engine wiring
    let store = Arc::new(PgStore::new(db_pool.clone()));
    let gateway = Arc::new(TelegramGateway::new(&loaded.bot_token));
    let (notification_tx, notification_rx) = notification_channel();
    let (timer_tx, timer_rx) = timer_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let timers = Scheduler::new(timer_tx);

    let flow = Arc::new(TradeFlow::new(
        Arc::clone(&store),
        Arc::clone(&gateway),
        chains.clone(),
        shared_config.clone(),
        notification_tx.clone(),
        timers.clone(),
    ));

    tracing::info!(venues = loaded.venues.len(), "Provisioning venue roster");
    flow.provision_venues(&loaded.venues).await?;

    // Background processors
    tokio::spawn(
        Notifier::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            notification_rx,
            shutdown_rx.clone(),
        )
        .run(),
    );
    tokio::spawn(TimerDispatch::new(Arc::clone(&flow), timer_rx, shutdown_rx.clone()).run());
    tokio::spawn(
        DeadlineSweeper::new(Arc::clone(&flow), sweep_interval, shutdown_rx.clone()).run(),
    );
    tokio::spawn(
        Reconciler::new(
            Arc::clone(&store),
            flow.settlements().clone(),
            chains,
            notification_tx,
            timers,
            sweep_interval,
            shutdown_rx,
        )
        .run(),
    );

    // Create application state
    let state = AppState::new(Arc::clone(&flow), shared_config, loaded.service_secret);

    // Spawn config reload handler (listens for SIGHUP)
    let shutdown_notify = spawn_config_reload_handler(state.clone(), config_loader);

    // Build the router
    let router = build_router(state);

    // Run the server
    tracing::info!("Starting HTTP server on {}", listen_addr);
    let result = run_server(router, listen_addr).await;

    // Stop the background processors
    let _ = shutdown_tx.send(true);

    // Signal the config reload handler to stop
    shutdown_notify.notify_one();

    // Close database connections gracefully
    tracing::info!("Closing database connections...");
    db_pool.close().await;
    tracing::info!("Server shutdown complete");

    result.map_err(Into::into)
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
