use axum::{routing::get, Router};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use viewer::config::{Cli, ViewerConfig};
use viewer::event_loop::run_event_loop;
use viewer::prefs::Preferences;
use viewer::rest::{create_router, AppState};
use viewer::session::Snapshot;
use viewer::metrics;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match ViewerConfig::load(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting UAV telemetry viewer");
    info!("MQTT broker: {}:{} ({:?})", config.host, config.port, config.transport);
    info!("Telemetry topic: {}", config.topic);
    info!("History RPC: {} -> {}/{}", config.request_topic, config.reply_prefix, config.client_id);
    info!("HTTP server: {}", config.http_addr);

    // Initialize metrics
    metrics::init_metrics();

    let prefs = Preferences::load(&config.prefs_path);
    if let Some(user) = prefs.last_user() {
        info!("Last used MQTT user: {}", user);
    }

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (snap_tx, snap_rx) = watch::channel(Snapshot::default());

    let http_addr = config.http_addr.clone();
    let loop_handle = tokio::spawn(run_event_loop(config, prefs, cmd_rx, snap_tx));

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(create_router(AppState::new(snap_rx, cmd_tx)));

    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = loop_handle => {
            error!("Event loop terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
