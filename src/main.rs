use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use live_session::{
    create_router, AppState, ClockedOutput, Config, EnvCredential, FileMediaDevices,
    LogMessageStore, MessageStore, NatsMessageStore, SessionController, SessionDeps,
    WebSocketConnector,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "live-session", version, about = "Live multimodal session service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP control surface over a live session
    Serve {
        /// Configuration file (without extension is fine)
        #[arg(long, default_value = "config/live-session")]
        config: String,

        /// Override the configured bind address
        #[arg(long)]
        bind: Option<String>,

        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve { config, bind, port } => serve(&config, bind, port).await,
    }
}

async fn serve(config_path: &str, bind: Option<String>, port: Option<u16>) -> Result<()> {
    let cfg = Config::load(config_path)?;

    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));
    info!("Live endpoint: {} ({})", cfg.endpoint.url, cfg.endpoint.model);

    let store: Arc<dyn MessageStore> = match &cfg.persistence.nats_url {
        Some(url) => Arc::new(
            NatsMessageStore::connect(url, cfg.persistence.subject_prefix.clone()).await?,
        ),
        None => {
            warn!("No persistence configured; finalized messages are only logged");
            Arc::new(LogMessageStore)
        }
    };

    let connector = WebSocketConnector::new(cfg.endpoint.url.clone(), cfg.endpoint.model.clone())
        .with_setup_timeout(Duration::from_secs(cfg.endpoint.setup_timeout_secs));

    let deps = SessionDeps {
        devices: Arc::new(FileMediaDevices::new(
            cfg.devices.microphone_wav.clone(),
            cfg.devices.camera_image.clone(),
        )),
        connector: Arc::new(connector),
        credentials: Arc::new(EnvCredential::new(cfg.endpoint.token_env.clone())),
        store,
        output: Box::new(ClockedOutput::new()),
    };

    info!("Chat session: {}", cfg.session.session_id);
    let controller = SessionController::spawn(cfg.session, deps);
    let app = create_router(AppState::new(controller.clone()));

    let bind = bind.unwrap_or(cfg.service.http.bind);
    let port = port.unwrap_or(cfg.service.http.port);
    let addr: SocketAddr = format!("{}:{}", bind, port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", bind, port))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP control surface listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("HTTP server failed")?;

    controller.stop().await?;
    info!("Live session service stopped");
    Ok(())
}
