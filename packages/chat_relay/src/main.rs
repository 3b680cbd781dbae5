use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::prelude::*;

mod cli;
mod config;
mod fold;
mod protocol;
mod registry;
mod relay;
mod responder;
mod server;
mod transport;

use registry::ConversationRegistry;
use responder::MockResponder;
use server::AppState;

#[derive(Parser)]
#[command(name = "chat-relay")]
#[command(about = "Multi-viewer chat synchronization relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config.toml (defaults to ./config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server in the foreground
    Server(ServerArgs),

    /// Connect to a conversation as an interactive viewer
    Chat(ChatArgs),
}

#[derive(Parser)]
struct ServerArgs {
    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the relay server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct ChatArgs {
    /// Conversation to join
    #[arg(default_value = "default")]
    conversation: String,

    /// Relay server to connect to
    #[arg(long, default_value = "http://127.0.0.1:4820")]
    server_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    let file_config: config::FileConfig = config::load_config(&config_path)
        .extract()
        .context("failed to load configuration")?;

    match cli.command {
        Commands::Server(args) => run_server(args, file_config).await,
        Commands::Chat(args) => cli::chat_command(args.conversation, args.server_url, file_config).await,
    }
}

async fn run_server(args: ServerArgs, mut file_config: config::FileConfig) -> Result<()> {
    let default_directive = if args.debug {
        "chat_relay=debug,tower_http=debug,info"
    } else {
        "chat_relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }

    let state = AppState {
        registry: Arc::new(ConversationRegistry::new()),
        responder: Arc::new(MockResponder::new(
            file_config.responder.to_responder_config(),
        )),
    };
    let app = server::build_router(state);

    let addr = config::resolved_addr(&file_config)?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Chat relay listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  GET /api/conv/:id    - Conversation log snapshot");
    info!("  GET /api/conv/:id/ws - WebSocket connection to conversation");

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received shutdown signal, cleaning up...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}
