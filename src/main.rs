use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleetscan::backends::BackendRegistry;

mod cli;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Backend to scan (defaults to `backend.type` from the configuration)
    #[arg(long, global = true)]
    backend: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover every image in the fleet once and print it as JSON lines
    #[command(visible_alias = "d")]
    Discover {
        /// Exit with an error if any part of the fleet could not be scanned
        #[arg(long)]
        strict: bool,
    },
    /// Follow the fleet's change feed and print images as members appear
    #[command(visible_alias = "w")]
    Watch,
    /// Extract images for one ECS task state change event
    #[cfg(feature = "ecs")]
    EcsEvent {
        /// Path to the event JSON, or `-` for stdin
        file: String,
    },
    /// Validate the configuration files and exit
    CheckConfig,
}

/// Cancel `token` on SIGINT or SIGTERM
fn cancel_on_shutdown(token: CancellationToken) {
    use tokio::signal;

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), shutting down gracefully");
            },
            _ = terminate => {
                info!("Received SIGTERM, shutting down gracefully");
            },
        }
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout carries only image records
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let registry = BackendRegistry::with_defaults();
    let backend = cli.backend.as_deref();

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());

    match cli.command {
        Commands::Discover { strict } => cli::discover(&registry, backend, strict, cancel).await,
        Commands::Watch => cli::watch(&registry, backend, cancel).await,
        #[cfg(feature = "ecs")]
        Commands::EcsEvent { file } => cli::ecs_event(&file).await,
        Commands::CheckConfig => cli::check_config(),
    }
}
