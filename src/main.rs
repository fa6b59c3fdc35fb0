use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use instructd::api::server::{build_router, ApiState};
use instructd::config::Config;
use instructd::instructions::InstructionStore;

#[derive(Parser)]
#[command(name = "instructd", version, about = "Versioned agent instruction service")]
struct Cli {
    /// Path to the config file (defaults to the platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API server.
    Serve {
        /// Override the bind address from the config file.
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { bind } => serve(config, bind).await,
    }
}

async fn serve(mut config: Config, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        config.bind = bind;
    }

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Fail fast if the schema cannot be created.
    InstructionStore::open(&config.db_path)?;

    let state = ApiState {
        db_path: Arc::new(config.db_path.clone()),
        default_page_limit: config.default_page_limit,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    tracing::info!(
        "listening on {} (db: {})",
        config.bind,
        config.db_path.display()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
