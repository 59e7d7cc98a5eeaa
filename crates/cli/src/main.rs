//! Capstan CLI — the main entry point.
//!
//! Commands:
//! - `onboard` — Initialize the config directory
//! - `chat`    — Interactive chat or single-message mode
//! - `tools`   — List the configured tool catalog
//! - `remote`  — Connect to remote tool servers and list their tools
//! - `doctor`  — Diagnose configuration and environment

use clap::{Parser, Subcommand};

mod commands;
mod host;

#[derive(Parser)]
#[command(
    name = "capstan",
    about = "Capstan — LLM tool-calling engine",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration
    Onboard,

    /// Chat with the model, with tools available
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,
    },

    /// List the configured tool catalog
    Tools,

    /// Connect to remote tool servers and list discovered tools
    Remote {
        /// Only this server instead of every configured one
        server: Option<String>,
    },

    /// Diagnose configuration and environment
    Doctor,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Onboard => commands::onboard::run().await?,
        Commands::Chat { message } => commands::chat::run(message).await?,
        Commands::Tools => commands::tools::run().await?,
        Commands::Remote { server } => commands::remote::run(server).await?,
        Commands::Doctor => commands::doctor::run().await?,
    }

    Ok(())
}
