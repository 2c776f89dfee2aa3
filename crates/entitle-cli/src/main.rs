//! Entitle CLI - chat entitlement inspection tool
//!
//! Resolves entitlements against the configured endpoint, runs the free
//! sign-up and applies setup actions to the persisted state.

mod commands;
mod output;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use entitle_core::FileStateStore;

#[derive(Parser)]
#[command(name = "entitle")]
#[command(author, version, about = "Chat entitlement and quota CLI", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: table (default) or json
    #[arg(long, global = true, default_value = "table")]
    format: output::OutputFormat,

    /// Suppress progress messages
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Override state file path (or set ENTITLE_STATE_PATH env var)
    #[arg(long, env = "ENTITLE_STATE_PATH", global = true)]
    state: Option<String>,

    /// Override config file path (or set ENTITLE_CONFIG env var)
    #[arg(long, env = "ENTITLE_CONFIG", global = true)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the persisted entitlement state and derived flags
    Status,

    /// Resolve the entitlement with sessions from a JSON file
    Resolve {
        #[command(flatten)]
        sessions: commands::SessionArgs,

        /// Look up the entitlement even if it resolved before
        #[arg(long)]
        force: bool,
    },

    /// Sign up for the free plan
    SignUp {
        #[command(flatten)]
        sessions: commands::SessionArgs,
    },

    /// Apply an explicit setup action
    Setup {
        #[command(subcommand)]
        action: commands::setup::SetupAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let config = match &cli.config {
        Some(path) => entitle_core::load_config_from(&commands::expand_path(path))?,
        None => entitle_core::load_config()?,
    };

    let store = match &cli.state {
        Some(path) => FileStateStore::open(commands::expand_path(path))?,
        None => FileStateStore::open_default()?,
    };

    // Create context for commands
    let ctx = commands::Context {
        config,
        store: Arc::new(store),
        format: cli.format,
        quiet: cli.quiet,
    };

    // Execute command
    match cli.command {
        Commands::Status => commands::status::execute(&ctx).await,
        Commands::Resolve { sessions, force } => {
            commands::resolve::execute(&ctx, sessions, force).await
        }
        Commands::SignUp { sessions } => commands::sign_up::execute(&ctx, sessions).await,
        Commands::Setup { action } => commands::setup::execute(&ctx, action).await,
        Commands::Config { action } => commands::config::execute(&ctx, action).await,
    }
}
