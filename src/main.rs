use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use leadboard::config::LeadboardConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "leadboard")]
#[command(version, about = "Multi-tenant sales pipeline board and payment reconciler")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to the config file (defaults to ./leadboard.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP and WebSocket server
    Serve {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
        /// Path to the SQLite database
        #[arg(long)]
        db_path: Option<PathBuf>,
        /// Permissive CORS and bind on all interfaces
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and a default leadboard.toml
    Init {
        /// Path to the SQLite database
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    leadboard::logging::init_tracing(cli.verbose, cli.log_json);

    let config = LeadboardConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port, db_path, dev } => {
            cmd::cmd_serve(
                config,
                cmd::serve::ServeOverrides { port, db_path, dev },
            )
            .await?;
        }
        Commands::Init { db_path } => {
            cmd::cmd_init(config, db_path, cli.config.as_deref())?;
        }
    }

    Ok(())
}
