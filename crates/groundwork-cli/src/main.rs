mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::EnvFilter;

use commands::migrate::{self, Action, Context};

#[derive(Parser)]
#[command(name = "groundwork")]
#[command(about = "Versioned migrations for relational and document stores")]
struct Cli {
    /// Path to groundwork.toml (default: search upwards from the working directory)
    #[arg(long, global = true, env = "GROUNDWORK_CONFIG")]
    config: Option<PathBuf>,

    /// Configured database to operate on
    #[arg(long, global = true, env = "GROUNDWORK_DB")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new migration script
    Create {
        /// Human readable slug, e.g. "add users table"
        slug: String,
    },

    /// Apply pending migrations
    Up {
        /// Apply up to and including this migration
        id: Option<String>,

        /// Apply at most this many migrations
        #[arg(long, conflicts_with = "id")]
        count: Option<usize>,
    },

    /// Revert applied migrations (default: the latest one)
    Down {
        /// Revert down to and including this migration
        id: Option<String>,

        /// Revert this many migrations
        #[arg(long, conflicts_with_all = ["id", "all"])]
        count: Option<usize>,

        /// Revert every applied migration
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },

    /// Show applied and pending migrations
    Status,

    /// Mark migrations up to an id as applied without running them
    SetHead {
        id: String,
    },

    /// Clear a stale run lock
    Unlock,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("groundwork=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", style("error:").red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let ctx = Context::load(cli.config.as_deref(), cli.db.as_deref())?;

    let action = match cli.command {
        Commands::Create { slug } => return migrate::create(&ctx, &slug),
        Commands::Up { id, count } => Action::Up(migrate::up_target(id, count)),
        Commands::Down { id, count, all } => Action::Down(migrate::down_target(id, count, all)),
        Commands::Status => Action::Status,
        Commands::SetHead { id } => Action::SetHead(id.into()),
        Commands::Unlock => Action::Unlock,
    };

    migrate::execute(&ctx, action).await
}
