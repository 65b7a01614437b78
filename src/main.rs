//! # Devgraph CLI (`dvg`)
//!
//! The `dvg` binary is the primary interface for Devgraph. It provides
//! commands for database initialization, connector syncs, the scheduler
//! daemon, and querying the knowledge graph.
//!
//! ## Usage
//!
//! ```bash
//! dvg --config ./config/devgraph.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dvg init` | Create the SQLite database and run schema migrations |
//! | `dvg sources` | List connectors with health, checkpoint, and last job |
//! | `dvg sync <connector>` | Run one sync in the foreground |
//! | `dvg run` | Start the scheduler daemon (workers + leases) |
//! | `dvg jobs` | Show recent sync jobs |
//! | `dvg query "<topic>"` | Assemble the context bundle for a topic |
//! | `dvg search "<text>"` | Semantic search over graph entities |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! dvg init --config ./config/devgraph.toml
//!
//! # Check connector credentials before the first sync
//! dvg sources
//!
//! # Sync one GitHub repo connector in the foreground
//! dvg sync github:platform
//!
//! # Refetch everything from the beginning of history
//! dvg sync github:platform --full
//!
//! # Run the scheduler until Ctrl+C
//! dvg run
//!
//! # What does the graph know about the auth flow?
//! dvg query "auth flow"
//! ```

mod config;
mod connector;
mod connector_discord;
mod connector_github;
mod connector_slack;
mod db;
mod embedding;
mod error;
mod extract;
#[allow(dead_code)]
mod graph;
mod jobs;
mod migrate;
#[allow(dead_code)]
mod models;
mod processor;
mod query;
mod retry;
mod scheduler;
mod sources;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Devgraph CLI — a knowledge graph over developer platform activity.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/devgraph.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dvg",
    about = "Devgraph — a knowledge graph over developer platform activity",
    version,
    long_about = "Devgraph ingests events from GitHub, Slack, and Discord, extracts decisions, \
    discussions, features, and file changes, and links them into a queryable knowledge graph \
    stored in SQLite."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/devgraph.toml`. All connector, database,
    /// extraction, and embedding settings are read from this file.
    #[arg(long, global = true, default_value = "./config/devgraph.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (events,
    /// jobs, checkpoints, entities, relationships, payload tables).
    /// Safe to run repeatedly; existing tables are left alone.
    Init,

    /// List configured connectors and their status.
    ///
    /// Shows each connector's health check result, current checkpoint,
    /// and most recent job. Useful for verifying tokens before a sync.
    Sources,

    /// Run one connector sync in the foreground.
    ///
    /// Fetches events newer than the connector's checkpoint, normalizes
    /// them, extracts knowledge, and writes everything to the graph.
    ///
    /// Connector format: `<platform>:<name>`, e.g. `github:platform`.
    Sync {
        /// Connector id, e.g. `github:platform` or `slack:eng`.
        connector: String,

        /// Ignore the checkpoint — refetch all history from scratch.
        #[arg(long)]
        full: bool,

        /// Dry run — fetch and group events without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Start the scheduler daemon.
    ///
    /// Runs a worker pool that leases pending jobs and re-syncs each
    /// connector on its suggested interval. Stops on SIGINT/SIGTERM;
    /// jobs already started are finished first.
    Run,

    /// Show recent sync jobs, newest first.
    Jobs {
        /// Maximum number of jobs to show.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Assemble the context bundle for a topic.
    ///
    /// Returns matching decisions, features, discussions, file changes,
    /// commits, and one-hop related entities. Every category is capped
    /// so the output stays bounded.
    Query {
        /// Topic to look up: a feature ref, file path, or free text.
        topic: String,
    },

    /// Semantic search over graph entities.
    ///
    /// Embeds the query and returns the nearest entities by cosine
    /// distance. Requires an embedding provider to be configured.
    Search {
        /// The search text.
        text: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to WARN for quiet CLI output; RUST_LOG=info or
    // RUST_LOG=debug for the daemon.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database ready at {}", cfg.db.path.display());
        }
        Commands::Sources => {
            sources::run_sources(&cfg).await?;
        }
        Commands::Sync {
            connector,
            full,
            dry_run,
        } => {
            scheduler::run_sync_once(&cfg, &connector, full, dry_run).await?;
        }
        Commands::Run => {
            scheduler::run_daemon(&cfg).await?;
        }
        Commands::Jobs { limit } => {
            sources::run_jobs(&cfg, limit).await?;
        }
        Commands::Query { topic } => {
            query::run_query(&cfg, &topic).await?;
        }
        Commands::Search { text, limit } => {
            query::run_search(&cfg, &text, limit).await?;
        }
    }

    Ok(())
}
