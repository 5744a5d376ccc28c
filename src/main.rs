//! # Ragi CLI (`ragi`)
//!
//! ## Usage
//!
//! ```bash
//! ragi --config ./config/ragi.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragi init` | Create the SQLite database and run schema migrations |
//! | `ragi watch` | Ingest files from the watched folder until Ctrl-C |
//! | `ragi scan` | Ingest the files currently in the watched folder, then exit |
//! | `ragi ingest <path>` | Ingest a single file now |
//! | `ragi stats` | Show database statistics |
//! | `ragi docs list` | List indexed documents |
//! | `ragi docs delete <name>` | Remove a document so it can be re-ingested |
//! | `ragi memory store` | Remember a chat exchange |
//! | `ragi memory list` | List remembered exchanges, newest first |
//! | `ragi memory recall "<query>"` | Recall relevant exchanges |
//! | `ragi memory sweep` | Delete old, unimportant exchanges |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ragi::{config, docs, ingest, logging, memory_cmd, migrate, stats};

/// Ragi — watched-folder ingestion and interaction memory for local
/// retrieval-augmented chat.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ragi.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ragi",
    about = "Ragi — watched-folder ingestion and interaction memory for local RAG",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragi.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Running it
    /// again is safe.
    Init,

    /// Watch the configured folder and ingest files as they settle.
    ///
    /// Files already in the folder are processed first. Stops cleanly on
    /// Ctrl-C, rolling back anything not yet indexed.
    Watch,

    /// Ingest the files currently in the watched folder, then exit.
    Scan,

    /// Ingest a single file.
    Ingest {
        /// Path to the file.
        path: PathBuf,
    },

    /// Show database statistics.
    Stats,

    /// Manage indexed documents.
    Docs {
        #[command(subcommand)]
        action: DocsAction,
    },

    /// Manage interaction memory.
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
}

#[derive(Subcommand)]
enum DocsAction {
    /// List indexed documents with chunk counts.
    List,
    /// Delete a document's chunks and fingerprints.
    Delete {
        /// File name as shown by `docs list`.
        name: String,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Remember a query/response exchange.
    Store {
        #[arg(long)]
        query: String,
        #[arg(long)]
        response: String,
        /// Exempt the exchange from retention sweeps and weight it higher.
        #[arg(long)]
        important: bool,
    },
    /// List all exchanges, newest first.
    List,
    /// Recall the exchanges most relevant to a query.
    Recall {
        query: String,
    },
    /// Delete unimportant exchanges past the retention age.
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Watch => {
            ingest::run_watch(&cfg).await?;
        }
        Commands::Scan => {
            ingest::run_scan(&cfg).await?;
        }
        Commands::Ingest { path } => {
            ingest::run_ingest(&cfg, &path).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Docs { action } => match action {
            DocsAction::List => docs::run_list(&cfg).await?,
            DocsAction::Delete { name } => docs::run_delete(&cfg, &name).await?,
        },
        Commands::Memory { action } => match action {
            MemoryAction::Store {
                query,
                response,
                important,
            } => memory_cmd::run_store(&cfg, &query, &response, important).await?,
            MemoryAction::List => memory_cmd::run_list(&cfg).await?,
            MemoryAction::Recall { query } => memory_cmd::run_recall(&cfg, &query).await?,
            MemoryAction::Sweep => memory_cmd::run_sweep(&cfg).await?,
        },
    }

    Ok(())
}
