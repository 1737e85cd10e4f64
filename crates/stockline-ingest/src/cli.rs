//! Command-line interface definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use crate::ingest::EntityKind;

/// Stockline - multi-tenant bulk ingestion and stock updates
#[derive(Parser, Debug)]
#[command(name = "stockline")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// Print the full command reference as markdown
    #[arg(long, hide = true)]
    pub markdown_help: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest customer, product, order and order item files
    Ingest {
        /// Tenant owning the data
        #[arg(short, long)]
        tenant: Uuid,

        /// Input files (.ndjson, .jsonl or .csv, optionally .gz)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Entity kind for every file (otherwise inferred from file names)
        #[arg(short, long)]
        kind: Option<EntityKind>,

        /// Make the request replay-safe under this key
        #[arg(long)]
        idempotency_key: Option<String>,

        /// Upload session this request is a chunk of
        #[arg(long, requires = "chunk_index")]
        upload_token: Option<Uuid>,

        /// Zero-based chunk index within the upload session
        #[arg(long, requires = "upload_token")]
        chunk_index: Option<u32>,

        /// Abandon the attempt after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Apply an NDJSON file of stock events
    Stock {
        /// Tenant owning the products
        #[arg(short, long)]
        tenant: Uuid,

        /// Stock event file (.ndjson, optionally .gz)
        file: PathBuf,

        /// Abandon products not started after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Manage chunked upload sessions
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },

    /// Remove expired idempotency entries
    Sweep,

    /// Apply database migrations
    Migrate,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    /// Open a new upload session
    Create {
        #[arg(short, long)]
        tenant: Uuid,

        /// Number of chunks the upload consists of
        #[arg(long)]
        total: u32,

        /// Use this token instead of a generated one
        #[arg(long)]
        token: Option<Uuid>,
    },

    /// Show received and missing chunks
    Status {
        #[arg(short, long)]
        tenant: Uuid,

        #[arg(long)]
        token: Uuid,
    },
}
