//! Stockline - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use stockline_common::checksum::{compute_file_checksum, RequestHasher};
use stockline_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use stockline_ingest::cli::{Cli, Commands, SessionCommand};
use stockline_ingest::config::Config;
use stockline_ingest::db;
use stockline_ingest::idempotency::IdempotencyLedger;
use stockline_ingest::ingest::{EntityKind, IngestionPipeline, IngestionRequest, SourceFile};
use stockline_ingest::sessions::ChunkTracker;
use stockline_ingest::stock::{parse_stock_events, StockUpdateEngine};
use stockline_ingest::store::PgStore;
use tracing::{error, info};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.markdown_help {
        println!("{}", clap_markdown::help_markdown::<Cli>());
        return;
    }

    let Some(command) = cli.command else {
        eprintln!("Error: A subcommand is required");
        eprintln!();
        eprintln!("For more information, try '--help'.");
        process::exit(2);
    };

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("stockline".to_string())
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    // The CLI still works when logging cannot be set up.
    let _log_guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        },
    };

    if let Err(e) = execute_command(command, cli.database_url).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn execute_command(command: Commands, database_url: Option<String>) -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(url) = database_url {
        config.database.url = url;
    }

    let pool = db::create_pool(&config.database)
        .await
        .context("Failed to connect to database")?;
    db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    let store = Arc::new(PgStore::new(Arc::new(pool)));

    match command {
        Commands::Migrate => store.migrate().await.context("Failed to apply migrations"),

        Commands::Ingest {
            tenant,
            files,
            kind,
            idempotency_key,
            upload_token,
            chunk_index,
            deadline_secs,
        } => {
            let request = build_ingest_request(
                tenant,
                &files,
                kind,
                idempotency_key,
                upload_token.zip(chunk_index),
                deadline_secs,
            )?;

            let pipeline = IngestionPipeline::new(store.clone(), store.clone(), store, &config);
            let response = pipeline.run(request).await?;
            print_json(&response)
        },

        Commands::Stock {
            tenant,
            file,
            deadline_secs,
        } => {
            let file_name = file_name(&file)?;
            let reader = std::fs::File::open(&file)
                .with_context(|| format!("Failed to open {}", file.display()))?;
            let parsed = tokio::task::spawn_blocking(move || {
                parse_stock_events(std::io::BufReader::new(reader), &file_name)
            })
            .await??;
            info!(
                events = parsed.events.len(),
                invalid = parsed.invalid.len(),
                skipped = parsed.skipped,
                "Stock events parsed"
            );

            let engine = StockUpdateEngine::new(store, config.stock.clone());
            let outcome = engine
                .apply_parsed(tenant, parsed, deadline_secs.map(Duration::from_secs))
                .await?;
            print_json(&outcome)
        },

        Commands::Session { command } => {
            let tracker = ChunkTracker::new(store);
            match command {
                SessionCommand::Create {
                    tenant,
                    total,
                    token,
                } => print_json(&tracker.create_session(tenant, total, token).await?),
                SessionCommand::Status { tenant, token } => {
                    print_json(&tracker.status(tenant, token).await?)
                },
            }
        },

        Commands::Sweep => {
            let ledger = IdempotencyLedger::new(store, config.idempotency.clone());
            let purged = ledger.purge_expired().await?;
            info!(purged, "Expired idempotency entries removed");
            print_json(&serde_json::json!({ "purged": purged }))
        },
    }
}

fn file_name(path: &std::path::Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("Invalid file name: {}", path.display()))
}

/// Open every file and, when an idempotency key is given, hash the request
/// from the file names, kind hint and file checksums.
fn build_ingest_request(
    tenant: Uuid,
    files: &[PathBuf],
    kind: Option<EntityKind>,
    idempotency_key: Option<String>,
    chunk: Option<(Uuid, u32)>,
    deadline_secs: Option<u64>,
) -> Result<IngestionRequest> {
    let mut sources = Vec::with_capacity(files.len());
    let mut hasher = RequestHasher::new();
    hasher.update_part("tenant", tenant.as_bytes());
    if let Some(kind) = kind {
        hasher.update_part("kind", kind.as_str().as_bytes());
    }

    for path in files {
        let mut source = SourceFile::from_path(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        if let Some(kind) = kind {
            source = source.with_kind(kind);
        }
        if idempotency_key.is_some() {
            let checksum = compute_file_checksum(path)
                .with_context(|| format!("Failed to hash {}", path.display()))?;
            hasher.update_part(&source.name, checksum.as_bytes());
        }
        sources.push(source);
    }

    let mut request = IngestionRequest::new(tenant, sources);
    if let Some(key) = idempotency_key {
        request = request.with_idempotency(key, hasher.finalize());
    }
    if let Some((token, index)) = chunk {
        request = request.with_chunk(token, index);
    }
    if let Some(secs) = deadline_secs {
        request = request.with_deadline(Duration::from_secs(secs));
    }
    Ok(request)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
