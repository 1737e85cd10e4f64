//! Build automation tasks for Stockline
//!
//! Currently generates the CLI reference from the clap definitions.

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for Stockline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<stockline_ingest::cli::Cli>();

    let content = format!(
        r#"# Stockline CLI Reference

Generated from the CLI source code on {}.

## Quick Start

```bash
# Create the schema
stockline migrate

# Ingest a batch; file names select the entity kind
stockline ingest --tenant $TENANT \
  --idempotency-key nightly-2024-03-01 \
  customers_0301.ndjson products_0301.ndjson orders_0301.ndjson order_items_0301.ndjson

# Chunked upload
stockline session create --tenant $TENANT --total 3
stockline ingest --tenant $TENANT --upload-token $TOKEN --chunk-index 0 orders_part0.ndjson.gz
stockline session status --tenant $TENANT --token $TOKEN

# Stock movements
stockline stock --tenant $TENANT stock_events.ndjson

# Remove expired idempotency entries
stockline sweep
```

## Commands

{}

## Environment Variables

- `DATABASE_URL` - PostgreSQL connection URL
- `STOCKLINE_BATCH_SIZE` - Records per promotion transaction (default: 500)
- `STOCKLINE_PARALLEL_BATCHES` - Concurrent batches per entity kind (default: 4)
- `STOCKLINE_ATTEMPT_DEADLINE_SECS` - Default attempt deadline, 0 disables (default: 0)
- `STOCKLINE_IDEMPOTENCY_TTL_SECS` - Idempotency entry lifetime (default: 86400)
- `STOCKLINE_STALE_PENDING_SECS` - Age at which a pending entry is taken over (default: 900)
- `STOCKLINE_NEGATIVE_STOCK_POLICY` - `reject`, `clamp` or `allow` (default: `reject`)
- `STOCKLINE_LOCK_TIMEOUT_MS` - Product lock wait, 0 waits forever (default: 5000)
- `STOCKLINE_MAX_CONCURRENT_PRODUCTS` - Products updated in parallel (default: 16)
- `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR` - Logging

---

*To update, run `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;

    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("Generated CLI documentation at: {}", file_path.display());

    Ok(())
}
