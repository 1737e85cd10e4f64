//! Error types shared across Stockline crates

use thiserror::Error;

/// Result type alias for shared operations
pub type Result<T> = std::result::Result<T, StocklineError>;

/// Main error type for shared utilities
#[derive(Error, Debug)]
pub enum StocklineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
