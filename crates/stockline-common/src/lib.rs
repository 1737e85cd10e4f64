//! Stockline Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities and error handling for the Stockline workspace.
//!
//! # Overview
//!
//! - **Error Handling**: `StocklineError` and the crate `Result` alias
//! - **Checksums**: request hashing used as the idempotency fingerprint
//! - **Logging**: `LogConfig` and `init_logging` for every binary
//!
//! # Example
//!
//! ```no_run
//! use stockline_common::checksum::RequestHasher;
//!
//! fn fingerprint(payload: &[u8]) -> String {
//!     let mut hasher = RequestHasher::new();
//!     hasher.update_part("customers_1.ndjson", payload);
//!     hasher.finalize()
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{Result, StocklineError};
