//! Idempotency ledger and the key-value seam it is stored behind

pub mod kv;
pub mod ledger;

pub use kv::KeyValueStore;
pub use ledger::{BeginOutcome, IdempotencyLedger, LedgerEntry, LedgerStatus};
