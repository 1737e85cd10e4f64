//! Bulk ingestion of customers, products, orders and order items
//!
//! An attempt decodes its input streams into an attempt-scoped
//! [`staging::StagingArea`], validates every record, and promotes the valid
//! ones in dependency order. Per-record problems become conflicts in the
//! [`types::IngestionOutcome`]; only structural problems abort the attempt.

pub mod attempt;
pub mod decoder;
pub mod pipeline;
pub mod promoter;
pub mod staging;
pub mod types;
pub mod validator;

pub use attempt::{AttemptMachine, AttemptState};
pub use pipeline::{IngestionPipeline, IngestionRequest, IngestionResponse, SourceFile};
pub use promoter::Promoter;
pub use staging::StagingArea;
pub use types::{
    EntityKind, EntityRecord, IngestionOutcome, OutcomeStatus, RecordConflict, PROMOTION_ORDER,
};
pub use validator::ValidationRules;
