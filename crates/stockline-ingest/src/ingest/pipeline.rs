//! Ingestion pipeline
//!
//! Wires the stages of one attempt together:
//!
//! 1. chunk receipt (when the request belongs to an upload session)
//! 2. idempotency check
//! 3. decode into the staging area
//! 4. validate
//! 5. dependency-ordered promotion
//! 6. ledger completion and the attempt outcome

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::attempt::{AttemptMachine, AttemptState};
use super::decoder::{decode, infer_kind, SourceDescriptor};
use super::promoter::Promoter;
use super::staging::StagingArea;
use super::types::{EntityKind, IngestionOutcome, OutcomeStatus};
use super::validator::ValidationRules;
use crate::config::Config;
use crate::error::{IdempotencyError, IngestError};
use crate::idempotency::{BeginOutcome, IdempotencyLedger, KeyValueStore};
use crate::sessions::{ChunkTracker, SessionProgress, SessionStore};
use crate::store::ProductionStore;

/// One input stream of an attempt
pub struct SourceFile {
    /// File name; drives format detection and, without a hint, the entity kind
    pub name: String,
    pub kind: Option<EntityKind>,
    pub reader: Box<dyn Read + Send>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, reader: impl Read + Send + 'static) -> Self {
        Self {
            name: name.into(),
            kind: None,
            reader: Box::new(reader),
        }
    }

    pub fn with_kind(mut self, kind: EntityKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn from_path(path: &Path) -> Result<Self, IngestError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| IngestError::Structural(format!("invalid file name: {}", path.display())))?
            .to_string();
        let file = File::open(path)?;
        Ok(Self::new(name, BufReader::new(file)))
    }
}

impl std::fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceFile")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyContext {
    pub key: String,
    /// Caller-computed hash of the request content
    pub request_hash: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkContext {
    pub upload_token: Uuid,
    pub chunk_index: u32,
}

#[derive(Debug)]
pub struct IngestionRequest {
    pub tenant_id: Uuid,
    pub sources: Vec<SourceFile>,
    pub idempotency: Option<IdempotencyContext>,
    pub chunk: Option<ChunkContext>,
    pub deadline: Option<Duration>,
}

impl IngestionRequest {
    pub fn new(tenant_id: Uuid, sources: Vec<SourceFile>) -> Self {
        Self {
            tenant_id,
            sources,
            idempotency: None,
            chunk: None,
            deadline: None,
        }
    }

    pub fn with_idempotency(mut self, key: impl Into<String>, request_hash: impl Into<String>) -> Self {
        self.idempotency = Some(IdempotencyContext {
            key: key.into(),
            request_hash: request_hash.into(),
        });
        self
    }

    pub fn with_chunk(mut self, upload_token: Uuid, chunk_index: u32) -> Self {
        self.chunk = Some(ChunkContext {
            upload_token,
            chunk_index,
        });
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum IngestionResponse {
    /// This call ran the attempt
    Completed(IngestionOutcome),
    /// Cached outcome of an earlier request with the same idempotency key
    Replayed(IngestionOutcome),
    /// Another request with the same key is still running
    InProgress,
    /// The chunk was promoted by an earlier attempt
    ChunkAlreadyPromoted { session: SessionProgress },
}

impl IngestionResponse {
    pub fn outcome(&self) -> Option<&IngestionOutcome> {
        match self {
            IngestionResponse::Completed(outcome) | IngestionResponse::Replayed(outcome) => Some(outcome),
            IngestionResponse::InProgress | IngestionResponse::ChunkAlreadyPromoted { .. } => None,
        }
    }
}

pub struct IngestionPipeline {
    ledger: IdempotencyLedger,
    tracker: ChunkTracker,
    promoter: Promoter,
    rules: ValidationRules,
    default_deadline: Option<Duration>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn ProductionStore>,
        kv: Arc<dyn KeyValueStore>,
        sessions: Arc<dyn SessionStore>,
        config: &Config,
    ) -> Self {
        Self {
            ledger: IdempotencyLedger::new(kv, config.idempotency.clone()),
            tracker: ChunkTracker::new(sessions),
            promoter: Promoter::new(store, &config.ingest),
            rules: ValidationRules::default(),
            default_deadline: config.ingest.default_deadline,
        }
    }

    pub fn with_rules(mut self, rules: ValidationRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    pub fn tracker(&self) -> &ChunkTracker {
        &self.tracker
    }

    #[tracing::instrument(
        skip(self, request),
        fields(tenant_id = %request.tenant_id, sources = request.sources.len())
    )]
    pub async fn run(&self, request: IngestionRequest) -> Result<IngestionResponse, IngestError> {
        let IngestionRequest {
            tenant_id,
            sources,
            idempotency,
            chunk,
            deadline,
        } = request;

        if let Some(chunk) = &chunk {
            let receipt = self
                .tracker
                .accept(tenant_id, chunk.upload_token, chunk.chunk_index)
                .await?;
            if receipt.already_promoted {
                info!(
                    upload_token = %chunk.upload_token,
                    chunk_index = chunk.chunk_index,
                    "Chunk already promoted, skipping"
                );
                let session = self.tracker.status(tenant_id, chunk.upload_token).await?;
                return Ok(IngestionResponse::ChunkAlreadyPromoted { session });
            }
        }

        let attempt = match &idempotency {
            Some(ctx) => match self.ledger.begin(tenant_id, &ctx.key, &ctx.request_hash).await? {
                BeginOutcome::Proceed { attempt } => attempt,
                BeginOutcome::ReturnCached(summary) => {
                    let outcome = serde_json::from_value(summary).map_err(IdempotencyError::from)?;
                    return Ok(IngestionResponse::Replayed(outcome));
                },
                BeginOutcome::InProgress => return Ok(IngestionResponse::InProgress),
                BeginOutcome::Conflict { .. } => {
                    return Err(IngestError::IdempotencyKeyConflict { key: ctx.key.clone() });
                },
            },
            None => 1,
        };

        let deadline = deadline.or(self.default_deadline).map(|d| Instant::now() + d);
        let result = self
            .execute(tenant_id, sources, chunk.as_ref(), deadline, attempt)
            .await;

        if let Some(ctx) = &idempotency {
            match &result {
                Ok(outcome) => {
                    let summary = serde_json::to_value(outcome).map_err(IdempotencyError::from)?;
                    self.ledger.complete(tenant_id, &ctx.key, summary).await?;
                },
                Err(err) => {
                    if let Err(ledger_err) = self.ledger.fail(tenant_id, &ctx.key, &err.to_string()).await {
                        warn!(key = %ctx.key, error = %ledger_err, "Failed to record failed attempt");
                    }
                },
            }
        }

        result.map(IngestionResponse::Completed)
    }

    async fn execute(
        &self,
        tenant_id: Uuid,
        sources: Vec<SourceFile>,
        chunk: Option<&ChunkContext>,
        deadline: Option<Instant>,
        attempt: u64,
    ) -> Result<IngestionOutcome, IngestError> {
        let started_at = Utc::now();
        let attempt_id = Uuid::new_v4();
        let mut machine = AttemptMachine::new(attempt_id);
        info!(attempt_id = %attempt_id, attempt, "Ingestion attempt started");

        machine.advance(AttemptState::Decoding)?;
        let mut staging = tokio::task::spawn_blocking(move || stage_sources(attempt_id, tenant_id, sources))
            .await
            .map_err(|e| IngestError::Internal(format!("decoder task failed: {}", e)))??;
        check_deadline(deadline, &machine)?;
        machine.advance(AttemptState::Staged)?;

        machine.advance(AttemptState::Validating)?;
        let summary = staging.validate_all(&self.rules);
        debug!(valid = summary.valid, invalid = summary.invalid, "Validation finished");
        check_deadline(deadline, &machine)?;

        self.promoter.promote(&mut staging, &mut machine, deadline).await?;

        let session = match chunk {
            Some(chunk) => {
                self.tracker
                    .mark_promoted(tenant_id, chunk.upload_token, chunk.chunk_index)
                    .await?;
                Some(self.tracker.status(tenant_id, chunk.upload_token).await?)
            },
            None => None,
        };

        let conflicts = staging.conflicts();
        machine.advance(if conflicts.is_empty() {
            AttemptState::Completed
        } else {
            AttemptState::CompletedWithConflicts
        })?;

        let promoted_counts = staging.promoted_counts();
        let skipped_counts = staging.skipped_counts();
        let landed: u64 = promoted_counts.values().chain(skipped_counts.values()).sum();
        let status = if conflicts.is_empty() {
            OutcomeStatus::Success
        } else if landed == 0 {
            OutcomeStatus::Failure
        } else {
            OutcomeStatus::PartialSuccess
        };

        let outcome = IngestionOutcome {
            attempt_id,
            tenant_id,
            status,
            attempt_state: machine.state(),
            rows_received: staging.rows_received(),
            promoted_counts,
            skipped_counts,
            conflicts,
            session,
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            attempt_id = %attempt_id,
            status = status.as_str(),
            rows_received = outcome.rows_received,
            promoted = outcome.total_promoted(),
            skipped = outcome.total_skipped(),
            conflicts = outcome.conflicts.len(),
            "Ingestion attempt finished"
        );

        Ok(outcome)
    }
}

fn check_deadline(deadline: Option<Instant>, machine: &AttemptMachine) -> Result<(), IngestError> {
    if deadline.is_some_and(|d| Instant::now() >= d) {
        warn!(state = %machine.state(), "Deadline exceeded");
        return Err(IngestError::DeadlineExceeded {
            state: machine.state(),
        });
    }
    Ok(())
}

/// Decode every source into a fresh staging area.
///
/// Blocking: runs on the blocking pool.
fn stage_sources(
    attempt_id: Uuid,
    tenant_id: Uuid,
    sources: Vec<SourceFile>,
) -> Result<StagingArea, IngestError> {
    let mut staging = StagingArea::new(attempt_id, tenant_id);

    for source in sources {
        let kind = infer_kind(&source.name, source.kind)?;
        let descriptor = SourceDescriptor::from_file_name(&source.name)?;
        let name: Arc<str> = Arc::from(source.name.as_str());

        for line in decode(source.reader, descriptor) {
            match line.result {
                Ok(fields) => staging.stage(kind, name.clone(), line.line_number, fields),
                Err(err) if err.fatal => {
                    return Err(IngestError::Structural(format!(
                        "{}: line {}: {}",
                        name, line.line_number, err
                    )));
                },
                Err(err) => staging.record_decode_failure(kind, line.line_number, &err),
            }
        }
        debug!(source = %name, kind = %kind, "Source decoded");
    }

    Ok(staging)
}
