//! Chunked upload sessions
//!
//! A session declares how many chunks an upload consists of. Each chunk is
//! ingested as its own attempt; the tracker records which indices have been
//! received and which have finished promotion, and reports the missing ones.
//! "Complete" means every chunk arrived, not that promotion succeeded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{SessionError, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_token: Uuid,
    pub tenant_id: Uuid,
    pub total_chunks: u32,
    pub chunks_received: BTreeSet<u32>,
    pub chunks_promoted: BTreeSet<u32>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionStatus {
    Incomplete { missing: Vec<u32> },
    Complete,
}

/// Snapshot reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProgress {
    pub upload_token: Uuid,
    pub total_chunks: u32,
    pub chunks_received: u32,
    pub chunks_promoted: u32,
    #[serde(flatten)]
    pub status: SessionStatus,
}

impl UploadSession {
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|idx| !self.chunks_received.contains(idx))
            .collect()
    }

    pub fn progress(&self) -> SessionProgress {
        let missing = self.missing_chunks();
        SessionProgress {
            upload_token: self.upload_token,
            total_chunks: self.total_chunks,
            chunks_received: self.chunks_received.len() as u32,
            chunks_promoted: self.chunks_promoted.len() as u32,
            status: if missing.is_empty() {
                SessionStatus::Complete
            } else {
                SessionStatus::Incomplete { missing }
            },
        }
    }
}

/// What [`ChunkTracker::accept`] found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkReceipt {
    /// This call recorded the chunk for the first time
    pub first_receipt: bool,
    /// A previous attempt already promoted this chunk
    pub already_promoted: bool,
}

/// Storage for sessions and chunk receipts
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fails with [`StoreError::Constraint`] when the token exists
    async fn create_session(&self, session: &UploadSession) -> Result<(), StoreError>;

    async fn load_session(&self, upload_token: Uuid) -> Result<Option<UploadSession>, StoreError>;

    /// Idempotently record a chunk; `promoted` only ever moves false -> true.
    /// Returns `true` when the chunk was not recorded before.
    async fn record_chunk(
        &self,
        upload_token: Uuid,
        chunk_index: u32,
        promoted: bool,
    ) -> Result<bool, StoreError>;
}

pub struct ChunkTracker {
    store: Arc<dyn SessionStore>,
}

impl ChunkTracker {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Open a session; a fresh token is issued when none is supplied.
    pub async fn create_session(
        &self,
        tenant_id: Uuid,
        total_chunks: u32,
        upload_token: Option<Uuid>,
    ) -> Result<UploadSession, SessionError> {
        if total_chunks == 0 {
            return Err(SessionError::InvalidTotal(total_chunks));
        }

        let now = Utc::now();
        let session = UploadSession {
            upload_token: upload_token.unwrap_or_else(Uuid::new_v4),
            tenant_id,
            total_chunks,
            chunks_received: BTreeSet::new(),
            chunks_promoted: BTreeSet::new(),
            created_at: now,
            last_activity: now,
        };

        self.store
            .create_session(&session)
            .await
            .map_err(|err| match err {
                StoreError::Constraint(_) => SessionError::AlreadyExists(session.upload_token),
                other => SessionError::Store(other),
            })?;

        info!(
            upload_token = %session.upload_token,
            tenant_id = %tenant_id,
            total_chunks,
            "Upload session created"
        );
        Ok(session)
    }

    /// Load a session owned by `tenant_id`; other tenants' sessions are invisible.
    async fn load(&self, tenant_id: Uuid, upload_token: Uuid) -> Result<UploadSession, SessionError> {
        match self.store.load_session(upload_token).await? {
            Some(session) if session.tenant_id == tenant_id => Ok(session),
            _ => Err(SessionError::NotFound(upload_token)),
        }
    }

    /// Record receipt of a chunk. Accepting the same index twice is a no-op.
    pub async fn accept(
        &self,
        tenant_id: Uuid,
        upload_token: Uuid,
        chunk_index: u32,
    ) -> Result<ChunkReceipt, SessionError> {
        let session = self.load(tenant_id, upload_token).await?;
        if chunk_index >= session.total_chunks {
            return Err(SessionError::ChunkOutOfRange {
                index: chunk_index,
                total: session.total_chunks,
            });
        }

        let first_receipt = self.store.record_chunk(upload_token, chunk_index, false).await?;
        debug!(
            upload_token = %upload_token,
            chunk_index,
            first_receipt,
            "Chunk accepted"
        );

        Ok(ChunkReceipt {
            first_receipt,
            already_promoted: session.chunks_promoted.contains(&chunk_index),
        })
    }

    /// Record that the attempt carrying this chunk finished promotion
    pub async fn mark_promoted(
        &self,
        tenant_id: Uuid,
        upload_token: Uuid,
        chunk_index: u32,
    ) -> Result<(), SessionError> {
        let session = self.load(tenant_id, upload_token).await?;
        if chunk_index >= session.total_chunks {
            return Err(SessionError::ChunkOutOfRange {
                index: chunk_index,
                total: session.total_chunks,
            });
        }
        self.store.record_chunk(upload_token, chunk_index, true).await?;
        Ok(())
    }

    pub async fn status(&self, tenant_id: Uuid, upload_token: Uuid) -> Result<SessionProgress, SessionError> {
        Ok(self.load(tenant_id, upload_token).await?.progress())
    }
}
