//! Batch storage trait and types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::client::{BatchClient, BatchError};
use super::unit::{BatchId, BatchStatus, UnitId, WorkUnit};

/// A unit claimed for execution.
#[derive(Debug, Clone)]
pub struct ClaimedUnit {
    pub id: UnitId,
    pub batch_id: BatchId,
    pub unit: WorkUnit,
    pub created_at: DateTime<Utc>,
}

/// Storage backend of the batch execution service.
///
/// Stores settle batch state themselves: finishing the last unit of a batch
/// makes it terminal and releases the continuations registered on it.
#[async_trait]
pub trait BatchStore: BatchClient {
    /// Claim up to `limit` pending units of started batches, oldest first.
    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedUnit>, BatchError>;

    /// Mark a unit as completed.
    async fn complete(&self, id: UnitId) -> Result<(), BatchError>;

    /// Mark a unit as failed with an error message.
    async fn fail(&self, id: UnitId, error: &str) -> Result<(), BatchError>;

    /// Reset units stuck in "running" back to "pending".
    /// Call on startup to recover from crashes.
    /// Returns the number of units recovered.
    async fn recover_orphans(&self) -> Result<usize, BatchError> {
        Ok(0)
    }

    /// Current status of a batch, `None` if it does not exist.
    async fn batch_status(&self, id: BatchId) -> Result<Option<BatchStatus>, BatchError>;
}

/// Longest error message kept for a failed unit.
pub(crate) const MAX_ERROR_LEN: usize = 2000;

pub(crate) fn truncate_error(error: &str) -> &str {
    if error.len() <= MAX_ERROR_LEN {
        return error;
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    &error[..end]
}
