//! Client side of the batch execution service.

use async_trait::async_trait;
use thiserror::Error;

use super::unit::{BatchId, InitialState, WorkUnit};

/// Error type for batch operations.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("storage error: {0}")]
    StorageError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("deserialization error: {0}")]
    DeserializationError(String),

    #[error("unknown batch: {0}")]
    UnknownBatch(BatchId),
}

/// What the mapping engine needs from a batch job runtime.
#[async_trait]
pub trait BatchClient: Send + Sync {
    /// Submit a set of independently schedulable units as one batch.
    ///
    /// `parent` nests the new batch under another one for bookkeeping only.
    async fn create_batch(
        &self,
        units: Vec<WorkUnit>,
        initial_state: InitialState,
        parent: Option<BatchId>,
    ) -> Result<BatchId, BatchError>;

    /// Schedule `units` as a batch that starts only after `batch` is terminal.
    ///
    /// Returns the id of the continuation batch.
    async fn continue_with(
        &self,
        batch: BatchId,
        units: Vec<WorkUnit>,
    ) -> Result<BatchId, BatchError>;

    /// Release a batch created as [`InitialState::Awaiting`] so its units run.
    ///
    /// Starting a batch that is already started or terminal is a no-op.
    async fn start_batch(&self, batch: BatchId) -> Result<(), BatchError>;
}
