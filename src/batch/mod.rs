//! Batch execution service: the client contract and its stores.

pub mod client;
pub mod memory;
pub mod store;
pub mod unit;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use client::{BatchClient, BatchError};
pub use memory::InMemoryBatchStore;
pub use store::{BatchStore, ClaimedUnit};
pub use unit::{
    BatchId, BatchStatus, ContinuationTrigger, InitialState, UnitId, UnitKind, WorkUnit,
};

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteBatchStore;
