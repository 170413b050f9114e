//! # Mapflow
//!
//! Paginated, self-continuing batch mapping.
//!
//! A [`Mapper`] pages through a source with a cursor of its own design. Each
//! page becomes one batch of independent work units, one per item. The next
//! page is queried only after that batch has finished, because the step that
//! queries it is registered as the batch's continuation. The run ends when a
//! page comes back empty.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mapflow::{InMemoryBatchStore, MapperJob, RunnerBuilder};
//!
//! let store = Arc::new(InMemoryBatchStore::new());
//! let job = MapperJob::new(ReindexUsers::new(repo), store.clone());
//!
//! let runner = RunnerBuilder::new(store)
//!     .mapper(job.clone())
//!     .max_concurrent(8)
//!     .build();
//!
//! job.enqueue(PageCursor { page: 1 }).await?;
//! runner.run().await;
//! ```
//!
//! ## Lifecycle Hooks
//!
//! Mappers declare hooks through [`Mapper::hooks`]. OnStart hooks join the
//! first page batch; OnComplete hooks run as one batch when the run ends.
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable the SQLite-backed batch store (on by default)

pub mod batch;
pub mod engine;
pub mod hooks;
pub mod mapper;
pub mod retry;
pub mod runner;

pub use batch::{
    BatchClient, BatchError, BatchId, BatchStatus, BatchStore, ClaimedUnit, ContinuationTrigger,
    InMemoryBatchStore, InitialState, UnitId, UnitKind, WorkUnit,
};
pub use engine::{EngineError, HookFrequency, MapperJob, StepOutcome};
pub use hooks::{HookDescriptor, HookId, HookRegistry, HookRole};
pub use mapper::{Mapper, MapperError};
pub use retry::RetryPolicy;
pub use runner::{ErasedMapper, Runner, RunnerBuilder, RunnerConfig, UnitError};

#[cfg(feature = "sqlite")]
pub use batch::SqliteBatchStore;
