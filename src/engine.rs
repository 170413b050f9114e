//! The continuation engine: one pagination step per batch.
//!
//! A step queries one page, submits an awaiting batch holding a unit per item
//! (plus OnStart hook units), registers a continuation on that batch whose only
//! unit runs the next step with the advanced cursor, and only then starts the
//! page batch. If any of these calls fails, nothing of the step runs: a batch
//! left behind stays awaiting forever, so re-running the step is safe.
//!
//! The engine never waits for a batch; the batch execution service fires the
//! continuation once the batch is terminal, and the runner routes that `Step`
//! unit back here.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::batch::{BatchClient, BatchError, BatchId, InitialState, WorkUnit};
use crate::hooks::{HookDescriptor, HookRegistry};
use crate::mapper::{Mapper, MapperError};

/// Display name of the unit that starts a mapping run.
pub const START_LABEL: &str = "Starting mapper job.";

/// Display name of the continuation unit that runs the next step.
pub const STEP_LABEL: &str = "Enqueueing batch.";

/// Display name of an item unit.
pub const ITEM_LABEL: &str = "Mapping item.";

/// How often OnStart hooks fire during a mapping run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookFrequency {
    /// Only with the first page of a run.
    #[default]
    OncePerRun,
    /// With every page batch.
    EveryPage,
}

/// Error returned by a pagination step.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The page query failed; nothing was submitted for this cursor.
    #[error("page query for mapper '{mapper}' failed: {source}")]
    PageSource {
        mapper: &'static str,
        #[source]
        source: MapperError,
    },

    /// The batch execution service rejected a batch or continuation.
    #[error("batch submission failed: {0}")]
    BatchSubmission(#[from] BatchError),

    /// An item or cursor could not be serialized into a work unit.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// What a step did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome<C> {
    /// A page batch was submitted and the next step registered on it.
    Continued {
        batch_id: BatchId,
        continuation_id: BatchId,
        items: usize,
        /// Cursor the next step will run with.
        next: C,
    },

    /// The page was empty; the run is over.
    Terminated {
        /// Batch of OnComplete hooks, if the mapper declares any.
        completion_batch: Option<BatchId>,
    },
}

impl<C> StepOutcome<C> {
    /// Returns true if this step ended the mapping run.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }
}

enum Phase<C> {
    Querying,
    BatchSubmitted {
        batch_id: BatchId,
        items: usize,
        next: C,
        continuation: WorkUnit,
    },
    Continued {
        batch_id: BatchId,
        continuation_id: BatchId,
        items: usize,
        next: C,
    },
    Terminated {
        completion_batch: Option<BatchId>,
    },
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Serialization(e.to_string()))
}

/// A mapper bound to a batch execution service.
///
/// ```rust,ignore
/// let store = Arc::new(InMemoryBatchStore::new());
/// let job = MapperJob::new(ReindexUsers::new(repo), store.clone());
///
/// job.enqueue(PageCursor { page: 1 }).await?;
/// ```
pub struct MapperJob<M: Mapper> {
    pub(crate) mapper: Arc<M>,
    pub(crate) hooks: Arc<HookRegistry<M::Cursor>>,
    client: Arc<dyn BatchClient>,
    hook_frequency: HookFrequency,
}

impl<M: Mapper> Clone for MapperJob<M> {
    fn clone(&self) -> Self {
        Self {
            mapper: self.mapper.clone(),
            hooks: self.hooks.clone(),
            client: self.client.clone(),
            hook_frequency: self.hook_frequency,
        }
    }
}

impl<M: Mapper> MapperJob<M> {
    /// Wrap a mapper, reading its hook registry once.
    pub fn new(mapper: M, client: Arc<dyn BatchClient>) -> Self {
        let hooks = mapper.hooks();
        Self {
            mapper: Arc::new(mapper),
            hooks: Arc::new(hooks),
            client,
            hook_frequency: HookFrequency::default(),
        }
    }

    /// Set how often OnStart hooks fire.
    pub fn with_hook_frequency(mut self, frequency: HookFrequency) -> Self {
        self.hook_frequency = frequency;
        self
    }

    /// Get the mapper name.
    pub fn name(&self) -> &'static str {
        self.mapper.name()
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    pub fn hooks(&self) -> &HookRegistry<M::Cursor> {
        &self.hooks
    }

    /// Start a mapping run from `initial`.
    pub async fn enqueue(&self, initial: M::Cursor) -> Result<StepOutcome<M::Cursor>, EngineError> {
        info!(mapper = self.name(), "Starting mapper job");
        self.step(initial, 0).await
    }

    /// Run one pagination step for `cursor`.
    ///
    /// `sequence` is the position of this step in its run, 0 for the first.
    pub async fn step(
        &self,
        cursor: M::Cursor,
        sequence: u64,
    ) -> Result<StepOutcome<M::Cursor>, EngineError> {
        self.run_step(cursor, sequence, None).await
    }

    /// Run one step, nesting the batches it creates under `parent`.
    pub(crate) async fn run_step(
        &self,
        cursor: M::Cursor,
        sequence: u64,
        parent: Option<BatchId>,
    ) -> Result<StepOutcome<M::Cursor>, EngineError> {
        let mapper = self.name();
        let mut phase = Phase::Querying;

        loop {
            phase = match phase {
                Phase::Querying => {
                    let mut next = cursor.clone();
                    debug!(mapper, sequence, "Querying page");
                    let page = self
                        .mapper
                        .query(&mut next)
                        .await
                        .map_err(|source| EngineError::PageSource { mapper, source })?;

                    let items = page.unwrap_or_default();
                    if items.is_empty() {
                        let completion_batch = self.submit_completion(&cursor, parent).await?;
                        Phase::Terminated { completion_batch }
                    } else {
                        let count = items.len();
                        let units = self.page_units(&cursor, sequence, items)?;
                        // Built before submitting so a bad cursor never strands a batch.
                        let continuation =
                            WorkUnit::step(mapper, STEP_LABEL, to_json(&next)?, sequence + 1);

                        // Held until the continuation is registered, so a page
                        // batch never runs without its next step attached.
                        let batch_id = self
                            .client
                            .create_batch(units, InitialState::Awaiting, parent)
                            .await?;
                        Phase::BatchSubmitted {
                            batch_id,
                            items: count,
                            next,
                            continuation,
                        }
                    }
                }
                Phase::BatchSubmitted {
                    batch_id,
                    items,
                    next,
                    continuation,
                } => {
                    let continuation_id = self
                        .client
                        .continue_with(batch_id, vec![continuation])
                        .await?;
                    self.client.start_batch(batch_id).await?;
                    Phase::Continued {
                        batch_id,
                        continuation_id,
                        items,
                        next,
                    }
                }
                Phase::Continued {
                    batch_id,
                    continuation_id,
                    items,
                    next,
                } => {
                    info!(
                        mapper,
                        sequence,
                        items,
                        batch = %batch_id,
                        continuation = %continuation_id,
                        "Enqueued page batch"
                    );
                    return Ok(StepOutcome::Continued {
                        batch_id,
                        continuation_id,
                        items,
                        next,
                    });
                }
                Phase::Terminated { completion_batch } => {
                    info!(
                        mapper,
                        sequence,
                        completion_hooks = completion_batch.is_some(),
                        "Mapping run finished"
                    );
                    return Ok(StepOutcome::Terminated { completion_batch });
                }
            };
        }
    }

    fn fires_start_hooks(&self, sequence: u64) -> bool {
        match self.hook_frequency {
            HookFrequency::OncePerRun => sequence == 0,
            HookFrequency::EveryPage => true,
        }
    }

    fn hook_unit(
        &self,
        hook: &HookDescriptor,
        cursor: &serde_json::Value,
    ) -> WorkUnit {
        WorkUnit::hook(
            self.name(),
            &hook.label,
            hook.id,
            hook.name,
            hook.role,
            cursor.clone(),
        )
    }

    /// OnStart hook units (with the pre-advance cursor) followed by item units.
    fn page_units(
        &self,
        cursor: &M::Cursor,
        sequence: u64,
        items: Vec<M::Item>,
    ) -> Result<Vec<WorkUnit>, EngineError> {
        let mut units = Vec::with_capacity(items.len() + self.hooks.len());

        if self.fires_start_hooks(sequence) {
            let cursor = to_json(cursor)?;
            units.extend(self.hooks.on_start_hooks().map(|h| self.hook_unit(h, &cursor)));
        }

        for item in &items {
            units.push(WorkUnit::item(self.name(), ITEM_LABEL, to_json(item)?));
        }

        Ok(units)
    }

    async fn submit_completion(
        &self,
        cursor: &M::Cursor,
        parent: Option<BatchId>,
    ) -> Result<Option<BatchId>, EngineError> {
        if self.hooks.on_complete_hooks().next().is_none() {
            return Ok(None);
        }

        let cursor = to_json(cursor)?;
        let units: Vec<WorkUnit> = self
            .hooks
            .on_complete_hooks()
            .map(|h| self.hook_unit(h, &cursor))
            .collect();

        let batch_id = self
            .client
            .create_batch(units, InitialState::Started, parent)
            .await?;
        Ok(Some(batch_id))
    }
}
