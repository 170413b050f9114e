//! In-memory implementation of BatchStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

use super::client::{BatchClient, BatchError};
use super::store::{truncate_error, BatchStore, ClaimedUnit};
use super::unit::{BatchId, BatchStatus, ContinuationTrigger, InitialState, UnitId, WorkUnit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

struct UnitRecord {
    batch_id: BatchId,
    unit: WorkUnit,
    status: UnitStatus,
    created_at: DateTime<Utc>,
}

struct BatchRecord {
    parent: Option<BatchId>,
    status: BatchStatus,
    /// Units of the batch in submission order; emptied once it settles.
    units: Vec<UnitId>,
    /// Units not yet completed or failed.
    remaining: usize,
    failures: Vec<String>,
    continuations: Vec<BatchId>,
}

#[derive(Default)]
struct State {
    next_batch: i64,
    next_unit: i64,
    batches: HashMap<BatchId, BatchRecord>,
    /// Units of batches that have not settled yet.
    units: HashMap<UnitId, UnitRecord>,
    /// Pending units of started batches, oldest first.
    ready: BTreeSet<UnitId>,
}

impl State {
    fn insert_batch(
        &mut self,
        units: Vec<WorkUnit>,
        parent: Option<BatchId>,
    ) -> Result<BatchId, BatchError> {
        if let Some(parent) = parent {
            if !self.batches.contains_key(&parent) {
                return Err(BatchError::UnknownBatch(parent));
            }
        }

        self.next_batch += 1;
        let id = BatchId(self.next_batch);
        let now = Utc::now();

        let mut ids = Vec::with_capacity(units.len());
        for unit in units {
            self.next_unit += 1;
            let unit_id = UnitId(self.next_unit);
            ids.push(unit_id);
            self.units.insert(
                unit_id,
                UnitRecord {
                    batch_id: id,
                    unit,
                    status: UnitStatus::Pending,
                    created_at: now,
                },
            );
        }

        self.batches.insert(
            id,
            BatchRecord {
                parent,
                status: BatchStatus::Awaiting,
                remaining: ids.len(),
                units: ids,
                failures: Vec::new(),
                continuations: Vec::new(),
            },
        );

        Ok(id)
    }

    /// Start an awaiting batch, settling it right away when it has no units.
    fn activate(&mut self, id: BatchId, trigger: ContinuationTrigger) {
        if self.release(id) {
            self.settle(id, trigger);
        }
    }

    /// Move an awaiting batch to started and queue its units.
    ///
    /// Returns true if the batch was released and has nothing to run.
    fn release(&mut self, id: BatchId) -> bool {
        match self.batches.get_mut(&id) {
            Some(batch) if batch.status == BatchStatus::Awaiting => {
                batch.status = BatchStatus::Started;
                self.ready.extend(batch.units.iter().copied());
                batch.remaining == 0
            }
            _ => false,
        }
    }

    /// Make a finished batch terminal, drop its unit records and release its
    /// continuations.
    fn settle(&mut self, id: BatchId, trigger: ContinuationTrigger) {
        let mut pending = vec![id];

        while let Some(id) = pending.pop() {
            let Some(batch) = self.batches.get_mut(&id) else {
                continue;
            };
            batch.status = if batch.failures.is_empty() {
                BatchStatus::Succeeded
            } else {
                BatchStatus::Failed
            };
            for unit in batch.units.drain(..) {
                self.units.remove(&unit);
            }
            if !trigger.fires_on(batch.status) {
                continue;
            }

            for next in batch.continuations.clone() {
                if self.release(next) {
                    pending.push(next);
                }
            }
        }
    }

    fn finish(
        &mut self,
        id: UnitId,
        outcome: UnitStatus,
        error: Option<String>,
        trigger: ContinuationTrigger,
    ) -> Result<(), BatchError> {
        let unit = self
            .units
            .get_mut(&id)
            .ok_or_else(|| BatchError::StorageError(format!("unknown unit {}", id.0)))?;

        if matches!(unit.status, UnitStatus::Completed | UnitStatus::Failed) {
            return Ok(());
        }
        unit.status = outcome;
        let batch_id = unit.batch_id;
        self.ready.remove(&id);

        let batch = self
            .batches
            .get_mut(&batch_id)
            .ok_or(BatchError::UnknownBatch(batch_id))?;
        batch.remaining = batch.remaining.saturating_sub(1);
        if outcome == UnitStatus::Failed {
            batch.failures.push(error.unwrap_or_default());
        }

        if batch.remaining == 0 && batch.status == BatchStatus::Started {
            self.settle(batch_id, trigger);
        }
        Ok(())
    }
}

/// Batch store kept entirely in process memory.
///
/// Suitable for tests and single-process hosts; nothing survives a restart.
/// Unit payloads are dropped once their batch settles; only batch status,
/// lineage and failure messages are kept.
#[derive(Default)]
pub struct InMemoryBatchStore {
    state: Mutex<State>,
    trigger: ContinuationTrigger,
}

impl InMemoryBatchStore {
    /// Create an empty store releasing continuations on success only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose which terminal states release continuations.
    pub fn with_continuation_trigger(mut self, trigger: ContinuationTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Units of a batch that has not settled yet, in submission order.
    pub fn batch_units(&self, id: BatchId) -> Vec<WorkUnit> {
        let state = self.state.lock();
        let Some(batch) = state.batches.get(&id) else {
            return Vec::new();
        };
        batch
            .units
            .iter()
            .filter_map(|u| state.units.get(u))
            .map(|u| u.unit.clone())
            .collect()
    }

    /// Continuation batches registered on a batch.
    pub fn continuations_of(&self, id: BatchId) -> Vec<BatchId> {
        let state = self.state.lock();
        state
            .batches
            .get(&id)
            .map(|b| b.continuations.clone())
            .unwrap_or_default()
    }

    /// Parent a batch was nested under.
    pub fn parent_of(&self, id: BatchId) -> Option<BatchId> {
        self.state.lock().batches.get(&id).and_then(|b| b.parent)
    }

    /// Error messages of failed units in a batch, in the order they failed.
    pub fn failures(&self, id: BatchId) -> Vec<String> {
        let state = self.state.lock();
        state
            .batches
            .get(&id)
            .map(|b| b.failures.clone())
            .unwrap_or_default()
    }

    /// Number of unit records held, across batches that have not settled.
    pub fn live_units(&self) -> usize {
        self.state.lock().units.len()
    }
}

#[async_trait]
impl BatchClient for InMemoryBatchStore {
    async fn create_batch(
        &self,
        units: Vec<WorkUnit>,
        initial_state: InitialState,
        parent: Option<BatchId>,
    ) -> Result<BatchId, BatchError> {
        let mut state = self.state.lock();
        let id = state.insert_batch(units, parent)?;
        if initial_state == InitialState::Started {
            state.activate(id, self.trigger);
        }
        Ok(id)
    }

    async fn continue_with(
        &self,
        batch: BatchId,
        units: Vec<WorkUnit>,
    ) -> Result<BatchId, BatchError> {
        let mut state = self.state.lock();
        let source_status = state
            .batches
            .get(&batch)
            .map(|b| b.status)
            .ok_or(BatchError::UnknownBatch(batch))?;

        let id = state.insert_batch(units, None)?;
        if let Some(source) = state.batches.get_mut(&batch) {
            source.continuations.push(id);
        }

        if self.trigger.fires_on(source_status) {
            state.activate(id, self.trigger);
        }
        Ok(id)
    }

    async fn start_batch(&self, batch: BatchId) -> Result<(), BatchError> {
        let mut state = self.state.lock();
        if !state.batches.contains_key(&batch) {
            return Err(BatchError::UnknownBatch(batch));
        }
        state.activate(batch, self.trigger);
        Ok(())
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedUnit>, BatchError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut claimed = Vec::with_capacity(limit.min(state.ready.len()));
        while claimed.len() < limit {
            let Some(id) = state.ready.pop_first() else {
                break;
            };
            let Some(unit) = state.units.get_mut(&id) else {
                continue;
            };

            unit.status = UnitStatus::Running;
            claimed.push(ClaimedUnit {
                id,
                batch_id: unit.batch_id,
                unit: unit.unit.clone(),
                created_at: unit.created_at,
            });
        }

        Ok(claimed)
    }

    async fn complete(&self, id: UnitId) -> Result<(), BatchError> {
        self.state
            .lock()
            .finish(id, UnitStatus::Completed, None, self.trigger)
    }

    async fn fail(&self, id: UnitId, error: &str) -> Result<(), BatchError> {
        let error = truncate_error(error).to_string();
        self.state
            .lock()
            .finish(id, UnitStatus::Failed, Some(error), self.trigger)
    }

    async fn recover_orphans(&self) -> Result<usize, BatchError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut recovered = 0;
        for (id, unit) in state.units.iter_mut() {
            if unit.status == UnitStatus::Running {
                unit.status = UnitStatus::Pending;
                state.ready.insert(*id);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn batch_status(&self, id: BatchId) -> Result<Option<BatchStatus>, BatchError> {
        Ok(self.state.lock().batches.get(&id).map(|b| b.status))
    }
}
