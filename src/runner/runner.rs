//! Runner that claims work units from a store and dispatches them to mappers.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::config::RunnerConfig;
use super::erased::{ErasedMapper, UnitError};
use crate::batch::{BatchError, BatchId, BatchStore, ClaimedUnit, InitialState, WorkUnit};
use crate::engine::START_LABEL;
use crate::retry::RetryPolicy;

type MapperRegistry = Arc<HashMap<&'static str, Arc<dyn ErasedMapper>>>;

/// Executes the units of a batch store with registered mappers.
pub struct Runner<S: BatchStore> {
    store: Arc<S>,
    mappers: MapperRegistry,
    poll_interval: Duration,
    max_concurrent: usize,
    retry_policy: RetryPolicy,
}

impl<S: BatchStore + 'static> Runner<S> {
    /// Start a mapping run as a job: the first page query runs on the runner.
    pub async fn submit<C: Serialize>(&self, mapper: &str, cursor: C) -> Result<BatchId, BatchError> {
        let cursor = serde_json::to_value(cursor)
            .map_err(|e| BatchError::SerializationError(e.to_string()))?;
        let unit = WorkUnit::step(mapper, START_LABEL, cursor, 0);
        let batch_id = self
            .store
            .create_batch(vec![unit], InitialState::Started, None)
            .await?;

        info!(mapper, batch = %batch_id, "Submitted mapper job");
        Ok(batch_id)
    }

    /// Run the unit loop indefinitely.
    pub async fn run(&self) -> ! {
        match self.store.recover_orphans().await {
            Ok(0) => {}
            Ok(recovered) => warn!(recovered, "Recovered orphaned units"),
            Err(e) => error!(error = %e, "Failed to recover orphaned units"),
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        loop {
            let available = semaphore.available_permits();
            if available > 0 {
                match self.store.claim(available).await {
                    Ok(units) => {
                        for claimed in units {
                            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                                break;
                            };
                            let store = self.store.clone();
                            let mappers = self.mappers.clone();
                            let retry_policy = self.retry_policy.clone();

                            tokio::spawn(async move {
                                // Hold the permit for the duration of execution
                                let _permit = permit;
                                Self::execute(store, mappers, retry_policy, claimed).await;
                            });
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to claim units"),
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Execute claimable units until none are left.
    ///
    /// Claims up to `max_concurrent` units at a time and waits for all of them
    /// before claiming again, so continuations released by a finished batch are
    /// picked up in the next round. Returns the number of units executed.
    pub async fn run_until_idle(&self) -> Result<usize, BatchError> {
        let mut executed = 0;

        loop {
            let units = self.store.claim(self.max_concurrent).await?;
            if units.is_empty() {
                debug!(executed, "No claimable units left");
                return Ok(executed);
            }

            executed += units.len();
            let mut running = JoinSet::new();
            for claimed in units {
                running.spawn(Self::execute(
                    self.store.clone(),
                    self.mappers.clone(),
                    self.retry_policy.clone(),
                    claimed,
                ));
            }
            while let Some(joined) = running.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Unit task panicked");
                }
            }
        }
    }

    async fn execute(
        store: Arc<S>,
        mappers: MapperRegistry,
        retry_policy: RetryPolicy,
        claimed: ClaimedUnit,
    ) {
        // Run the unit in its own task so a panicking mapper still fails the
        // unit and lets its batch settle.
        let unit = claimed.clone();
        let result = tokio::spawn(async move {
            Self::execute_unit(&mappers, &retry_policy, &unit).await
        })
        .await
        .unwrap_or_else(|e| Err(UnitError::Panicked(e.to_string())));

        let recorded = match result {
            Ok(()) => store.complete(claimed.id).await,
            Err(e) => {
                warn!(
                    unit = claimed.id.0,
                    batch = %claimed.batch_id,
                    label = %claimed.unit.label,
                    error = %e,
                    "Work unit failed"
                );
                store.fail(claimed.id, &e.to_string()).await
            }
        };

        if let Err(e) = recorded {
            error!(unit = claimed.id.0, error = %e, "Failed to record unit outcome");
        }
    }

    async fn execute_unit(
        mappers: &HashMap<&'static str, Arc<dyn ErasedMapper>>,
        retry_policy: &RetryPolicy,
        claimed: &ClaimedUnit,
    ) -> Result<(), UnitError> {
        let mapper = mappers
            .get(claimed.unit.mapper.as_str())
            .ok_or_else(|| UnitError::UnknownMapper(claimed.unit.mapper.clone()))?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match mapper.run_unit(claimed).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => match retry_policy.delay_for_attempt(attempt) {
                    Some(delay) => {
                        debug!(
                            unit = claimed.id.0,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Retrying work unit"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }
}

/// Builder for constructing a Runner.
pub struct RunnerBuilder<S: BatchStore> {
    store: Arc<S>,
    mappers: HashMap<&'static str, Arc<dyn ErasedMapper>>,
    poll_interval: Duration,
    max_concurrent: usize,
    retry_policy: RetryPolicy,
}

impl<S: BatchStore + 'static> RunnerBuilder<S> {
    /// Create a new builder over a shared store.
    ///
    /// The same store is usually handed to each [`crate::MapperJob`] as its
    /// batch client.
    pub fn new(store: Arc<S>) -> Self {
        let defaults = RunnerConfig::default();
        Self {
            store,
            mappers: HashMap::new(),
            poll_interval: defaults.poll_interval(),
            max_concurrent: defaults.max_concurrent,
            retry_policy: defaults.retry_policy(),
        }
    }

    /// Register a mapper with the runner.
    pub fn mapper(mut self, mapper: impl ErasedMapper + 'static) -> Self {
        let name = mapper.name();
        self.mappers.insert(name, Arc::new(mapper));
        self
    }

    /// Set the poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the maximum concurrent units.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    pub fn max_concurrent(mut self, n: usize) -> Self {
        assert!(n > 0, "runner concurrency must be at least 1");
        self.max_concurrent = n;
        self
    }

    /// Set the retry policy applied to retryable unit failures.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Apply settings loaded from configuration.
    ///
    /// A `max_concurrent` of 0 is raised to 1.
    pub fn config(self, config: &RunnerConfig) -> Self {
        if config.max_concurrent == 0 {
            warn!("Configured max_concurrent is 0, running one unit at a time");
        }
        self.poll_interval(config.poll_interval())
            .max_concurrent(config.max_concurrent.max(1))
            .retry(config.retry_policy())
    }

    /// Build the runner.
    pub fn build(self) -> Runner<S> {
        Runner {
            store: self.store,
            mappers: Arc::new(self.mappers),
            poll_interval: self.poll_interval,
            max_concurrent: self.max_concurrent,
            retry_policy: self.retry_policy,
        }
    }
}
