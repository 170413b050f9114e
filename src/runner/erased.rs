//! Type-erased mapper wrapper for runtime dispatch.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::batch::{ClaimedUnit, UnitKind};
use crate::engine::{EngineError, MapperJob};
use crate::hooks::HookId;
use crate::mapper::{Mapper, MapperError};

/// Error type for executing a single work unit.
#[derive(Error, Debug)]
pub enum UnitError {
    #[error("unknown mapper: {0}")]
    UnknownMapper(String),

    #[error("mapper '{mapper}' has no hook '{name}' at {id:?}")]
    UnknownHook {
        mapper: &'static str,
        id: HookId,
        name: String,
    },

    #[error("deserialization error: {0}")]
    DeserializationError(String),

    #[error(transparent)]
    Mapper(#[from] MapperError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("unit panicked: {0}")]
    Panicked(String),
}

impl UnitError {
    /// Returns true if running the unit again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Mapper(e) => e.is_retryable(),
            Self::Engine(EngineError::PageSource { source, .. }) => source.is_retryable(),
            Self::Engine(EngineError::BatchSubmission(_)) => true,
            _ => false,
        }
    }
}

/// Type-erased mapper that can be stored in a registry.
#[async_trait]
pub trait ErasedMapper: Send + Sync {
    /// Get the mapper name.
    fn name(&self) -> &'static str;

    /// Execute one claimed unit addressed to this mapper.
    async fn run_unit(&self, claimed: &ClaimedUnit) -> Result<(), UnitError>;
}

fn decode<T: DeserializeOwned>(value: &serde_json::Value) -> Result<T, UnitError> {
    T::deserialize(value).map_err(|e| UnitError::DeserializationError(e.to_string()))
}

#[async_trait]
impl<M> ErasedMapper for MapperJob<M>
where
    M: Mapper + 'static,
{
    fn name(&self) -> &'static str {
        MapperJob::name(self)
    }

    async fn run_unit(&self, claimed: &ClaimedUnit) -> Result<(), UnitError> {
        match &claimed.unit.kind {
            UnitKind::Item { item } => {
                let item: M::Item = decode(item)?;
                self.mapper.process(item).await?;
            }
            UnitKind::Hook {
                hook, name, cursor, ..
            } => {
                let registered = self
                    .hooks
                    .get(*hook)
                    .filter(|h| h.descriptor.name == name.as_str())
                    .ok_or_else(|| UnitError::UnknownHook {
                        mapper: MapperJob::name(self),
                        id: *hook,
                        name: name.clone(),
                    })?;
                let cursor: M::Cursor = decode(cursor)?;
                registered.invoke(cursor).await?;
            }
            UnitKind::Step { cursor, sequence } => {
                let cursor: M::Cursor = decode(cursor)?;
                self.run_step(cursor, *sequence, Some(claimed.batch_id))
                    .await?;
            }
        }
        Ok(())
    }
}
