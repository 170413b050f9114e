//! Work units and batch identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hooks::{HookId, HookRole};

/// Unique identifier for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(pub i64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

/// Unique identifier for a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub i64);

/// A serializable description of one job inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Name of the mapper that executes this unit.
    pub mapper: String,
    /// Human-readable display name.
    pub label: String,
    #[serde(flatten)]
    pub kind: UnitKind,
}

/// What a work unit does when it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitKind {
    /// Process one item of a page.
    Item { item: serde_json::Value },

    /// Invoke a lifecycle hook with a cursor.
    Hook {
        hook: HookId,
        name: String,
        role: HookRole,
        cursor: serde_json::Value,
    },

    /// Run one pagination step for the cursor.
    Step {
        cursor: serde_json::Value,
        /// Position of the step in its chain, starting at 0.
        sequence: u64,
    },
}

impl WorkUnit {
    pub fn item(mapper: &str, label: &str, item: serde_json::Value) -> Self {
        Self {
            mapper: mapper.to_string(),
            label: label.to_string(),
            kind: UnitKind::Item { item },
        }
    }

    pub fn hook(
        mapper: &str,
        label: &str,
        hook: HookId,
        name: &str,
        role: HookRole,
        cursor: serde_json::Value,
    ) -> Self {
        Self {
            mapper: mapper.to_string(),
            label: label.to_string(),
            kind: UnitKind::Hook {
                hook,
                name: name.to_string(),
                role,
                cursor,
            },
        }
    }

    pub fn step(mapper: &str, label: &str, cursor: serde_json::Value, sequence: u64) -> Self {
        Self {
            mapper: mapper.to_string(),
            label: label.to_string(),
            kind: UnitKind::Step { cursor, sequence },
        }
    }
}

/// State a batch is created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialState {
    /// Units are claimable right away.
    Started,
    /// Units wait until the batch is released as a continuation.
    Awaiting,
}

/// Lifecycle of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Awaiting,
    Started,
    /// Every unit completed.
    Succeeded,
    /// Every unit finished and at least one failed.
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Awaiting => "awaiting",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "awaiting" => Some(Self::Awaiting),
            "started" => Some(Self::Started),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Which terminal states of a batch release its continuations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationTrigger {
    /// Only a batch whose units all completed.
    #[default]
    OnSuccess,
    /// Any terminal batch, failed units included.
    OnAnyFinished,
}

impl ContinuationTrigger {
    /// Returns true if a batch that ended in `status` releases continuations.
    pub fn fires_on(self, status: BatchStatus) -> bool {
        match self {
            Self::OnSuccess => status == BatchStatus::Succeeded,
            Self::OnAnyFinished => status.is_terminal(),
        }
    }
}
