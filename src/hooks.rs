//! Lifecycle hook registration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::mapper::MapperError;

type HookFuture = Pin<Box<dyn Future<Output = Result<(), MapperError>> + Send>>;

/// Type-erased hook callback receiving the cursor of the step that fired it.
pub(crate) type HookFn<C> = Arc<dyn Fn(C) -> HookFuture + Send + Sync>;

/// Identity of a hook within its registry (its registration index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HookId(pub u32);

/// When a hook fires during a mapping run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookRole {
    /// Fired alongside the item units of a page batch.
    OnStart,
    /// Fired once, when a page query comes back empty.
    OnComplete,
}

/// Describes a registered hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookDescriptor {
    pub id: HookId,
    pub name: &'static str,
    pub role: HookRole,
    /// Human-readable display name for the hook's work unit.
    pub label: String,
}

/// A hook descriptor paired with its callback.
pub struct RegisteredHook<C> {
    pub descriptor: HookDescriptor,
    pub(crate) handler: HookFn<C>,
}

impl<C> RegisteredHook<C> {
    /// Invoke the hook with the given cursor.
    pub async fn invoke(&self, cursor: C) -> Result<(), MapperError> {
        (self.handler)(cursor).await
    }
}

impl<C> Clone for RegisteredHook<C> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            handler: self.handler.clone(),
        }
    }
}

/// Ordered set of lifecycle hooks declared by a mapper.
///
/// ```rust,ignore
/// HookRegistry::new()
///     .on_start("mark_started", "Mark job as started.", move |cursor| {
///         let notifier = notifier.clone();
///         async move { notifier.started(cursor).await.map_err(MapperError::retryable) }
///     })
///     .on_complete("mark_completed", "Mark job as completed.", |_| async { Ok(()) })
/// ```
pub struct HookRegistry<C> {
    hooks: Vec<RegisteredHook<C>>,
}

impl<C> Default for HookRegistry<C> {
    fn default() -> Self {
        Self { hooks: Vec::new() }
    }
}

impl<C> Clone for HookRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            hooks: self.hooks.clone(),
        }
    }
}

impl<C> fmt::Debug for HookRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|h| &h.descriptor))
            .finish()
    }
}

impl<C: Send + 'static> HookRegistry<C> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook fired with the cursor of the page that starts a batch.
    ///
    /// # Panics
    ///
    /// Panics if a hook with the same name is already registered.
    pub fn on_start<F, Fut>(self, name: &'static str, label: &str, hook: F) -> Self
    where
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MapperError>> + Send + 'static,
    {
        self.register(HookRole::OnStart, name, label, hook)
    }

    /// Register a hook fired once when the mapping run reaches an empty page.
    ///
    /// # Panics
    ///
    /// Panics if a hook with the same name is already registered.
    pub fn on_complete<F, Fut>(self, name: &'static str, label: &str, hook: F) -> Self
    where
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MapperError>> + Send + 'static,
    {
        self.register(HookRole::OnComplete, name, label, hook)
    }

    fn register<F, Fut>(mut self, role: HookRole, name: &'static str, label: &str, hook: F) -> Self
    where
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MapperError>> + Send + 'static,
    {
        assert!(
            self.hooks.iter().all(|h| h.descriptor.name != name),
            "hook '{}' is already registered",
            name
        );

        let handler: HookFn<C> = Arc::new(move |cursor: C| -> HookFuture { Box::pin(hook(cursor)) });
        self.hooks.push(RegisteredHook {
            descriptor: HookDescriptor {
                id: HookId(self.hooks.len() as u32),
                name,
                role,
                label: label.to_string(),
            },
            handler,
        });
        self
    }
}

impl<C> HookRegistry<C> {
    /// OnStart hooks in declaration order.
    pub fn on_start_hooks(&self) -> impl Iterator<Item = &HookDescriptor> {
        self.with_role(HookRole::OnStart)
    }

    /// OnComplete hooks in declaration order.
    pub fn on_complete_hooks(&self) -> impl Iterator<Item = &HookDescriptor> {
        self.with_role(HookRole::OnComplete)
    }

    fn with_role(&self, role: HookRole) -> impl Iterator<Item = &HookDescriptor> {
        self.hooks
            .iter()
            .map(|h| &h.descriptor)
            .filter(move |d| d.role == role)
    }

    /// Look up a hook by id.
    pub fn get(&self, id: HookId) -> Option<&RegisteredHook<C>> {
        self.hooks.get(id.0 as usize)
    }

    /// Number of registered hooks, both roles included.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Returns true if the mapper declares no hooks.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}
