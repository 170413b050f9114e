//! Shared fixtures: a paginated resource mapper and a recording batch client.

#![allow(dead_code)]

use async_trait::async_trait;
use mapflow::{
    BatchClient, BatchError, BatchId, HookRegistry, InitialState, Mapper, MapperError, WorkUnit,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: u32,
    pub name: String,
}

pub fn resource(id: u32, name: &str) -> Resource {
    Resource {
        id,
        name: name.to_string(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    pub page: u32,
}

/// Ordered log of queries, item runs and hook runs.
pub type Events = Arc<Mutex<Vec<String>>>;

/// Pages through a fixed set of pages keyed by page number.
///
/// Pages not configured come back empty; pages set to `None` come back null.
pub struct ResourceMapper {
    pages: HashMap<u32, Option<Vec<Resource>>>,
    pub events: Events,
    start_hooks: Vec<&'static str>,
    complete_hooks: Vec<&'static str>,
    failing_page: Option<u32>,
    failing_item: Option<u32>,
    panicking_item: Option<u32>,
    flaky_item: Option<(u32, usize)>,
    flaky_attempts: Arc<AtomicUsize>,
}

impl ResourceMapper {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            events: Arc::new(Mutex::new(Vec::new())),
            start_hooks: Vec::new(),
            complete_hooks: Vec::new(),
            failing_page: None,
            failing_item: None,
            panicking_item: None,
            flaky_item: None,
            flaky_attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn page(mut self, page: u32, items: Vec<Resource>) -> Self {
        self.pages.insert(page, Some(items));
        self
    }

    pub fn null_page(mut self, page: u32) -> Self {
        self.pages.insert(page, None);
        self
    }

    pub fn on_start(mut self, name: &'static str) -> Self {
        self.start_hooks.push(name);
        self
    }

    pub fn on_complete(mut self, name: &'static str) -> Self {
        self.complete_hooks.push(name);
        self
    }

    pub fn failing_page(mut self, page: u32) -> Self {
        self.failing_page = Some(page);
        self
    }

    pub fn failing_item(mut self, id: u32) -> Self {
        self.failing_item = Some(id);
        self
    }

    pub fn panicking_item(mut self, id: u32) -> Self {
        self.panicking_item = Some(id);
        self
    }

    /// Item `id` fails with a retryable error for its first `failures` runs.
    pub fn flaky_item(mut self, id: u32, failures: usize) -> Self {
        self.flaky_item = Some((id, failures));
        self
    }

    pub fn flaky_attempts(&self) -> Arc<AtomicUsize> {
        self.flaky_attempts.clone()
    }
}

async fn record_hook(events: Events, name: &'static str, cursor: PageState) -> Result<(), MapperError> {
    events.lock().await.push(format!("{}:{}", name, cursor.page));
    Ok(())
}

#[async_trait]
impl Mapper for ResourceMapper {
    type Item = Resource;
    type Cursor = PageState;

    fn name(&self) -> &'static str {
        "resources"
    }

    async fn query(&self, cursor: &mut PageState) -> Result<Option<Vec<Resource>>, MapperError> {
        self.events.lock().await.push(format!("query:{}", cursor.page));

        if self.failing_page == Some(cursor.page) {
            return Err(MapperError::permanent(anyhow::anyhow!(
                "repository unavailable for page {}",
                cursor.page
            )));
        }

        let page = self
            .pages
            .get(&cursor.page)
            .cloned()
            .unwrap_or_else(|| Some(Vec::new()));
        cursor.page += 1;
        Ok(page)
    }

    async fn process(&self, item: Resource) -> Result<(), MapperError> {
        if let Some((id, failures)) = self.flaky_item {
            if item.id == id && self.flaky_attempts.fetch_add(1, Ordering::SeqCst) < failures {
                return Err(MapperError::retryable(anyhow::anyhow!("timeout")));
            }
        }
        if self.panicking_item == Some(item.id) {
            panic!("mapper crashed on item {}", item.id);
        }
        if self.failing_item == Some(item.id) {
            return Err(MapperError::permanent(anyhow::anyhow!("bad item {}", item.id)));
        }

        self.events.lock().await.push(format!("process:{}", item.id));
        Ok(())
    }

    fn hooks(&self) -> HookRegistry<PageState> {
        let mut registry = HookRegistry::new();
        for &name in &self.start_hooks {
            registry = registry.on_start(
                name,
                &format!("Run {}.", name),
                {
                    let events = self.events.clone();
                    move |cursor| record_hook(events.clone(), name, cursor)
                },
            );
        }
        for &name in &self.complete_hooks {
            registry = registry.on_complete(
                name,
                &format!("Run {}.", name),
                {
                    let events = self.events.clone();
                    move |cursor| record_hook(events.clone(), name, cursor)
                },
            );
        }
        registry
    }
}

/// A call made against the recording client.
#[derive(Debug, Clone)]
pub enum Call {
    Create {
        id: BatchId,
        units: Vec<WorkUnit>,
        state: InitialState,
        parent: Option<BatchId>,
    },
    Continue {
        id: BatchId,
        source: BatchId,
        units: Vec<WorkUnit>,
    },
    Start {
        id: BatchId,
    },
}

/// Batch client that only records what it is asked to do.
#[derive(Default)]
pub struct RecordingClient {
    calls: Mutex<Vec<Call>>,
    next_id: AtomicI64,
    fail_create: bool,
    fail_continue: bool,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    pub fn failing_continue() -> Self {
        Self {
            fail_continue: true,
            ..Self::default()
        }
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    fn next(&self) -> BatchId {
        BatchId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl BatchClient for RecordingClient {
    async fn create_batch(
        &self,
        units: Vec<WorkUnit>,
        initial_state: InitialState,
        parent: Option<BatchId>,
    ) -> Result<BatchId, BatchError> {
        if self.fail_create {
            return Err(BatchError::StorageError("connection refused".to_string()));
        }
        let id = self.next();
        self.calls.lock().await.push(Call::Create {
            id,
            units,
            state: initial_state,
            parent,
        });
        Ok(id)
    }

    async fn continue_with(
        &self,
        batch: BatchId,
        units: Vec<WorkUnit>,
    ) -> Result<BatchId, BatchError> {
        if self.fail_continue {
            return Err(BatchError::UnknownBatch(batch));
        }
        let id = self.next();
        self.calls.lock().await.push(Call::Continue {
            id,
            source: batch,
            units,
        });
        Ok(id)
    }

    async fn start_batch(&self, batch: BatchId) -> Result<(), BatchError> {
        self.calls.lock().await.push(Call::Start { id: batch });
        Ok(())
    }
}
