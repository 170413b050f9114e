//! Mapper trait and error types.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::hooks::HookRegistry;

/// Error returned by a page query, an item or a hook.
#[derive(Error, Debug)]
pub enum MapperError {
    /// Transient failure - worth running the unit again.
    #[error("retryable: {0}")]
    Retryable(#[source] anyhow::Error),

    /// Permanent failure - won't succeed on retry.
    #[error("permanent: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl MapperError {
    /// Create a retryable error.
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    /// Create a permanent error.
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// A paginated mapping job definition.
///
/// A mapper pages through some source with a caller-defined cursor and
/// processes every item it finds as an independent unit of work.
///
/// ```rust,ignore
/// struct ReindexUsers { repo: Arc<UserRepo> }
///
/// #[async_trait]
/// impl Mapper for ReindexUsers {
///     type Item = User;
///     type Cursor = PageCursor;
///
///     fn name(&self) -> &'static str {
///         "reindex_users"
///     }
///
///     async fn query(&self, cursor: &mut PageCursor) -> Result<Option<Vec<User>>, MapperError> {
///         let users = self.repo.list(cursor.page).await.map_err(MapperError::retryable)?;
///         cursor.page += 1;
///         Ok(Some(users))
///     }
///
///     async fn process(&self, user: User) -> Result<(), MapperError> {
///         self.repo.reindex(&user).await.map_err(MapperError::retryable)
///     }
/// }
/// ```
#[async_trait]
pub trait Mapper: Send + Sync {
    /// One element of a page.
    type Item: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Pagination state threaded from one step to the next.
    type Cursor: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Unique name used to route work units back to this mapper.
    fn name(&self) -> &'static str;

    /// Fetch the page for `cursor` and advance it in place for the next call.
    ///
    /// `None` and an empty page both end the mapping run.
    async fn query(
        &self,
        cursor: &mut Self::Cursor,
    ) -> Result<Option<Vec<Self::Item>>, MapperError>;

    /// Process a single item.
    async fn process(&self, item: Self::Item) -> Result<(), MapperError>;

    /// Lifecycle hooks for this mapper, in declaration order.
    ///
    /// Called once when the mapper is wrapped in a [`crate::MapperJob`].
    fn hooks(&self) -> HookRegistry<Self::Cursor> {
        HookRegistry::new()
    }
}
