use crate::error::{QueryError, Result};
use crate::querier::Querier;
use crate::script::BindStyle;
use crate::types::*;
use async_trait::async_trait;
use downcast_rs::{impl_downcast, Downcast};
use futures::stream::BoxStream;
use serde_json::Value;

/// Lazily produced records of a streaming call
pub type RecordStream = BoxStream<'static, Result<Record>>;

/// Backend-specific syntax for binding, limiting and counting.
///
/// The shared service never builds backend syntax itself; it asks the
/// dialect to derive a limited or counting querier from a rendered one.
pub trait BackendDialect: Send + Sync {
    /// How the template renderer should emit bound values
    fn bind_style(&self) -> BindStyle;

    /// Whether offset/limit can be pushed into this querier
    fn supports_limit(&self, _querier: &Querier) -> bool {
        true
    }

    /// Derive a querier that skips `offset` rows and returns at most `limit`
    fn limit(&self, querier: Querier, offset: u64, limit: u64) -> Result<Querier>;

    /// Derive a querier whose execution counts the rows of `querier`
    fn count(&self, querier: &Querier) -> Result<Querier>;
}

/// Core trait that every backend executor implements
#[async_trait]
pub trait QueryExecutor: Send + Sync + Downcast {
    /// Backend type name (`postgres`, `search`, `http`, ...)
    fn backend(&self) -> &str;

    /// Limit/offset and count rendering for this backend
    fn dialect(&self) -> &dyn BackendDialect;

    /// Get all capabilities supported by this executor
    fn capabilities(&self) -> Vec<Capability>;

    /// Check if a specific capability is supported
    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Run a rendered script and return its rows in order
    async fn execute(&self, querier: &Querier) -> Result<Vec<Record>>;

    /// Run a querier produced by [`BackendDialect::count`]
    async fn count(&self, _querier: &Querier) -> Result<u64> {
        Err(QueryError::operation_not_supported(format!(
            "{} does not support count queries",
            self.backend()
        )))
    }

    /// Open a native cursor over the rows of a querier.
    ///
    /// The stream owns every resource it opens and releases it when it is
    /// exhausted or dropped.
    async fn stream(&self, _querier: Querier) -> Result<RecordStream> {
        Err(QueryError::operation_not_supported(format!(
            "{} does not support cursors",
            self.backend()
        )))
    }

    /// Pass a raw search or aggregation script through, returning the
    /// backend's structured response
    async fn native(&self, _querier: &Querier, operation: Operation) -> Result<Value> {
        Err(QueryError::operation_not_supported(format!(
            "{} does not support {}",
            self.backend(),
            operation
        )))
    }

    /// Close the connection gracefully
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl_downcast!(QueryExecutor);
