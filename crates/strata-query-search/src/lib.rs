//! Search engine backend for strata-query
//!
//! Rendered scripts are Elasticsearch/OpenSearch request bodies. Rows are the
//! `_source` documents of the hits, paging uses `from`/`size`, totals come
//! from `_count` and streams walk a scroll context.
//!
//! The target index is read from the query's `index` property and falls back
//! to the executor's default index.

mod client;
mod dialect;
mod scroll;

pub use client::{hits, SearchClient};
pub use dialect::{request_body, SearchDialect};
pub use scroll::Scroll;

use async_trait::async_trait;
use futures::stream::Stream;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strata_query::{
    BackendDialect, Capability, ConnectionConfig, ExecutorFactory, Operation, Querier,
    QueryError, QueryExecutor, Record, RecordStream, Result,
};
use strata_query::config::STREAM_BATCH_SIZE_PROPERTY;
use tracing::debug;

/// Query property naming the target index
pub const INDEX_PROPERTY: &str = "index";

const DEFAULT_SCROLL_KEEP_ALIVE: &str = "1m";
const DEFAULT_SCROLL_SIZE: u64 = 64;

/// Elasticsearch/OpenSearch query executor
pub struct SearchExecutor {
    client: SearchClient,
    default_index: Option<String>,
    keep_alive: String,
    dialect: SearchDialect,
}

impl SearchExecutor {
    /// Create an executor for the cluster at `base_url`
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| {
            QueryError::InvalidConfiguration(format!("Failed to create HTTP client: {}", e))
        })?;
        Ok(Self::with_client(SearchClient::new(client, base_url)))
    }

    pub fn with_client(client: SearchClient) -> Self {
        Self {
            client,
            default_index: None,
            keep_alive: DEFAULT_SCROLL_KEEP_ALIVE.to_string(),
            dialect: SearchDialect,
        }
    }

    /// Index used by queries without an `index` property
    pub fn with_default_index(mut self, index: impl Into<String>) -> Self {
        self.default_index = Some(index.into());
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.client = self.client.with_credentials(username, password);
        self
    }

    /// How long the cluster keeps a scroll context between pages
    pub fn with_keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.keep_alive = keep_alive.into();
        self
    }

    fn index_for(&self, querier: &Querier) -> Result<String> {
        querier
            .property::<String>(INDEX_PROPERTY)
            .or_else(|| self.default_index.clone())
            .ok_or_else(|| {
                QueryError::InvalidConfiguration(format!(
                    "No index configured for query {}",
                    querier.name()
                ))
            })
    }

    async fn search(&self, querier: &Querier, body: &Value) -> Result<Value> {
        let index = self.index_for(querier)?;
        within_timeout(
            querier,
            self.client
                .send(Method::POST, &format!("/{}/_search", index), Some(body)),
        )
        .await
    }
}

async fn within_timeout<T>(querier: &Querier, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match querier.timeout() {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| QueryError::QueryTimeout(limit.as_millis() as u64))?,
        None => fut.await,
    }
}

fn boxed_stream<S>(stream: S) -> RecordStream
where
    S: Stream<Item = Result<Record>> + Send + 'static,
{
    Box::pin(stream)
}

#[async_trait]
impl QueryExecutor for SearchExecutor {
    fn backend(&self) -> &str {
        "search"
    }

    fn dialect(&self) -> &dyn BackendDialect {
        &self.dialect
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![
            Capability::Search,
            Capability::Count,
            Capability::Cursor,
            Capability::Aggregation,
        ]
    }

    async fn execute(&self, querier: &Querier) -> Result<Vec<Record>> {
        let body = Value::Object(request_body(querier)?);
        let response = self.search(querier, &body).await?;
        let rows = hits(&response);
        debug!("Search {} returned {} hits", querier.name(), rows.len());
        Ok(rows)
    }

    async fn count(&self, querier: &Querier) -> Result<u64> {
        let index = self.index_for(querier)?;
        let body = Value::Object(request_body(querier)?);
        let response = within_timeout(
            querier,
            self.client
                .send(Method::POST, &format!("/{}/_count", index), Some(&body)),
        )
        .await?;
        response.get("count").and_then(Value::as_u64).ok_or_else(|| {
            QueryError::QueryFailed(format!("Count response carried no count: {}", response))
        })
    }

    async fn stream(&self, querier: Querier) -> Result<RecordStream> {
        let index = self.index_for(&querier)?;
        let mut body = request_body(&querier)?;
        let size = querier
            .property::<u64>(STREAM_BATCH_SIZE_PROPERTY)
            .unwrap_or(DEFAULT_SCROLL_SIZE);
        body.entry("size").or_insert_with(|| json!(size));

        let body = Value::Object(body);
        let response = within_timeout(
            &querier,
            self.client.send(
                Method::POST,
                &format!("/{}/_search?scroll={}", index, self.keep_alive),
                Some(&body),
            ),
        )
        .await?;
        let mut scroll = Scroll::open(self.client.clone(), self.keep_alive.clone(), &response);
        let first = hits(&response);
        debug!("Opened scroll for {}", querier.name());

        Ok(boxed_stream(async_stream::try_stream! {
            let mut page = first;
            while !page.is_empty() {
                for record in page {
                    yield record;
                }
                page = scroll.next_page().await?;
            }
            scroll.close().await;
        }))
    }

    async fn native(&self, querier: &Querier, operation: Operation) -> Result<Value> {
        let mut body = request_body(querier)?;
        match operation {
            Operation::Search => self.search(querier, &Value::Object(body)).await,
            Operation::Aggregate => {
                body.entry("size").or_insert_with(|| json!(0));
                let response = self.search(querier, &Value::Object(body)).await?;
                Ok(response
                    .get("aggregations")
                    .cloned()
                    .unwrap_or_else(|| json!({})))
            }
            other => Err(QueryError::operation_not_supported(format!(
                "search backend has no native {}",
                other
            ))),
        }
    }
}

/// Creates [`SearchExecutor`]s from connection configurations.
///
/// `url` (or `host`/`port`) addresses the cluster, `database` is the default
/// index and the `scroll` option sets the scroll keep-alive.
#[derive(Debug, Default)]
pub struct SearchExecutorFactory;

impl SearchExecutorFactory {
    pub fn new() -> Self {
        Self
    }

    fn base_url(config: &ConnectionConfig) -> String {
        match &config.url {
            Some(url) => url.clone(),
            None => format!(
                "http://{}:{}",
                config.host.as_deref().unwrap_or("localhost"),
                config.port.unwrap_or(9200)
            ),
        }
    }
}

#[async_trait]
impl ExecutorFactory for SearchExecutorFactory {
    fn backend_type(&self) -> &'static str {
        "search"
    }

    async fn create_executor(&self, config: ConnectionConfig) -> Result<Arc<dyn QueryExecutor>> {
        debug!("Creating search executor for {}", config.connection_string());
        let mut executor = SearchExecutor::new(Self::base_url(&config), config.timeout)?;
        if let Some(index) = &config.database {
            executor = executor.with_default_index(index.clone());
        }
        if let Some(username) = &config.username {
            executor = executor.with_credentials(username.clone(), config.password.clone());
        }
        if let Some(keep_alive) = config.option("scroll") {
            executor = executor.with_keep_alive(keep_alive);
        }
        Ok(Arc::new(executor))
    }
}
