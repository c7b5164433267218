//! The named query service.
//!
//! One service runs per backend and implements get/select/page/forward/
//! stream/search/aggregate on top of that backend's executor. The control
//! flow (limits, totals, overflow, fetch composition and hints) lives here
//! once; backends only contribute syntax through their [`BackendDialect`].
//!
//! [`BackendDialect`]: crate::traits::BackendDialect

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{Stream, StreamExt};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, error};

use crate::config::QueryConfig;
use crate::error::{QueryError, Result};
use crate::fetch;
use crate::hint::HintRegistry;
use crate::mapping::QueryMappingService;
use crate::querier::{CompiledFetch, Querier, QuerierCache};
use crate::script::RendererRegistry;
use crate::traits::{QueryExecutor, RecordStream};
use crate::types::{Capability, ForwardList, Operation, PagedList, QueryParameter, Record};

/// Services reachable by backend name for cross-backend fetches.
///
/// Entries are weak so a directory never keeps a stopped service alive.
#[derive(Default)]
pub struct PeerDirectory {
    services: RwLock<HashMap<String, Weak<ServiceInner>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: &NamedQueryService) {
        self.services
            .write()
            .insert(service.backend().to_string(), Arc::downgrade(&service.inner));
    }

    /// Drop the entry of `service`, leaving a newer service on the same backend alone
    pub fn remove(&self, service: &NamedQueryService) {
        let mut services = self.services.write();
        let current = services
            .get(service.backend())
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(&service.inner)));
        if current {
            services.remove(service.backend());
        }
    }

    pub fn get(&self, backend: &str) -> Option<NamedQueryService> {
        self.services
            .read()
            .get(backend)
            .and_then(Weak::upgrade)
            .map(|inner| NamedQueryService { inner })
    }
}

struct ServiceInner {
    backend: String,
    cache: QuerierCache,
    executor: Arc<dyn QueryExecutor>,
    hints: Arc<HintRegistry>,
    config: Arc<QueryConfig>,
    peers: Arc<PeerDirectory>,
}

/// Named query service bound to one backend executor
#[derive(Clone)]
pub struct NamedQueryService {
    inner: Arc<ServiceInner>,
}

/// Builder for [`NamedQueryService`]
pub struct NamedQueryServiceBuilder {
    backend: String,
    executor: Arc<dyn QueryExecutor>,
    mappings: Arc<QueryMappingService>,
    renderers: Arc<RendererRegistry>,
    hints: Arc<HintRegistry>,
    config: Arc<QueryConfig>,
    peers: Arc<PeerDirectory>,
}

impl NamedQueryServiceBuilder {
    pub fn renderers(mut self, renderers: Arc<RendererRegistry>) -> Self {
        self.renderers = renderers;
        self
    }

    pub fn hints(mut self, hints: Arc<HintRegistry>) -> Self {
        self.hints = hints;
        self
    }

    pub fn config(mut self, config: Arc<QueryConfig>) -> Self {
        self.config = config;
        self
    }

    /// Directory used to reach services of other backends
    pub fn peers(mut self, peers: Arc<PeerDirectory>) -> Self {
        self.peers = peers;
        self
    }

    pub fn build(self) -> NamedQueryService {
        let bind_style = self.executor.dialect().bind_style();
        let service = NamedQueryService {
            inner: Arc::new(ServiceInner {
                cache: QuerierCache::new(self.mappings, self.renderers, bind_style),
                backend: self.backend,
                executor: self.executor,
                hints: self.hints,
                config: self.config,
                peers: self.peers,
            }),
        };
        service.inner.peers.register(&service);
        debug!("Started named query service for backend {}", service.backend());
        service
    }
}

fn boxed_stream<S>(stream: S) -> RecordStream
where
    S: Stream<Item = Result<Record>> + Send + 'static,
{
    Box::pin(stream)
}

fn convert<T: DeserializeOwned>(record: Record) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(record))?)
}

impl NamedQueryService {
    pub fn builder(
        backend: impl Into<String>,
        executor: Arc<dyn QueryExecutor>,
        mappings: Arc<QueryMappingService>,
    ) -> NamedQueryServiceBuilder {
        NamedQueryServiceBuilder {
            backend: backend.into(),
            executor,
            mappings,
            renderers: Arc::new(RendererRegistry::with_defaults()),
            hints: Arc::new(HintRegistry::with_defaults()),
            config: Arc::new(QueryConfig::default()),
            peers: Arc::new(PeerDirectory::new()),
        }
    }

    pub fn backend(&self) -> &str {
        &self.inner.backend
    }

    pub fn executor(&self) -> &Arc<dyn QueryExecutor> {
        &self.inner.executor
    }

    pub fn cache(&self) -> &QuerierCache {
        &self.inner.cache
    }

    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    /// Resolve a named query into a querier without executing it
    pub fn querier(&self, name: &str, parameter: &QueryParameter) -> Result<Querier> {
        self.inner.cache.resolve(name, parameter)
    }

    /// Reload the mapping sources; compiled builders are replaced on next use
    pub fn reload(&self) -> Result<usize> {
        self.inner.cache.mappings().reload()
    }

    /// First row of the query, or `None` when it returns nothing
    pub async fn get(&self, name: &str, parameter: &QueryParameter) -> Result<Option<Record>> {
        let querier = self.querier(name, parameter)?;
        let rows = self.execute_limited(&querier, 0, 1, Operation::Get).await?;
        let rows = self.compose(&querier, rows).await?;
        Ok(rows.into_iter().next())
    }

    /// All rows, failing when they exceed the select ceiling
    pub async fn select(&self, name: &str, parameter: &QueryParameter) -> Result<Vec<Record>> {
        let querier = self.querier(name, parameter)?;
        let rows = self.select_rows(&querier, Operation::Select).await?;
        self.compose(&querier, rows).await
    }

    /// One page plus the total row count
    pub async fn page(&self, name: &str, parameter: &QueryParameter) -> Result<PagedList> {
        let querier = self.querier(name, parameter)?;
        let settings = self.inner.config.for_query(querier.query());
        let offset = parameter.offset.unwrap_or(0);
        let limit = settings.effective_limit(parameter.limit);

        let rows = self
            .execute_limited(&querier, offset, limit, Operation::Page)
            .await?;
        let total = if (rows.len() as u64) < limit {
            offset.saturating_add(rows.len() as u64)
        } else {
            self.count(&querier, Operation::Page).await?
        };
        let results = self.compose(&querier, rows).await?;

        Ok(PagedList {
            offset,
            page_size: limit,
            total,
            results,
        })
    }

    /// A window of rows and whether more follow, without a count query
    pub async fn forward(&self, name: &str, parameter: &QueryParameter) -> Result<ForwardList> {
        let querier = self.querier(name, parameter)?;
        let settings = self.inner.config.for_query(querier.query());
        let offset = parameter.offset.unwrap_or(0);
        let limit = settings.effective_limit(parameter.limit);

        let mut rows = self
            .execute_limited(&querier, offset, limit.saturating_add(1), Operation::Forward)
            .await?;
        let has_next = rows.len() as u64 > limit;
        rows.truncate(limit as usize);
        let results = self.compose(&querier, rows).await?;

        Ok(ForwardList { results, has_next })
    }

    /// Lazily produced rows, each enriched before it is yielded.
    ///
    /// Uses the executor's cursor when it has one and successive limited
    /// batches otherwise.
    pub async fn stream(&self, name: &str, parameter: &QueryParameter) -> Result<RecordStream> {
        let querier = self.querier(name, parameter)?;
        let service = self.clone();
        let query_name = querier.name();

        if self.inner.executor.supports(Capability::Cursor) {
            let mut cursor = self
                .inner
                .executor
                .stream(querier.clone())
                .await
                .map_err(|e| e.in_operation(&query_name, Operation::Stream))?;
            debug!("Streaming {} through a native cursor", query_name);

            let mut skip = parameter.offset.unwrap_or(0);

            return Ok(boxed_stream(async_stream::try_stream! {
                while let Some(record) = cursor.next().await {
                    let record = record.map_err(|e| e.in_operation(&query_name, Operation::Stream))?;
                    if skip > 0 {
                        skip -= 1;
                        continue;
                    }
                    for row in service.compose(&querier, vec![record]).await? {
                        yield row;
                    }
                }
            }));
        }

        let settings = self.inner.config.for_query(querier.query());
        let batch = settings.stream_batch_size;
        let mut offset = parameter.offset.unwrap_or(0);
        debug!("Streaming {} in batches of {}", query_name, batch);

        if !self.inner.executor.dialect().supports_limit(&querier) {
            let rows = self
                .inner
                .executor
                .execute(&querier)
                .await
                .map_err(|e| e.in_operation(&query_name, Operation::Stream))?;
            return Ok(boxed_stream(async_stream::try_stream! {
                let mut rows = rows.into_iter().skip(offset as usize).peekable();
                while rows.peek().is_some() {
                    let chunk: Vec<Record> = rows.by_ref().take(batch as usize).collect();
                    for row in service.compose(&querier, chunk).await? {
                        yield row;
                    }
                }
            }));
        }

        Ok(boxed_stream(async_stream::try_stream! {
            loop {
                let mut rows = service
                    .execute_limited(&querier, offset, batch.saturating_add(1), Operation::Stream)
                    .await?;
                let has_next = rows.len() as u64 > batch;
                rows.truncate(batch as usize);
                offset = offset.saturating_add(batch);
                for row in service.compose(&querier, rows).await? {
                    yield row;
                }
                if !has_next {
                    break;
                }
            }
        }))
    }

    /// Raw search pass-through; hints apply to the native response
    pub async fn search(&self, name: &str, parameter: &QueryParameter) -> Result<Value> {
        self.native(name, parameter, Operation::Search).await
    }

    /// Raw aggregation pass-through; hints apply to the native response
    pub async fn aggregate(&self, name: &str, parameter: &QueryParameter) -> Result<Value> {
        self.native(name, parameter, Operation::Aggregate).await
    }

    pub async fn get_as<T: DeserializeOwned>(
        &self,
        name: &str,
        parameter: &QueryParameter,
    ) -> Result<Option<T>> {
        self.get(name, parameter).await?.map(convert).transpose()
    }

    pub async fn select_as<T: DeserializeOwned>(
        &self,
        name: &str,
        parameter: &QueryParameter,
    ) -> Result<Vec<T>> {
        self.select(name, parameter)
            .await?
            .into_iter()
            .map(convert)
            .collect()
    }

    pub async fn page_as<T: DeserializeOwned>(
        &self,
        name: &str,
        parameter: &QueryParameter,
    ) -> Result<PagedList<T>> {
        self.page(name, parameter).await?.try_map(convert)
    }

    pub async fn forward_as<T: DeserializeOwned>(
        &self,
        name: &str,
        parameter: &QueryParameter,
    ) -> Result<ForwardList<T>> {
        self.forward(name, parameter).await?.try_map(convert)
    }

    pub async fn stream_as<T: DeserializeOwned + Send + 'static>(
        &self,
        name: &str,
        parameter: &QueryParameter,
    ) -> Result<futures::stream::BoxStream<'static, Result<T>>> {
        let stream = self.stream(name, parameter).await?;
        Ok(stream.map(|record| record.and_then(convert)).boxed())
    }

    /// Close the underlying executor
    pub async fn close(&self) -> Result<()> {
        self.inner.peers.remove(self);
        self.inner.executor.close().await
    }

    async fn native(
        &self,
        name: &str,
        parameter: &QueryParameter,
        operation: Operation,
    ) -> Result<Value> {
        let querier = self.querier(name, parameter)?;
        let mut value = self
            .inner
            .executor
            .native(&querier, operation)
            .await
            .map_err(|e| {
                error!("{} of {} failed: {}", operation, querier.name(), e);
                e.in_operation(&querier.name(), operation)
            })?;
        self.inner.hints.apply_native(&querier, &mut value)?;
        Ok(value)
    }

    /// Run a querier restricted to `limit` rows after `offset`.
    ///
    /// Dialects that cannot push the window down get it applied in memory.
    async fn execute_limited(
        &self,
        querier: &Querier,
        offset: u64,
        limit: u64,
        operation: Operation,
    ) -> Result<Vec<Record>> {
        let executor = &self.inner.executor;
        let dialect = executor.dialect();
        let result = if dialect.supports_limit(querier) {
            match dialect.limit(querier.clone(), offset, limit) {
                Ok(limited) => executor.execute(&limited).await,
                Err(e) => Err(e),
            }
        } else {
            executor.execute(querier).await.map(|rows| {
                rows.into_iter()
                    .skip(offset as usize)
                    .take(limit as usize)
                    .collect()
            })
        };

        result.map_err(|e| {
            error!("{} of {} failed: {}", operation, querier.name(), e);
            e.in_operation(&querier.name(), operation)
        })
    }

    /// Run a querier under the select ceiling
    async fn select_rows(&self, querier: &Querier, operation: Operation) -> Result<Vec<Record>> {
        let ceiling = self.inner.config.for_query(querier.query()).max_select_size;
        let executor = &self.inner.executor;

        let rows = if executor.dialect().supports_limit(querier) {
            self.execute_limited(querier, 0, (ceiling as u64).saturating_add(1), operation)
                .await?
        } else {
            executor
                .execute(querier)
                .await
                .map_err(|e| e.in_operation(&querier.name(), operation))?
        };

        if rows.len() > ceiling {
            return Err(QueryError::Overflow {
                query: querier.name(),
                operation,
                ceiling,
            });
        }
        Ok(rows)
    }

    async fn count(&self, querier: &Querier, operation: Operation) -> Result<u64> {
        let executor = &self.inner.executor;
        let counted = match executor.dialect().count(querier) {
            Ok(counter) => executor.count(&counter).await,
            Err(e) => Err(e),
        };
        counted.map_err(|e| {
            error!("Count for {} failed: {}", querier.name(), e);
            e.in_operation(&querier.name(), operation)
        })
    }

    /// Fetch-enrich rows, then apply hints
    fn compose<'a>(
        &'a self,
        querier: &'a Querier,
        rows: Vec<Record>,
    ) -> BoxFuture<'a, Result<Vec<Record>>> {
        async move {
            let mut rows = rows;
            if !querier.fetch_queries().is_empty() {
                for row in rows.iter_mut() {
                    self.fetch_into(querier, row).await?;
                }
            }
            self.inner.hints.apply_records(querier, &mut rows)?;
            Ok(rows)
        }
        .boxed()
    }

    /// Resolve every fetch query of one row in declaration order
    async fn fetch_into(&self, querier: &Querier, row: &mut Record) -> Result<()> {
        let mut deferred: Vec<(&CompiledFetch, Vec<Record>)> = Vec::new();

        for compiled in querier.fetch_queries() {
            let wrap = |e: QueryError| QueryError::Fetch {
                query: querier.name(),
                fetch: compiled.fetch.reference_versioned_name(),
                source: Box::new(e),
            };

            if !fetch::should_fetch(compiled, row, querier.parameter()).map_err(wrap)? {
                continue;
            }
            let parameter =
                fetch::derive_parameter(compiled, row, querier.parameter()).map_err(wrap)?;
            let peer = self.peer_for(compiled).map_err(wrap)?;
            let fetched = peer.run_fetch(compiled, parameter).await.map_err(wrap)?;

            if compiled.fetch.eager_inject {
                fetch::inject(compiled, row, fetched).map_err(wrap)?;
            } else {
                deferred.push((compiled, fetched));
            }
        }

        for (compiled, fetched) in deferred {
            fetch::inject(compiled, row, fetched).map_err(|e| QueryError::Fetch {
                query: querier.name(),
                fetch: compiled.fetch.reference_versioned_name(),
                source: Box::new(e),
            })?;
        }
        Ok(())
    }

    fn peer_for(&self, compiled: &CompiledFetch) -> Result<NamedQueryService> {
        match compiled.fetch.reference_backend.as_deref() {
            None => Ok(self.clone()),
            Some(backend) if backend == self.inner.backend => Ok(self.clone()),
            Some(backend) => self.inner.peers.get(backend).ok_or_else(|| {
                QueryError::invalid_configuration(format!(
                    "No named query service registered for backend '{}'",
                    backend
                ))
            }),
        }
    }

    /// Resolve and run one fetch query, including its own fetches and hints
    fn run_fetch<'a>(
        &'a self,
        compiled: &'a CompiledFetch,
        parameter: QueryParameter,
    ) -> BoxFuture<'a, Result<Vec<Record>>> {
        async move {
            let fetch = &compiled.fetch;
            let querier = self.querier(&fetch.reference_versioned_name(), &parameter)?;

            let rows = if !fetch.multi_records {
                self.execute_limited(&querier, 0, 1, Operation::Fetch).await?
            } else if fetch.max_size > 0 {
                self.execute_limited(&querier, 0, fetch.max_size as u64, Operation::Fetch)
                    .await?
            } else {
                self.select_rows(&querier, Operation::Fetch).await?
            };

            self.compose(&querier, rows).await
        }
        .boxed()
    }
}
