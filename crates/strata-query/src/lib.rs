//! # strata-query
//!
//! Named, parameterized queries over heterogeneous backends.
//!
//! Queries are declared in XML mapping documents and executed through one
//! uniform API (`get`, `select`, `page`, `forward`, `stream`, `search`,
//! `aggregate`) regardless of whether the backend is a relational database,
//! a search engine or a remote HTTP resource.
//!
//! ## Architecture
//!
//! - **Mapping**: [`QueryMappingLoader`] parses mapping sources and rejects
//!   duplicate names, dangling fetch references and fetch cycles;
//!   [`QueryMappingService`] owns the reloadable query table.
//! - **Scripts**: a [`ScriptRenderer`] per dialect compiles a query once;
//!   [`QuerierCache`] keeps one compiled builder per versioned name and
//!   renders a fresh [`Querier`] per call.
//! - **Execution**: [`NamedQueryService`] drives limits, totals, overflow
//!   checks, fetch composition and hints on top of a [`QueryExecutor`].
//! - **Backends**: executors and their [`BackendDialect`] live in the
//!   backend crates (`strata-query-postgres`, `strata-query-search`,
//!   `strata-query-http`) and are wired up through [`QueryRegistry`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strata_query::{QueryConfig, QueryParameter, QueryRegistry};
//!
//! # async fn example(executor: Arc<dyn strata_query::QueryExecutor>) -> strata_query::Result<()> {
//! let config = QueryConfig::from_yaml("mapping_paths: [mappings/]")?;
//! let registry = QueryRegistry::new(config)?;
//! let service = registry.register_executor("postgres", executor).await;
//!
//! let param = QueryParameter::new()
//!     .with_criteria(serde_json::json!({"status": "open"}))
//!     .with_limit(20);
//! let page = service.page("orders", &param).await?;
//! println!("{} of {}", page.results.len(), page.total);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod fetch;
pub mod hint;
pub mod mapping;
pub mod model;
pub mod param;
pub mod querier;
pub mod registry;
pub mod script;
pub mod service;
pub mod traits;
pub mod types;
pub mod value;

// Re-export commonly used items
pub use config::{QueryConfig, QuerySettings};
pub use error::{QueryError, Result};
pub use hint::{
    FieldConvertHintHandler, HintRegistry, HintTarget, MaskHintHandler, ResultHintHandler,
};
pub use mapping::{
    parse_mapping, MappingSnapshot, QueryMappingLoader, QueryMappingService, QueryProvider,
    StaticQueries,
};
pub use model::{
    FetchParameterSource, FetchQuery, FetchQueryParameter, HintParameter, Query, QueryHint,
    QueryMapping, Script,
};
pub use param::ParameterType;
pub use querier::{CompiledFetch, Querier, QuerierBuilder, QuerierCache};
pub use registry::{ConnectionConfig, ExecutorFactory, QueryRegistry};
pub use script::{
    BindStyle, CompiledScript, FetchInjection, FetchPredicate, PlainRenderer, RenderContext,
    RenderedScript, RendererRegistry, ScriptRenderer, TemplateRenderer, PLAIN_DIALECT,
    TEMPLATE_DIALECT,
};
pub use service::{NamedQueryService, NamedQueryServiceBuilder, PeerDirectory};
pub use traits::{BackendDialect, QueryExecutor, RecordStream};
pub use types::{Capability, ForwardList, Operation, PagedList, QueryParameter, Record};
