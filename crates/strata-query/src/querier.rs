//! Querier builders and the per-service compile-once cache.

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{QueryError, Result};
use crate::mapping::{MappingSnapshot, QueryMappingService};
use crate::model::{FetchQuery, Query, QueryHint};
use crate::param::coerce_criteria;
use crate::script::{
    BindStyle, CompiledScript, FetchInjection, FetchPredicate, RenderContext, RenderedScript,
    RendererRegistry,
};
use crate::types::QueryParameter;

/// A fetch query with its predicate and injection scripts compiled
#[derive(Clone)]
pub struct CompiledFetch {
    pub fetch: FetchQuery,
    pub predicate: Option<Arc<dyn FetchPredicate>>,
    pub injection: Option<Arc<dyn FetchInjection>>,
}

/// The executable form of one call to a named query.
///
/// Created fresh by [`QuerierBuilder::build`]; backend dialects derive
/// limited or counting variants of it through [`Querier::with_script`].
#[derive(Clone)]
pub struct Querier {
    query: Arc<Query>,
    script: RenderedScript,
    parameter: QueryParameter,
    fetches: Arc<[CompiledFetch]>,
}

impl Querier {
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Versioned name of the backing query
    pub fn name(&self) -> String {
        self.query.versioned_name()
    }

    pub fn result_type(&self) -> &str {
        &self.query.result_type
    }

    pub fn script(&self) -> &RenderedScript {
        &self.script
    }

    pub fn body(&self) -> &str {
        &self.script.body
    }

    pub fn binds(&self) -> &[Value] {
        &self.script.binds
    }

    /// The caller parameter with coerced criteria
    pub fn parameter(&self) -> &QueryParameter {
        &self.parameter
    }

    pub fn fetch_queries(&self) -> &[CompiledFetch] {
        &self.fetches
    }

    pub fn hints(&self) -> &[QueryHint] {
        &self.query.hints
    }

    pub fn property<T: FromStr>(&self, key: &str) -> Option<T> {
        self.query.property(key)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.query.timeout()
    }

    /// Same call with a different rendered script
    pub fn with_script(mut self, script: RenderedScript) -> Self {
        self.script = script;
        self
    }
}

impl std::fmt::Debug for Querier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Querier")
            .field("query", &self.query.versioned_name())
            .field("script", &self.script)
            .field("fetches", &self.fetches.len())
            .finish()
    }
}

/// A query bound to its renderer's compiled form
pub struct QuerierBuilder {
    query: Arc<Query>,
    script: Arc<dyn CompiledScript>,
    fetches: Arc<[CompiledFetch]>,
}

impl QuerierBuilder {
    /// One-time preparation of a query: renderer selection and compilation
    pub fn compile(query: Arc<Query>, renderers: &RendererRegistry) -> Result<Self> {
        let renderer = renderers.for_script(&query, &query.script)?;
        let script = renderer.compile(&query)?;

        let mut fetches = Vec::with_capacity(query.fetch_queries.len());
        for fetch in &query.fetch_queries {
            let predicate = match &fetch.predicate {
                Some(s) => Some(renderers.for_script(&query, s)?.compile_predicate(&query, s)?),
                None => None,
            };
            let injection = match &fetch.injection {
                Some(s) => Some(renderers.for_script(&query, s)?.compile_injection(&query, s)?),
                None => None,
            };
            fetches.push(CompiledFetch {
                fetch: fetch.clone(),
                predicate,
                injection,
            });
        }

        debug!(
            "Compiled query {} with dialect {}",
            query.versioned_name(),
            query.script.dialect
        );

        Ok(Self {
            query,
            script,
            fetches: fetches.into(),
        })
    }

    pub fn query(&self) -> &Arc<Query> {
        &self.query
    }

    /// Render a fresh querier for one call
    pub fn build(&self, parameter: &QueryParameter, bind_style: BindStyle) -> Result<Querier> {
        let criteria = coerce_criteria(&parameter.criteria, &self.query.parameter_types).map_err(
            |(name, message)| QueryError::InvalidParameter {
                query: self.query.versioned_name(),
                name,
                message,
            },
        )?;
        let parameter = QueryParameter {
            criteria,
            ..parameter.clone()
        };

        let script = self.script.render(&RenderContext {
            query: &self.query,
            parameter: &parameter,
            bind_style,
        })?;
        debug!(
            "Rendered {}: {} ({} binds)",
            self.query.versioned_name(),
            script.body,
            script.binds.len()
        );

        Ok(Querier {
            query: self.query.clone(),
            script,
            parameter,
            fetches: self.fetches.clone(),
        })
    }
}

/// Outcome of compiling one query; failures stay cached until the next reload
type BuilderSlot = Arc<OnceCell<Result<Arc<QuerierBuilder>>>>;

/// Builders compiled against one mapping snapshot
struct BuilderTable {
    snapshot: Arc<MappingSnapshot>,
    builders: RwLock<HashMap<String, BuilderSlot>>,
}

impl BuilderTable {
    fn new(snapshot: Arc<MappingSnapshot>) -> Self {
        Self {
            snapshot,
            builders: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, name: &str) -> BuilderSlot {
        if let Some(slot) = self.builders.read().get(name) {
            return slot.clone();
        }
        self.builders
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }
}

/// Compile-once cache of querier builders keyed by versioned name.
///
/// The whole table is replaced when the mapping service publishes a newer
/// snapshot; callers holding the previous table finish against it.
pub struct QuerierCache {
    mappings: Arc<QueryMappingService>,
    renderers: Arc<RendererRegistry>,
    bind_style: BindStyle,
    table: RwLock<Arc<BuilderTable>>,
}

impl QuerierCache {
    pub fn new(
        mappings: Arc<QueryMappingService>,
        renderers: Arc<RendererRegistry>,
        bind_style: BindStyle,
    ) -> Self {
        let table = BuilderTable::new(mappings.snapshot());
        Self {
            mappings,
            renderers,
            bind_style,
            table: RwLock::new(Arc::new(table)),
        }
    }

    pub fn mappings(&self) -> &Arc<QueryMappingService> {
        &self.mappings
    }

    fn current_table(&self) -> Arc<BuilderTable> {
        let snapshot = self.mappings.snapshot();
        {
            let table = self.table.read();
            if table.snapshot.generation >= snapshot.generation {
                return table.clone();
            }
        }

        let mut table = self.table.write();
        if table.snapshot.generation < snapshot.generation {
            debug!(
                "Discarding {} compiled builders for mapping generation {}",
                table.builders.read().len(),
                snapshot.generation
            );
            *table = Arc::new(BuilderTable::new(snapshot));
        }
        table.clone()
    }

    /// Builder for a versioned name, compiling it on first use.
    ///
    /// Queries declared with `cache="false"` compile on every call.
    pub fn builder(&self, name: &str) -> Result<Arc<QuerierBuilder>> {
        let table = self.current_table();
        let query = table
            .snapshot
            .get(name)
            .ok_or_else(|| QueryError::QueryNotFound(name.to_string()))?;

        if !query.cacheable {
            return QuerierBuilder::compile(query, &self.renderers).map(Arc::new);
        }

        table
            .slot(name)
            .get_or_init(|| {
                QuerierBuilder::compile(query, &self.renderers)
                    .map(Arc::new)
                    .map_err(|e| {
                        warn!("Compiling {} failed: {}", name, e);
                        e
                    })
            })
            .clone()
    }

    /// Resolve a named query into a fresh querier for this call
    pub fn resolve(&self, name: &str, parameter: &QueryParameter) -> Result<Querier> {
        self.builder(name)?.build(parameter, self.bind_style)
    }

    /// Drop every compiled builder
    pub fn clear(&self) {
        *self.table.write() = Arc::new(BuilderTable::new(self.mappings.snapshot()));
    }

    /// Number of compiled builders in the current table
    pub fn len(&self) -> usize {
        self.current_table()
            .builders
            .read()
            .values()
            .filter(|slot| matches!(slot.get(), Some(Ok(_))))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
