//! Script renderer contract and the dialect registry.
//!
//! A renderer is chosen once per query by the script's dialect tag and
//! compiles the query into a [`CompiledScript`]; the compiled form is then
//! rendered against every call's parameter.

mod template;

pub use template::TemplateRenderer;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{QueryError, Result};
use crate::model::{Query, Script};
use crate::types::{QueryParameter, Record};

/// Dialect tag of the built-in template renderer
pub const TEMPLATE_DIALECT: &str = "template";
/// Dialect tag of the verbatim renderer
pub const PLAIN_DIALECT: &str = "plain";

/// How a backend wants bound values to appear in the rendered body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStyle {
    /// Positional `$1`, `$2`, ... markers
    Dollar,
    /// Positional `?` markers
    Question,
    /// Values written into the body as JSON literals
    Inline,
}

/// Executable body plus its bind values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedScript {
    pub body: String,
    pub binds: Vec<Value>,
}

impl RenderedScript {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            binds: Vec::new(),
        }
    }

    pub fn with_binds(mut self, binds: Vec<Value>) -> Self {
        self.binds = binds;
        self
    }
}

/// Inputs available while rendering one call
pub struct RenderContext<'a> {
    pub query: &'a Query,
    /// Caller parameter with coerced criteria
    pub parameter: &'a QueryParameter,
    pub bind_style: BindStyle,
}

/// Renderer for one script dialect
pub trait ScriptRenderer: Send + Sync {
    /// Dialect tag this renderer is registered under
    fn dialect(&self) -> &str;

    /// One-time preparation of a query's script
    fn compile(&self, query: &Query) -> Result<Arc<dyn CompiledScript>>;

    /// Compile a fetch predicate written in this dialect
    fn compile_predicate(
        &self,
        query: &Query,
        _script: &Script,
    ) -> Result<Arc<dyn FetchPredicate>> {
        Err(QueryError::UnsupportedDialect {
            query: query.versioned_name(),
            dialect: format!("{} (predicate)", self.dialect()),
        })
    }

    /// Compile a fetch injection script written in this dialect
    fn compile_injection(
        &self,
        query: &Query,
        _script: &Script,
    ) -> Result<Arc<dyn FetchInjection>> {
        Err(QueryError::UnsupportedDialect {
            query: query.versioned_name(),
            dialect: format!("{} (injection)", self.dialect()),
        })
    }
}

/// A script prepared once and rendered per call
pub trait CompiledScript: Send + Sync {
    fn render(&self, ctx: &RenderContext<'_>) -> Result<RenderedScript>;
}

/// Decides whether a fetch query runs for a parent row
pub trait FetchPredicate: Send + Sync {
    fn test(&self, parent: &Record, parameter: &QueryParameter) -> Result<bool>;
}

/// Transforms fetched values before they are injected into the parent
pub trait FetchInjection: Send + Sync {
    fn apply(&self, parent: &Record, fetched: Vec<Value>) -> Result<Vec<Value>>;
}

/// Renderer that hands the script body over verbatim
pub struct PlainRenderer;

struct PlainScript {
    body: String,
}

impl CompiledScript for PlainScript {
    fn render(&self, _ctx: &RenderContext<'_>) -> Result<RenderedScript> {
        Ok(RenderedScript::new(self.body.clone()))
    }
}

impl ScriptRenderer for PlainRenderer {
    fn dialect(&self) -> &str {
        PLAIN_DIALECT
    }

    fn compile(&self, query: &Query) -> Result<Arc<dyn CompiledScript>> {
        let body = match &query.common_segment {
            Some(segment) if !segment.trim().is_empty() => {
                format!("{}\n{}", segment.trim(), query.script.code.trim())
            }
            _ => query.script.code.trim().to_string(),
        };
        Ok(Arc::new(PlainScript { body }))
    }
}

/// Dialect tag to renderer map, consulted when a query is compiled
pub struct RendererRegistry {
    renderers: HashMap<String, Arc<dyn ScriptRenderer>>,
}

impl RendererRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            renderers: HashMap::new(),
        }
    }

    /// Registry with the template and plain dialects
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TemplateRenderer));
        registry.register(Arc::new(PlainRenderer));
        registry
    }

    pub fn register(&mut self, renderer: Arc<dyn ScriptRenderer>) {
        let dialect = renderer.dialect().to_string();
        if self.renderers.contains_key(&dialect) {
            warn!("Overwriting existing renderer for dialect: {}", dialect);
        }
        debug!("Registered renderer for dialect: {}", dialect);
        self.renderers.insert(dialect, renderer);
    }

    pub fn get(&self, dialect: &str) -> Option<Arc<dyn ScriptRenderer>> {
        self.renderers.get(dialect).cloned()
    }

    /// Renderer for a query's script, or an unsupported-dialect error
    pub fn for_script(&self, query: &Query, script: &Script) -> Result<Arc<dyn ScriptRenderer>> {
        self.get(&script.dialect)
            .ok_or_else(|| QueryError::UnsupportedDialect {
                query: query.versioned_name(),
                dialect: script.dialect.clone(),
            })
    }

    pub fn dialects(&self) -> Vec<String> {
        let mut dialects: Vec<String> = self.renderers.keys().cloned().collect();
        dialects.sort();
        dialects
    }
}

impl Default for RendererRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_dialects() {
        let registry = RendererRegistry::with_defaults();
        assert_eq!(registry.dialects(), vec!["plain", "template"]);
    }

    #[test]
    fn test_unknown_dialect() {
        let registry = RendererRegistry::with_defaults();
        let query = Query::new("orders", Script::new("velocity", "select 1"));
        let err = registry
            .for_script(&query, &query.script)
            .err()
            .expect("dialect should be unknown");
        assert!(matches!(err, QueryError::UnsupportedDialect { ref dialect, .. } if dialect == "velocity"));
    }

    #[test]
    fn test_plain_renderer_is_verbatim() {
        let mut query = Query::new("orders", Script::new(PLAIN_DIALECT, " {\"size\": 0} "));
        query.common_segment = Some("// shared".into());
        let compiled = PlainRenderer.compile(&query).unwrap();
        let parameter = QueryParameter::new();
        let rendered = compiled
            .render(&RenderContext {
                query: &query,
                parameter: &parameter,
                bind_style: BindStyle::Inline,
            })
            .unwrap();
        assert_eq!(rendered.body, "// shared\n{\"size\": 0}");
        assert!(rendered.binds.is_empty());
    }

    #[test]
    fn test_plain_renderer_has_no_predicates() {
        let query = Query::new("orders", Script::new(PLAIN_DIALECT, "x"));
        let script = Script::new(PLAIN_DIALECT, "true");
        assert!(PlainRenderer.compile_predicate(&query, &script).is_err());
    }
}
