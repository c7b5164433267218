//! Result hint handlers.
//!
//! After fetch composition every hint declared on a query is offered to the
//! registered handlers in ascending priority order. A handler that declares
//! itself exclusive stops the remaining handlers for that hint.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::error::{QueryError, Result};
use crate::model::QueryHint;
use crate::param::ParameterType;
use crate::querier::Querier;
use crate::types::{QueryParameter, Record};
use crate::value;

pub const MASK_HINT: &str = "mask";
pub const FIELD_CONVERT_HINT: &str = "result-field-convert";

const DEFAULT_MASK: &str = "***";

/// Result a hint handler works on
pub enum HintTarget<'a> {
    /// Row-shaped results of get/select/page/forward/stream
    Records(&'a mut Vec<Record>),
    /// Native response of search/aggregate
    Native(&'a mut Value),
}

impl HintTarget<'_> {
    /// Visit every record-shaped object in the target
    pub fn for_each_record(&mut self, mut f: impl FnMut(&mut Record) -> Result<()>) -> Result<()> {
        match self {
            HintTarget::Records(records) => records.iter_mut().try_for_each(f),
            HintTarget::Native(value) => match &mut **value {
                Value::Object(record) => f(record),
                Value::Array(items) => items.iter_mut().try_for_each(|item| match item {
                    Value::Object(record) => f(record),
                    _ => Ok(()),
                }),
                _ => Ok(()),
            },
        }
    }
}

/// Post-processor for results carrying a given hint key
pub trait ResultHintHandler: Send + Sync {
    fn can_handle(&self, result_type: &str, hint: &QueryHint) -> bool;

    /// Lower values run first
    fn priority(&self) -> i32 {
        0
    }

    /// Whether later handlers for the same hint are skipped
    fn exclusive(&self) -> bool {
        false
    }

    fn handle(
        &self,
        hint: &QueryHint,
        parameter: &QueryParameter,
        target: &mut HintTarget<'_>,
    ) -> Result<()>;
}

/// Ordered set of hint handlers
#[derive(Clone, Default)]
pub struct HintRegistry {
    handlers: Vec<Arc<dyn ResultHintHandler>>,
}

impl HintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `mask` and `result-field-convert` handlers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MaskHintHandler));
        registry.register(Arc::new(FieldConvertHintHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn ResultHintHandler>) {
        self.handlers.push(handler);
        self.handlers.sort_by_key(|h| h.priority());
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Apply every hint of a querier to its result
    pub fn apply(&self, querier: &Querier, target: &mut HintTarget<'_>) -> Result<()> {
        for hint in querier.hints() {
            for handler in self
                .handlers
                .iter()
                .filter(|h| h.can_handle(querier.result_type(), hint))
            {
                handler
                    .handle(hint, querier.parameter(), target)
                    .map_err(|e| match e {
                        e @ QueryError::Hint { .. } => e,
                        other => QueryError::Hint {
                            query: querier.name(),
                            key: hint.key.clone(),
                            message: other.to_string(),
                        },
                    })?;
                if handler.exclusive() {
                    debug!(
                        "Exclusive handler consumed hint {} for {}",
                        hint.key,
                        querier.name()
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn apply_records(&self, querier: &Querier, records: &mut Vec<Record>) -> Result<()> {
        if querier.hints().is_empty() {
            return Ok(());
        }
        self.apply(querier, &mut HintTarget::Records(records))
    }

    pub fn apply_native(&self, querier: &Querier, value: &mut Value) -> Result<()> {
        if querier.hints().is_empty() {
            return Ok(());
        }
        self.apply(querier, &mut HintTarget::Native(value))
    }
}

/// Replaces the `field` paths of every record with `with` (default `***`)
pub struct MaskHintHandler;

impl ResultHintHandler for MaskHintHandler {
    fn can_handle(&self, _result_type: &str, hint: &QueryHint) -> bool {
        hint.key == MASK_HINT
    }

    fn exclusive(&self) -> bool {
        true
    }

    fn handle(
        &self,
        hint: &QueryHint,
        _parameter: &QueryParameter,
        target: &mut HintTarget<'_>,
    ) -> Result<()> {
        let replacement = match hint.parameters.get("with").and_then(|p| p.first()) {
            Some(p) => p.typed_value().map_err(QueryError::invalid_configuration)?,
            None => Value::String(DEFAULT_MASK.to_string()),
        };
        let fields = hint.values("field");

        target.for_each_record(|record| {
            for field in &fields {
                if value::resolve_in_record(record, field).is_some() {
                    value::set_path(record, field, replacement.clone());
                }
            }
            Ok(())
        })
    }
}

/// Coerces result fields: `field`/`type` parameters are read pairwise
pub struct FieldConvertHintHandler;

impl ResultHintHandler for FieldConvertHintHandler {
    fn can_handle(&self, _result_type: &str, hint: &QueryHint) -> bool {
        hint.key == FIELD_CONVERT_HINT
    }

    fn priority(&self) -> i32 {
        100
    }

    fn handle(
        &self,
        hint: &QueryHint,
        _parameter: &QueryParameter,
        target: &mut HintTarget<'_>,
    ) -> Result<()> {
        let fields = hint.values("field");
        let types = hint.values("type");
        if fields.len() != types.len() {
            return Err(QueryError::invalid_configuration(format!(
                "{} fields but {} types",
                fields.len(),
                types.len()
            )));
        }
        let conversions = fields
            .into_iter()
            .zip(types)
            .map(|(field, ty)| {
                ty.parse::<ParameterType>()
                    .map(|ty| (field, ty))
                    .map_err(QueryError::invalid_configuration)
            })
            .collect::<Result<Vec<_>>>()?;

        target.for_each_record(|record| {
            for (field, ty) in &conversions {
                if let Some(current) = value::resolve_in_record(record, field) {
                    let converted = ty.coerce(&current).map_err(|e| {
                        QueryError::Serialization(format!("field '{}': {}", field, e))
                    })?;
                    value::set_path(record, field, converted);
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::QueryMappingService;
    use crate::model::{HintParameter, Query, Script};
    use crate::querier::QuerierCache;
    use crate::script::{BindStyle, RendererRegistry};
    use serde_json::json;

    fn querier(query: Query) -> Querier {
        let name = query.versioned_name();
        let mappings = Arc::new(QueryMappingService::from_queries(vec![query]).unwrap());
        let cache = QuerierCache::new(
            mappings,
            Arc::new(RendererRegistry::with_defaults()),
            BindStyle::Inline,
        );
        cache.resolve(&name, &QueryParameter::new()).unwrap()
    }

    fn records(value: Value) -> Vec<Record> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_mask_nested_fields() {
        let q = querier(
            Query::new("people", Script::template("x")).with_hint(
                QueryHint::new(MASK_HINT)
                    .with_parameter("field", HintParameter::new("email"))
                    .with_parameter("field", HintParameter::new("card.number")),
            ),
        );
        let mut rows = records(json!([
            {"email": "a@b.c", "card": {"number": "4111"}},
            {"name": "no email"}
        ]));

        HintRegistry::with_defaults().apply_records(&q, &mut rows).unwrap();
        assert_eq!(
            rows,
            records(json!([
                {"email": "***", "card": {"number": "***"}},
                {"name": "no email"}
            ]))
        );
    }

    #[test]
    fn test_field_convert() {
        let q = querier(
            Query::new("orders", Script::template("x")).with_hint(
                QueryHint::new(FIELD_CONVERT_HINT)
                    .with_parameter("field", HintParameter::new("total"))
                    .with_parameter("type", HintParameter::new("decimal"))
                    .with_parameter("field", HintParameter::new("placed"))
                    .with_parameter("type", HintParameter::new("date")),
            ),
        );
        let mut rows = records(json!([{"total": "12.5", "placed": "2024-05-01T08:00:00Z"}]));
        HintRegistry::with_defaults().apply_records(&q, &mut rows).unwrap();
        assert_eq!(rows, records(json!([{"total": 12.5, "placed": "2024-05-01"}])));
    }

    #[test]
    fn test_handler_failure_is_tagged() {
        let q = querier(
            Query::new("orders", Script::template("x")).with_hint(
                QueryHint::new(FIELD_CONVERT_HINT)
                    .with_parameter("field", HintParameter::new("total"))
                    .with_parameter("type", HintParameter::new("long")),
            ),
        );
        let mut rows = records(json!([{"total": "many"}]));
        let err = HintRegistry::with_defaults()
            .apply_records(&q, &mut rows)
            .unwrap_err();
        assert!(
            matches!(err, QueryError::Hint { ref query, ref key, .. } if query == "orders" && key == FIELD_CONVERT_HINT)
        );
    }

    #[test]
    fn test_native_targets() {
        let q = querier(
            Query::new("search", Script::template("x"))
                .with_hint(QueryHint::new(MASK_HINT).with_parameter("field", HintParameter::new("secret"))),
        );
        let mut value = json!([{"secret": 1}, {"secret": 2}, 3]);
        HintRegistry::with_defaults().apply_native(&q, &mut value).unwrap();
        assert_eq!(value, json!([{"secret": "***"}, {"secret": "***"}, 3]));
    }

    /// Writes the hint's script code into a `label` field
    struct LabelHandler;

    impl ResultHintHandler for LabelHandler {
        fn can_handle(&self, _result_type: &str, hint: &QueryHint) -> bool {
            hint.key == "label"
        }

        fn handle(
            &self,
            hint: &QueryHint,
            _parameter: &QueryParameter,
            target: &mut HintTarget<'_>,
        ) -> Result<()> {
            let script = hint.script.as_ref().ok_or_else(|| {
                QueryError::invalid_configuration("label hint needs a script")
            })?;
            target.for_each_record(|record| {
                record.insert("label".into(), Value::String(script.code.clone()));
                Ok(())
            })
        }
    }

    #[test]
    fn test_handler_reads_hint_script() {
        let q = querier(Query::new("orders", Script::template("x")).with_hint(
            QueryHint::new("label").with_script(Script::new("plain", "priority")),
        ));
        let mut registry = HintRegistry::new();
        registry.register(Arc::new(LabelHandler));

        let mut rows = records(json!([{"id": 1}]));
        registry.apply_records(&q, &mut rows).unwrap();
        assert_eq!(rows, records(json!([{"id": 1, "label": "priority"}])));

        let bare =
            querier(Query::new("orders", Script::template("x")).with_hint(QueryHint::new("label")));
        let err = registry.apply_records(&bare, &mut rows).unwrap_err();
        assert!(matches!(err, QueryError::Hint { ref key, .. } if key == "label"));
    }
}
