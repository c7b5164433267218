use serde_json::{json, Map, Value};
use strata_query::{BackendDialect, BindStyle, Querier, QueryError, RenderedScript, Result};

/// Search request bodies: inline JSON values, `from`/`size` windows
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchDialect;

/// Parse a rendered body as a JSON object; an empty body is `{}`
pub fn request_body(querier: &Querier) -> Result<Map<String, Value>> {
    let body = querier.body().trim();
    if body.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(QueryError::QueryFailed(format!(
            "Search body of {} must be a JSON object, got {}",
            querier.name(),
            other
        ))),
        Err(e) => Err(QueryError::Serialization(format!(
            "Search body of {} is not valid JSON: {}",
            querier.name(),
            e
        ))),
    }
}

fn with_body(querier: Querier, body: Map<String, Value>) -> Result<Querier> {
    let script = RenderedScript::new(serde_json::to_string(&body)?);
    Ok(querier.with_script(script))
}

impl BackendDialect for SearchDialect {
    fn bind_style(&self) -> BindStyle {
        BindStyle::Inline
    }

    fn limit(&self, querier: Querier, offset: u64, limit: u64) -> Result<Querier> {
        let mut body = request_body(&querier)?;
        body.insert("from".into(), json!(offset));
        body.insert("size".into(), json!(limit));
        with_body(querier, body)
    }

    fn count(&self, querier: &Querier) -> Result<Querier> {
        let body = request_body(querier)?;
        let mut count = Map::new();
        if let Some(query) = body.get("query") {
            count.insert("query".into(), query.clone());
        }
        with_body(querier.clone(), count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata_query::{Query, QuerierBuilder, QueryParameter, RendererRegistry, Script};

    fn querier(script: &str) -> Querier {
        let query = Arc::new(Query::new("orders", Script::template(script)));
        QuerierBuilder::compile(query, &RendererRegistry::with_defaults())
            .unwrap()
            .build(
                &QueryParameter::new().with_criteria(json!({"status": "open"})),
                BindStyle::Inline,
            )
            .unwrap()
    }

    #[test]
    fn test_limit_sets_window() {
        let q = querier(r#"{"query": {"term": {"status": ${status}}}, "size": 500}"#);
        let limited = SearchDialect.limit(q, 20, 10).unwrap();
        let body: Value = serde_json::from_str(limited.body()).unwrap();
        assert_eq!(
            body,
            json!({"query": {"term": {"status": "open"}}, "size": 10, "from": 20})
        );
    }

    #[test]
    fn test_count_keeps_only_query() {
        let q = querier(
            r#"{"query": {"term": {"status": ${status}}}, "sort": [{"id": "asc"}], "aggs": {}}"#,
        );
        let counted = SearchDialect.count(&q).unwrap();
        let body: Value = serde_json::from_str(counted.body()).unwrap();
        assert_eq!(body, json!({"query": {"term": {"status": "open"}}}));
    }

    #[test]
    fn test_body_must_be_object() {
        let q = querier("[1, 2]");
        assert!(matches!(
            SearchDialect.limit(q, 0, 1),
            Err(QueryError::QueryFailed(_))
        ));
    }
}
