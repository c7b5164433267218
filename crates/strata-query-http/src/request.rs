use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use strata_query::{BackendDialect, BindStyle, Querier, QueryError, RenderedScript, Result};

/// Query property naming the request parameter that carries the offset
pub const OFFSET_PARAM_PROPERTY: &str = "offset-param";
/// Query property naming the request parameter that carries the limit
pub const LIMIT_PARAM_PROPERTY: &str = "limit-param";

fn default_method() -> String {
    "GET".to_string()
}

/// A rendered HTTP request.
///
/// `{name}` segments of `path` are replaced by the URL-encoded entries of
/// `variables`; `query` entries become query-string parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub query: Map<String, Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl RequestDescriptor {
    pub fn parse(querier: &Querier) -> Result<Self> {
        serde_json::from_str(querier.body()).map_err(|e| {
            QueryError::Serialization(format!(
                "Request descriptor of {} is invalid: {}",
                querier.name(),
                e
            ))
        })
    }

    /// Path with every `{name}` variable substituted
    pub fn resolved_path(&self) -> Result<String> {
        let mut path = String::with_capacity(self.path.len());
        let mut rest = self.path.as_str();

        while let Some(start) = rest.find('{') {
            path.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let end = after.find('}').ok_or_else(|| {
                QueryError::QueryFailed(format!("Unterminated path variable in {}", self.path))
            })?;
            let name = &after[..end];
            let value = self
                .variables
                .get(name)
                .filter(|v| !v.is_null())
                .ok_or_else(|| {
                    QueryError::QueryFailed(format!("Path variable '{}' has no value", name))
                })?;
            path.push_str(&urlencoding::encode(&plain(value)));
            rest = &after[end + 1..];
        }
        path.push_str(rest);
        Ok(path)
    }

    /// Query-string pairs; nulls are dropped and arrays repeat the key
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (key, value) in &self.query {
            match value {
                Value::Null => {}
                Value::Array(items) => pairs.extend(
                    items
                        .iter()
                        .filter(|item| !item.is_null())
                        .map(|item| (key.clone(), plain(item))),
                ),
                other => pairs.push((key.clone(), plain(other))),
            }
        }
        pairs
    }

    fn into_querier(self, querier: Querier) -> Result<Querier> {
        let script = RenderedScript::new(serde_json::to_string(&self)?);
        Ok(querier.with_script(script))
    }
}

/// HTTP request descriptors; windows are pushed into query parameters when
/// the query names both of them through `offset-param` and `limit-param`
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpDialect;

impl BackendDialect for HttpDialect {
    fn bind_style(&self) -> BindStyle {
        BindStyle::Inline
    }

    fn supports_limit(&self, querier: &Querier) -> bool {
        querier.property::<String>(LIMIT_PARAM_PROPERTY).is_some()
            && querier.property::<String>(OFFSET_PARAM_PROPERTY).is_some()
    }

    fn limit(&self, querier: Querier, offset: u64, limit: u64) -> Result<Querier> {
        let Some(limit_param) = querier.property::<String>(LIMIT_PARAM_PROPERTY) else {
            return Err(QueryError::operation_not_supported(format!(
                "{} declares no {}",
                querier.name(),
                LIMIT_PARAM_PROPERTY
            )));
        };
        let offset_param = querier.property::<String>(OFFSET_PARAM_PROPERTY);
        if offset > 0 && offset_param.is_none() {
            return Err(QueryError::operation_not_supported(format!(
                "{} declares no {} to skip {} rows",
                querier.name(),
                OFFSET_PARAM_PROPERTY,
                offset
            )));
        }

        let mut request = RequestDescriptor::parse(&querier)?;
        request.query.insert(limit_param, Value::from(limit));
        if let Some(offset_param) = offset_param {
            request.query.insert(offset_param, Value::from(offset));
        }
        request.into_querier(querier)
    }

    fn count(&self, querier: &Querier) -> Result<Querier> {
        let mut request = RequestDescriptor::parse(querier)?;
        for property in [OFFSET_PARAM_PROPERTY, LIMIT_PARAM_PROPERTY] {
            if let Some(param) = querier.property::<String>(property) {
                request.query.remove(&param);
            }
        }
        request.into_querier(querier.clone())
    }
}
