//! In-memory representation of named queries.
//!
//! Everything here is built once by the mapping loader and is immutable
//! afterwards; queries are shared behind `Arc` by the mapping table.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::param::ParameterType;
use crate::script::TEMPLATE_DIALECT;

/// Result type used when a query declares none
pub const DEFAULT_RESULT_TYPE: &str = "record";

/// Build the lookup key of a query: `name` or `name_version`
pub fn versioned_name(name: &str, version: &str) -> String {
    if version.is_empty() {
        name.to_string()
    } else {
        format!("{}_{}", name, version)
    }
}

/// Unrendered script source tagged with its dialect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub dialect: String,
    pub code: String,
}

impl Script {
    pub fn new(dialect: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            dialect: dialect.into(),
            code: code.into(),
        }
    }

    /// Script in the default template dialect
    pub fn template(code: impl Into<String>) -> Self {
        Self::new(TEMPLATE_DIALECT, code)
    }
}

/// One named query definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub name: String,
    pub version: String,
    pub result_type: String,
    pub script: Script,
    /// Shared boilerplate inherited from the mapping source
    pub common_segment: Option<String>,
    pub fetch_queries: Vec<FetchQuery>,
    pub hints: Vec<QueryHint>,
    /// Parameter name to target type coercions
    pub parameter_types: HashMap<String, ParameterType>,
    pub properties: HashMap<String, String>,
    pub cacheable: bool,
    pub description: Option<String>,
    /// Mapping source this query was loaded from
    pub origin: Option<String>,
}

impl Query {
    pub fn new(name: impl Into<String>, script: Script) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            result_type: DEFAULT_RESULT_TYPE.to_string(),
            script,
            common_segment: None,
            fetch_queries: Vec::new(),
            hints: Vec::new(),
            parameter_types: HashMap::new(),
            properties: HashMap::new(),
            cacheable: true,
            description: None,
            origin: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_result_type(mut self, result_type: impl Into<String>) -> Self {
        self.result_type = result_type.into();
        self
    }

    pub fn with_fetch(mut self, fetch: FetchQuery) -> Self {
        self.fetch_queries.push(fetch);
        self
    }

    pub fn with_hint(mut self, hint: QueryHint) -> Self {
        self.hints.push(hint);
        self
    }

    pub fn with_parameter_type(mut self, name: impl Into<String>, ty: ParameterType) -> Self {
        self.parameter_types.insert(name.into(), ty);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn versioned_name(&self) -> String {
        versioned_name(&self.name, &self.version)
    }

    /// Read and parse a property, ignoring values that do not parse
    pub fn property<T: FromStr>(&self, key: &str) -> Option<T> {
        self.properties.get(key).and_then(|v| v.trim().parse().ok())
    }

    /// Statement timeout passed through to executors
    pub fn timeout(&self) -> Option<Duration> {
        self.property::<u64>("timeout").map(Duration::from_millis)
    }
}

/// Where a fetch parameter takes its value from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchParameterSource {
    /// The parent query's parameter (criteria, then context)
    #[serde(rename = "P")]
    Parent,
    /// A field of the parent result row
    #[serde(rename = "R")]
    Result,
    /// A literal baked into the mapping
    #[serde(rename = "C")]
    Constant,
}

impl FromStr for FetchParameterSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "P" | "PARENT" => Ok(FetchParameterSource::Parent),
            "R" | "RESULT" => Ok(FetchParameterSource::Result),
            "C" | "CONSTANT" => Ok(FetchParameterSource::Constant),
            other => Err(format!("Unknown fetch parameter source: {}", other)),
        }
    }
}

impl fmt::Display for FetchParameterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchParameterSource::Parent => write!(f, "P"),
            FetchParameterSource::Result => write!(f, "R"),
            FetchParameterSource::Constant => write!(f, "C"),
        }
    }
}

/// One parameter of a derived fetch query call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchQueryParameter {
    /// Name in the fetched query's criteria
    pub name: String,
    pub source: FetchParameterSource,
    /// Path for `P`/`R` sources, literal for `C`
    pub source_name: String,
    pub target_type: Option<ParameterType>,
    /// De-duplicate collection values before binding
    pub distinct: bool,
}

impl FetchQueryParameter {
    pub fn new(
        name: impl Into<String>,
        source: FetchParameterSource,
        source_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            source_name: source_name.into(),
            target_type: None,
            distinct: false,
        }
    }

    pub fn with_type(mut self, ty: ParameterType) -> Self {
        self.target_type = Some(ty);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Literal value of a constant source; JSON when it parses, else a string
    pub fn constant_value(&self) -> Value {
        serde_json::from_str(&self.source_name)
            .unwrap_or_else(|_| Value::String(self.source_name.clone()))
    }
}

/// A secondary query whose results are injected into parent rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchQuery {
    pub reference_query: String,
    pub reference_version: String,
    /// Backend serving the referenced query; `None` means the parent's own
    pub reference_backend: Option<String>,
    /// Dotted property path on the parent row
    pub inject_property: String,
    pub multi_records: bool,
    /// Cap on fetched rows; `<= 0` means backend default
    pub max_size: i64,
    pub parameters: Vec<FetchQueryParameter>,
    pub predicate: Option<Script>,
    pub injection: Option<Script>,
    pub eager_inject: bool,
}

impl FetchQuery {
    pub fn new(reference_query: impl Into<String>, inject_property: impl Into<String>) -> Self {
        Self {
            reference_query: reference_query.into(),
            reference_version: String::new(),
            reference_backend: None,
            inject_property: inject_property.into(),
            multi_records: true,
            max_size: 0,
            parameters: Vec::new(),
            predicate: None,
            injection: None,
            eager_inject: true,
        }
    }

    pub fn single(mut self) -> Self {
        self.multi_records = false;
        self
    }

    pub fn with_max_size(mut self, max_size: i64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.reference_backend = Some(backend.into());
        self
    }

    pub fn with_parameter(mut self, parameter: FetchQueryParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_predicate(mut self, script: Script) -> Self {
        self.predicate = Some(script);
        self
    }

    pub fn with_injection(mut self, script: Script) -> Self {
        self.injection = Some(script);
        self
    }

    pub fn deferred(mut self) -> Self {
        self.eager_inject = false;
        self
    }

    pub fn reference_versioned_name(&self) -> String {
        versioned_name(&self.reference_query, &self.reference_version)
    }
}

/// A declared hint parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HintParameter {
    pub value: String,
    pub ty: Option<ParameterType>,
}

impl HintParameter {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ty: None,
        }
    }

    /// Value coerced to its declared type, or a plain string
    pub fn typed_value(&self) -> Result<Value, String> {
        let raw = Value::String(self.value.clone());
        match self.ty {
            Some(ty) => ty.coerce(&raw),
            None => Ok(raw),
        }
    }
}

/// Declarative post-processing instruction for results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHint {
    pub key: String,
    pub parameters: HashMap<String, Vec<HintParameter>>,
    pub script: Option<Script>,
}

impl QueryHint {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            parameters: HashMap::new(),
            script: None,
        }
    }

    /// Hint-specific script, read by the handlers that understand it
    pub fn with_script(mut self, script: Script) -> Self {
        self.script = Some(script);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, parameter: HintParameter) -> Self {
        self.parameters
            .entry(name.into())
            .or_default()
            .push(parameter);
        self
    }

    /// All raw values declared for a parameter name
    pub fn values(&self, name: &str) -> Vec<&str> {
        self.parameters
            .get(name)
            .map(|params| params.iter().map(|p| p.value.as_str()).collect())
            .unwrap_or_default()
    }

    /// First raw value declared for a parameter name
    pub fn value(&self, name: &str) -> Option<&str> {
        self.parameters
            .get(name)
            .and_then(|params| params.first())
            .map(|p| p.value.as_str())
    }
}

/// Queries parsed from one mapping source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryMapping {
    pub origin: String,
    pub queries: Vec<Query>,
    /// Mapping-wide parameter coercions, overridden per query
    pub parameter_types: HashMap<String, ParameterType>,
    pub common_segment: Option<String>,
}

impl QueryMapping {
    /// Hand the queries out with mapping-level settings folded in
    pub fn into_queries(self) -> Vec<Query> {
        let QueryMapping {
            origin,
            queries,
            parameter_types,
            common_segment,
        } = self;

        queries
            .into_iter()
            .map(|mut query| {
                for (name, ty) in &parameter_types {
                    query.parameter_types.entry(name.clone()).or_insert(*ty);
                }
                if query.common_segment.is_none() {
                    query.common_segment = common_segment.clone();
                }
                if query.origin.is_none() {
                    query.origin = Some(origin.clone());
                }
                query
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_versioned_name() {
        assert_eq!(versioned_name("orders", ""), "orders");
        assert_eq!(versioned_name("orders", "v2"), "orders_v2");

        let query = Query::new("orders", Script::template("x")).with_version("2");
        assert_eq!(query.versioned_name(), "orders_2");
    }

    #[test]
    fn test_query_properties() {
        let query = Query::new("orders", Script::template("x"))
            .with_property("max-select-size", " 10 ")
            .with_property("timeout", "1500")
            .with_property("broken", "ten");

        assert_eq!(query.property::<usize>("max-select-size"), Some(10));
        assert_eq!(query.property::<usize>("broken"), None);
        assert_eq!(query.timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_constant_parameter_value() {
        let number = FetchQueryParameter::new("n", FetchParameterSource::Constant, "5");
        let word = FetchQueryParameter::new("s", FetchParameterSource::Constant, "open");
        assert_eq!(number.constant_value(), json!(5));
        assert_eq!(word.constant_value(), json!("open"));
    }

    #[test]
    fn test_mapping_folds_shared_settings() {
        let mut parameter_types = HashMap::new();
        parameter_types.insert("id".to_string(), ParameterType::Long);
        parameter_types.insert("flag".to_string(), ParameterType::Boolean);

        let mapping = QueryMapping {
            origin: "orders.xml".into(),
            queries: vec![Query::new("orders", Script::template("x"))
                .with_parameter_type("flag", ParameterType::String)],
            parameter_types,
            common_segment: Some("-- shared".into()),
        };

        let queries = mapping.into_queries();
        let query = &queries[0];
        assert_eq!(query.parameter_types["id"], ParameterType::Long);
        assert_eq!(query.parameter_types["flag"], ParameterType::String);
        assert_eq!(query.common_segment.as_deref(), Some("-- shared"));
        assert_eq!(query.origin.as_deref(), Some("orders.xml"));
    }

    #[test]
    fn test_hint_values() {
        let hint = QueryHint::new("mask")
            .with_parameter("field", HintParameter::new("email"))
            .with_parameter("field", HintParameter::new("phone"));
        assert_eq!(hint.values("field"), vec!["email", "phone"]);
        assert_eq!(hint.value("field"), Some("email"));
        assert_eq!(hint.value("with"), None);
    }
}
