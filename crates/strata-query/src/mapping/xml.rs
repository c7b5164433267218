//! XML mapping documents.
//!
//! ```xml
//! <query-mappings>
//!   <param-entry name="customerId" type="long"/>
//!   <common-segment>-- shared</common-segment>
//!   <query name="orders" version="" cache="true" result-type="record">
//!     <script type="template"><![CDATA[SELECT * FROM orders]]></script>
//!     <fetch-query reference-query="customers" inject-property-name="customer" multi-records="false">
//!       <param name="id" source="R" source-name="customerId" type="long"/>
//!     </fetch-query>
//!     <hint key="mask"><param name="field" value="email"/></hint>
//!     <properties><property name="max-select-size" value="64"/></properties>
//!   </query>
//! </query-mappings>
//! ```

use serde::Deserialize;
use std::collections::HashMap;

use crate::error::{QueryError, Result};
use crate::model::{
    FetchParameterSource, FetchQuery, FetchQueryParameter, HintParameter, Query, QueryHint,
    QueryMapping, Script, DEFAULT_RESULT_TYPE,
};
use crate::param::ParameterType;

#[derive(Debug, Deserialize)]
#[serde(rename = "query-mappings")]
struct RawMappings {
    #[serde(rename = "param-entry", default)]
    param_entries: Vec<RawParamEntry>,
    #[serde(rename = "common-segment", default)]
    common_segment: Option<String>,
    #[serde(rename = "query", default)]
    queries: Vec<RawQuery>,
}

#[derive(Debug, Deserialize)]
struct RawParamEntry {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@type")]
    ty: String,
}

#[derive(Debug, Deserialize)]
struct RawScript {
    #[serde(rename = "@type", default)]
    dialect: Option<String>,
    #[serde(rename = "$text", default)]
    code: String,
}

#[derive(Debug, Deserialize)]
struct RawQuery {
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(rename = "@version", default)]
    version: String,
    #[serde(rename = "@cache", default)]
    cache: Option<String>,
    #[serde(rename = "@result-type", default)]
    result_type: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    script: Option<RawScript>,
    #[serde(rename = "fetch-query", default)]
    fetch_queries: Vec<RawFetchQuery>,
    #[serde(rename = "hint", default)]
    hints: Vec<RawHint>,
    #[serde(rename = "param-entry", default)]
    param_entries: Vec<RawParamEntry>,
    #[serde(default)]
    properties: Option<RawProperties>,
}

#[derive(Debug, Deserialize)]
struct RawFetchQuery {
    #[serde(rename = "@reference-query", default)]
    reference_query: String,
    #[serde(rename = "@reference-query-version", default)]
    reference_version: String,
    #[serde(rename = "@reference-query-backend", default)]
    reference_backend: Option<String>,
    #[serde(rename = "@inject-property-name", default)]
    inject_property: String,
    #[serde(rename = "@max-size", default)]
    max_size: Option<String>,
    #[serde(rename = "@multi-records", default)]
    multi_records: Option<String>,
    #[serde(rename = "@eager-inject", default)]
    eager_inject: Option<String>,
    #[serde(rename = "param", default)]
    parameters: Vec<RawFetchParam>,
    #[serde(rename = "predicate-script", default)]
    predicate: Option<RawScript>,
    #[serde(rename = "injection-script", default)]
    injection: Option<RawScript>,
}

#[derive(Debug, Deserialize)]
struct RawFetchParam {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@source", default)]
    source: Option<String>,
    #[serde(rename = "@source-name", default)]
    source_name: Option<String>,
    #[serde(rename = "@value", default)]
    value: Option<String>,
    #[serde(rename = "@type", default)]
    ty: Option<String>,
    #[serde(rename = "@distinct", default)]
    distinct: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawHint {
    #[serde(rename = "@key")]
    key: String,
    #[serde(rename = "param", default)]
    parameters: Vec<RawHintParam>,
    #[serde(default)]
    script: Option<RawScript>,
}

#[derive(Debug, Deserialize)]
struct RawHintParam {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@value", default)]
    value: String,
    #[serde(rename = "@type", default)]
    ty: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawProperties {
    #[serde(rename = "property", default)]
    entries: Vec<RawProperty>,
}

#[derive(Debug, Deserialize)]
struct RawProperty {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@value", default)]
    value: String,
}

/// Converts raw elements while remembering where they came from
struct Converter<'a> {
    origin: &'a str,
    default_dialect: &'a str,
}

impl Converter<'_> {
    fn malformed(&self, message: impl Into<String>) -> QueryError {
        QueryError::malformed(self.origin, message)
    }

    fn flag(&self, raw: Option<&str>, default: bool, what: &str) -> Result<bool> {
        match raw.map(str::trim) {
            None | Some("") => Ok(default),
            Some(v) if v.eq_ignore_ascii_case("true") => Ok(true),
            Some(v) if v.eq_ignore_ascii_case("false") => Ok(false),
            Some(v) => Err(self.malformed(format!("{} must be true or false, got '{}'", what, v))),
        }
    }

    fn parameter_type(&self, raw: &str, what: &str) -> Result<ParameterType> {
        raw.parse()
            .map_err(|e: String| self.malformed(format!("{}: {}", what, e)))
    }

    fn script(&self, raw: RawScript) -> Script {
        let dialect = raw
            .dialect
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| self.default_dialect.to_string());
        Script::new(dialect.trim(), raw.code.trim())
    }

    fn param_entries(&self, raw: Vec<RawParamEntry>) -> Result<HashMap<String, ParameterType>> {
        raw.into_iter()
            .map(|entry| {
                let ty = self.parameter_type(&entry.ty, &format!("param-entry '{}'", entry.name))?;
                Ok((entry.name, ty))
            })
            .collect()
    }

    fn mapping(&self, raw: RawMappings) -> Result<QueryMapping> {
        let parameter_types = self.param_entries(raw.param_entries)?;
        let queries = raw
            .queries
            .into_iter()
            .map(|q| self.query(q))
            .collect::<Result<Vec<_>>>()?;

        Ok(QueryMapping {
            origin: self.origin.to_string(),
            queries,
            parameter_types,
            common_segment: raw
                .common_segment
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        })
    }

    fn query(&self, raw: RawQuery) -> Result<Query> {
        let name = raw.name.trim().to_string();
        if name.is_empty() {
            return Err(self.malformed("query without a name"));
        }
        let script = raw
            .script
            .ok_or_else(|| self.malformed(format!("query '{}' has no script", name)))?;

        let mut query = Query::new(name.clone(), self.script(script))
            .with_version(raw.version.trim());
        query.result_type = raw
            .result_type
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_RESULT_TYPE.to_string());
        query.cacheable = self.flag(raw.cache.as_deref(), true, "cache")?;
        query.description = raw.description.map(|d| d.trim().to_string());
        query.parameter_types = self.param_entries(raw.param_entries)?;
        query.fetch_queries = raw
            .fetch_queries
            .into_iter()
            .map(|f| self.fetch_query(&name, f))
            .collect::<Result<_>>()?;
        query.hints = raw
            .hints
            .into_iter()
            .map(|h| self.hint(h))
            .collect::<Result<_>>()?;
        if let Some(properties) = raw.properties {
            query.properties = properties
                .entries
                .into_iter()
                .map(|p| (p.name, p.value))
                .collect();
        }
        Ok(query)
    }

    fn fetch_query(&self, owner: &str, raw: RawFetchQuery) -> Result<FetchQuery> {
        let reference = raw.reference_query.trim();
        if reference.is_empty() {
            return Err(self.malformed(format!(
                "fetch-query of '{}' has no reference-query",
                owner
            )));
        }
        let inject = raw.inject_property.trim();
        if inject.is_empty() {
            return Err(self.malformed(format!(
                "fetch-query '{}' of '{}' has no inject-property-name",
                reference, owner
            )));
        }

        let mut fetch = FetchQuery::new(reference, inject);
        fetch.reference_version = raw.reference_version.trim().to_string();
        fetch.reference_backend = raw
            .reference_backend
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty());
        fetch.multi_records = self.flag(raw.multi_records.as_deref(), true, "multi-records")?;
        fetch.eager_inject = self.flag(raw.eager_inject.as_deref(), true, "eager-inject")?;
        fetch.max_size = match raw.max_size.as_deref().map(str::trim) {
            None | Some("") => 0,
            Some(v) => v
                .parse()
                .map_err(|_| self.malformed(format!("max-size must be an integer, got '{}'", v)))?,
        };
        fetch.parameters = raw
            .parameters
            .into_iter()
            .map(|p| self.fetch_parameter(reference, p))
            .collect::<Result<_>>()?;
        fetch.predicate = raw.predicate.map(|s| self.script(s));
        fetch.injection = raw.injection.map(|s| self.script(s));
        Ok(fetch)
    }

    fn fetch_parameter(&self, reference: &str, raw: RawFetchParam) -> Result<FetchQueryParameter> {
        let source: FetchParameterSource = raw
            .source
            .as_deref()
            .unwrap_or("P")
            .parse()
            .map_err(|e: String| self.malformed(format!("fetch-query '{}': {}", reference, e)))?;

        // Constants may be written as `value`, lookups as `source-name`
        let source_name = match source {
            FetchParameterSource::Constant => raw.value.or(raw.source_name),
            _ => raw.source_name.or(raw.value),
        }
        .unwrap_or_else(|| raw.name.clone());

        let mut parameter = FetchQueryParameter::new(raw.name, source, source_name);
        if let Some(ty) = raw.ty.as_deref().filter(|t| !t.trim().is_empty()) {
            parameter.target_type = Some(self.parameter_type(ty, "fetch parameter type")?);
        }
        parameter.distinct = self.flag(raw.distinct.as_deref(), false, "distinct")?;
        Ok(parameter)
    }

    fn hint(&self, raw: RawHint) -> Result<QueryHint> {
        let mut hint = QueryHint::new(raw.key.trim());
        for p in raw.parameters {
            let mut parameter = HintParameter::new(p.value);
            if let Some(ty) = p.ty.as_deref().filter(|t| !t.trim().is_empty()) {
                parameter.ty = Some(self.parameter_type(ty, "hint parameter type")?);
            }
            hint = hint.with_parameter(p.name, parameter);
        }
        hint.script = raw.script.map(|s| self.script(s));
        Ok(hint)
    }
}

/// Parse one XML mapping document
pub fn parse_mapping(origin: &str, content: &str, default_dialect: &str) -> Result<QueryMapping> {
    let raw: RawMappings = quick_xml::de::from_str(content)
        .map_err(|e| QueryError::malformed(origin, e.to_string()))?;

    Converter {
        origin,
        default_dialect,
    }
    .mapping(raw)
}
