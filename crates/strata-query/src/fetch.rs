//! Parameter derivation and injection for fetch queries.

use serde_json::{Map, Value};

use crate::error::{QueryError, Result};
use crate::model::FetchParameterSource;
use crate::querier::CompiledFetch;
use crate::types::{QueryParameter, Record};
use crate::value;

/// Build the parameter of a fetch call from its parent row and parameter.
///
/// Sources that resolve to nothing are left out of the criteria so
/// optional template sections can drop them.
pub fn derive_parameter(
    compiled: &CompiledFetch,
    parent: &Record,
    parent_parameter: &QueryParameter,
) -> Result<QueryParameter> {
    let fetch = &compiled.fetch;
    let mut criteria = Map::new();

    for parameter in &fetch.parameters {
        let resolved = match parameter.source {
            FetchParameterSource::Parent => parent_parameter.lookup(&parameter.source_name),
            FetchParameterSource::Result => value::resolve_in_record(parent, &parameter.source_name),
            FetchParameterSource::Constant => Some(parameter.constant_value()),
        };
        let Some(mut resolved) = resolved else {
            continue;
        };

        if parameter.distinct {
            if let Value::Array(items) = resolved {
                resolved = Value::Array(value::distinct(items));
            }
        }
        if let Some(ty) = parameter.target_type {
            resolved = ty
                .coerce(&resolved)
                .map_err(|message| QueryError::InvalidParameter {
                    query: fetch.reference_versioned_name(),
                    name: parameter.name.clone(),
                    message,
                })?;
        }
        criteria.insert(parameter.name.clone(), resolved);
    }

    Ok(QueryParameter {
        offset: None,
        limit: None,
        criteria: Value::Object(criteria),
        context: parent_parameter.context.clone(),
    })
}

/// Whether the fetch applies to this parent row
pub fn should_fetch(
    compiled: &CompiledFetch,
    parent: &Record,
    parent_parameter: &QueryParameter,
) -> Result<bool> {
    match &compiled.predicate {
        Some(predicate) => predicate.test(parent, parent_parameter),
        None => Ok(true),
    }
}

/// Transform fetched rows and set them on the parent.
///
/// Multi-record fetches always inject a list; single-record fetches inject
/// the first value, or nothing when the fetch came back empty.
pub fn inject(compiled: &CompiledFetch, parent: &mut Record, fetched: Vec<Record>) -> Result<()> {
    let mut values: Vec<Value> = fetched.into_iter().map(Value::Object).collect();
    if let Some(injection) = &compiled.injection {
        values = injection.apply(parent, values)?;
    }

    let property = &compiled.fetch.inject_property;
    if compiled.fetch.multi_records {
        value::set_path(parent, property, Value::Array(values));
    } else if let Some(first) = values.into_iter().next() {
        value::set_path(parent, property, first);
    }
    Ok(())
}
