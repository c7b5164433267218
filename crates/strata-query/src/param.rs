use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Target types for parameter and result-field coercion
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Boolean,
    /// 32-bit signed integer
    Integer,
    /// 64-bit signed integer
    Long,
    /// 64-bit floating point
    Decimal,
    /// ISO 8601 date (`YYYY-MM-DD`)
    Date,
    /// RFC 3339 timestamp, normalized to UTC
    DateTime,
    /// Passed through untouched
    Json,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterType::String => write!(f, "string"),
            ParameterType::Boolean => write!(f, "boolean"),
            ParameterType::Integer => write!(f, "integer"),
            ParameterType::Long => write!(f, "long"),
            ParameterType::Decimal => write!(f, "decimal"),
            ParameterType::Date => write!(f, "date"),
            ParameterType::DateTime => write!(f, "datetime"),
            ParameterType::Json => write!(f, "json"),
        }
    }
}

impl FromStr for ParameterType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "string" | "str" | "text" => Ok(ParameterType::String),
            "boolean" | "bool" => Ok(ParameterType::Boolean),
            "integer" | "int" | "i32" => Ok(ParameterType::Integer),
            "long" | "bigint" | "i64" => Ok(ParameterType::Long),
            "decimal" | "double" | "float" | "number" | "f64" => Ok(ParameterType::Decimal),
            "date" => Ok(ParameterType::Date),
            "datetime" | "timestamp" | "instant" => Ok(ParameterType::DateTime),
            "json" | "object" => Ok(ParameterType::Json),
            other => Err(format!("Unknown parameter type: {}", other)),
        }
    }
}

impl ParameterType {
    /// Coerce a value to this type; arrays are coerced element-wise
    pub fn coerce(&self, value: &Value) -> Result<Value, String> {
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (ParameterType::Json, v) => Ok(v.clone()),
            (_, Value::Array(items)) => items
                .iter()
                .map(|item| self.coerce(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            (ParameterType::String, v) => Ok(Value::String(match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })),
            (ParameterType::Boolean, v) => coerce_bool(v).map(Value::Bool),
            (ParameterType::Integer, v) => {
                let n = coerce_i64(v)?;
                i32::try_from(n)
                    .map(|n| Value::Number(n.into()))
                    .map_err(|_| format!("{} is out of range for integer", n))
            }
            (ParameterType::Long, v) => coerce_i64(v).map(|n| Value::Number(n.into())),
            (ParameterType::Decimal, v) => {
                let f = coerce_f64(v)?;
                Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(|| format!("{} is not a finite number", f))
            }
            (ParameterType::Date, v) => coerce_date(v).map(|d| Value::String(d.to_string())),
            (ParameterType::DateTime, v) => {
                coerce_datetime(v).map(|dt| Value::String(dt.to_rfc3339()))
            }
        }
    }
}

fn coerce_bool(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok(true),
            "false" | "0" | "no" | "n" => Ok(false),
            other => Err(format!("Expected boolean, got '{}'", other)),
        },
        other => Err(format!("Expected boolean, got {}", other)),
    }
}

fn coerce_i64(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 => Ok(f as i64),
                    _ => Err(format!("Expected integral number, got {}", n)),
                }
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("Expected integral number, got '{}'", s)),
        Value::Bool(b) => Ok(i64::from(*b)),
        other => Err(format!("Expected integral number, got {}", other)),
    }
}

fn coerce_f64(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("Expected number, got {}", n)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("Expected number, got '{}'", s)),
        other => Err(format!("Expected number, got {}", other)),
    }
}

fn coerce_date(value: &Value) -> Result<NaiveDate, String> {
    let Value::String(s) = value else {
        return Err(format!("Expected date string, got {}", value));
    };
    let s = s.trim();
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.date_naive())
        .map_err(|_| format!("Expected date (YYYY-MM-DD), got '{}'", s))
}

fn coerce_datetime(value: &Value) -> Result<DateTime<Utc>, String> {
    match value {
        Value::Number(n) => {
            let millis = n
                .as_i64()
                .ok_or_else(|| format!("Expected epoch milliseconds, got {}", n))?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| format!("Epoch milliseconds out of range: {}", millis))
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
                .ok_or_else(|| format!("Expected RFC 3339 timestamp, got '{}'", s))
        }
        other => Err(format!("Expected timestamp, got {}", other)),
    }
}

/// Coerce the top-level criteria fields that have a declared type.
///
/// Returns the offending parameter name alongside the message on failure.
pub fn coerce_criteria(
    criteria: &Value,
    types: &HashMap<String, ParameterType>,
) -> Result<Value, (String, String)> {
    let Value::Object(fields) = criteria else {
        return Ok(criteria.clone());
    };
    if types.is_empty() {
        return Ok(criteria.clone());
    }

    let mut coerced = fields.clone();
    for (name, value) in coerced.iter_mut() {
        if let Some(ty) = types.get(name) {
            *value = ty.coerce(value).map_err(|e| (name.clone(), e))?;
        }
    }
    Ok(Value::Object(coerced))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_type_aliases() {
        assert_eq!("Long".parse::<ParameterType>().unwrap(), ParameterType::Long);
        assert_eq!("int".parse::<ParameterType>().unwrap(), ParameterType::Integer);
        assert_eq!(
            "timestamp".parse::<ParameterType>().unwrap(),
            ParameterType::DateTime
        );
        assert!("uuidish".parse::<ParameterType>().is_err());
    }

    #[test]
    fn test_coerce_scalars() {
        assert_eq!(ParameterType::Long.coerce(&json!("42")).unwrap(), json!(42));
        assert_eq!(ParameterType::Integer.coerce(&json!(3.0)).unwrap(), json!(3));
        assert!(ParameterType::Integer.coerce(&json!(5_000_000_000i64)).is_err());
        assert_eq!(ParameterType::Boolean.coerce(&json!("yes")).unwrap(), json!(true));
        assert_eq!(ParameterType::String.coerce(&json!(12)).unwrap(), json!("12"));
        assert_eq!(ParameterType::Decimal.coerce(&json!("1.5")).unwrap(), json!(1.5));
        assert_eq!(ParameterType::Long.coerce(&Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn test_coerce_dates() {
        assert_eq!(
            ParameterType::Date.coerce(&json!("2024-03-01T10:00:00Z")).unwrap(),
            json!("2024-03-01")
        );
        assert_eq!(
            ParameterType::DateTime
                .coerce(&json!("2024-03-01 10:00:00"))
                .unwrap(),
            json!("2024-03-01T10:00:00+00:00")
        );
        assert!(ParameterType::Date.coerce(&json!("yesterday")).is_err());
    }

    #[test]
    fn test_coerce_arrays_elementwise() {
        assert_eq!(
            ParameterType::Long.coerce(&json!(["1", 2])).unwrap(),
            json!([1, 2])
        );
    }

    #[test]
    fn test_coerce_criteria_reports_field() {
        let mut types = HashMap::new();
        types.insert("id".to_string(), ParameterType::Long);

        let ok = coerce_criteria(&json!({"id": "7", "name": "x"}), &types).unwrap();
        assert_eq!(ok, json!({"id": 7, "name": "x"}));

        let (name, _) = coerce_criteria(&json!({"id": "seven"}), &types).unwrap_err();
        assert_eq!(name, "id");
    }
}
