//! Conversion between JSON values and PostgreSQL wire types.

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use std::error::Error;
use strata_query::{ParameterType, QueryError, Record, Result};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Row;

/// One bind value, typed by the parameter type the server inferred
#[derive(Debug, Clone, PartialEq)]
pub enum PgBind {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Json(Value),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

impl ToSql for PgBind {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            PgBind::Null => Ok(IsNull::Yes),
            PgBind::Bool(v) => v.to_sql(ty, out),
            PgBind::Int2(v) => v.to_sql(ty, out),
            PgBind::Int4(v) => v.to_sql(ty, out),
            PgBind::Int8(v) => v.to_sql(ty, out),
            PgBind::Float4(v) => v.to_sql(ty, out),
            PgBind::Float8(v) => v.to_sql(ty, out),
            PgBind::Text(v) => v.to_sql(ty, out),
            PgBind::Json(v) => v.to_sql(ty, out),
            PgBind::Date(v) => v.to_sql(ty, out),
            PgBind::Timestamp(v) => v.to_sql(ty, out),
            PgBind::TimestampTz(v) => v.to_sql(ty, out),
        }
    }

    // each variant is only produced for the type it encodes
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn mismatch(value: &Value, ty: &Type) -> QueryError {
    QueryError::QueryFailed(format!(
        "Cannot bind {} to a parameter of type {}",
        value,
        ty.name()
    ))
}

fn as_i64(value: &Value, ty: &Type) -> Result<i64> {
    match ParameterType::Long.coerce(value) {
        Ok(Value::Number(n)) => n.as_i64().ok_or_else(|| mismatch(value, ty)),
        _ => Err(mismatch(value, ty)),
    }
}

fn as_f64(value: &Value, ty: &Type) -> Result<f64> {
    match ParameterType::Decimal.coerce(value) {
        Ok(Value::Number(n)) => n.as_f64().ok_or_else(|| mismatch(value, ty)),
        _ => Err(mismatch(value, ty)),
    }
}

fn as_datetime(value: &Value, ty: &Type) -> Result<DateTime<Utc>> {
    match ParameterType::DateTime.coerce(value) {
        Ok(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| mismatch(value, ty)),
        _ => Err(mismatch(value, ty)),
    }
}

/// Convert a rendered bind value for a parameter of type `ty`
pub fn bind_value(value: &Value, ty: &Type) -> Result<PgBind> {
    if value.is_null() {
        return Ok(PgBind::Null);
    }

    let bind = match *ty {
        Type::BOOL => match ParameterType::Boolean.coerce(value) {
            Ok(Value::Bool(b)) => PgBind::Bool(b),
            _ => return Err(mismatch(value, ty)),
        },
        Type::INT2 => PgBind::Int2(
            i16::try_from(as_i64(value, ty)?).map_err(|_| mismatch(value, ty))?,
        ),
        Type::INT4 => PgBind::Int4(
            i32::try_from(as_i64(value, ty)?).map_err(|_| mismatch(value, ty))?,
        ),
        Type::INT8 => PgBind::Int8(as_i64(value, ty)?),
        Type::FLOAT4 => PgBind::Float4(as_f64(value, ty)? as f32),
        Type::FLOAT8 => PgBind::Float8(as_f64(value, ty)?),
        Type::JSON | Type::JSONB => PgBind::Json(value.clone()),
        Type::DATE => match ParameterType::Date.coerce(value) {
            Ok(Value::String(s)) => PgBind::Date(
                NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|_| mismatch(value, ty))?,
            ),
            _ => return Err(mismatch(value, ty)),
        },
        Type::TIMESTAMP => PgBind::Timestamp(as_datetime(value, ty)?.naive_utc()),
        Type::TIMESTAMPTZ => PgBind::TimestampTz(as_datetime(value, ty)?),
        _ => PgBind::Text(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
    };
    Ok(bind)
}

/// Pair bind values with the parameter types of a prepared statement
pub fn bind_all(values: &[Value], types: &[Type]) -> Result<Vec<PgBind>> {
    if values.len() != types.len() {
        return Err(QueryError::QueryFailed(format!(
            "Statement expects {} parameters but {} were bound",
            types.len(),
            values.len()
        )));
    }
    values
        .iter()
        .zip(types)
        .map(|(value, ty)| bind_value(value, ty))
        .collect()
}

/// Convert a PostgreSQL row to a record in column order
pub fn row_to_record(row: &Row) -> Result<Record> {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        record.insert(column.name().to_string(), extract_value(row, idx));
    }
    Ok(record)
}

/// Extract value from PostgreSQL row
fn extract_value(row: &Row, idx: usize) -> Value {
    let column = &row.columns()[idx];

    match column.type_().name() {
        "bool" => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "int2" => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),

        "int4" => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),

        "int8" => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Number(v.into()))
            .unwrap_or(Value::Null),

        "float4" => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(Value::Number)
            .unwrap_or(Value::Null),

        "float8" => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),

        "date" => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null),

        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.and_utc().to_rfc3339()))
            .unwrap_or(Value::Null),

        "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::String(v.to_rfc3339()))
            .unwrap_or(Value::Null),

        "json" | "jsonb" => row
            .try_get::<_, Option<Value>>(idx)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),

        // text-like and anything else readable as text
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Render a driver error with the server's detail, hint and position
pub fn describe_error(e: &tokio_postgres::Error) -> String {
    let Some(db_error) = e.as_db_error() else {
        return e.to_string();
    };

    let mut msg = db_error.message().to_string();
    if let Some(detail) = db_error.detail() {
        msg.push_str(&format!("\nDetail: {}", detail));
    }
    if let Some(hint) = db_error.hint() {
        msg.push_str(&format!("\nHint: {}", hint));
    }
    if let Some(position) = db_error.position() {
        msg.push_str(&format!("\nPosition: {:?}", position));
    }
    if let Some(column) = db_error.column() {
        msg.push_str(&format!("\nColumn: {}", column));
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bind_integers() {
        assert_eq!(bind_value(&json!(5), &Type::INT4).unwrap(), PgBind::Int4(5));
        assert_eq!(bind_value(&json!("42"), &Type::INT8).unwrap(), PgBind::Int8(42));
        assert!(bind_value(&json!(70000), &Type::INT2).is_err());
        assert!(bind_value(&json!("abc"), &Type::INT4).is_err());
    }

    #[test]
    fn test_bind_null_for_any_type() {
        assert_eq!(bind_value(&Value::Null, &Type::INT4).unwrap(), PgBind::Null);
        assert_eq!(bind_value(&Value::Null, &Type::TEXT).unwrap(), PgBind::Null);
    }

    #[test]
    fn test_bind_text_and_json() {
        assert_eq!(
            bind_value(&json!("open"), &Type::TEXT).unwrap(),
            PgBind::Text("open".into())
        );
        assert_eq!(
            bind_value(&json!(12), &Type::VARCHAR).unwrap(),
            PgBind::Text("12".into())
        );
        assert_eq!(
            bind_value(&json!({"a": 1}), &Type::JSONB).unwrap(),
            PgBind::Json(json!({"a": 1}))
        );
    }

    #[test]
    fn test_bind_temporal() {
        assert_eq!(
            bind_value(&json!("2024-03-01"), &Type::DATE).unwrap(),
            PgBind::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );
        match bind_value(&json!("2024-03-01T10:00:00Z"), &Type::TIMESTAMPTZ).unwrap() {
            PgBind::TimestampTz(dt) => assert_eq!(dt.to_rfc3339(), "2024-03-01T10:00:00+00:00"),
            other => panic!("unexpected bind: {:?}", other),
        }
        assert!(matches!(
            bind_value(&json!("2024-03-01 10:00:00"), &Type::TIMESTAMP).unwrap(),
            PgBind::Timestamp(_)
        ));
    }

    #[test]
    fn test_bind_all_checks_arity() {
        let err = bind_all(&[json!(1)], &[Type::INT4, Type::TEXT]).unwrap_err();
        assert!(err.to_string().contains("expects 2 parameters"));

        let binds = bind_all(&[json!(true), json!(1.5)], &[Type::BOOL, Type::FLOAT8]).unwrap();
        assert_eq!(binds, vec![PgBind::Bool(true), PgBind::Float8(1.5)]);
    }
}
