//! Attribute coercion
//!
//! `coerce` turns one raw JSON attribute into the typed value its declared
//! field type calls for. It is pure: no I/O, no shared state.

use crate::ingest::error::CoercionError;
use crate::ingest::schema::FieldType;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Null,
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Real(f32),
    Double(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    Uuid(Uuid),
}

pub fn coerce(field: &str, raw: &Value, ty: FieldType) -> Result<TypedValue, CoercionError> {
    if raw.is_null() {
        return Ok(TypedValue::Null);
    }
    // An empty string means "no value" for every non-text type
    if ty != FieldType::Text && raw.as_str().is_some_and(|s| s.trim().is_empty()) {
        return Ok(TypedValue::Null);
    }

    let fail = || CoercionError {
        field: field.to_string(),
        expected: ty.pg_type(),
        value: truncate(raw.to_string()),
    };

    let value = match ty {
        FieldType::SmallInt => {
            TypedValue::SmallInt(integer(raw).and_then(|v| i16::try_from(v).ok()).ok_or_else(fail)?)
        },
        FieldType::Integer => {
            TypedValue::Integer(integer(raw).and_then(|v| i32::try_from(v).ok()).ok_or_else(fail)?)
        },
        FieldType::BigInt => TypedValue::BigInt(integer(raw).ok_or_else(fail)?),
        FieldType::Real => {
            let v = float(raw).ok_or_else(fail)?;
            if v.is_finite() && v.abs() > f64::from(f32::MAX) {
                return Err(fail());
            }
            TypedValue::Real(v as f32)
        },
        FieldType::Double => TypedValue::Double(float(raw).ok_or_else(fail)?),
        FieldType::Text => TypedValue::Text(text(raw)),
        FieldType::Timestamp => TypedValue::Timestamp(timestamp(raw).ok_or_else(fail)?),
        FieldType::Date => TypedValue::Date(date(raw).ok_or_else(fail)?),
        FieldType::Time => TypedValue::Time(time(raw).ok_or_else(fail)?),
        FieldType::Uuid => TypedValue::Uuid(uuid(raw).ok_or_else(fail)?),
    };

    Ok(value)
}

fn truncate(mut s: String) -> String {
    const MAX: usize = 64;
    if s.len() > MAX {
        let mut end = MAX;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
        s.push_str("...");
    }
    s
}

/// Integers, integral floats and numeric strings
fn integer(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15)
                .map(|f| f as i64)
        }),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15)
                    .map(|f| f as i64)
            })
        },
        _ => None,
    }
}

fn float(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn text(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Esri dates are epoch milliseconds; ISO 8601 strings are accepted too
fn timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    if let Some(ms) = integer(raw) {
        return DateTime::from_timestamp_millis(ms);
    }
    let s = raw.as_str()?.trim();
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                .ok()
                .map(|naive| naive.and_utc())
        })
}

fn date(raw: &Value) -> Option<NaiveDate> {
    match raw {
        Value::String(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok(),
        Value::Number(_) => timestamp(raw).map(|dt| dt.date_naive()),
        _ => None,
    }
}

fn time(raw: &Value) -> Option<NaiveTime> {
    let s = raw.as_str()?.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

/// GlobalIDs arrive braced and upper case: `{8C5F...}`
fn uuid(raw: &Value) -> Option<Uuid> {
    let s = raw.as_str()?.trim();
    let s = s.strip_prefix('{').and_then(|s| s.strip_suffix('}')).unwrap_or(s);
    Uuid::parse_str(s).ok()
}
