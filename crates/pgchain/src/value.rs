//! Bound parameter values.
//!
//! [`Value`] is what every placeholder in a compiled statement binds to. The
//! server infers each parameter's type from the statement, and `Value`'s
//! `ToSql` impl adapts to it: an integer bound against an `int4` column is
//! sent as `int4`, text bound against a `uuid` column is parsed first, and so on.

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::error::Error as StdError;
use std::str::FromStr;
use tokio_postgres::types::{IsNull, Kind, ToSql, Type, to_sql_checked};
use uuid::Uuid;

type BoxError = Box<dyn StdError + Sync + Send>;

/// A single bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Exact decimal, bound as `numeric`.
    Decimal(Decimal),
    Text(String),
    Json(serde_json::Value),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
}

impl Value {
    /// Convert a JSON value into a bind value.
    ///
    /// Scalars map onto their natural variant. Objects and arrays stay JSON and
    /// are adapted at bind time (arrays can bind to PostgreSQL array types).
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Text(s),
            other => Value::Json(other),
        }
    }

    /// JSON rendering of the value, used for observers and diagnostics.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Decimal(d) => serde_json::Value::String(d.to_string()),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Json(v) => v.clone(),
            Value::Uuid(u) => serde_json::Value::String(u.to_string()),
            Value::Timestamp(t) => serde_json::Value::String(t.to_rfc3339()),
            Value::Bytes(b) => serde_json::Value::String(hex_bytes(b)),
            Value::Array(items) => items.iter().map(Value::to_json).collect(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn text_to_sql(s: &str, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match *ty {
            Type::BOOL => match s.to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "on" | "1" => true.to_sql(ty, out),
                "false" | "f" | "no" | "off" | "0" => false.to_sql(ty, out),
                _ => Err(format!("invalid boolean literal '{s}'").into()),
            },
            Type::INT2 | Type::INT4 | Type::INT8 | Type::OID => {
                Value::Int(s.trim().parse()?).to_sql(ty, out)
            }
            Type::FLOAT4 | Type::FLOAT8 => Value::Float(s.trim().parse()?).to_sql(ty, out),
            Type::NUMERIC => parse_decimal(s)?.to_sql(ty, out),
            Type::UUID => Uuid::parse_str(s.trim())?.to_sql(ty, out),
            Type::TIMESTAMPTZ => DateTime::parse_from_rfc3339(s.trim())?
                .with_timezone(&Utc)
                .to_sql(ty, out),
            Type::TIMESTAMP => parse_naive_datetime(s.trim())?.to_sql(ty, out),
            Type::DATE => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")?.to_sql(ty, out),
            Type::TIME => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")?.to_sql(ty, out),
            Type::JSON | Type::JSONB => serde_json::Value::String(s.to_string()).to_sql(ty, out),
            Type::BYTEA => s.as_bytes().to_sql(ty, out),
            _ if is_text_like(ty) => write_text(s, out),
            _ => Err(mismatch("text", ty)),
        }
    }

    fn json_to_sql(v: &serde_json::Value, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        if matches!(*ty, Type::JSON | Type::JSONB) {
            return v.to_sql(ty, out);
        }
        match v {
            serde_json::Value::Array(items) if matches!(ty.kind(), Kind::Array(_)) => {
                let items: Vec<Value> = items.iter().cloned().map(Value::from_json).collect();
                items.to_sql(ty, out)
            }
            serde_json::Value::Array(_) | serde_json::Value::Object(_) if is_text_like(ty) => {
                write_text(&v.to_string(), out)
            }
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => Err(mismatch("json", ty)),
            scalar => Value::from_json(scalar.clone()).to_sql(ty, out),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        if let Kind::Domain(base) = ty.kind() {
            return self.to_sql(base, out);
        }

        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => match *ty {
                Type::BOOL => b.to_sql(ty, out),
                Type::JSON | Type::JSONB => serde_json::Value::Bool(*b).to_sql(ty, out),
                _ if is_text_like(ty) => write_text(if *b { "true" } else { "false" }, out),
                _ => Err(mismatch("bool", ty)),
            },
            Value::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::INT8 => i.to_sql(ty, out),
                Type::OID => u32::try_from(*i)?.to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                Type::NUMERIC => Decimal::from(*i).to_sql(ty, out),
                Type::JSON | Type::JSONB => serde_json::Value::from(*i).to_sql(ty, out),
                _ if is_text_like(ty) => write_text(&i.to_string(), out),
                _ => Err(mismatch("integer", ty)),
            },
            Value::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::FLOAT8 => f.to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*f)?.to_sql(ty, out),
                Type::JSON | Type::JSONB => self.to_json().to_sql(ty, out),
                _ if is_text_like(ty) => write_text(&f.to_string(), out),
                _ => Err(mismatch("float", ty)),
            },
            Value::Decimal(d) => match *ty {
                Type::NUMERIC => d.to_sql(ty, out),
                Type::JSON | Type::JSONB => self.to_json().to_sql(ty, out),
                _ if is_text_like(ty) => write_text(&d.to_string(), out),
                _ => Err(mismatch("decimal", ty)),
            },
            Value::Text(s) => Self::text_to_sql(s, ty, out),
            Value::Json(v) => Self::json_to_sql(v, ty, out),
            Value::Uuid(u) => match *ty {
                Type::UUID => u.to_sql(ty, out),
                Type::JSON | Type::JSONB => self.to_json().to_sql(ty, out),
                _ if is_text_like(ty) => write_text(&u.to_string(), out),
                _ => Err(mismatch("uuid", ty)),
            },
            Value::Timestamp(t) => match *ty {
                Type::TIMESTAMPTZ => t.to_sql(ty, out),
                Type::TIMESTAMP => t.naive_utc().to_sql(ty, out),
                Type::DATE => t.date_naive().to_sql(ty, out),
                Type::JSON | Type::JSONB => self.to_json().to_sql(ty, out),
                _ if is_text_like(ty) => write_text(&t.to_rfc3339(), out),
                _ => Err(mismatch("timestamp", ty)),
            },
            Value::Bytes(b) => match *ty {
                Type::BYTEA => b.as_slice().to_sql(ty, out),
                _ => Err(mismatch("bytes", ty)),
            },
            Value::Array(items) => match ty.kind() {
                Kind::Array(_) => items.to_sql(ty, out),
                _ if matches!(*ty, Type::JSON | Type::JSONB) => self.to_json().to_sql(ty, out),
                _ => Err(mismatch("array", ty)),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn is_text_like(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN
    ) || matches!(ty.kind(), Kind::Enum(_))
        || ty.name() == "citext"
}

fn write_text(s: &str, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    out.extend_from_slice(s.as_bytes());
    Ok(IsNull::No)
}

fn mismatch(kind: &str, ty: &Type) -> BoxError {
    format!("cannot bind {kind} value to parameter of type {ty}").into()
}

fn parse_naive_datetime(s: &str) -> Result<NaiveDateTime, BoxError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(Into::into)
}

pub(crate) fn hex_bytes(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Parse a decimal literal, plain or scientific (`1.5e3`).
fn parse_decimal(text: &str) -> Result<Decimal, BoxError> {
    let text = text.trim();
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|e| format!("invalid numeric literal '{text}': {e}").into())
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int(v.into())
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}
