//! Result rows as JSON objects.
//!
//! A [`Row`] maps column names to JSON values. Conversion dispatches on each
//! column's PostgreSQL type; unsupported types fail with a decode error naming
//! the column. `numeric` goes through `rust_decimal`, so NaN, infinities and
//! values beyond 28 significant digits are decode errors.

use crate::error::{OrmError, OrmResult};
use crate::value::hex_bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use std::error::Error as StdError;
use tokio_postgres::types::{FromSql, Kind, Type};
use uuid::Uuid;

type BoxError = Box<dyn StdError + Sync + Send>;

/// One result row.
pub type Row = serde_json::Map<String, JsonValue>;

/// Convert a driver row into a [`Row`].
pub fn row_to_json(row: &tokio_postgres::Row) -> OrmResult<Row> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = column_to_json(row, idx, column.type_())?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

pub(crate) fn rows_to_json(rows: &[tokio_postgres::Row]) -> OrmResult<Vec<Row>> {
    rows.iter().map(row_to_json).collect()
}

fn get<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, idx: usize) -> OrmResult<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        let name = row.columns()[idx].name();
        OrmError::decode(name, e.to_string())
    })
}

fn json_or_null<T>(value: Option<T>, f: impl FnOnce(T) -> JsonValue) -> JsonValue {
    value.map(f).unwrap_or(JsonValue::Null)
}

fn column_to_json(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> OrmResult<JsonValue> {
    if let Kind::Array(member) = ty.kind() {
        return array_to_json(row, idx, member);
    }

    let value = match *ty {
        Type::BOOL => json_or_null(get::<bool>(row, idx)?, JsonValue::Bool),
        Type::CHAR => json_or_null(get::<i8>(row, idx)?, |c| {
            JsonValue::String(char::from(c as u8).to_string())
        }),
        Type::INT2 => json_or_null(get::<i16>(row, idx)?, JsonValue::from),
        Type::INT4 => json_or_null(get::<i32>(row, idx)?, JsonValue::from),
        Type::INT8 => json_or_null(get::<i64>(row, idx)?, JsonValue::from),
        Type::OID => json_or_null(get::<u32>(row, idx)?, JsonValue::from),
        Type::FLOAT4 => json_or_null(get::<f32>(row, idx)?, |f| JsonValue::from(f64::from(f))),
        Type::FLOAT8 => json_or_null(get::<f64>(row, idx)?, JsonValue::from),
        Type::NUMERIC => json_or_null(get::<Decimal>(row, idx)?, decimal_to_json),
        Type::JSON | Type::JSONB => get::<JsonValue>(row, idx)?.unwrap_or(JsonValue::Null),
        Type::UUID => json_or_null(get::<Uuid>(row, idx)?, |u| JsonValue::String(u.to_string())),
        Type::TIMESTAMP => json_or_null(get::<NaiveDateTime>(row, idx)?, |t| {
            JsonValue::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        }),
        Type::TIMESTAMPTZ => json_or_null(get::<DateTime<Utc>>(row, idx)?, |t| {
            JsonValue::String(t.to_rfc3339())
        }),
        Type::DATE => json_or_null(get::<NaiveDate>(row, idx)?, |d| JsonValue::String(d.to_string())),
        Type::TIME => json_or_null(get::<NaiveTime>(row, idx)?, |t| JsonValue::String(t.to_string())),
        Type::BYTEA => json_or_null(get::<Vec<u8>>(row, idx)?, |b| JsonValue::String(hex_bytes(&b))),
        _ if RawText::accepts(ty) => json_or_null(get::<RawText>(row, idx)?, |s| JsonValue::String(s.0)),
        _ => {
            return Err(OrmError::decode(
                row.columns()[idx].name(),
                format!("unsupported column type '{ty}'"),
            ));
        }
    };
    Ok(value)
}

fn array_to_json(row: &tokio_postgres::Row, idx: usize, member: &Type) -> OrmResult<JsonValue> {
    fn list<T>(items: Option<Vec<Option<T>>>, f: impl Fn(T) -> JsonValue) -> JsonValue {
        json_or_null(items, |items| {
            JsonValue::Array(items.into_iter().map(|item| json_or_null(item, &f)).collect())
        })
    }

    let value = match *member {
        Type::BOOL => list(get::<Vec<Option<bool>>>(row, idx)?, JsonValue::Bool),
        Type::INT2 => list(get::<Vec<Option<i16>>>(row, idx)?, JsonValue::from),
        Type::INT4 => list(get::<Vec<Option<i32>>>(row, idx)?, JsonValue::from),
        Type::INT8 => list(get::<Vec<Option<i64>>>(row, idx)?, JsonValue::from),
        Type::FLOAT4 => list(get::<Vec<Option<f32>>>(row, idx)?, |f| JsonValue::from(f64::from(f))),
        Type::FLOAT8 => list(get::<Vec<Option<f64>>>(row, idx)?, JsonValue::from),
        Type::NUMERIC => list(get::<Vec<Option<Decimal>>>(row, idx)?, decimal_to_json),
        Type::JSON | Type::JSONB => list(get::<Vec<Option<JsonValue>>>(row, idx)?, |v| v),
        Type::UUID => list(get::<Vec<Option<Uuid>>>(row, idx)?, |u| JsonValue::String(u.to_string())),
        Type::TIMESTAMPTZ => list(get::<Vec<Option<DateTime<Utc>>>>(row, idx)?, |t| {
            JsonValue::String(t.to_rfc3339())
        }),
        Type::DATE => list(get::<Vec<Option<NaiveDate>>>(row, idx)?, |d| JsonValue::String(d.to_string())),
        _ if RawText::accepts(member) => {
            list(get::<Vec<Option<RawText>>>(row, idx)?, |s| JsonValue::String(s.0))
        }
        _ => {
            return Err(OrmError::decode(
                row.columns()[idx].name(),
                format!("unsupported array element type '{member}'"),
            ));
        }
    };
    Ok(value)
}

/// Text-like and enum columns, read as UTF-8.
struct RawText(String);

impl<'a> FromSql<'a> for RawText {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(RawText(std::str::from_utf8(raw)?.to_string()))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(ty.kind(), Kind::Enum(_)) || <&str as FromSql>::accepts(ty)
    }
}

/// Decimal text keeps the column's scale (`1.2300` stays `1.2300`).
fn decimal_to_json(d: Decimal) -> JsonValue {
    JsonValue::String(d.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::str::FromStr;
    use tokio_postgres::types::ToSql;

    #[test]
    fn numeric_keeps_scale() {
        let d = Decimal::from_str("1.2300").unwrap();
        let mut buf = BytesMut::new();
        d.to_sql(&Type::NUMERIC, &mut buf).unwrap();
        let back = Decimal::from_sql(&Type::NUMERIC, &buf).unwrap();
        assert_eq!(decimal_to_json(back), JsonValue::String("1.2300".into()));
        assert_eq!(decimal_to_json(Decimal::from_str("-0.5").unwrap()), "-0.5");
    }

    #[test]
    fn numeric_nan_is_rejected() {
        // ndigits=0 weight=0 sign=NaN dscale=0
        let nan = [0u8, 0, 0, 0, 0xC0, 0, 0, 0];
        assert!(Decimal::from_sql(&Type::NUMERIC, &nan).is_err());
    }

    #[test]
    fn raw_text_accepts_text_and_enums() {
        assert!(RawText::accepts(&Type::TEXT));
        assert!(RawText::accepts(&Type::VARCHAR));
        assert!(!RawText::accepts(&Type::INT4));
    }
}
