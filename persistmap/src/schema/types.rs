use crate::error::{BindingError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How values bound to a column are coerced, derived from its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Real,
    DateTime,
    Text,
}

impl ColumnType {
    /// Case-insensitive match on the declared type name. Anything unrecognised
    /// is treated as opaque text.
    pub fn from_declared(declared: &str) -> Self {
        match declared.trim().to_ascii_uppercase().as_str() {
            "INTEGER" => ColumnType::Integer,
            "REAL" => ColumnType::Real,
            "DATE" | "DATETIME" => ColumnType::DateTime,
            _ => ColumnType::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// The type exactly as written in the table definition (may be empty).
    pub declared_type: String,
    pub kind: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        let declared_type = declared_type.into();
        Column {
            name: name.into(),
            kind: ColumnType::from_declared(&declared_type),
            declared_type,
        }
    }

    fn describe(&self) -> String {
        format!("{} column '{}'", self.declared_type, self.name)
    }

    /// Coerce a caller-supplied string (a key) to this column's native type.
    pub fn coerce_str(&self, raw: &str) -> Result<SqlValue> {
        let fail = || BindingError::coercion(raw, self.describe());
        match self.kind {
            ColumnType::Integer => raw
                .trim()
                .parse::<i64>()
                .map(SqlValue::Integer)
                .map_err(|_| fail()),
            ColumnType::Real => match raw.trim().parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(SqlValue::Real(f)),
                _ => Err(fail()),
            },
            ColumnType::DateTime => parse_timestamp(raw)
                .map(|dt| SqlValue::Text(iso_8601(&dt)))
                .ok_or_else(fail),
            ColumnType::Text => Ok(SqlValue::Text(raw.to_string())),
        }
    }

    /// Coerce a field of a JSON row object to this column's native type.
    /// `null` always binds as SQL NULL.
    pub fn coerce_json(&self, value: &Value) -> Result<SqlValue> {
        let fail = || BindingError::coercion(value.to_string(), self.describe());
        match (self.kind, value) {
            (_, Value::Null) => Ok(SqlValue::Null),
            (_, Value::String(s)) => self.coerce_str(s),

            (ColumnType::Integer, Value::Number(n)) => match n.as_i64() {
                Some(i) => Ok(SqlValue::Integer(i)),
                None => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        Ok(SqlValue::Integer(f as i64))
                    }
                    _ => Err(fail()),
                },
            },
            (ColumnType::Integer, Value::Bool(b)) => Ok(SqlValue::Integer(i64::from(*b))),

            (ColumnType::Real, Value::Number(n)) => {
                n.as_f64().map(SqlValue::Real).ok_or_else(fail)
            }

            // Numbers are milliseconds since the Unix epoch.
            (ColumnType::DateTime, Value::Number(n)) => n
                .as_i64()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .map(|dt| SqlValue::Text(iso_8601(&dt)))
                .ok_or_else(fail),

            (ColumnType::Text, Value::Number(n)) => Ok(SqlValue::Text(n.to_string())),
            (ColumnType::Text, Value::Bool(b)) => Ok(SqlValue::Text(b.to_string())),
            (ColumnType::Text, Value::Array(_) | Value::Object(_)) => {
                Ok(SqlValue::Text(value.to_string()))
            }

            _ => Err(fail()),
        }
    }
}

/// The table a relational binding is attached to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    pub primary_key: Column,
    /// Every column other than the primary key, in declaration order.
    pub value_columns: Vec<Column>,
}

/// Parse the timestamp forms we accept: RFC 3339, `YYYY-MM-DD[ T]HH:MM[:SS[.f]]`
/// (taken as UTC) and bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Canonical form: UTC with millisecond precision, e.g. `2099-01-01T00:00:00.000Z`.
pub fn iso_8601(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Convert a stored SQL value to JSON.
pub fn sql_to_json(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(n) => Value::Number(n.into()),
        SqlValue::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(b) => Value::String(String::from_utf8_lossy(&b).into()),
    }
}

/// Render a stored primary-key value as a binding key.
pub fn sql_to_key(value: SqlValue) -> String {
    match value {
        SqlValue::Null => "null".to_string(),
        SqlValue::Integer(n) => n.to_string(),
        SqlValue::Real(f) => f.to_string(),
        SqlValue::Text(s) => s,
        SqlValue::Blob(b) => String::from_utf8_lossy(&b).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_declared_type_matching() {
        assert_eq!(ColumnType::from_declared("integer"), ColumnType::Integer);
        assert_eq!(ColumnType::from_declared("Real"), ColumnType::Real);
        assert_eq!(ColumnType::from_declared("DATE"), ColumnType::DateTime);
        assert_eq!(ColumnType::from_declared("datetime"), ColumnType::DateTime);
        assert_eq!(ColumnType::from_declared("VARCHAR(20)"), ColumnType::Text);
        assert_eq!(ColumnType::from_declared("INT"), ColumnType::Text);
        assert_eq!(ColumnType::from_declared(""), ColumnType::Text);
    }

    #[test]
    fn test_integer_keys() {
        let id = Column::new("id", "INTEGER");
        assert_eq!(id.coerce_str("5").unwrap(), SqlValue::Integer(5));
        assert_eq!(id.coerce_str("05").unwrap(), SqlValue::Integer(5));
        assert_eq!(id.coerce_str("-12").unwrap(), SqlValue::Integer(-12));

        for bad in ["abc", "5abc", "", "1.5"] {
            let err = id.coerce_str(bad).unwrap_err();
            assert!(matches!(err, BindingError::Coercion { .. }), "{bad}");
        }
    }

    #[test]
    fn test_real_keys_reject_non_finite() {
        let score = Column::new("score", "REAL");
        assert_eq!(score.coerce_str("2.5").unwrap(), SqlValue::Real(2.5));
        assert!(score.coerce_str("NaN").is_err());
        assert!(score.coerce_str("inf").is_err());
        assert!(score.coerce_str("x").is_err());
    }

    #[test]
    fn test_datetime_normalization() {
        let at = Column::new("at", "DATETIME");
        let expected = SqlValue::Text("2099-01-01T00:00:00.000Z".into());

        assert_eq!(at.coerce_str("2099-01-01").unwrap(), expected);
        assert_eq!(at.coerce_str("2099-01-01T00:00:00Z").unwrap(), expected);
        assert_eq!(at.coerce_str("2099-01-01 00:00:00").unwrap(), expected);
        assert_eq!(at.coerce_str("2099-01-01T02:00:00+02:00").unwrap(), expected);
        assert!(at.coerce_str("next tuesday").is_err());
    }

    #[test]
    fn test_text_is_opaque() {
        let name = Column::new("name", "TEXT");
        assert_eq!(name.coerce_str(" 05 ").unwrap(), SqlValue::Text(" 05 ".into()));
    }

    #[test]
    fn test_json_values() {
        let count = Column::new("count", "INTEGER");
        assert_eq!(count.coerce_json(&json!(3)).unwrap(), SqlValue::Integer(3));
        assert_eq!(count.coerce_json(&json!(3.0)).unwrap(), SqlValue::Integer(3));
        assert_eq!(count.coerce_json(&json!("7")).unwrap(), SqlValue::Integer(7));
        assert_eq!(count.coerce_json(&json!(true)).unwrap(), SqlValue::Integer(1));
        assert_eq!(count.coerce_json(&Value::Null).unwrap(), SqlValue::Null);
        assert!(count.coerce_json(&json!(3.5)).is_err());
        assert!(count.coerce_json(&json!({"a": 1})).is_err());

        let note = Column::new("note", "TEXT");
        assert_eq!(
            note.coerce_json(&json!({"a": 1})).unwrap(),
            SqlValue::Text(r#"{"a":1}"#.into())
        );
        assert_eq!(note.coerce_json(&json!(42)).unwrap(), SqlValue::Text("42".into()));

        let at = Column::new("at", "DATE");
        assert_eq!(
            at.coerce_json(&json!(0)).unwrap(),
            SqlValue::Text("1970-01-01T00:00:00.000Z".into())
        );
    }

    #[test]
    fn test_sql_conversions() {
        assert_eq!(sql_to_json(SqlValue::Integer(4)), json!(4));
        assert_eq!(sql_to_json(SqlValue::Real(f64::NAN)), Value::Null);
        assert_eq!(sql_to_json(SqlValue::Blob(b"hi".to_vec())), json!("hi"));
        assert_eq!(sql_to_key(SqlValue::Integer(5)), "5");
        assert_eq!(sql_to_key(SqlValue::Real(2.5)), "2.5");
        assert_eq!(sql_to_key(SqlValue::Text("k1".into())), "k1");
    }
}
