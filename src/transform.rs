//! Row transformer
//!
//! Normalizes raw source rows into the column set a destination table expects:
//! column names are matched case-insensitively, undeclared columns are dropped
//! and key values are extracted into comparable [`RowKey`]s.

use std::fmt;

use sea_orm::sea_query::Value;
use serde_json::{Map, Value as JsonValue};

use crate::error::SyncError;
use crate::policy::EntityPolicy;

/// A normalized row: lower-cased column name to JSON value.
pub type Row = Map<String, JsonValue>;

/// Normalized string form of a (possibly composite) key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey(pub Vec<String>);

impl RowKey {
    /// Extract the key for `columns`; `None` if any component is missing or null.
    pub fn extract(row: &Row, columns: &[String]) -> Option<Self> {
        columns
            .iter()
            .map(|column| row.get(column).and_then(key_component))
            .collect::<Option<Vec<_>>>()
            .map(RowKey)
    }

    pub fn single(value: &JsonValue) -> Option<Self> {
        key_component(value).map(|component| RowKey(vec![component]))
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("|"))
    }
}

/// Comparable string form of a key value.
///
/// Sources disagree about numeric key types (`10`, `10.0`, `"10"`), so whole
/// numbers collapse to their integer form.
pub fn key_component(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => {
            let trimmed = s.trim();
            match trimmed.parse::<f64>() {
                Ok(n) if n.fract() == 0.0 && n.abs() < 1e15 && !trimmed.contains(['e', 'E']) => {
                    Some(format!("{}", n as i64))
                }
                _ => Some(trimmed.to_string()),
            }
        }
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                n.as_f64().map(|f| {
                    if f.fract() == 0.0 && f.abs() < 1e15 {
                        format!("{}", f as i64)
                    } else {
                        f.to_string()
                    }
                })
            }
        }
        JsonValue::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        other => Some(other.to_string()),
    }
}

/// Convert a JSON value into a query value for statement building.
pub fn json_to_value(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::String(None),
        JsonValue::Bool(b) => Value::Bool(Some(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::BigInt(Some(i))
            } else if let Some(u) = n.as_u64() {
                Value::BigUnsigned(Some(u))
            } else {
                Value::Double(n.as_f64())
            }
        }
        JsonValue::String(s) => Value::String(Some(Box::new(s.clone()))),
        other => Value::Json(Some(Box::new(other.clone()))),
    }
}

/// Lower-case every column name of a raw row.
pub fn normalize_row(entity: &str, raw: JsonValue) -> Result<Row, SyncError> {
    match raw {
        JsonValue::Object(map) => Ok(map
            .into_iter()
            .map(|(column, value)| (column.to_lowercase(), value))
            .collect()),
        other => Err(SyncError::InvalidRow {
            entity: entity.to_string(),
            details: format!("expected an object, got {}", other),
        }),
    }
}

/// Per-entity transformer built from a policy.
#[derive(Debug, Clone)]
pub struct RowTransformer {
    entity: String,
    key_columns: Vec<String>,
    columns: Option<Vec<String>>,
}

impl RowTransformer {
    pub fn new(policy: &EntityPolicy) -> Self {
        Self {
            entity: policy.name.clone(),
            key_columns: policy
                .key_columns
                .iter()
                .map(|column| column.to_lowercase())
                .collect(),
            columns: (!policy.passthrough).then(|| policy.writable_columns()),
        }
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    /// Normalize a single row. Rows without a complete key cannot be matched
    /// on upsert and are rejected.
    pub fn transform_row(&self, raw: JsonValue) -> Result<Row, SyncError> {
        let mut row = normalize_row(&self.entity, raw)?;

        if let Some(columns) = &self.columns {
            row.retain(|column, _| columns.contains(column));
        }

        if RowKey::extract(&row, &self.key_columns).is_none() {
            return Err(SyncError::InvalidRow {
                entity: self.entity.clone(),
                details: format!("missing key column(s) {}", self.key_columns.join(", ")),
            });
        }

        Ok(row)
    }

    pub fn transform(&self, raw: Vec<JsonValue>) -> Result<Vec<Row>, SyncError> {
        raw.into_iter().map(|row| self.transform_row(row)).collect()
    }
}
