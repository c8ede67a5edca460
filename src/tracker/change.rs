// ABOUTME: Row change records and the typed scalar payload model
// ABOUTME: Converts delta-query rows into ordered, serializable RowChange batches

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use tokio_postgres::Row;

use super::entity::EntityId;
use super::schema::Column;

/// The mutation a change record describes. Serialized externally as a
/// single-letter code: `I`, `U`, or `D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn code(self) -> &'static str {
        match self {
            Self::Insert => "I",
            Self::Update => "U",
            Self::Delete => "D",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "I" => Some(Self::Insert),
            "U" => Some(Self::Update),
            "D" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl Serialize for ChangeOperation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

/// A typed scalar cell value.
///
/// Payloads are never untyped blobs: every cell is one of these variants so
/// serialization stays deterministic. Timestamps serialize as RFC 3339.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Serialize for ScalarValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_none(),
            Self::Bool(v) => serializer.serialize_bool(*v),
            Self::Int(v) => serializer.serialize_i64(*v),
            Self::Float(v) => serializer.serialize_f64(*v),
            Self::Text(v) => serializer.serialize_str(v),
            Self::Timestamp(v) => serializer.serialize_str(&v.to_rfc3339()),
        }
    }
}

/// Ordered column-name → scalar mapping. Serializes as a JSON object in
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowPayload {
    entries: Vec<(String, ScalarValue)>,
}

impl RowPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: ScalarValue) {
        self.entries.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&ScalarValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScalarValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for RowPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// One row-level mutation read from the delta query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowChange {
    pub change_version: i64,
    pub change_operation: ChangeOperation,
    pub database: String,
    pub table: String,
    pub row: RowPayload,
}

/// Highest change version in a batch, if any.
pub fn max_version(batch: &[RowChange]) -> Option<i64> {
    batch.iter().map(|c| c.change_version).max()
}

/// Convert one table delta-query row into a `RowChange`.
///
/// The query selects `change_version, change_operation` followed by the
/// entity's columns in ordinal order, so payload cells start at index 2.
pub fn from_table_row(id: &EntityId, columns: &[Column], row: &Row) -> Result<RowChange> {
    let change_version: i64 = row
        .try_get("change_version")
        .context("Delta row is missing change_version")?;
    let operation = read_operation(row)?;

    let mut payload = RowPayload::new();
    for (idx, column) in columns.iter().enumerate() {
        let value = read_typed(row, idx + 2, &column.data_type)
            .with_context(|| format!("Failed to read column {} of {}", column.name, id))?;
        payload.push(column.name.clone(), value);
    }

    Ok(RowChange {
        change_version,
        change_operation: operation,
        database: id.database.clone(),
        table: id.name.clone(),
        row: payload,
    })
}

/// Convert one procedure result row into a `RowChange` plus the procedure's
/// advancement output.
///
/// Procedure result sets carry their own column metadata; everything except
/// the `change_version`, `change_operation`, and `next_version` columns
/// becomes payload. `next_version` models the procedure's output parameter:
/// the watermark advances to it, never to the change versions themselves.
pub fn from_procedure_row(id: &EntityId, row: &Row) -> Result<(RowChange, i64)> {
    let change_version: i64 = row
        .try_get("change_version")
        .context("Procedure row is missing change_version")?;
    let operation = read_operation(row)?;
    let next_version: i64 = row
        .try_get("next_version")
        .context("Procedure row is missing next_version")?;

    let mut payload = RowPayload::new();
    for (idx, column) in row.columns().iter().enumerate() {
        if matches!(
            column.name(),
            "change_version" | "change_operation" | "next_version"
        ) {
            continue;
        }
        let value = read_typed(row, idx, column.type_().name())
            .with_context(|| format!("Failed to read column {} of {}", column.name(), id))?;
        payload.push(column.name().to_string(), value);
    }

    Ok((
        RowChange {
            change_version,
            change_operation: operation,
            database: id.database.clone(),
            table: id.name.clone(),
            row: payload,
        },
        next_version,
    ))
}

fn read_operation(row: &Row) -> Result<ChangeOperation> {
    let code: String = row
        .try_get("change_operation")
        .context("Delta row is missing change_operation")?;
    ChangeOperation::from_code(&code)
        .with_context(|| format!("Unknown change operation code {:?}", code))
}

/// Read one cell into a `ScalarValue`, dispatching on the catalog type name.
///
/// Accepts both `information_schema` spellings (table path) and pg type
/// names (procedure path). Types without a lossless scalar mapping fall back
/// to their text form when the driver can produce one, otherwise NULL.
fn read_typed(row: &Row, idx: usize, data_type: &str) -> Result<ScalarValue> {
    let value = match data_type {
        "smallint" | "int2" => row.try_get::<_, Option<i16>>(idx)?.map(i64::from).map(ScalarValue::Int),
        "integer" | "int4" => row.try_get::<_, Option<i32>>(idx)?.map(i64::from).map(ScalarValue::Int),
        "bigint" | "int8" => row.try_get::<_, Option<i64>>(idx)?.map(ScalarValue::Int),
        "real" | "float4" => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| ScalarValue::Float(v as f64)),
        "double precision" | "float8" => row.try_get::<_, Option<f64>>(idx)?.map(ScalarValue::Float),
        "boolean" | "bool" => row.try_get::<_, Option<bool>>(idx)?.map(ScalarValue::Bool),
        "text" | "character varying" | "varchar" | "character" | "bpchar" | "name" => {
            row.try_get::<_, Option<String>>(idx)?.map(ScalarValue::Text)
        }
        "uuid" => row
            .try_get::<_, Option<uuid::Uuid>>(idx)?
            .map(|v| ScalarValue::Text(v.to_string())),
        "timestamp without time zone" | "timestamp" => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(|v| ScalarValue::Timestamp(DateTime::from_naive_utc_and_offset(v, Utc))),
        "timestamp with time zone" | "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(ScalarValue::Timestamp),
        "date" => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)?
            .map(|v| ScalarValue::Text(v.to_string())),
        "json" | "jsonb" => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(|v| ScalarValue::Text(v.to_string())),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(ScalarValue::Text),
    };

    Ok(value.unwrap_or(ScalarValue::Null))
}
