//! In-memory columnar dataset ingested as one feature version.

use crate::error::FeatureStoreError;
use crate::model::EntityId;
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet as HashSet;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int64,
    Float64,
    String,
    Bool,
    Timestamp,
}

/// Decides which statistics a column gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Numeric,
    Other,
}

impl ColumnType {
    pub fn dtype(&self) -> &'static str {
        match self {
            ColumnType::Int64 => "int64",
            ColumnType::Float64 => "float64",
            ColumnType::String => "string",
            ColumnType::Bool => "bool",
            ColumnType::Timestamp => "timestamp",
        }
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            ColumnType::Int64 | ColumnType::Float64 => ColumnKind::Numeric,
            ColumnType::String | ColumnType::Bool | ColumnType::Timestamp => ColumnKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValues {
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
    String(Vec<Option<String>>),
    Bool(Vec<Option<bool>>),
    Timestamp(Vec<Option<DateTime<Utc>>>),
}

impl ColumnValues {
    pub fn len(&self) -> usize {
        match self {
            ColumnValues::Int64(v) => v.len(),
            ColumnValues::Float64(v) => v.len(),
            ColumnValues::String(v) => v.len(),
            ColumnValues::Bool(v) => v.len(),
            ColumnValues::Timestamp(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnValues::Int64(_) => ColumnType::Int64,
            ColumnValues::Float64(_) => ColumnType::Float64,
            ColumnValues::String(_) => ColumnType::String,
            ColumnValues::Bool(_) => ColumnType::Bool,
            ColumnValues::Timestamp(_) => ColumnType::Timestamp,
        }
    }

    /// NaN counts as missing, matching the profiler.
    pub fn null_count(&self) -> usize {
        match self {
            ColumnValues::Int64(v) => v.iter().filter(|x| x.is_none()).count(),
            ColumnValues::Float64(v) => v
                .iter()
                .filter(|x| x.is_none_or(|f| f.is_nan()))
                .count(),
            ColumnValues::String(v) => v.iter().filter(|x| x.is_none()).count(),
            ColumnValues::Bool(v) => v.iter().filter(|x| x.is_none()).count(),
            ColumnValues::Timestamp(v) => v.iter().filter(|x| x.is_none()).count(),
        }
    }

    /// Present values of a numeric column as `f64`, `None` for other columns.
    pub fn numeric_values(&self) -> Option<Vec<f64>> {
        match self {
            ColumnValues::Int64(v) => Some(v.iter().flatten().map(|i| *i as f64).collect()),
            ColumnValues::Float64(v) => Some(
                v.iter()
                    .flatten()
                    .copied()
                    .filter(|f| !f.is_nan())
                    .collect(),
            ),
            _ => None,
        }
    }

    pub fn value(&self, row: usize) -> FieldValue {
        let value = match self {
            ColumnValues::Int64(v) => v.get(row).copied().flatten().map(FieldValue::Int),
            ColumnValues::Float64(v) => v.get(row).copied().flatten().map(FieldValue::Float),
            ColumnValues::String(v) => v.get(row).cloned().flatten().map(FieldValue::String),
            ColumnValues::Bool(v) => v.get(row).copied().flatten().map(FieldValue::Bool),
            ColumnValues::Timestamp(v) => {
                v.get(row).copied().flatten().map(FieldValue::Timestamp)
            }
        };
        value.unwrap_or(FieldValue::Null)
    }

    /// Equality between a cell and an entity id. Integer ids also match
    /// float cells holding the same whole number; types never coerce to strings.
    pub fn matches(&self, row: usize, entity_id: &EntityId) -> bool {
        match (self, entity_id) {
            (ColumnValues::Int64(v), EntityId::Int(id)) => v.get(row) == Some(&Some(*id)),
            (ColumnValues::Float64(v), EntityId::Int(id)) => {
                matches!(v.get(row), Some(Some(f)) if *f == *id as f64)
            }
            (ColumnValues::String(v), EntityId::String(id)) => {
                matches!(v.get(row), Some(Some(s)) if s == id)
            }
            _ => false,
        }
    }

    fn to_json(&self) -> Vec<JsonValue> {
        match self {
            ColumnValues::Int64(v) => v.iter().map(|x| JsonValue::from(*x)).collect(),
            ColumnValues::Float64(v) => v.iter().map(|x| JsonValue::from(*x)).collect(),
            ColumnValues::String(v) => v.iter().map(|x| JsonValue::from(x.clone())).collect(),
            ColumnValues::Bool(v) => v.iter().map(|x| JsonValue::from(*x)).collect(),
            ColumnValues::Timestamp(v) => v
                .iter()
                .map(|x| JsonValue::from(x.map(|ts| ts.to_rfc3339())))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: ColumnValues,
}

impl Column {
    pub fn new(name: impl Into<String>, values: ColumnValues) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn column_type(&self) -> ColumnType {
        self.values.column_type()
    }

    /// Builds a typed column from JSON scalars; `null` is a missing value.
    pub fn from_json(name: &str, column_type: ColumnType, values: Vec<JsonValue>) -> Result<Self> {
        fn convert<T>(
            name: &str,
            values: Vec<JsonValue>,
            expected: &str,
            f: impl Fn(&JsonValue) -> Option<T>,
        ) -> Result<Vec<Option<T>>> {
            values
                .iter()
                .enumerate()
                .map(|(row, value)| {
                    if value.is_null() {
                        return Ok(None);
                    }
                    f(value).map(Some).ok_or_else(|| {
                        anyhow::Error::from(FeatureStoreError::invalid_input(format!(
                            "column '{}' row {}: expected {}, got {}",
                            name, row, expected, value
                        )))
                    })
                })
                .collect()
        }

        let values = match column_type {
            ColumnType::Int64 => {
                ColumnValues::Int64(convert(name, values, "an integer", JsonValue::as_i64)?)
            }
            ColumnType::Float64 => {
                ColumnValues::Float64(convert(name, values, "a number", JsonValue::as_f64)?)
            }
            ColumnType::String => ColumnValues::String(convert(name, values, "a string", |v| {
                v.as_str().map(str::to_owned)
            })?),
            ColumnType::Bool => {
                ColumnValues::Bool(convert(name, values, "a boolean", JsonValue::as_bool)?)
            }
            ColumnType::Timestamp => {
                ColumnValues::Timestamp(convert(name, values, "an RFC 3339 timestamp", |v| {
                    v.as_str()
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .map(|ts| ts.with_timezone(&Utc))
                })?)
            }
        };
        Ok(Column::new(name, values))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    columns: Vec<Column>,
    row_count: usize,
}

impl Dataset {
    /// Column names must be unique and all columns the same length.
    pub fn try_new(columns: Vec<Column>) -> Result<Self> {
        let mut seen = HashSet::default();
        for column in &columns {
            if column.name.is_empty() {
                return Err(FeatureStoreError::invalid_input("column names must not be empty").into());
            }
            if !seen.insert(column.name.as_str()) {
                return Err(FeatureStoreError::invalid_input(format!(
                    "duplicate column '{}'",
                    column.name
                ))
                .into());
            }
        }
        let row_count = columns.first().map(|c| c.values.len()).unwrap_or(0);
        if let Some(column) = columns.iter().find(|c| c.values.len() != row_count) {
            return Err(FeatureStoreError::invalid_input(format!(
                "column '{}' has {} rows, expected {}",
                column.name,
                column.values.len(),
                row_count
            ))
            .into());
        }
        Ok(Self { columns, row_count })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn row(&self, index: usize) -> Option<Record> {
        if index >= self.row_count {
            return None;
        }
        Some(Record {
            fields: self
                .columns
                .iter()
                .map(|c| (c.name.clone(), c.values.value(index)))
                .collect(),
        })
    }

    /// First row, in storage order, whose `key` column equals `entity_id`.
    pub fn find_first(&self, key: &str, entity_id: &EntityId) -> Result<Option<Record>> {
        let column = self.column(key).ok_or_else(|| {
            FeatureStoreError::invalid_input(format!(
                "Entity key '{}' not found in feature data.",
                key
            ))
        })?;
        Ok((0..self.row_count)
            .find(|row| column.values.matches(*row, entity_id))
            .and_then(|row| self.row(row)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

/// One dataset row, keeping column order when serialized.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    fields: Vec<(String, FieldValue)>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }
}

impl Serialize for Record {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Wire form of a dataset: `{"columns": [{"name", "dtype", "values"}]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetPayload {
    pub columns: Vec<ColumnPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnPayload {
    pub name: String,
    pub dtype: ColumnType,
    #[serde(default)]
    pub values: Vec<JsonValue>,
}

impl TryFrom<DatasetPayload> for Dataset {
    type Error = anyhow::Error;

    fn try_from(payload: DatasetPayload) -> Result<Self> {
        let columns = payload
            .columns
            .into_iter()
            .map(|c| Column::from_json(&c.name, c.dtype, c.values))
            .collect::<Result<Vec<_>>>()?;
        Dataset::try_new(columns)
    }
}

impl From<&Dataset> for DatasetPayload {
    fn from(dataset: &Dataset) -> Self {
        DatasetPayload {
            columns: dataset
                .columns
                .iter()
                .map(|c| ColumnPayload {
                    name: c.name.clone(),
                    dtype: c.column_type(),
                    values: c.values.to_json(),
                })
                .collect(),
        }
    }
}

impl DatasetPayload {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| anyhow!("Invalid dataset payload: {}", err))
    }
}
