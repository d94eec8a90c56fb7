//! Column-wise statistical profile of a dataset.

use crate::dataset::{ColumnKind, Dataset};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub row_count: u64,
    pub columns: BTreeMap<String, ColumnProfile>,
}

/// `numeric` is present only for numeric columns; its fields are null when
/// the column has no values to summarize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ColumnProfileDef")]
pub struct ColumnProfile {
    pub dtype: String,
    pub null_count: u64,
    pub null_percentage: f64,
    #[serde(flatten)]
    pub numeric: Option<NumericSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericSummary {
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Deserialize)]
struct ColumnProfileDef {
    dtype: String,
    null_count: u64,
    null_percentage: f64,
    #[serde(flatten)]
    rest: Map<String, JsonValue>,
}

impl From<ColumnProfileDef> for ColumnProfile {
    fn from(value: ColumnProfileDef) -> Self {
        let ColumnProfileDef {
            dtype,
            null_count,
            null_percentage,
            rest,
        } = value;
        let numeric = rest.contains_key("mean").then(|| NumericSummary {
            mean: rest.get("mean").and_then(JsonValue::as_f64),
            std: rest.get("std").and_then(JsonValue::as_f64),
            min: rest.get("min").and_then(JsonValue::as_f64),
            max: rest.get("max").and_then(JsonValue::as_f64),
        });
        ColumnProfile {
            dtype,
            null_count,
            null_percentage,
            numeric,
        }
    }
}

impl Profile {
    /// `(column, statistic, value)` for every numeric statistic that is set.
    pub fn numeric_metrics(&self) -> Vec<(String, &'static str, f64)> {
        let mut metrics = Vec::new();
        for (name, column) in &self.columns {
            metrics.push((name.clone(), "null_count", column.null_count as f64));
            metrics.push((name.clone(), "null_percentage", column.null_percentage));
            if let Some(summary) = &column.numeric {
                let stats = [
                    ("mean", summary.mean),
                    ("std", summary.std),
                    ("min", summary.min),
                    ("max", summary.max),
                ];
                for (stat, value) in stats {
                    if let Some(value) = value {
                        metrics.push((name.clone(), stat, value));
                    }
                }
            }
        }
        metrics
    }
}

pub fn calculate_statistics(dataset: &Dataset) -> Profile {
    let row_count = dataset.row_count();
    let columns = dataset
        .columns()
        .iter()
        .map(|column| {
            let column_type = column.column_type();
            let null_count = column.values.null_count();
            let null_percentage = if row_count == 0 {
                0.0
            } else {
                null_count as f64 / row_count as f64
            };
            let numeric = match column_type.kind() {
                ColumnKind::Numeric => Some(summarize(
                    &column.values.numeric_values().unwrap_or_default(),
                )),
                ColumnKind::Other => None,
            };
            let profile = ColumnProfile {
                dtype: column_type.dtype().to_string(),
                null_count: null_count as u64,
                null_percentage,
                numeric,
            };
            (column.name.clone(), profile)
        })
        .collect();
    Profile {
        row_count: row_count as u64,
        columns,
    }
}

fn summarize(values: &[f64]) -> NumericSummary {
    if values.is_empty() {
        return NumericSummary::default();
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    // sample standard deviation needs two observations
    let std = (values.len() > 1).then(|| {
        let squares: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
        (squares / (n - 1.0)).sqrt()
    });
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    NumericSummary {
        mean: Some(mean),
        std,
        min: Some(min),
        max: Some(max),
    }
}
