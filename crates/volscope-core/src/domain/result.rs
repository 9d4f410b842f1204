//! Result sets and their tabular presentation.
//!
//! Plugin output is a list of heterogeneous rows (opaque key-value maps).
//! Columns come from an explicit [`ResultSchema`]; when a caller has none,
//! [`ResultSchema::infer`] takes the union of keys over *all* rows so rows
//! with extra or missing keys still line up.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One result row.
pub type Row = serde_json::Map<String, Value>;

/// Ordered rows returned for a completed job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultSet {
    rows: Vec<Row>,
}

impl ResultSet {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// A completed job with zero rows. Not an error.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows where any value contains `needle` (case-insensitive).
    ///
    /// An empty needle keeps every row.
    pub fn filter(&self, needle: &str) -> ResultSet {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return self.clone();
        }
        let rows = self
            .rows
            .iter()
            .filter(|row| {
                row.values()
                    .any(|v| render_cell(v).to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        ResultSet { rows }
    }

    /// Project rows onto `schema` as display strings.
    pub fn to_table(&self, schema: &ResultSchema) -> Vec<Vec<String>> {
        self.rows
            .iter()
            .map(|row| {
                schema
                    .columns()
                    .iter()
                    .map(|col| row.get(col).map(render_cell).unwrap_or_default())
                    .collect()
            })
            .collect()
    }
}

/// Declared column list for a result type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSchema {
    columns: Vec<String>,
}

impl ResultSchema {
    pub fn declared<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Union of keys across all rows, in first-seen order.
    ///
    /// Keys starting with `__` (renderer metadata such as `__children`) are skipped.
    pub fn infer(results: &ResultSet) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for row in results.rows() {
            for key in row.keys() {
                if key.starts_with("__") || columns.iter().any(|c| c == key) {
                    continue;
                }
                columns.push(key.clone());
            }
        }
        Self { columns }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Render a JSON value for display (strings unquoted, null as empty).
pub fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
