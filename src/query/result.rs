use serde::{Deserialize, Serialize};

use crate::data::Value;

/// Column metadata for an executed result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub is_tag: bool,
    #[serde(default)]
    pub is_time: bool,
}

impl ColumnMeta {
    pub fn field(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            is_tag: false,
            is_time: false,
        }
    }

    pub fn tag(name: &str) -> Self {
        Self {
            is_tag: true,
            ..Self::field(name, "string")
        }
    }

    pub fn time(name: &str) -> Self {
        Self {
            is_time: true,
            ..Self::field(name, "timestamp")
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub execution_time_ms: f64,
    pub rows_scanned: u64,
    pub bytes_scanned: u64,
}

/// Result of executing a normalized query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<Value>>,
    #[serde(default)]
    pub stats: ExecutionStats,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn time_index(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.is_time)
    }

    pub fn tag_indices(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_tag)
            .map(|(i, _)| i)
            .collect()
    }

    /// Columns that are neither tags nor the time column
    pub fn field_indices(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_tag && !c.is_time)
            .map(|(i, _)| i)
            .collect()
    }
}
