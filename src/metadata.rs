//! Data source layout: delimiter, ordered columns and the primary column.

use std::sync::Arc;

use datafusion::arrow::datatypes::Schema;
use serde::{Deserialize, Serialize};

use crate::{IndexSenderError, Result};

/// Supplies the layout of the data source a sender writes to.
///
/// A failed lookup is surfaced to the writing caller as a configuration error.
pub trait DataSourceMetadata: Send + Sync {
    fn spec(&self) -> Result<DataSourceSpec>;
}

/// Layout of one data source as reported by the index service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceSpec {
    delimiter: String,
    columns: Arc<[String]>,
    primary_index: usize,
}

impl DataSourceSpec {
    pub fn new(
        delimiter: impl Into<String>,
        columns: Vec<String>,
        primary_column: &str,
    ) -> Result<Self> {
        let delimiter = delimiter.into();
        if delimiter.is_empty() {
            return Err(IndexSenderError::Configuration(
                "delimiter can not be empty".to_string(),
            ));
        }
        if columns.is_empty() {
            return Err(IndexSenderError::Configuration(
                "data source must have at least one column".to_string(),
            ));
        }
        let primary_index = columns
            .iter()
            .position(|c| c == primary_column)
            .ok_or_else(|| {
                IndexSenderError::Configuration(format!(
                    "primary column {} not found in columns {:?}",
                    primary_column, columns
                ))
            })?;

        Ok(Self {
            delimiter,
            columns: columns.into(),
            primary_index,
        })
    }

    /// Build a spec from the field names of an Arrow schema.
    pub fn from_schema(
        schema: &Schema,
        primary_column: &str,
        delimiter: impl Into<String>,
    ) -> Result<Self> {
        let columns = schema.fields().iter().map(|f| f.name().to_string()).collect();
        Self::new(delimiter, columns, primary_column)
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn primary_column_index(&self) -> usize {
        self.primary_index
    }

    pub fn primary_column_name(&self) -> &str {
        &self.columns[self.primary_index]
    }
}

impl DataSourceMetadata for DataSourceSpec {
    fn spec(&self) -> Result<DataSourceSpec> {
        Ok(self.clone())
    }
}

/// JSON shape of a spec as served by the index service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecMessage {
    pub delimiter: String,
    pub columns: Vec<String>,
    pub primary_column: String,
}

impl TryFrom<SpecMessage> for DataSourceSpec {
    type Error = IndexSenderError;

    fn try_from(message: SpecMessage) -> Result<Self> {
        DataSourceSpec::new(message.delimiter, message.columns, &message.primary_column)
    }
}
