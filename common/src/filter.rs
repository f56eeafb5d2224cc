use crate::{record::Record, Error, Result};
use csv::StringRecord;

/// Keeps only rows whose `column` equals `value` exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    column: String,
    index: usize,
    value: String,
}

impl RowFilter {
    /// Parses a `column=value` expression against the schema of `R`.
    pub fn parse<R: Record>(expr: &str) -> Result<Self> {
        let (column, value) = expr
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("row filter {expr:?} is not column=value")))?;
        let column = column.trim();
        let index = R::field_index(column)
            .ok_or_else(|| Error::Config(format!("row filter names unknown column {column:?}")))?;
        Ok(Self {
            column: column.to_string(),
            index,
            value: value.trim().to_string(),
        })
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn matches(&self, fields: &StringRecord) -> bool {
        fields.get(self.index) == Some(self.value.as_str())
    }
}
