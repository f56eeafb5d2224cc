//! Parsing raw dump lines into records and rendering records as output rows.

use crate::{dialect::Dialect, record::Record, Error, Result};
use csv::StringRecord;
use serde::Serialize;

/// Largest accepted field, in bytes. State blobs easily exceed the usual
/// defaults of CSV readers.
pub const FIELD_SIZE_LIMIT: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    parse_dialect: Dialect,
    write_dialect: Dialect,
    field_size_limit: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(Dialect::MYSQLDUMP, Dialect::MYSQLPIPE, FIELD_SIZE_LIMIT)
    }
}

impl Codec {
    pub fn new(parse_dialect: Dialect, write_dialect: Dialect, field_size_limit: usize) -> Self {
        Self {
            parse_dialect,
            write_dialect,
            field_size_limit,
        }
    }

    pub fn with_field_size_limit(mut self, limit: usize) -> Self {
        self.field_size_limit = limit;
        self
    }

    pub fn field_size_limit(&self) -> usize {
        self.field_size_limit
    }

    /// Splits one line into exactly `arity` fields.
    pub fn split(&self, line: &str, arity: usize) -> Result<StringRecord> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return Err(Error::malformed("empty line"));
        }

        let line = self.parse_dialect.quote_escaped_fields(line)?;
        let mut reader = self
            .parse_dialect
            .reader_builder()
            .from_reader(line.as_bytes());
        let mut record = StringRecord::new();
        let found = reader
            .read_record(&mut record)
            .map_err(|e| Error::malformed(e.to_string()))?;
        if !found {
            return Err(Error::malformed("no record on line"));
        }
        if reader
            .read_record(&mut StringRecord::new())
            .map_err(|e| Error::malformed(e.to_string()))?
        {
            return Err(Error::malformed("line holds more than one record"));
        }

        if let Some((index, field)) = record
            .iter()
            .enumerate()
            .find(|(_, field)| field.len() > self.field_size_limit)
        {
            return Err(Error::FieldTooLarge {
                index,
                size: field.len(),
                limit: self.field_size_limit,
            });
        }

        if record.len() != arity {
            return Err(Error::malformed(format!(
                "expected {arity} fields, found {}",
                record.len()
            )));
        }
        Ok(record)
    }

    /// Expects `fields` from [`Codec::split`] with `R::arity()`.
    pub fn decode<R: Record>(&self, fields: &StringRecord) -> Result<R> {
        fields
            .deserialize(None)
            .map_err(|e| Error::malformed(e.to_string()))
    }

    pub fn parse<R: Record>(&self, line: &str) -> Result<R> {
        let fields = self.split(line, R::arity())?;
        self.decode(&fields)
    }

    /// Renders `record` as one line of the write dialect, without the
    /// line terminator.
    pub fn serialize<R: Serialize>(&self, record: &R) -> Result<String> {
        let mut writer = self.write_dialect.writer_builder().from_writer(Vec::new());
        writer
            .serialize(record)
            .map_err(|e| Error::malformed(e.to_string()))?;
        let mut bytes = writer
            .into_inner()
            .map_err(|e| Error::malformed(e.to_string()))?;
        if bytes.last() == Some(&self.write_dialect.terminator) {
            bytes.pop();
        }
        String::from_utf8(bytes).map_err(|e| Error::malformed(e.to_string()))
    }
}
