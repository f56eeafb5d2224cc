//! One output file per partition key.

use crate::{Error, Result};
use dashmap::{mapref::entry::Entry, DashMap};
use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Opened,
    HeaderWritten,
    RowWritten,
    Closed,
}

/// Writes a header line followed by rows, each terminated by `\n`.
///
/// Calls must follow `write_header`, `write_row`*, `finish`. Anything else
/// is reported as a [`Error::PartitionWriteFailure`].
#[derive(Debug)]
pub struct PartitionWriter {
    path: PathBuf,
    out: BufWriter<File>,
    state: WriterState,
    rows: usize,
}

impl PartitionWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::partition(&path, e))?;
        }
        let file = File::create(&path).map_err(|e| Error::partition(&path, e))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
            state: WriterState::Opened,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn write_header(&mut self, fields: &[&str]) -> Result<()> {
        if self.state != WriterState::Opened {
            return Err(self.out_of_order("header"));
        }
        self.write_line(&fields.join("\t"))?;
        self.state = WriterState::HeaderWritten;
        Ok(())
    }

    pub fn write_row(&mut self, row: &str) -> Result<()> {
        if !matches!(
            self.state,
            WriterState::HeaderWritten | WriterState::RowWritten
        ) {
            return Err(self.out_of_order("row"));
        }
        self.write_line(row)?;
        self.rows += 1;
        self.state = WriterState::RowWritten;
        Ok(())
    }

    /// Flushes and syncs the file to disk. Returns the number of rows.
    pub fn finish(&mut self) -> Result<usize> {
        if !matches!(
            self.state,
            WriterState::HeaderWritten | WriterState::RowWritten
        ) {
            return Err(self.out_of_order("finish"));
        }
        self.out
            .flush()
            .and_then(|_| self.out.get_ref().sync_all())
            .map_err(|e| Error::partition(&self.path, e))?;
        self.state = WriterState::Closed;
        Ok(self.rows)
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        self.out
            .write_all(line.as_bytes())
            .and_then(|_| self.out.write_all(b"\n"))
            .map_err(|e| Error::partition(&self.path, e))
    }

    fn out_of_order(&self, op: &str) -> Error {
        Error::partition(
            &self.path,
            io::Error::new(
                io::ErrorKind::Other,
                format!("{op} not allowed in state {:?}", self.state),
            ),
        )
    }
}

/// Remembers which key owns each output location in a run.
#[derive(Debug, Default)]
pub struct PartitionRegistry {
    claims: DashMap<PathBuf, String>,
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, path: &Path, key: &str) -> Result<()> {
        match self.claims.entry(path.to_path_buf()) {
            Entry::Occupied(o) if o.get() != key => Err(Error::SanitizationCollision {
                path: path.to_path_buf(),
                existing: o.get().clone(),
                incoming: key.to_string(),
            }),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(v) => {
                v.insert(key.to_string());
                Ok(())
            }
        }
    }
}
