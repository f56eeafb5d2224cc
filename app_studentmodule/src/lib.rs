//! Splits a raw dump of the `courseware_studentmodule` table into one
//! tab separated file per course.

use common::{
    Codec, KeyValue, MultiOutputJob, OutputRouter, PartitionWriter, Record, Result, RowFilter,
    FIELD_SIZE_LIMIT,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

pub const TABLE_NAME: &str = "courseware_studentmodule";

pub const STUDENT_MODULE_FIELDS: [&str; 11] = [
    "id",
    "module_type",
    "module_id",
    "student_id",
    "state",
    "grade",
    "created",
    "modified",
    "max_grade",
    "done",
    "course_id",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentModuleRecord {
    pub id: String,
    pub module_type: String,
    pub module_id: String,
    pub student_id: String,
    pub state: String,
    pub grade: String,
    pub created: String,
    pub modified: String,
    pub max_grade: String,
    pub done: String,
    pub course_id: String,
}

impl Record for StudentModuleRecord {
    const FIELDS: &'static [&'static str] = &STUDENT_MODULE_FIELDS;
}

#[derive(Debug, Clone)]
pub struct PerCourseOptions {
    /// Added to the file names for identification.
    pub output_suffix: Option<String>,
    /// Replaces characters that are unsafe in file names.
    pub substitute: char,
    /// `column=value`; rows with any other value are dropped.
    pub row_filter: Option<String>,
    pub field_size_limit: usize,
}

impl Default for PerCourseOptions {
    fn default() -> Self {
        Self {
            output_suffix: None,
            substitute: '-',
            row_filter: None,
            field_size_limit: FIELD_SIZE_LIMIT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StudentModulePerCourse {
    codec: Codec,
    router: OutputRouter,
    filter: Option<RowFilter>,
}

impl StudentModulePerCourse {
    pub fn new(output_root: impl Into<PathBuf>, options: PerCourseOptions) -> Result<Self> {
        let router = OutputRouter::new(
            output_root,
            TABLE_NAME,
            options.output_suffix,
            options.substitute,
        )?;
        let filter = options
            .row_filter
            .as_deref()
            .map(RowFilter::parse::<StudentModuleRecord>)
            .transpose()?;
        if let Some(filter) = &filter {
            debug!(column = filter.column(), "keeping matching rows only");
        }
        Ok(Self {
            codec: Codec::default().with_field_size_limit(options.field_size_limit),
            router,
            filter,
        })
    }
}

impl MultiOutputJob for StudentModulePerCourse {
    fn name(&self) -> &str {
        "student-module-per-course"
    }

    fn output_root(&self) -> &Path {
        self.router.root()
    }

    /// Emits `(course_id, tab separated row)`.
    fn map(&self, line: &str) -> Result<Vec<KeyValue>> {
        let fields = self.codec.split(line, StudentModuleRecord::arity())?;
        if let Some(filter) = &self.filter {
            if !filter.matches(&fields) {
                return Ok(vec![]);
            }
        }
        let record: StudentModuleRecord = self.codec.decode(&fields)?;
        let row = self.codec.serialize(&record)?;
        Ok(vec![KeyValue {
            key: record.course_id,
            value: row,
        }])
    }

    fn output_path_for_key(&self, course_id: &str) -> PathBuf {
        self.router.path_for(course_id)
    }

    fn multi_output_reducer(
        &self,
        course_id: &str,
        rows: &mut dyn Iterator<Item = String>,
        output: &mut PartitionWriter,
    ) -> Result<()> {
        output.write_header(StudentModuleRecord::FIELDS)?;
        for row in rows {
            output.write_row(&row)?;
        }
        trace!(course_id, rows = output.rows(), "course rows written");
        Ok(())
    }
}
