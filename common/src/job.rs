use crate::{writer::PartitionWriter, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// A map/reduce job that writes one output file per key.
pub trait MultiOutputJob: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Directory holding the partitions and the completion marker.
    fn output_root(&self) -> &Path;

    /// Must not have side effects. An empty result means the line was
    /// filtered out.
    fn map(&self, line: &str) -> Result<Vec<KeyValue>>;

    fn output_path_for_key(&self, key: &str) -> PathBuf;

    /// Called once per distinct key with every row mapped to it, in no
    /// particular order. `rows` is streamed from the merged spill runs. The
    /// runner opens `output` beforehand and finishes it afterwards.
    fn multi_output_reducer(
        &self,
        key: &str,
        rows: &mut dyn Iterator<Item = String>,
        output: &mut PartitionWriter,
    ) -> Result<()>;
}
