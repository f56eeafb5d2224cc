//! Intermediate map output. Each spill file is one sorted run of frames:
//! `u64 LE key length, key bytes, u64 LE value length, value bytes`.
//! Runs are read back as streams and merged by key, so a reduce task holds
//! one buffered reader per run instead of its whole bucket.

use crate::{Error, KeyValue, Result};
use itertools::{Itertools, KMergeBy};
use std::{
    collections::hash_map::DefaultHasher,
    fs::File,
    hash::{Hash, Hasher},
    io::{self, BufRead, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

/// Reduce bucket for `key`. Stable within a process.
pub fn bucket_for(key: &str, n_reduce: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() % n_reduce
}

pub struct SpillWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl SpillWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)
            .map_err(|e| Error::io(format!("creating spill {}", path.display()), e))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, kv: &KeyValue) -> Result<()> {
        write_chunk(&mut self.out, kv.key.as_bytes())
            .and_then(|_| write_chunk(&mut self.out, kv.value.as_bytes()))
            .map_err(|e| Error::io(format!("writing spill {}", self.path.display()), e))
    }

    pub fn finish(mut self) -> Result<PathBuf> {
        self.out
            .flush()
            .map_err(|e| Error::io(format!("flushing spill {}", self.path.display()), e))?;
        Ok(self.path)
    }
}

/// Sorts `pairs` by key and writes them as one run.
pub fn write_run(path: impl Into<PathBuf>, mut pairs: Vec<KeyValue>) -> Result<PathBuf> {
    pairs.sort_by(|a, b| a.key.cmp(&b.key));
    let mut writer = SpillWriter::create(path)?;
    for kv in &pairs {
        writer.append(kv)?;
    }
    writer.finish()
}

fn write_chunk(out: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    out.write_all(&(bytes.len() as u64).to_le_bytes())?;
    out.write_all(bytes)
}

/// Streams the frames of one spill file.
pub struct SpillReader {
    path: PathBuf,
    input: BufReader<File>,
}

impl SpillReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::io(format!("opening spill {}", path.display()), e))?;
        Ok(Self {
            path: path.to_path_buf(),
            input: BufReader::new(file),
        })
    }

    fn read_chunk(&mut self) -> io::Result<String> {
        let mut len = [0u8; 8];
        self.input.read_exact(&mut len)?;
        let len = usize::try_from(u64::from_le_bytes(len))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame length overflows"))?;
        let mut chunk = Vec::new();
        (&mut self.input).take(len as u64).read_to_end(&mut chunk)?;
        if chunk.len() != len {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated frame"));
        }
        String::from_utf8(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame is not UTF-8"))
    }

    fn read_frame(&mut self) -> io::Result<Option<KeyValue>> {
        if self.input.fill_buf()?.is_empty() {
            return Ok(None);
        }
        let key = self.read_chunk()?;
        let value = self.read_chunk()?;
        Ok(Some(KeyValue { key, value }))
    }
}

impl Iterator for SpillReader {
    type Item = Result<KeyValue>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_frame()
            .map_err(|e| Error::io(format!("reading spill {}", self.path.display()), e))
            .transpose()
    }
}

pub type FrameOrder = fn(&Result<KeyValue>, &Result<KeyValue>) -> bool;

/// Errors sort first so a corrupt run surfaces as soon as it is read.
fn frame_order(a: &Result<KeyValue>, b: &Result<KeyValue>) -> bool {
    match (a, b) {
        (Ok(a), Ok(b)) => a.key < b.key,
        (Err(_), _) => true,
        (Ok(_), Err(_)) => false,
    }
}

/// Merges sorted runs into one stream ordered by key.
pub fn merge_runs(paths: &[PathBuf]) -> Result<KMergeBy<SpillReader, FrameOrder>> {
    let runs = paths
        .iter()
        .map(|path| SpillReader::open(path))
        .collect::<Result<Vec<_>>>()?;
    Ok(runs.into_iter().kmerge_by(frame_order as FrameOrder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn kv(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.into(),
            value: value.into(),
        }
    }

    fn read_all(path: &Path) -> Result<Vec<KeyValue>> {
        SpillReader::open(path)?.collect()
    }

    #[test]
    fn test_frames_survive_delimiters_and_newlines() {
        let dir = TempDir::new().unwrap();
        let mut writer = SpillWriter::create(dir.path().join("mr-0-1")).unwrap();
        let pairs = vec![
            kv("course:A", "1\tmod\t{\"a\":\n1}"),
            kv("", ""),
            kv("ü", "tail\n"),
        ];
        for pair in &pairs {
            writer.append(pair).unwrap();
        }
        let path = writer.finish().unwrap();
        assert_eq!(read_all(&path).unwrap(), pairs);
    }

    #[test]
    fn test_truncated_spill_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write_run(dir.path().join("mr-0-0-0"), vec![kv("k", "value")]).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 2);
        fs::write(&path, bytes).unwrap();
        assert!(matches!(read_all(&path), Err(Error::Io { .. })));
    }

    #[test]
    fn test_runs_are_written_sorted() {
        let dir = TempDir::new().unwrap();
        let path = write_run(
            dir.path().join("run"),
            vec![kv("b", "1"), kv("a", "2"), kv("c", "3"), kv("a", "4")],
        )
        .unwrap();
        let keys: Vec<String> = read_all(&path).unwrap().into_iter().map(|kv| kv.key).collect();
        assert_eq!(keys, vec!["a", "a", "b", "c"]);
    }

    #[test]
    fn test_merge_runs_orders_by_key() {
        let dir = TempDir::new().unwrap();
        let runs = vec![
            write_run(dir.path().join("r0"), vec![kv("b", "1"), kv("d", "2")]).unwrap(),
            write_run(dir.path().join("r1"), vec![kv("a", "3"), kv("b", "4")]).unwrap(),
            write_run(dir.path().join("r2"), vec![]).unwrap(),
            write_run(dir.path().join("r3"), vec![kv("c", "5"), kv("a", "6")]).unwrap(),
        ];
        let merged: Vec<KeyValue> = merge_runs(&runs).unwrap().collect::<Result<_>>().unwrap();
        let keys: Vec<&str> = merged.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "a", "b", "b", "c", "d"]);
        let mut values: Vec<&str> = merged.iter().map(|kv| kv.value.as_str()).collect();
        values.sort();
        assert_eq!(values, vec!["1", "2", "3", "4", "5", "6"]);
    }

    #[test]
    fn test_merge_surfaces_corrupt_run() {
        let dir = TempDir::new().unwrap();
        let good = write_run(dir.path().join("r0"), vec![kv("a", "1")]).unwrap();
        let bad = write_run(dir.path().join("r1"), vec![kv("b", "2")]).unwrap();
        let mut bytes = fs::read(&bad).unwrap();
        bytes.truncate(bytes.len() - 1);
        fs::write(&bad, bytes).unwrap();
        let merged: Result<Vec<KeyValue>> = merge_runs(&[good, bad]).unwrap().collect();
        assert!(matches!(merged, Err(Error::Io { .. })));
    }

    #[test]
    fn test_bucket_for_is_stable_and_in_range() {
        for key in ["a", "course-v1:edX+DemoX+2014", ""] {
            let bucket = bucket_for(key, 7);
            assert!(bucket < 7);
            assert_eq!(bucket, bucket_for(key, 7));
        }
        assert_eq!(bucket_for("anything", 1), 0);
    }
}
