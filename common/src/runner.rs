//! Local stand-in for a cluster shuffle.
//!
//! The map phase buffers `(key, value)` pairs per hash bucket and spills
//! them to disk as sorted runs whenever the buffer fills. The reduce phase
//! merges the runs of one bucket by key and streams each group to the job's
//! reducer, so no task holds more than its spill buffer or one open reader
//! per run. The completion marker is written only after both phases joined
//! without error.

use crate::{
    marker,
    pathset::path_set,
    spill::{self, merge_runs, write_run},
    writer::{PartitionRegistry, PartitionWriter},
    Error, KeyValue, MultiOutputJob, Result,
};
use crossbeam_queue::ArrayQueue;
use dashmap::DashMap;
use futures::future::join_all;
use itertools::Itertools;
use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log malformed lines and keep going.
    #[default]
    Skip,
    /// Abort the run on the first malformed line.
    FailFast,
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub input_root: PathBuf,
    pub n_reduce: u64,
    pub workers: usize,
    pub failure_policy: FailurePolicy,
    pub overwrite: bool,
    pub keep_temp_files: bool,
    pub tmp_dir: PathBuf,
    /// Bytes of map output a map task buffers before spilling a sorted run.
    pub spill_buffer_size: usize,
}

pub const SPILL_BUFFER_SIZE: usize = 64 * 1024 * 1024;

impl JobConfig {
    pub fn new(input_root: impl Into<PathBuf>) -> Self {
        Self {
            input_root: input_root.into(),
            n_reduce: 10,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            failure_policy: FailurePolicy::default(),
            overwrite: false,
            keep_temp_files: false,
            tmp_dir: std::env::temp_dir(),
            spill_buffer_size: SPILL_BUFFER_SIZE,
        }
    }

    /// Number of reduce buckets.
    pub fn set_n_reduce(mut self, n_reduce: u64) -> Self {
        self.n_reduce = n_reduce;
        self
    }

    pub fn set_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn set_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Delete the output root before running, even if it holds a marker.
    pub fn set_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn keep_temp_files(mut self, keep: bool) -> Self {
        self.keep_temp_files = keep;
        self
    }

    /// Where spill files go. Each run uses its own subdirectory.
    pub fn set_tmp_dir(mut self, tmp_dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = tmp_dir.into();
        self
    }

    pub fn set_spill_buffer_size(mut self, bytes: usize) -> Self {
        self.spill_buffer_size = bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_reduce == 0 {
            return Err(Error::Config("n_reduce must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if self.spill_buffer_size == 0 {
            return Err(Error::Config("spill buffer size must be at least 1 byte".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub inputs: usize,
    pub lines: usize,
    pub emitted: usize,
    pub filtered: usize,
    pub malformed: usize,
    pub partitions: usize,
    pub rows: usize,
}

impl RunSummary {
    fn absorb(&mut self, other: RunSummary) {
        self.inputs += other.inputs;
        self.lines += other.lines;
        self.emitted += other.emitted;
        self.filtered += other.filtered;
        self.malformed += other.malformed;
        self.partitions += other.partitions;
        self.rows += other.rows;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The output root already carried a marker; nothing was done.
    AlreadyComplete,
    Completed(RunSummary),
}

#[derive(Debug)]
enum Task {
    Map { index: usize, file: PathBuf },
    Reduce { bucket: u64, files: Vec<PathBuf> },
}

struct Shared<J> {
    job: Arc<J>,
    config: JobConfig,
    run_dir: PathBuf,
    pending: ArrayQueue<Task>,
    bucket_files: DashMap<u64, Vec<PathBuf>>,
    registry: PartitionRegistry,
    aborted: AtomicBool,
}

pub struct Runner<J> {
    config: JobConfig,
    job: Arc<J>,
}

impl<J: MultiOutputJob> Runner<J> {
    pub fn new(config: JobConfig, job: J) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            job: Arc::new(job),
        })
    }

    pub async fn run(&self) -> Result<RunOutcome> {
        let name = self.job.name();
        let output_root = self.job.output_root().to_path_buf();

        if self.config.overwrite {
            if output_root.exists() {
                info!(job = name, output_root = %output_root.display(), "removing previous output");
                // a half-removed root must not still look complete
                marker::clear_marker(&output_root)?;
                fs::remove_dir_all(&output_root).map_err(|e| {
                    Error::io(format!("removing {}", output_root.display()), e)
                })?;
            }
        } else if marker::is_complete(&output_root) {
            info!(job = name, output_root = %output_root.display(), "output already complete, skipping");
            return Ok(RunOutcome::AlreadyComplete);
        }

        let inputs = path_set(&self.config.input_root)?;
        info!(
            job = name,
            inputs = inputs.len(),
            n_reduce = self.config.n_reduce,
            workers = self.config.workers,
            "starting run"
        );

        let run_dir = self
            .config
            .tmp_dir
            .join(format!("mr-{}-{}", name, Uuid::new_v4()));
        fs::create_dir_all(&run_dir)
            .map_err(|e| Error::io(format!("creating {}", run_dir.display()), e))?;

        let capacity = inputs.len().max(self.config.n_reduce as usize).max(1);
        let shared = Arc::new(Shared {
            job: Arc::clone(&self.job),
            config: self.config.clone(),
            run_dir: run_dir.clone(),
            pending: ArrayQueue::new(capacity),
            bucket_files: DashMap::new(),
            registry: PartitionRegistry::new(),
            aborted: AtomicBool::new(false),
        });
        let result = shared.run(inputs).await;

        if self.config.keep_temp_files {
            info!(run_dir = %run_dir.display(), "keeping spill files");
        } else if let Err(e) = fs::remove_dir_all(&run_dir) {
            warn!(run_dir = %run_dir.display(), error = %e, "failed to remove spill files");
        }

        let summary = match result {
            Ok(summary) => summary,
            Err(e) => {
                error!(job = name, error = %e, "run failed, completion marker not written");
                return Err(e);
            }
        };

        marker::mark_success(&output_root)?;
        info!(
            job = name,
            lines = summary.lines,
            malformed = summary.malformed,
            filtered = summary.filtered,
            partitions = summary.partitions,
            rows = summary.rows,
            "run complete"
        );
        Ok(RunOutcome::Completed(summary))
    }
}

impl<J: MultiOutputJob> Shared<J> {
    async fn run(self: &Arc<Self>, inputs: Vec<PathBuf>) -> Result<RunSummary> {
        let mut summary = RunSummary {
            inputs: inputs.len(),
            ..Default::default()
        };

        self.init_map(inputs)?;
        summary.absorb(self.drain().await?);
        info!(buckets = self.bucket_files.len(), "map done, init reduce");

        self.init_reduce()?;
        summary.absorb(self.drain().await?);
        Ok(summary)
    }

    fn init_map(&self, inputs: Vec<PathBuf>) -> Result<()> {
        for (index, file) in inputs.into_iter().enumerate() {
            self.push(Task::Map { index, file })?;
        }
        Ok(())
    }

    fn init_reduce(&self) -> Result<()> {
        debug_assert!(self.pending.is_empty());
        let buckets = self
            .bucket_files
            .iter()
            .map(|pair| (*pair.key(), pair.value().clone()))
            .sorted_by_key(|(bucket, _)| *bucket)
            .collect_vec();
        for (bucket, files) in buckets {
            self.push(Task::Reduce { bucket, files })?;
        }
        Ok(())
    }

    fn push(&self, task: Task) -> Result<()> {
        self.pending
            .push(task)
            .map_err(|task| Error::Task(format!("task queue full, dropped {task:?}")))
    }

    /// Runs the queued tasks on `workers` blocking threads and waits for all
    /// of them.
    async fn drain(self: &Arc<Self>) -> Result<RunSummary> {
        let handles = (0..self.config.workers)
            .map(|worker| {
                let shared = Arc::clone(self);
                tokio::task::spawn_blocking(move || shared.work(worker))
            })
            .collect_vec();

        let mut summary = RunSummary::default();
        let mut failure = None;
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(part)) => summary.absorb(part),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    self.aborted.store(true, Ordering::Release);
                    failure.get_or_insert(Error::Task(e.to_string()));
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn work(&self, worker: usize) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        while !self.aborted.load(Ordering::Acquire) {
            let Some(task) = self.pending.pop() else {
                break;
            };
            debug!(worker, ?task, "task start");
            let outcome = match task {
                Task::Map { index, file } => self.map_task(index, &file),
                Task::Reduce { bucket, files } => self.reduce_task(bucket, &files),
            };
            match outcome {
                Ok(part) => summary.absorb(part),
                Err(e) => {
                    self.aborted.store(true, Ordering::Release);
                    error!(worker, error = %e, "task failed");
                    return Err(e);
                }
            }
        }
        Ok(summary)
    }

    fn map_task(&self, index: usize, file: &Path) -> Result<RunSummary> {
        let input =
            File::open(file).map_err(|e| Error::io(format!("opening {}", file.display()), e))?;
        let mut reader = BufReader::new(input);
        let mut buffered: HashMap<u64, Vec<KeyValue>> = HashMap::new();
        let mut buffered_bytes = 0;
        let mut runs = 0;
        let mut summary = RunSummary::default();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| Error::io(format!("reading {}", file.display()), e))?;
            if read == 0 {
                break;
            }
            summary.lines += 1;

            let mapped = std::str::from_utf8(&buf)
                .map_err(|e| Error::malformed(format!("invalid UTF-8: {e}")))
                .and_then(|line| self.job.map(line));
            let pairs = match mapped {
                Ok(pairs) => pairs,
                Err(e)
                    if e.is_record_error()
                        && self.config.failure_policy == FailurePolicy::Skip =>
                {
                    summary.malformed += 1;
                    warn!(file = %file.display(), line = summary.lines, error = %e, "skipping malformed record");
                    continue;
                }
                Err(e) => {
                    error!(file = %file.display(), line = summary.lines, error = %e, "map failed");
                    return Err(e);
                }
            };
            if pairs.is_empty() {
                summary.filtered += 1;
                continue;
            }

            for kv in pairs {
                let bucket = spill::bucket_for(&kv.key, self.config.n_reduce);
                buffered_bytes += kv.key.len() + kv.value.len();
                buffered.entry(bucket).or_default().push(kv);
                summary.emitted += 1;
            }
            if buffered_bytes >= self.config.spill_buffer_size {
                self.spill(index, runs, &mut buffered)?;
                runs += 1;
                buffered_bytes = 0;
            }
        }

        if !buffered.is_empty() {
            self.spill(index, runs, &mut buffered)?;
            runs += 1;
        }
        debug!(file = %file.display(), lines = summary.lines, emitted = summary.emitted, runs, "map task done");
        Ok(summary)
    }

    /// Writes each buffered bucket as a sorted run named `mr-{map}-{bucket}-{run}`.
    fn spill(
        &self,
        index: usize,
        run: usize,
        buffered: &mut HashMap<u64, Vec<KeyValue>>,
    ) -> Result<()> {
        for (bucket, pairs) in buffered.drain() {
            let path = write_run(
                self.run_dir.join(format!("mr-{index}-{bucket}-{run}")),
                pairs,
            )?;
            self.bucket_files.entry(bucket).or_default().push(path);
        }
        Ok(())
    }

    fn reduce_task(&self, bucket: u64, files: &[PathBuf]) -> Result<RunSummary> {
        let merged = merge_runs(files)?;
        let summary = itertools::process_results(merged, |pairs| -> Result<RunSummary> {
            let mut summary = RunSummary::default();
            let groups = pairs.group_by(|kv| kv.key.clone());
            for (key, group) in &groups {
                if self.aborted.load(Ordering::Acquire) {
                    break;
                }
                summary.rows += self.write_partition(&key, &mut group.map(|kv| kv.value))?;
                summary.partitions += 1;
            }
            Ok(summary)
        })??;
        debug!(
            bucket,
            runs = files.len(),
            partitions = summary.partitions,
            rows = summary.rows,
            "reduce task done"
        );
        Ok(summary)
    }

    fn write_partition(
        &self,
        key: &str,
        rows: &mut dyn Iterator<Item = String>,
    ) -> Result<usize> {
        let path = self.job.output_path_for_key(key);
        self.registry.claim(&path, key)?;
        let mut output = PartitionWriter::create(&path)?;
        self.job.multi_output_reducer(key, rows, &mut output)?;
        let written = output.finish()?;
        debug!(key, path = %output.path().display(), rows = written, "partition written");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::OutputRouter;
    use tempfile::TempDir;

    /// Key is the text before the first comma. Lines starting with `#` are
    /// filtered, lines without a comma are malformed.
    struct FirstColumn {
        router: OutputRouter,
    }

    impl FirstColumn {
        fn new(root: &Path) -> Self {
            Self {
                router: OutputRouter::new(root, "test", None, '-').unwrap(),
            }
        }
    }

    impl MultiOutputJob for FirstColumn {
        fn name(&self) -> &str {
            "first-column"
        }

        fn output_root(&self) -> &Path {
            self.router.root()
        }

        fn map(&self, line: &str) -> Result<Vec<KeyValue>> {
            let line = line.trim_end();
            if line.starts_with('#') {
                return Ok(vec![]);
            }
            let (key, value) = line
                .split_once(',')
                .ok_or_else(|| Error::malformed("no comma"))?;
            Ok(vec![KeyValue {
                key: key.to_string(),
                value: value.to_string(),
            }])
        }

        fn output_path_for_key(&self, key: &str) -> PathBuf {
            self.router.path_for(key)
        }

        fn multi_output_reducer(
            &self,
            _key: &str,
            rows: &mut dyn Iterator<Item = String>,
            output: &mut PartitionWriter,
        ) -> Result<()> {
            output.write_header(&["value"])?;
            for row in rows {
                output.write_row(&row)?;
            }
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        input: PathBuf,
        output: PathBuf,
        tmp: PathBuf,
    }

    fn fixture(files: &[(&str, &str)]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("dump");
        let output = dir.path().join("out");
        let tmp = dir.path().join("tmp");
        fs::create_dir_all(&input).unwrap();
        fs::create_dir_all(&tmp).unwrap();
        for (name, contents) in files {
            fs::write(input.join(name), contents).unwrap();
        }
        Fixture {
            _dir: dir,
            input,
            output,
            tmp,
        }
    }

    fn config(fx: &Fixture) -> JobConfig {
        JobConfig::new(&fx.input)
            .set_n_reduce(3)
            .set_workers(2)
            .set_tmp_dir(&fx.tmp)
    }

    fn partition_files(root: &Path) -> Vec<String> {
        fs::read_dir(root)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with("analytics.sql"))
            .sorted()
            .collect()
    }

    #[tokio::test]
    async fn test_one_partition_per_key() {
        let fx = fixture(&[
            ("part-0", "a,1\nb,2\n# comment\nbroken\na,3\n"),
            ("part-1", "c,4\nb,5\na,6"),
        ]);
        let runner = Runner::new(config(&fx), FirstColumn::new(&fx.output)).unwrap();

        let summary = match runner.run().await.unwrap() {
            RunOutcome::Completed(summary) => summary,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(
            summary,
            RunSummary {
                inputs: 2,
                lines: 8,
                emitted: 6,
                filtered: 1,
                malformed: 1,
                partitions: 3,
                rows: 6,
            }
        );

        assert_eq!(
            partition_files(&fx.output),
            vec![
                "a-test-analytics.sql",
                "b-test-analytics.sql",
                "c-test-analytics.sql"
            ]
        );
        let a = fs::read_to_string(fx.output.join("a-test-analytics.sql")).unwrap();
        let mut lines: Vec<&str> = a.lines().collect();
        assert_eq!(lines.remove(0), "value");
        lines.sort();
        assert_eq!(lines, vec!["1", "3", "6"]);

        assert!(marker::is_complete(&fx.output));
        assert_eq!(fs::read_dir(&fx.tmp).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_small_spill_buffer_merges_many_runs() {
        let contents: String = (0..40).map(|i| format!("k{},{i}\n", i % 5)).collect();
        let fx = fixture(&[("part-0", contents.as_str()), ("part-1", "k0,x\nk9,y\n")]);
        let config = config(&fx).set_spill_buffer_size(1).keep_temp_files(true);
        let runner = Runner::new(config, FirstColumn::new(&fx.output)).unwrap();

        let summary = match runner.run().await.unwrap() {
            RunOutcome::Completed(summary) => summary,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!((summary.partitions, summary.rows), (6, 42));

        // one run per emitted pair
        let run_dir = fs::read_dir(&fx.tmp).unwrap().next().unwrap().unwrap().path();
        assert_eq!(fs::read_dir(run_dir).unwrap().count(), 42);

        let k0 = fs::read_to_string(fx.output.join("k0-test-analytics.sql")).unwrap();
        let mut rows: Vec<&str> = k0.lines().skip(1).collect();
        rows.sort();
        assert_eq!(rows, vec!["0", "10", "15", "20", "25", "30", "35", "5", "x"]);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_on_malformed_line() {
        let fx = fixture(&[("part-0", "a,1\nbroken\n")]);
        let config = config(&fx).set_failure_policy(FailurePolicy::FailFast);
        let runner = Runner::new(config, FirstColumn::new(&fx.output)).unwrap();

        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, Error::MalformedRecord { .. }), "{err}");
        assert!(!marker::is_complete(&fx.output));
    }

    #[tokio::test]
    async fn test_partition_failure_leaves_no_marker() {
        let fx = fixture(&[("part-0", "a,1\nb,2\nc,3\n")]);
        let job = FirstColumn::new(&fx.output);
        fs::create_dir_all(job.output_path_for_key("c")).unwrap();
        let runner = Runner::new(config(&fx).set_workers(1), job).unwrap();

        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, Error::PartitionWriteFailure { .. }), "{err}");
        assert!(!marker::is_complete(&fx.output));
        assert_eq!(fs::read_dir(&fx.tmp).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sanitization_collision_is_fatal() {
        let fx = fixture(&[("part-0", "a:b,1\na;b,2\n")]);
        let runner = Runner::new(config(&fx), FirstColumn::new(&fx.output)).unwrap();

        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, Error::SanitizationCollision { .. }), "{err}");
        assert!(!marker::is_complete(&fx.output));
    }

    #[tokio::test]
    async fn test_completed_output_is_not_redone() {
        let fx = fixture(&[("part-0", "a,1\n")]);
        marker::mark_success(&fx.output).unwrap();
        let runner = Runner::new(config(&fx), FirstColumn::new(&fx.output)).unwrap();

        assert_eq!(runner.run().await.unwrap(), RunOutcome::AlreadyComplete);
        assert!(partition_files(&fx.output).is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_previous_output() {
        let fx = fixture(&[("part-0", "a,1\n")]);
        fs::create_dir_all(&fx.output).unwrap();
        fs::write(fx.output.join("stale-test-analytics.sql"), "old").unwrap();
        marker::mark_success(&fx.output).unwrap();

        let config = config(&fx).set_overwrite(true);
        assert!(marker::is_complete(&fx.output));
        let runner = Runner::new(config, FirstColumn::new(&fx.output)).unwrap();
        assert!(matches!(
            runner.run().await.unwrap(),
            RunOutcome::Completed(_)
        ));
        assert_eq!(partition_files(&fx.output), vec!["a-test-analytics.sql"]);
        assert!(marker::is_complete(&fx.output));
    }

    #[tokio::test]
    async fn test_failed_overwrite_leaves_no_marker() {
        let fx = fixture(&[("part-0", "a,1\n"), ("part-1", "broken\n")]);
        marker::mark_success(&fx.output).unwrap();
        let config = config(&fx)
            .set_overwrite(true)
            .set_failure_policy(FailurePolicy::FailFast);
        let runner = Runner::new(config, FirstColumn::new(&fx.output)).unwrap();

        assert!(runner.run().await.is_err());
        assert!(!marker::is_complete(&fx.output));
    }

    #[tokio::test]
    async fn test_keep_temp_files() {
        let fx = fixture(&[("part-0", "a,1\nb,2\n")]);
        let config = config(&fx).keep_temp_files(true);
        let runner = Runner::new(config, FirstColumn::new(&fx.output)).unwrap();
        runner.run().await.unwrap();

        let run_dirs: Vec<_> = fs::read_dir(&fx.tmp).unwrap().collect();
        assert_eq!(run_dirs.len(), 1);
        let run_dir = run_dirs[0].as_ref().unwrap().path();
        assert!(fs::read_dir(run_dir).unwrap().count() >= 1);
    }

    #[tokio::test]
    async fn test_empty_input_still_completes() {
        let fx = fixture(&[]);
        let runner = Runner::new(config(&fx), FirstColumn::new(&fx.output)).unwrap();
        match runner.run().await.unwrap() {
            RunOutcome::Completed(summary) => assert_eq!(summary.partitions, 0),
            other => panic!("unexpected {other:?}"),
        }
        assert!(marker::is_complete(&fx.output));
    }

    #[test]
    fn test_config_validation() {
        assert!(matches!(
            JobConfig::new("in").set_n_reduce(0).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            JobConfig::new("in").set_workers(0).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            JobConfig::new("in").set_spill_buffer_size(0).validate(),
            Err(Error::Config(_))
        ));
        assert!(JobConfig::new("in").validate().is_ok());
    }
}
