use anyhow::{Context, Result};
use app_studentmodule::{PerCourseOptions, StudentModulePerCourse};
use clap::Parser;
use common::{
    init_logger, FailurePolicy, JobConfig, RunOutcome, Runner, FIELD_SIZE_LIMIT, SPILL_BUFFER_SIZE,
};
use std::path::PathBuf;
use tracing::info;

/// Separates a raw dump of the courseware_studentmodule table into a
/// different tsv file for each course.
#[derive(Parser, Debug)]
struct Cli {
    /// Location of the database dump.
    #[arg(long)]
    dump_root: PathBuf,
    /// Where the per-course files and the job_success marker are written.
    #[arg(long)]
    output_root: PathBuf,
    /// Added to the file names for identification.
    #[arg(long)]
    output_suffix: Option<String>,
    /// Keep only rows where COLUMN equals VALUE.
    #[arg(long = "where", value_name = "COLUMN=VALUE")]
    row_filter: Option<String>,
    #[arg(long, default_value_t = FIELD_SIZE_LIMIT)]
    field_size_limit: usize,
    #[arg(short, long, default_value_t = 10)]
    n_reduce: u64,
    #[arg(short, long)]
    workers: Option<usize>,
    /// Abort on the first malformed line instead of skipping it.
    #[arg(long)]
    fail_fast: bool,
    /// Recursively delete the output root before running.
    #[arg(long)]
    delete_output_root: bool,
    #[arg(long)]
    keep_temp_files: bool,
    /// Bytes of map output each worker buffers before spilling a sorted run.
    #[arg(long, default_value_t = SPILL_BUFFER_SIZE)]
    spill_buffer_size: usize,
    #[arg(long)]
    tmp_dir: Option<PathBuf>,
    /// Replaces characters that are not safe in file names.
    #[arg(long, default_value_t = '-')]
    substitute: char,
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn job_config(&self) -> JobConfig {
        let mut config = JobConfig::new(&self.dump_root)
            .set_n_reduce(self.n_reduce)
            .set_overwrite(self.delete_output_root)
            .keep_temp_files(self.keep_temp_files)
            .set_spill_buffer_size(self.spill_buffer_size)
            .set_failure_policy(if self.fail_fast {
                FailurePolicy::FailFast
            } else {
                FailurePolicy::Skip
            });
        if let Some(workers) = self.workers {
            config = config.set_workers(workers);
        }
        if let Some(tmp_dir) = &self.tmp_dir {
            config = config.set_tmp_dir(tmp_dir);
        }
        config
    }

    fn options(&self) -> PerCourseOptions {
        PerCourseOptions {
            output_suffix: self.output_suffix.clone(),
            substitute: self.substitute,
            row_filter: self.row_filter.clone(),
            field_size_limit: self.field_size_limit,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    // before the runtime starts its threads, so the local UTC offset is readable
    let _guard = init_logger(cli.verbose, cli.log_file.as_deref())?;

    let job = StudentModulePerCourse::new(&cli.output_root, cli.options())?;
    let runner = Runner::new(cli.job_config(), job)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let outcome = runtime
        .block_on(runner.run())
        .with_context(|| format!("splitting {}", cli.dump_root.display()))?;

    match outcome {
        RunOutcome::AlreadyComplete => {
            info!(output_root = %cli.output_root.display(), "nothing to do")
        }
        RunOutcome::Completed(summary) => info!(?summary, "done"),
    }
    Ok(())
}
