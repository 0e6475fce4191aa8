// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Context as _;
use netboot_e2e_defs::TestResult;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Name of the harness log inside a run's output directory.
pub const HARNESS_LOG_NAME: &str = "netboot_e2e.log";

/// A source of per-run log files and attachments, all kept under one output
/// directory.
#[derive(Debug, Clone)]
pub struct RunLogger(Arc<RunLoggerInner>);

#[derive(Debug)]
struct RunLoggerInner {
    dir: PathBuf,
}

impl RunLogger {
    /// Uses `dir` as the output directory, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs_err::create_dir_all(&dir)?;
        Ok(Self(Arc::new(RunLoggerInner { dir })))
    }

    /// The output directory.
    pub fn dir(&self) -> &Path {
        &self.0.dir
    }

    /// Opens `<name>.log` for appending.
    pub fn log_file(&self, name: &str) -> anyhow::Result<fs_err::File> {
        let path = self.0.dir.join(format!("{name}.log"));
        let file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(file)
    }

    /// Writes `data` to an attachment named `name`, returning its path.
    pub fn write_attachment(&self, name: &str, data: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.0.dir.join(name);
        fs_err::write(&path, data)?;
        Ok(path)
    }

    /// Records the verdict of a run: a summary line in the log and the full
    /// result as `result.json`.
    pub fn log_test_result(&self, result: &TestResult) -> anyhow::Result<PathBuf> {
        tracing::info!(
            scenario = result.scenario,
            environment = result.environment_id,
            status = %result.status,
            vms = result.vms.len(),
            failed_assertions = result.failed_assertions(),
            "test result"
        );
        let data = serde_json::to_vec_pretty(result).context("failed to serialize result")?;
        self.write_attachment("result.json", &data)
    }
}

/// Initializes tracing to stderr and to [`HARNESS_LOG_NAME`] in
/// `output_dir`, and returns a logger for that directory.
///
/// Filtering follows `RUST_LOG`, defaulting to `info`. If a global subscriber
/// is already installed (as in unit tests), it is left in place and only the
/// logger is returned.
pub fn try_init_tracing(output_dir: &Path) -> anyhow::Result<RunLogger> {
    let logger = RunLogger::new(output_dir)?;
    let log_file = logger
        .log_file("netboot_e2e")
        .context("failed to open harness log")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let r = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(log_file)),
        )
        .try_init();
    if let Err(e) = r {
        tracing::debug!(error = %e, "tracing already initialized");
    }
    Ok(logger)
}
