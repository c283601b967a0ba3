//! Durable outcome logs.
//!
//! Each outcome becomes one line in `success.txt` or `failure.txt`. The file
//! is opened in append mode, written with a single `write_all` and closed
//! again for every outcome, so an interrupted run leaves at most the line in
//! flight unwritten.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::SinkError;
use crate::model::TransferOutcome;

pub const SUCCESS_LOG: &str = "success.txt";
pub const FAILURE_LOG: &str = "failure.txt";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkTotals {
    pub successes: u64,
    pub failures: u64,
}

/// Owned by the single consumer task, so nothing here is locked.
#[derive(Debug)]
pub struct OutcomeSink {
    success_path: PathBuf,
    failure_path: PathBuf,
    totals: SinkTotals,
}

impl OutcomeSink {
    /// Create `output_dir` if needed and make sure both logs can be appended to.
    pub fn open(output_dir: &Path) -> Result<Self, SinkError> {
        fs::create_dir_all(output_dir).map_err(|source| SinkError::Open {
            path: output_dir.to_path_buf(),
            source,
        })?;
        let sink = Self {
            success_path: output_dir.join(SUCCESS_LOG),
            failure_path: output_dir.join(FAILURE_LOG),
            totals: SinkTotals::default(),
        };
        for path in [&sink.success_path, &sink.failure_path] {
            open_append(path)?;
        }
        Ok(sink)
    }

    pub fn record(&mut self, outcome: &TransferOutcome) -> Result<(), SinkError> {
        let path = if outcome.is_success() {
            &self.success_path
        } else {
            &self.failure_path
        };
        let line = format!("{}\n", outcome);
        open_append(path)?
            .write_all(line.as_bytes())
            .map_err(|source| SinkError::Write {
                path: path.clone(),
                source,
            })?;
        if outcome.is_success() {
            self.totals.successes += 1;
        } else {
            self.totals.failures += 1;
        }
        Ok(())
    }

    pub fn totals(&self) -> SinkTotals {
        self.totals
    }

    pub fn success_path(&self) -> &Path {
        &self.success_path
    }

    pub fn failure_path(&self) -> &Path {
        &self.failure_path
    }
}

fn open_append(path: &Path) -> Result<fs::File, SinkError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        })
}
