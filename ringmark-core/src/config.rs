//! Run configuration and defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{RingmarkError, RingmarkResult};
use crate::session::MsgLevel;

/// Default exchange message size.
pub const DEFAULT_MSG_SIZE: usize = 512 * 1024;

/// Message size forced for large jobs.
pub const LARGE_JOB_MSG_SIZE: usize = 1024;

/// Rank count at and above which a job counts as large.
pub const LARGE_JOB_THRESHOLD: usize = 256;

/// Default per-rank file size for the I/O probes.
pub const DEFAULT_FILE_SIZE: usize = 1 << 12;

/// Default number of passes over the selected suite.
pub const DEFAULT_PASSES: usize = 1;

/// Bound on the `-s` stat path list.
pub const MAX_STAT_PATHS: usize = 256;

/// Bound on the `-w` I/O path list.
pub const MAX_IO_PATHS: usize = 64;

/// Default watchdog deadline, seconds. Zero disables the watchdog.
pub const DEFAULT_HANG_TIMEOUT_SECS: u64 = 15;

/// Name stem of the transient files the I/O probes create.
pub const TEST_FILE_NAME: &str = "RINGMARK_TEST_FILE-YOU_CAN_DELETE_ME";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Exchange message size in bytes.
    pub msg_size: usize,
    /// Per-rank file size in bytes for the I/O probes.
    pub file_size: usize,
    /// Number of passes over the suite.
    pub passes: usize,
    /// Suppress progress output.
    pub quiet: bool,
    /// Emit everything.
    pub verbose: bool,
    /// Paths every rank stats.
    pub stat_paths: Vec<PathBuf>,
    /// Paths the I/O probes write under.
    pub io_paths: Vec<PathBuf>,
    /// Explicit probe list; overrides job-size suite selection.
    pub probe_list: Option<Vec<String>>,
    /// Watchdog deadline in seconds; zero disables.
    pub hang_timeout_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            msg_size: DEFAULT_MSG_SIZE,
            file_size: DEFAULT_FILE_SIZE,
            passes: DEFAULT_PASSES,
            quiet: false,
            verbose: false,
            stat_paths: Vec::new(),
            io_paths: Vec::new(),
            probe_list: None,
            hang_timeout_secs: DEFAULT_HANG_TIMEOUT_SECS,
        }
    }
}

impl RunConfig {
    /// Add a stat path, silently dropping additions past the bound.
    pub fn push_stat_path(&mut self, path: PathBuf) {
        if self.stat_paths.len() < MAX_STAT_PATHS {
            self.stat_paths.push(path);
        }
    }

    /// Add an I/O path, silently dropping additions past the bound.
    pub fn push_io_path(&mut self, path: PathBuf) {
        if self.io_paths.len() < MAX_IO_PATHS {
            self.io_paths.push(path);
        }
    }

    /// Session verbosity implied by the quiet/verbose flags.
    pub fn msg_level(&self) -> MsgLevel {
        if self.quiet {
            MsgLevel::Fail
        } else if self.verbose {
            MsgLevel::Debug
        } else {
            MsgLevel::Progress
        }
    }
}

fn suffix_multiplier(symbol: char) -> Option<u64> {
    match symbol {
        'B' => Some(1),
        'k' => Some(1 << 10),
        'M' => Some(1 << 20),
        'G' => Some(1 << 30),
        _ => None,
    }
}

/// Parse a byte count with an optional B/k/M/G suffix, e.g. `512k`.
/// Rejects negative, malformed, and overflowing sizes; `label` names the
/// quantity in error messages.
pub fn parse_size(input: &str, label: &str) -> RingmarkResult<usize> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, suffix) = input.split_at(split);

    if digits.is_empty() {
        return Err(RingmarkError::InvalidArgument {
            field: label.to_string(),
            message: format!("'{input}' is not a size"),
        });
    }
    let base: u64 = digits.parse().map_err(|_| RingmarkError::InvalidArgument {
        field: label.to_string(),
        message: format!("'{digits}' is out of range"),
    })?;

    let mult = match suffix.chars().collect::<Vec<_>>()[..] {
        [] => 1,
        [symbol] => suffix_multiplier(symbol).ok_or_else(|| RingmarkError::InvalidArgument {
            field: label.to_string(),
            message: format!("'{symbol}' is not a supported size suffix"),
        })?,
        _ => {
            return Err(RingmarkError::InvalidArgument {
                field: label.to_string(),
                message: format!("'{suffix}' is not a supported size suffix"),
            })
        }
    };

    let bytes = base
        .checked_mul(mult)
        .filter(|&b| b <= i32::MAX as u64)
        .ok_or_else(|| RingmarkError::InvalidArgument {
            field: label.to_string(),
            message: format!("requested {label} size is too large"),
        })?;

    Ok(bytes as usize)
}
