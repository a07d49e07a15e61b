//! Isolate meta file parser
//!
//! Parses the `key:value` meta file isolate writes after each run.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

/// Outcome class reported by isolate in the `status` key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunStatus {
    /// Program exited normally (no `status` key)
    #[default]
    Ok,
    /// `TO`: CPU or wall time limit exceeded
    TimedOut,
    /// `RE`: non-zero exit code
    RuntimeError,
    /// `SG`: killed by a signal
    Signaled,
    /// `XX`: isolate itself failed
    InternalError,
}

impl RunStatus {
    pub fn from_code(code: &str) -> Self {
        match code {
            "OK" | "" => RunStatus::Ok,
            "TO" => RunStatus::TimedOut,
            "RE" => RunStatus::RuntimeError,
            "SG" => RunStatus::Signaled,
            "XX" => RunStatus::InternalError,
            other => {
                warn!("Unknown isolate status code: {}", other);
                RunStatus::RuntimeError
            }
        }
    }

    /// Short code as isolate spells it ("OK" for a normal exit)
    pub fn code(&self) -> &'static str {
        match self {
            RunStatus::Ok => "OK",
            RunStatus::TimedOut => "TO",
            RunStatus::RuntimeError => "RE",
            RunStatus::Signaled => "SG",
            RunStatus::InternalError => "XX",
        }
    }
}

/// Resource usage and outcome of one sandboxed command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Peak cgroup memory in KB
    pub memory_kb: u32,
    pub exit_code: i32,
    pub exit_signal: i32,
    /// The program was killed by isolate's watchdog
    pub killed: bool,
    pub status: RunStatus,
    /// Human readable message from isolate
    pub message: String,
    /// CPU time in seconds
    pub time: f64,
    /// Wall clock time in seconds
    pub wall_time: f64,
    /// The cgroup OOM killer fired
    pub memory_limit_exceeded: bool,
    /// Whatever isolate printed on its own stdout/stderr
    pub internal_message: String,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Ok && self.exit_code == 0
    }
}

/// Parse isolate meta file content
pub fn parse_meta(content: &str) -> RunResult {
    let mut result = RunResult::default();

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        match key {
            "cg-mem" => result.memory_kb = value.trim().parse().unwrap_or(0),
            "exitcode" => result.exit_code = value.trim().parse().unwrap_or(0),
            "exitsig" => result.exit_signal = value.trim().parse().unwrap_or(0),
            "killed" => result.killed = true,
            "message" => result.message = value.to_string(),
            "status" => result.status = RunStatus::from_code(value.trim()),
            "time" => result.time = value.trim().parse().unwrap_or(0.0),
            "time-wall" => result.wall_time = value.trim().parse().unwrap_or(0.0),
            "cg-oom-killed" => result.memory_limit_exceeded = true,
            "max-rss" | "csw-voluntary" | "csw-forced" | "cg-enabled" => {}
            _ => info!("Unknown isolate stat: {:?} (value: {:?})", key, value),
        }
    }

    result
}

/// Read and parse a meta file.
///
/// A missing, unreadable or empty file means isolate produced no structured
/// result and yields `None`.
pub async fn read_meta_file(path: &Path) -> Option<RunResult> {
    match fs::read_to_string(path).await {
        Ok(content) if content.trim().is_empty() => {
            debug!("Meta file {:?} is empty", path);
            None
        }
        Ok(content) => Some(parse_meta(&content)),
        Err(e) => {
            warn!("Couldn't open meta file {:?}: {}", path, e);
            None
        }
    }
}
