//! Engine configuration
//!
//! Loaded from environment variables (a `.env` file is honoured by the binary),
//! with defaults suitable for a single judging host.

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{EvalError, Result};

/// Wall-time heuristic for submission runs.
///
/// With a CPU time limit `t`, the wall limit is `t * multiplier + offset`.
/// Without one, `unlimited_secs` caps programs that sleep or block on IO.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WallTimePolicy {
    pub multiplier: f64,
    pub offset_secs: f64,
    pub unlimited_secs: f64,
}

impl Default for WallTimePolicy {
    fn default() -> Self {
        Self {
            multiplier: 2.0,
            offset_secs: 1.0,
            unlimited_secs: 30.0,
        }
    }
}

impl WallTimePolicy {
    pub fn wall_time_for(&self, time_limit_secs: f64) -> f64 {
        if time_limit_secs <= 0.0 {
            self.unlimited_secs
        } else {
            time_limit_secs * self.multiplier + self.offset_secs
        }
    }
}

/// Execution engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the isolate binary
    pub isolate_path: PathBuf,
    /// Number of boxes that may run concurrently
    pub box_count: u32,
    /// Box IDs are handed out starting at `box_id_start + 1`
    pub box_id_start: u32,
    /// Memory budget shared by all boxes, in KB
    pub memory_budget_kb: u32,
    /// Optional TOML file replacing the embedded language table
    pub languages_path: Option<PathBuf>,
    /// Compile time limit in seconds (default: 30s)
    pub compile_time_limit_secs: f64,
    /// Compile memory limit in KB (default: 1GB)
    pub compile_memory_limit_kb: u32,
    pub wall_time: WallTimePolicy,
    /// File receiving the per-run audit records instead of the console
    pub audit_log_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            isolate_path: PathBuf::from("/usr/local/bin/isolate"),
            box_count: 2,
            box_id_start: 0,
            memory_budget_kb: 2 * 1024 * 1024,
            languages_path: None,
            compile_time_limit_secs: 30.0,
            compile_memory_limit_kb: 1024 * 1024,
            wall_time: WallTimePolicy::default(),
            audit_log_path: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            isolate_path: lookup("ISOLATE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.isolate_path),
            box_count: parse_or(&lookup, "BOX_COUNT", defaults.box_count)?,
            box_id_start: parse_or(&lookup, "BOX_ID_START", defaults.box_id_start)?,
            memory_budget_kb: parse_or(&lookup, "MEMORY_BUDGET_KB", defaults.memory_budget_kb)?,
            languages_path: lookup("LANGUAGES_CONFIG").map(PathBuf::from),
            compile_time_limit_secs: parse_or(
                &lookup,
                "COMPILE_TIME_LIMIT_SECS",
                defaults.compile_time_limit_secs,
            )?,
            compile_memory_limit_kb: parse_or(
                &lookup,
                "COMPILE_MEMORY_LIMIT_KB",
                defaults.compile_memory_limit_kb,
            )?,
            wall_time: WallTimePolicy {
                multiplier: parse_or(
                    &lookup,
                    "WALL_TIME_MULTIPLIER",
                    defaults.wall_time.multiplier,
                )?,
                offset_secs: parse_or(
                    &lookup,
                    "WALL_TIME_OFFSET_SECS",
                    defaults.wall_time.offset_secs,
                )?,
                unlimited_secs: parse_or(
                    &lookup,
                    "WALL_TIME_UNLIMITED_SECS",
                    defaults.wall_time.unlimited_secs,
                )?,
            },
            audit_log_path: lookup("AUDIT_LOG_PATH").map(PathBuf::from),
        };

        if config.box_count == 0 {
            return Err(EvalError::Config {
                key: "BOX_COUNT",
                value: "0".into(),
            });
        }

        Ok(config)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EvalError::Config { key, value: raw }),
        None => Ok(default),
    }
}
