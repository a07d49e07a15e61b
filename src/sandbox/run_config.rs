//! Per-command run configuration
//!
//! A `RunConfig` is built fresh for every command and describes mounts,
//! environment, limits and stdio redirection for one isolate invocation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Directory rule passed to isolate as `--dir=in=out[:opts]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    /// Path inside the sandbox
    #[serde(rename = "in")]
    pub inside: String,
    /// Path on the host (defaults to `inside`)
    #[serde(rename = "out", default)]
    pub outside: Option<String>,
    /// Mount options such as `rw`, `noexec`, `tmp`
    #[serde(rename = "opts", default)]
    pub options: Option<String>,
    /// Unmount a path inherited from isolate's default rules
    #[serde(default)]
    pub removes: bool,
    /// Pass `inside` as-is, without `=outside`
    #[serde(default)]
    pub verbatim: bool,
}

impl Directory {
    pub fn new(inside: impl Into<String>) -> Self {
        Self {
            inside: inside.into(),
            ..Default::default()
        }
    }

    pub fn removed(inside: impl Into<String>) -> Self {
        Self {
            inside: inside.into(),
            removes: true,
            ..Default::default()
        }
    }

    pub fn with_outside(mut self, outside: impl Into<String>) -> Self {
        self.outside = Some(outside.into());
        self
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }

    /// Render as an isolate `--dir` flag
    pub fn to_flag(&self) -> String {
        if self.removes {
            return format!("--dir={}=", self.inside);
        }

        let mut flag = format!("--dir={}", self.inside);
        match &self.outside {
            Some(outside) => {
                flag.push('=');
                flag.push_str(outside);
            }
            None if !self.verbatim => {
                flag.push('=');
                flag.push_str(&self.inside);
            }
            None => {}
        }
        if let Some(options) = &self.options {
            flag.push(':');
            flag.push_str(options);
        }
        flag
    }
}

/// Configuration of a single sandboxed command
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunConfig {
    pub directories: Vec<Directory>,

    /// Pass the whole host environment (`--full-env`)
    pub inherit_env: bool,
    /// Host variables to pass through by name
    pub env_to_inherit: Vec<String>,
    /// Variables to set explicitly
    pub env: BTreeMap<String, String>,

    /// CPU time limit in seconds (0 = none)
    pub time_limit: f64,
    /// Wall-clock limit in seconds (0 = none)
    pub wall_time_limit: f64,
    /// Memory limit in KB (0 = only the box quota applies)
    pub memory_limit_kb: u32,
    /// Maximum processes (None = unlimited)
    pub max_processes: Option<u32>,

    /// Sandbox-relative stdin path (None = /dev/null)
    pub stdin_path: Option<String>,
    /// Sandbox-relative stdout path (None = /dev/null)
    pub stdout_path: Option<String>,
    /// Sandbox-relative stderr path (None = /dev/null)
    pub stderr_path: Option<String>,
    pub stderr_to_stdout: bool,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_directories(mut self, dirs: impl IntoIterator<Item = Directory>) -> Self {
        self.directories.extend(dirs);
        self
    }

    pub fn with_inherit_env(mut self, value: bool) -> Self {
        self.inherit_env = value;
        self
    }

    /// Overlay environment variables; later overlays win
    pub fn with_env<'a>(mut self, vars: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        for (key, value) in vars {
            self.env.insert(key.clone(), value.clone());
        }
        self
    }

    pub fn with_time_limits(mut self, time_limit: f64, wall_time_limit: f64) -> Self {
        self.time_limit = time_limit;
        self.wall_time_limit = wall_time_limit;
        self
    }

    pub fn with_memory_limit(mut self, memory_limit_kb: u32) -> Self {
        self.memory_limit_kb = memory_limit_kb;
        self
    }

    pub fn with_stdin(mut self, path: impl Into<String>) -> Self {
        self.stdin_path = Some(path.into());
        self
    }

    pub fn with_stdout(mut self, path: impl Into<String>) -> Self {
        self.stdout_path = Some(path.into());
        self
    }

    pub fn with_stderr_to_stdout(mut self, value: bool) -> Self {
        self.stderr_to_stdout = value;
        self
    }
}

/// Memory limit actually handed to isolate for a box with `quota_kb` reserved.
///
/// Requests above the quota are clamped to it; a run without its own limit
/// still gets the quota so one box cannot exhaust the shared budget.
pub fn effective_memory_limit(requested_kb: u32, quota_kb: u32) -> Option<u32> {
    match (requested_kb, quota_kb) {
        (0, 0) => None,
        (0, quota) => Some(quota),
        (requested, 0) => Some(requested),
        (requested, quota) => Some(requested.min(quota)),
    }
}
