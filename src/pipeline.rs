//! Compile/run pipeline
//!
//! Turns a language definition plus source files into sandbox invocations:
//! - Compilation with the language's command template and build environment
//! - Running the compiled (or interpreted) program under time and memory limits
//!
//! The pipeline works on a sandbox it is handed; acquiring and releasing the
//! box is up to the caller.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::ErrorKind;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, WallTimePolicy};
use crate::error::{EvalError, Result};
use crate::languages::{host_search_path, resolve_command, Language, SOURCE_PLACEHOLDER};
use crate::sandbox::{RunConfig, RunResult, Sandbox};

/// Compiler output beyond this many bytes is cut off
pub const COMPILE_OUTPUT_LIMIT: usize = 4500 * 1024;
pub const TRUNCATION_MARKER: &str = "... (compilation output trimmed)";

/// Combined compiler stdout and stderr
pub const COMPILE_OUTPUT_PATH: &str = "/box/compilation.out";
/// Console-mode input file
pub const CONSOLE_STDIN_PATH: &str = "/box/stdin.in";
/// Console-mode output file
pub const CONSOLE_STDOUT_PATH: &str = "/box/stdin.out";
/// Combined output of a language's version command
pub const VERSION_OUTPUT_PATH: &str = "/box/version.out";
/// Reported when a version command ran but printed nothing readable
pub const UNKNOWN_VERSION: &str = "???";

const VERSION_WALL_TIME_SECS: f64 = 5.0;

/// Submission limits as set by the problem
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Limits {
    /// CPU time in seconds (0 = none)
    pub time_limit_secs: f64,
    /// Memory in KB (0 = only the box quota applies)
    pub memory_limit_kb: u32,
}

/// Result of a successful compilation
#[derive(Debug, Clone)]
pub struct CompileOutput {
    /// Compiler diagnostics, possibly truncated
    pub output: String,
    pub stats: Option<RunResult>,
}

/// Compile and run steps for one host
#[derive(Debug, Clone)]
pub struct Pipeline {
    compile_time_limit_secs: f64,
    compile_memory_limit_kb: u32,
    wall_time: WallTimePolicy,
    search_path: Option<OsString>,
}

impl Pipeline {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            compile_time_limit_secs: config.compile_time_limit_secs,
            compile_memory_limit_kb: config.compile_memory_limit_kb,
            wall_time: config.wall_time,
            search_path: host_search_path(),
        }
    }

    /// Resolve programs against this search path instead of the host `PATH`
    pub fn with_search_path(mut self, search_path: Option<OsString>) -> Self {
        self.search_path = search_path;
        self
    }

    /// Resolve a command for isolate, keeping it verbatim if that fails
    fn resolve(&self, command: &[String]) -> Vec<String> {
        match resolve_command(command, self.search_path.as_deref()) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("{}. Using the configured command {:?} as-is", e, command);
                command.to_vec()
            }
        }
    }

    /// Run configuration for compiling `language`
    pub fn compile_config(&self, language: &Language) -> RunConfig {
        RunConfig::new()
            .with_inherit_env(true)
            .with_directories(language.mounts.iter().cloned())
            .with_env(&language.common_env)
            .with_env(&language.build_env)
            .with_time_limits(
                self.compile_time_limit_secs,
                self.wall_time.wall_time_for(self.compile_time_limit_secs),
            )
            .with_memory_limit(self.compile_memory_limit_kb)
            .with_stdout(COMPILE_OUTPUT_PATH)
            .with_stderr_to_stdout(true)
    }

    /// Run configuration for running a submission in `language`
    pub fn run_config(&self, language: &Language, limits: Limits, console_io: bool) -> RunConfig {
        let mut config = RunConfig::new();

        // Interpreters need their mounts at run time; compiled code only at build time
        if !language.compiled {
            config = config.with_directories(language.mounts.iter().cloned());
        }

        config = config
            .with_env(&language.common_env)
            .with_env(&language.run_env)
            .with_time_limits(
                limits.time_limit_secs,
                self.wall_time.wall_time_for(limits.time_limit_secs),
            )
            .with_memory_limit(limits.memory_limit_kb);

        if console_io {
            config = config.with_stdin(CONSOLE_STDIN_PATH).with_stdout(CONSOLE_STDOUT_PATH);
        }
        config
    }

    /// Run configuration for printing the toolchain version of `language`
    pub fn version_config(&self, language: &Language) -> RunConfig {
        RunConfig::new()
            .with_directories(language.mounts.iter().cloned())
            .with_env(&language.common_env)
            .with_env(&language.build_env)
            .with_time_limits(0.0, VERSION_WALL_TIME_SECS)
            .with_stdout(VERSION_OUTPUT_PATH)
            .with_stderr_to_stdout(true)
    }

    /// Ask the toolchain of `language` for its version.
    ///
    /// Returns the first line of output, or `None` for languages without a
    /// version command.
    pub async fn language_version(
        &self,
        token: &CancellationToken,
        sandbox: &dyn Sandbox,
        language: &Language,
    ) -> Result<Option<String>> {
        if language.version_command.is_empty() {
            return Ok(None);
        }

        let command = self.resolve(&language.version_command);
        sandbox
            .run_command(token, &command, &self.version_config(language))
            .await?;

        let version = match sandbox.read_file(VERSION_OUTPUT_PATH).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes)
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or(UNKNOWN_VERSION)
                .to_string(),
            Err(EvalError::Io(e)) if e.kind() == ErrorKind::NotFound => UNKNOWN_VERSION.to_string(),
            Err(e) => return Err(e),
        };
        Ok(Some(version))
    }

    /// Compile `files` inside `sandbox`.
    ///
    /// `compiled_files` replace the source placeholder of the compile command.
    /// A failed compilation is `EvalError::CompileFailed` carrying the
    /// compiler output to show the submitter.
    pub async fn compile(
        &self,
        token: &CancellationToken,
        sandbox: &dyn Sandbox,
        files: &BTreeMap<String, Vec<u8>>,
        compiled_files: &[String],
        language: &Language,
    ) -> Result<CompileOutput> {
        if files.is_empty() {
            warn!("No files specified for compilation");
        }
        for (name, data) in files {
            sandbox.write_file(name, data, 0o644).await?;
        }

        let command = build_compile_command(&self.resolve(&language.compile_command), compiled_files);
        debug!("Compiling {} with {:?} in box {}", language.name, command, sandbox.box_id());

        let config = self.compile_config(language);
        let stats = sandbox.run_command(token, &command, &config).await?;
        let output = read_compile_output(sandbox).await;

        let succeeded = stats.as_ref().is_some_and(RunResult::is_success);
        if !succeeded {
            info!(
                "Compilation failed in box {} ({})",
                sandbox.box_id(),
                stats.as_ref().map_or("no result", |s| s.status.code())
            );
            return Err(EvalError::CompileFailed { output });
        }

        // The compiler may have consumed or moved the sources
        for (name, data) in files {
            sandbox.write_file(name, data, 0o644).await?;
        }
        match sandbox.remove_file(&language.source_name).await {
            Ok(()) => {}
            Err(EvalError::Io(e)) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Ok(CompileOutput { output, stats })
    }

    /// Run the program already placed in `sandbox` under `limits`.
    ///
    /// With `console_io`, stdin and stdout go to fixed files inside the box.
    pub async fn run_submission(
        &self,
        token: &CancellationToken,
        sandbox: &dyn Sandbox,
        language: &Language,
        limits: Limits,
        console_io: bool,
    ) -> Result<Option<RunResult>> {
        let config = self.run_config(language, limits, console_io);
        let command = self.resolve(&language.run_command);
        debug!("Running {:?} in box {}", command, sandbox.box_id());

        sandbox.run_command(token, &command, &config).await
    }
}

/// Substitute the source placeholder in a compile command template with `files`.
///
/// Without a placeholder the template is used unchanged.
pub fn build_compile_command(template: &[String], files: &[String]) -> Vec<String> {
    let Some(pos) = template.iter().position(|arg| arg == SOURCE_PLACEHOLDER) else {
        warn!("Didn't replace any fields in {:?}", template);
        return template.to_vec();
    };

    let mut command = Vec::with_capacity(template.len() + files.len());
    command.extend_from_slice(&template[..pos]);
    command.extend_from_slice(files);
    command.extend_from_slice(&template[pos + 1..]);
    command
}

/// Cut `output` down to [`COMPILE_OUTPUT_LIMIT`] bytes on a char boundary
pub fn truncate_output(mut output: String) -> String {
    if output.len() <= COMPILE_OUTPUT_LIMIT {
        return output;
    }
    let mut cut = COMPILE_OUTPUT_LIMIT;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output.push_str(TRUNCATION_MARKER);
    output
}

async fn read_compile_output(sandbox: &dyn Sandbox) -> String {
    match sandbox.read_file(COMPILE_OUTPUT_PATH).await {
        Ok(bytes) => truncate_output(String::from_utf8_lossy(&bytes).into_owned()),
        Err(EvalError::Io(e)) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => {
            warn!("Couldn't read compilation output: {}", e);
            String::new()
        }
    }
}
