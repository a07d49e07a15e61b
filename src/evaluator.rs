//! Grader-facing evaluator
//!
//! Wraps the scheduler, the language registry and the pipeline into the tasks
//! a grader needs: compile a submission, execute it on one test, and report
//! toolchain versions. Every box acquired here is released before returning.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EvalError, Result};
use crate::languages::{Language, LanguageRegistry};
use crate::pipeline::{Limits, Pipeline, CONSOLE_STDIN_PATH, CONSOLE_STDOUT_PATH};
use crate::sandbox::{RunResult, RunStatus, Sandbox};
use crate::scheduler::BoxScheduler;

/// Input name that switches a test to console I/O
pub const CONSOLE_INPUT_NAME: &str = "stdin";
/// Version reported for a language whose version command failed
pub const VERSION_ERROR: &str = "ERR";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompileRequest {
    pub language: String,
    /// Files passed to the compiler, keyed by sandbox path
    pub code_files: BTreeMap<String, Vec<u8>>,
    /// Files written alongside but not passed to the compiler
    #[serde(default)]
    pub header_files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompileResponse {
    pub success: bool,
    /// Compiler diagnostics for the submitter
    pub output: String,
    /// Runnable artifact (binary, or the source for interpreted languages)
    #[serde(skip)]
    pub artifact: Option<Vec<u8>>,
    pub stats: Option<RunResult>,
    /// Infrastructure problems, not meant for the submitter
    pub other: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub language: String,
    /// Output of a successful compile
    #[serde(skip)]
    pub artifact: Vec<u8>,
    #[serde(skip)]
    pub input: Vec<u8>,
    /// File the program reads; `stdin` selects console I/O
    pub input_name: String,
    /// File the program writes (ignored in console mode)
    pub output_name: String,
    pub limits: ExecuteLimits,
    /// Memory reserved in the scheduler for this run (KB)
    pub memory_quota: u32,
}

/// Serializable mirror of [`Limits`]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExecuteLimits {
    pub time_limit_secs: f64,
    pub memory_limit_kb: u32,
}

impl From<ExecuteLimits> for Limits {
    fn from(limits: ExecuteLimits) -> Self {
        Limits {
            time_limit_secs: limits.time_limit_secs,
            memory_limit_kb: limits.memory_limit_kb,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub time: f64,
    pub memory_kb: u32,
    /// Comment for the grader; empty when the program exited normally
    pub comments: String,
    #[serde(skip)]
    pub output: Option<Vec<u8>>,
    pub stats: Option<RunResult>,
}

/// Turn a run outcome into the grader comment
pub fn describe_outcome(stats: &RunResult) -> String {
    match stats.status {
        RunStatus::TimedOut if stats.message.contains("wall") => "translate:walltimeout".to_string(),
        RunStatus::TimedOut => "translate:timeout".to_string(),
        RunStatus::RuntimeError | RunStatus::Signaled => stats.message.clone(),
        RunStatus::InternalError => format!("Sandbox Error: {}", stats.message),
        RunStatus::Ok if stats.memory_limit_exceeded => "translate:memory_limit".to_string(),
        RunStatus::Ok => String::new(),
    }
}

/// Compile and execute submissions on this host
pub struct Evaluator {
    scheduler: BoxScheduler,
    registry: Arc<LanguageRegistry>,
    pipeline: Pipeline,
    compile_quota_kb: u32,
    versions: Mutex<Option<BTreeMap<String, String>>>,
}

impl Evaluator {
    /// Build everything from configuration, probing the host for languages
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let registry = LanguageRegistry::load(config)?;
        Ok(Self::new(
            BoxScheduler::from_config(config),
            Arc::new(registry),
            Pipeline::new(config),
            config.compile_memory_limit_kb,
        ))
    }

    pub fn new(
        scheduler: BoxScheduler,
        registry: Arc<LanguageRegistry>,
        pipeline: Pipeline,
        compile_memory_kb: u32,
    ) -> Self {
        let compile_quota_kb = compile_memory_kb.min(scheduler.memory_budget_kb());
        Self {
            scheduler,
            registry,
            pipeline,
            compile_quota_kb,
            versions: Mutex::new(None),
        }
    }

    pub fn scheduler(&self) -> &BoxScheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    /// Toolchain version of every enabled language, keyed by language name.
    ///
    /// Computed on first use and cached. Languages without a version command
    /// are left out; ones whose command fails report [`VERSION_ERROR`].
    pub async fn language_versions(&self, token: &CancellationToken) -> Result<BTreeMap<String, String>> {
        let mut cached = self.versions.lock().await;
        if let Some(versions) = cached.as_ref() {
            return Ok(versions.clone());
        }

        let mut versions = BTreeMap::new();
        for language in self.registry.iter().filter(|lang| lang.is_enabled()) {
            if language.version_command.is_empty() {
                continue;
            }
            let result = match self.scheduler.acquire(token, 0).await {
                Ok(lease) => {
                    let result = self.pipeline.language_version(token, &*lease, language).await;
                    lease.release().await;
                    result
                }
                Err(e) => Err(e),
            };

            let version = match result {
                Ok(Some(version)) => {
                    info!("Got version for language {}: {}", language.name, version);
                    version
                }
                Ok(None) => continue,
                Err(EvalError::Cancelled) => return Err(EvalError::Cancelled),
                Err(e) => {
                    warn!("Could not get version for language {}: {}", language.name, e);
                    VERSION_ERROR.to_string()
                }
            };
            versions.insert(language.name.clone(), version);
        }

        *cached = Some(versions.clone());
        Ok(versions)
    }

    /// Compile a submission.
    ///
    /// Unknown or disabled languages fail before any box is acquired. A
    /// compilation error is a normal response with `success == false`.
    pub async fn compile(&self, token: &CancellationToken, req: &CompileRequest) -> Result<CompileResponse> {
        let language = self.registry.enabled(&req.language)?;

        // Interpreted code is its own artifact
        if !language.compiled {
            if req.code_files.len() > 1 {
                warn!("More than one file specified for non-compiled language {}", language.name);
            }
            return Ok(CompileResponse {
                success: true,
                artifact: req.code_files.values().next().cloned(),
                ..Default::default()
            });
        }

        let lease = self.scheduler.acquire(token, self.compile_quota_kb).await?;
        info!("Compiling {} submission using box {}", language.name, lease.box_id());
        let result = self.compile_in(token, &*lease, language, req).await;
        lease.release().await;
        result
    }

    async fn compile_in(
        &self,
        token: &CancellationToken,
        sandbox: &dyn Sandbox,
        language: &Language,
        req: &CompileRequest,
    ) -> Result<CompileResponse> {
        let mut files = req.header_files.clone();
        files.extend(req.code_files.iter().map(|(k, v)| (k.clone(), v.clone())));
        let sources: Vec<String> = req.code_files.keys().cloned().collect();

        let compiled = match self.pipeline.compile(token, sandbox, &files, &sources, language).await {
            Ok(compiled) => compiled,
            Err(EvalError::CompileFailed { output }) => {
                return Ok(CompileResponse {
                    output,
                    ..Default::default()
                });
            }
            Err(e) => return Err(e),
        };

        let mut resp = CompileResponse {
            success: true,
            output: compiled.output,
            stats: compiled.stats,
            ..Default::default()
        };
        match sandbox.read_file(&language.compiled_name).await {
            Ok(artifact) => resp.artifact = Some(artifact),
            Err(e) => {
                resp.success = false;
                resp.other = e.to_string();
            }
        }
        Ok(resp)
    }

    /// Execute a compiled submission on one test input
    pub async fn execute(&self, token: &CancellationToken, req: &ExecuteRequest) -> Result<ExecuteResponse> {
        let language = self.registry.enabled(&req.language)?;

        let lease = self.scheduler.acquire(token, req.memory_quota).await?;
        info!("Executing {} test using box {}", req.input_name, lease.box_id());
        let result = self.execute_in(token, &*lease, language, req).await;
        lease.release().await;
        result
    }

    async fn execute_in(
        &self,
        token: &CancellationToken,
        sandbox: &dyn Sandbox,
        language: &Language,
        req: &ExecuteRequest,
    ) -> Result<ExecuteResponse> {
        let console_io = req.input_name == CONSOLE_INPUT_NAME;
        let (input_path, output_path) = if console_io {
            (CONSOLE_STDIN_PATH.to_string(), CONSOLE_STDOUT_PATH.to_string())
        } else {
            (format!("/box/{}", req.input_name), format!("/box/{}", req.output_name))
        };

        sandbox.write_file(&input_path, &req.input, 0o666).await?;
        sandbox.write_file(&language.compiled_name, &req.artifact, 0o777).await?;

        let stats = match self
            .pipeline
            .run_submission(token, sandbox, language, req.limits.into(), console_io)
            .await
        {
            Ok(Some(stats)) => stats,
            Ok(None) => {
                return Ok(ExecuteResponse {
                    comments: "translate:internal_error".to_string(),
                    ..Default::default()
                });
            }
            Err(EvalError::Cancelled) => return Err(EvalError::Cancelled),
            Err(e) => {
                return Ok(ExecuteResponse {
                    comments: format!("translate:internal_error({})", e),
                    ..Default::default()
                });
            }
        };

        if stats.status == RunStatus::InternalError {
            warn!("Sandbox error in box {}: {:?}", sandbox.box_id(), stats);
        }

        let mut resp = ExecuteResponse {
            time: stats.time,
            memory_kb: stats.memory_kb,
            comments: describe_outcome(&stats),
            output: None,
            stats: Some(stats),
        };

        if sandbox.file_exists(&output_path).await {
            resp.output = Some(sandbox.read_file(&output_path).await?);
        } else if resp.comments.is_empty() {
            resp.comments = "No output file found".to_string();
        }
        Ok(resp)
    }
}
