//! Error taxonomy for the execution core
//!
//! Program outcomes (non-zero exit, signals, timeouts) are never errors here;
//! they are reported through `RunResult::status`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    /// The caller's cancellation token fired while waiting or running
    #[error("operation cancelled")]
    Cancelled,

    /// The scheduler was closed while the caller was waiting on it
    #[error("box scheduler is closed")]
    Closed,

    #[error("memory quota of {quota_kb} KB exceeds the scheduler budget of {budget_kb} KB")]
    QuotaExceedsBudget { quota_kb: u32, budget_kb: u32 },

    #[error("sub-scheduler wants {requested} slots but the parent only has {available}")]
    TooManySlots { requested: u32, available: u32 },

    /// The isolate binary itself could not be started
    #[error("failed to spawn isolate at {path:?}: {source}")]
    IsolateSpawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to initialize isolate box {box_id}: {output}")]
    BoxInit { box_id: u32, output: String },

    #[error("failed to clean up isolate box {box_id}: {output}")]
    BoxCleanup { box_id: u32, output: String },

    #[error("path {0:?} escapes the sandbox root")]
    InvalidPath(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    #[error("language {0} is disabled on this host")]
    LanguageDisabled(String),

    #[error("compilation failed")]
    CompileFailed { output: String },

    #[error("invalid language configuration: {0}")]
    LanguageConfig(String),

    #[error("could not resolve command {command:?}: {reason}")]
    CommandResolve { command: String, reason: String },

    #[error("invalid configuration value for {key}: {value:?}")]
    Config { key: &'static str, value: String },
}

pub type Result<T, E = EvalError> = std::result::Result<T, E>;
