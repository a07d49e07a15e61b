//! Sandbox module - Low-level isolate wrapper
//!
//! This module provides a minimal abstraction over the isolate sandbox.
//! It handles:
//! - Isolate box initialization (with repair of stale boxes) and cleanup
//! - File I/O relative to the box root
//! - Raw command execution with bounded retries, returning a parsed `RunResult`
//!
//! The sandbox module does NOT:
//! - Interpret verdicts (that's the grader's job)
//! - Know about languages or compilation
//! - Decide which box ID to use (that's the scheduler's job)

pub mod isolate_box;
pub mod meta;
pub mod retry;
pub mod run_config;

#[cfg(test)]
pub(crate) mod testutil;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

// Re-exports for convenience
pub use isolate_box::{
    build_run_flags, check_can_run, isolate_version, IsolateBox, AUDIT_TARGET, MEMORY_PLACEHOLDER, RUN_RETRY_POLICY,
};
pub use meta::{parse_meta, read_meta_file, RunResult, RunStatus};
pub use retry::{retry, RetryPolicy};
pub use run_config::{effective_memory_limit, Directory, RunConfig};

/// One isolated execution environment.
///
/// Paths are sandbox-relative (`/box/main.c`). All operations on one
/// sandbox are serialized.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn box_id(&self) -> u32;

    /// Memory reserved for this sandbox in KB (0 = unbounded)
    fn memory_quota(&self) -> u32;

    async fn write_file(&self, path: &str, data: &[u8], mode: u32) -> Result<()>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    async fn file_exists(&self, path: &str) -> bool;

    async fn remove_file(&self, path: &str) -> Result<()>;

    /// Run `command` under `config`.
    ///
    /// `Ok(None)` means isolate left no structured result behind.
    async fn run_command(
        &self,
        token: &CancellationToken,
        command: &[String],
        config: &RunConfig,
    ) -> Result<Option<RunResult>>;

    /// Tear down the box on the host
    async fn close(&self) -> Result<()>;
}
