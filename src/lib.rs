//! Sandboxed execution core for an online judge.
//!
//! Untrusted submissions are compiled and run inside isolate boxes handed out
//! by a [`scheduler::BoxScheduler`], which caps both the number of concurrent
//! boxes and the memory they reserve. [`evaluator::Evaluator`] is the entry
//! point for graders.

pub mod config;
pub mod error;
pub mod evaluator;
pub mod languages;
pub mod pipeline;
pub mod sandbox;
pub mod scheduler;

pub use config::{EngineConfig, WallTimePolicy};
pub use error::{EvalError, Result};
pub use evaluator::Evaluator;
