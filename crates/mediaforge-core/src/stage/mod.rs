//! Stage processor abstraction.
//!
//! Stage processors are black boxes to the scheduler. They can:
//! - perform side effects (writing artifacts through the context)
//! - return an output summary consumed by dependent stages
//! - fail with declared severity and recovery semantics

mod context;
mod result;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

pub use context::StageContext;
pub use result::{ErrorKind, ErrorSeverity, RecoveryAction, StageFailure, StageResult};

// Re-export CancellationToken for convenience
pub use tokio_util::sync::CancellationToken;

/// Input map handed to a stage: caller-provided initial input plus the output
/// summary of every transitively-depended completed stage, keyed by stage
/// name.
pub type StageInput = Map<String, Value>;

/// The contract stage implementations are registered under.
///
/// Processors must poll `ctx.cancellation()` at least at every I/O boundary;
/// the scheduler otherwise treats `execute` as an opaque call bounded by the
/// stage timeout.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// Execute the stage.
    async fn execute(&self, ctx: &StageContext, input: &StageInput) -> StageResult;

    /// Whether this stage may be skipped from `pending` without running.
    fn can_skip(&self) -> bool {
        false
    }

    /// Optional duration estimate overriding the stage definition's.
    fn estimate_duration(&self) -> Option<Duration> {
        None
    }
}
