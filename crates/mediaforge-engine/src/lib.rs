//! Workflow execution engine.
//!
//! The engine drives an execution plan to completion under bounded
//! concurrency:
//! - `ResourcePool`: named counted resources with deadlock refusal
//! - `WorkflowEngine`: the phase scheduler (timeouts, retries, pause/resume,
//!   cancellation, progress events)
//! - `CheckpointManager` / `RecoveryManager`: crash-consistent snapshots and
//!   interrupted-run recovery

mod checkpoint;
mod progress;
mod recovery;
mod resources;
mod scheduler;

use thiserror::Error;

pub use checkpoint::{CheckpointDocument, CheckpointError, CheckpointManager};
pub use progress::{ExecutionSnapshot, ProgressSink};
pub use recovery::{IntegrityReport, RecoveryManager};
pub use resources::{Reservation, ResourceError, ResourcePool, ResourceUsage};
pub use scheduler::{ExecutionResult, ExecutionStatus, StageSummary, WorkflowEngine};

use mediaforge_core::planner::PlanError;
use mediaforge_core::store::StoreError;
use mediaforge_core::workspace::WorkspaceError;

/// Engine error types.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("unknown project: {0}")]
    UnknownProject(String),

    #[error("no processor registered for stage: {0}")]
    MissingProcessor(String),

    #[error("project already has an active execution: {0}")]
    AlreadyRunning(String),

    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}
