//! StageContext type definition

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::workspace::ArtifactWriter;

/// Execution context the scheduler hands to a stage processor.
///
/// Provides:
/// - project / stage / execution identification
/// - an artifact writer bound to the executing (project, stage) pair -
///   artifact registration is always attributed to the current stage
/// - a cancellation token for cooperative cancellation
#[derive(Clone)]
pub struct StageContext {
    pub project_id: String,
    pub stage_name: String,
    /// Runtime ID for this specific attempt; distinguishes retry runs.
    pub execution_id: String,
    artifacts: Arc<dyn ArtifactWriter>,
    cancellation: CancellationToken,
}

impl StageContext {
    pub fn new(
        project_id: impl Into<String>,
        stage_name: impl Into<String>,
        execution_id: impl Into<String>,
        artifacts: Arc<dyn ArtifactWriter>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            stage_name: stage_name.into(),
            execution_id: execution_id.into(),
            artifacts,
            cancellation,
        }
    }

    /// Artifact writer bound to this (project, stage).
    pub fn artifacts(&self) -> &Arc<dyn ArtifactWriter> {
        &self.artifacts
    }

    /// The cancellation signal; processors must poll this at I/O boundaries.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Future resolving when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("project_id", &self.project_id)
            .field("stage_name", &self.stage_name)
            .field("execution_id", &self.execution_id)
            .finish_non_exhaustive()
    }
}
