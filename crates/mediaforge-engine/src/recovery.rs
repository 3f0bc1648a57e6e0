//! Interrupted-run recovery.
//!
//! A project whose latest checkpoint caught a stage in `running` was
//! abandoned by a dying scheduler. Recovery normalizes such stages back to
//! `failed` so the scheduler's retry logic can re-drive them, verifies
//! store/ledger/disk agreement, and can restore stage rows from a
//! checkpoint.

use std::sync::Arc;

use serde::Serialize;

use mediaforge_core::store::ProjectStore;
use mediaforge_core::types::StageStatus;
use mediaforge_core::workspace::{ReconcileMode, ReconcileReport};
use mediaforge_files::ProjectWorkspace;

use crate::checkpoint::{CheckpointDocument, CheckpointError, CheckpointManager};
use crate::EngineError;

/// Outcome of a full integrity verification pass.
#[derive(Debug, Serialize)]
pub struct IntegrityReport {
    pub project_id: String,
    /// Sequence of the newest checkpoint that passed checksum validation.
    pub checkpoint_sequence: Option<u64>,
    /// Ledger/disk comparison, report-only.
    pub reconcile: ReconcileReport,
    /// Mismatches between the checkpoint and the live store.
    pub issues: Vec<String>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty() && self.reconcile.is_clean()
    }
}

/// Detects and repairs interrupted executions.
pub struct RecoveryManager {
    store: Arc<dyn ProjectStore>,
    workspace: Arc<ProjectWorkspace>,
    checkpoints: Arc<CheckpointManager>,
}

impl RecoveryManager {
    pub fn new(
        store: Arc<dyn ProjectStore>,
        workspace: Arc<ProjectWorkspace>,
        checkpoints: Arc<CheckpointManager>,
    ) -> Self {
        Self {
            store,
            workspace,
            checkpoints,
        }
    }

    /// Projects whose last checkpoint shows a stage still running.
    pub async fn find_interrupted(&self) -> Result<Vec<String>, CheckpointError> {
        self.checkpoints.find_interrupted().await
    }

    /// Cross-check the latest checkpoint, the store and the disk.
    ///
    /// Reconciliation runs in report-only mode here: verification never
    /// mutates.
    pub async fn verify(&self, project_id: &str) -> Result<IntegrityReport, EngineError> {
        let mut issues = Vec::new();

        let checkpoint = self.checkpoints.latest(project_id).await?;
        let checkpoint_sequence = checkpoint.as_ref().map(|c| c.sequence);
        if checkpoint.is_none() {
            issues.push("no valid checkpoint on disk".to_string());
        }

        let records = self.store.stage_records(project_id).await?;
        if let Some(checkpoint) = &checkpoint {
            for snapshot in &checkpoint.stages {
                match records.iter().find(|r| r.name == snapshot.name) {
                    None => issues.push(format!(
                        "stage '{}' is in the checkpoint but not the store",
                        snapshot.name
                    )),
                    Some(record) => {
                        // a store that moved forward is fine; one that moved
                        // backwards is not
                        if record.status == StageStatus::Pending
                            && snapshot.status != StageStatus::Pending
                        {
                            issues.push(format!(
                                "stage '{}' regressed: checkpoint {:?}, store {:?}",
                                snapshot.name, snapshot.status, record.status
                            ));
                        }
                    }
                }
            }
        }

        let reconcile = self
            .workspace
            .reconcile_with(project_id, ReconcileMode::ReportOnly)
            .await?;

        Ok(IntegrityReport {
            project_id: project_id.to_string(),
            checkpoint_sequence,
            reconcile,
            issues,
        })
    }

    /// Normalize abandoned stages so the scheduler can re-drive them:
    /// `running` becomes `failed (interrupted)`, `cancelled` becomes
    /// `failed (cancelled)`, and `skipped` stages return to `pending`.
    /// Returns the names of normalized stages.
    pub async fn resume(&self, project_id: &str) -> Result<Vec<String>, EngineError> {
        let mut records = self.store.stage_records(project_id).await?;
        let mut normalized = Vec::new();
        for record in &mut records {
            match record.status {
                StageStatus::Running => {
                    record.status = StageStatus::Failed;
                    record.error_message = Some("interrupted".to_string());
                    normalized.push(record.name.clone());
                }
                StageStatus::Cancelled => {
                    record.status = StageStatus::Failed;
                    record.error_message = Some("cancelled".to_string());
                    normalized.push(record.name.clone());
                }
                StageStatus::Skipped => {
                    record.status = StageStatus::Pending;
                    record.error_message = None;
                    normalized.push(record.name.clone());
                }
                _ => {}
            }
        }
        if !normalized.is_empty() {
            self.store.replace_stage_records(project_id, &records).await?;
            tracing::info!(
                project_id,
                stages = normalized.len(),
                "interrupted stages normalized for re-execution"
            );
        }
        Ok(normalized)
    }

    /// Overwrite the project's stage rows from a loaded checkpoint, in one
    /// transaction.
    pub async fn restore(
        &self,
        project_id: &str,
        checkpoint: &CheckpointDocument,
    ) -> Result<(), EngineError> {
        checkpoint.validate()?;
        if checkpoint.project.id != project_id {
            return Err(EngineError::Checkpoint(CheckpointError::InvalidFormat(
                format!(
                    "checkpoint belongs to project '{}', not '{}'",
                    checkpoint.project.id, project_id
                ),
            )));
        }
        self.store
            .replace_stage_records(project_id, &checkpoint.stages)
            .await?;
        tracing::info!(
            project_id,
            sequence = checkpoint.sequence,
            stages = checkpoint.stages.len(),
            "stage records restored from checkpoint"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use serde_json::{json, Map};
    use tempfile::TempDir;

    use mediaforge_core::stage::{StageContext, StageInput, StageProcessor, StageResult};
    use mediaforge_core::types::{NewProject, StageDef, StageUpdate};
    use mediaforge_store::SqliteStore;

    use crate::scheduler::{ExecutionStatus, WorkflowEngine};
    use mediaforge_config::PipelineConfig;

    struct Fixture {
        engine: Arc<WorkflowEngine>,
        recovery: RecoveryManager,
        store: Arc<SqliteStore>,
        checkpoints: Arc<CheckpointManager>,
        _root: TempDir,
    }

    async fn fixture() -> Fixture {
        let root = TempDir::new().expect("tempdir");
        let store = Arc::new(
            SqliteStore::connect_in_memory(root.path())
                .await
                .expect("store"),
        );
        let workspace = Arc::new(ProjectWorkspace::new(root.path(), store.clone()));
        let checkpoints = Arc::new(CheckpointManager::new(
            root.path(),
            store.clone(),
            store.clone(),
            10,
        ));
        let mut config = PipelineConfig::default();
        config.retry_base_delay_seconds = 0.01;
        config.checkpoint_interval_seconds = 0;
        let engine = Arc::new(WorkflowEngine::new(
            config,
            store.clone(),
            workspace.clone(),
            checkpoints.clone(),
        ));
        let recovery = RecoveryManager::new(store.clone(), workspace, checkpoints.clone());
        Fixture {
            engine,
            recovery,
            store,
            checkpoints,
            _root: root,
        }
    }

    struct CountingProcessor {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl StageProcessor for CountingProcessor {
        async fn execute(&self, _ctx: &StageContext, _input: &StageInput) -> StageResult {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            StageResult::success_with_one("done", json!(true))
        }
    }

    #[tokio::test]
    async fn test_interrupted_recovery_end_to_end() {
        // S6: a running row left behind by a dead scheduler is found,
        // normalized, and the workflow then completes on re-execution
        let f = fixture().await;
        f.store
            .create_project(NewProject::new("demo", "theme").with_id("p1"))
            .await
            .expect("project");
        let stages = vec![
            StageDef::new("script"),
            StageDef::new("render").with_dependencies(vec!["script".to_string()]),
        ];
        f.store
            .create_stage_records("p1", &stages)
            .await
            .expect("records");

        // simulate process death mid-stage
        f.store
            .update_stage_status(
                "p1",
                "script",
                StageUpdate::to_status(StageStatus::Running),
            )
            .await
            .expect("running");
        f.checkpoints.save("p1").await.expect("checkpoint");

        assert_eq!(
            f.recovery.find_interrupted().await.expect("scan"),
            vec!["p1".to_string()]
        );

        let normalized = f.recovery.resume("p1").await.expect("resume");
        assert_eq!(normalized, vec!["script".to_string()]);
        let record = f
            .store
            .stage_record("p1", "script")
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(record.status, StageStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("interrupted"));

        // re-drive to completion
        f.engine
            .register_workflow("wf", stages)
            .expect("register");
        let processor = Arc::new(CountingProcessor {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        f.engine.register_processor("script", processor.clone());
        f.engine.register_processor("render", processor.clone());
        let result = f
            .engine
            .execute("wf", "p1", Map::new(), None)
            .await
            .expect("execute");
        assert_eq!(result.status, ExecutionStatus::Completed);

        let records = f.store.stage_records("p1").await.expect("records");
        let by_name: HashMap<_, _> = records.iter().map(|r| (r.name.as_str(), r)).collect();
        assert_eq!(by_name["script"].status, StageStatus::Completed);
        assert_eq!(by_name["render"].status, StageStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_without_interruption_is_noop() {
        let f = fixture().await;
        f.store
            .create_project(NewProject::new("demo", "theme").with_id("p1"))
            .await
            .expect("project");
        f.store
            .create_stage_records("p1", &[StageDef::new("only")])
            .await
            .expect("records");
        assert!(f.recovery.resume("p1").await.expect("resume").is_empty());
    }

    #[tokio::test]
    async fn test_verify_reports_clean_project() {
        let f = fixture().await;
        f.store
            .create_project(NewProject::new("demo", "theme").with_id("p1"))
            .await
            .expect("project");
        f.store
            .create_stage_records("p1", &[StageDef::new("only")])
            .await
            .expect("records");
        f.checkpoints.save("p1").await.expect("checkpoint");

        let report = f.recovery.verify("p1").await.expect("verify");
        assert!(report.is_clean(), "issues: {:?}", report.issues);
        assert_eq!(report.checkpoint_sequence, Some(1));
    }

    #[tokio::test]
    async fn test_verify_flags_missing_checkpoint_and_regression() {
        let f = fixture().await;
        f.store
            .create_project(NewProject::new("demo", "theme").with_id("p1"))
            .await
            .expect("project");
        f.store
            .create_stage_records("p1", &[StageDef::new("only")])
            .await
            .expect("records");

        // no checkpoint yet
        let report = f.recovery.verify("p1").await.expect("verify");
        assert!(!report.is_clean());

        // checkpoint a completed stage, then regress the store
        f.store
            .update_stage_status("p1", "only", StageUpdate::to_status(StageStatus::Running))
            .await
            .expect("running");
        f.store
            .update_stage_status(
                "p1",
                "only",
                StageUpdate::to_status(StageStatus::Completed),
            )
            .await
            .expect("completed");
        f.checkpoints.save("p1").await.expect("checkpoint");
        let mut records = f.store.stage_records("p1").await.expect("records");
        records[0].status = StageStatus::Pending;
        records[0].started_at = None;
        records[0].completed_at = None;
        f.store
            .replace_stage_records("p1", &records)
            .await
            .expect("regress");

        let report = f.recovery.verify("p1").await.expect("verify");
        assert!(report
            .issues
            .iter()
            .any(|issue| issue.contains("regressed")));
    }

    #[tokio::test]
    async fn test_restore_rewrites_stage_rows() {
        let f = fixture().await;
        f.store
            .create_project(NewProject::new("demo", "theme").with_id("p1"))
            .await
            .expect("project");
        f.store
            .create_stage_records("p1", &[StageDef::new("only")])
            .await
            .expect("records");
        f.store
            .update_stage_status("p1", "only", StageUpdate::to_status(StageStatus::Running))
            .await
            .expect("running");
        f.store
            .update_stage_status(
                "p1",
                "only",
                StageUpdate::to_status(StageStatus::Completed)
                    .with_output(json!({"take": 1})),
            )
            .await
            .expect("completed");
        f.checkpoints.save("p1").await.expect("checkpoint");
        let checkpoint = f
            .checkpoints
            .latest("p1")
            .await
            .expect("latest")
            .expect("some");

        // wipe the rows, then restore from the checkpoint
        f.store
            .replace_stage_records("p1", &[])
            .await
            .expect("wipe");
        f.recovery.restore("p1", &checkpoint).await.expect("restore");
        let record = f
            .store
            .stage_record("p1", "only")
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(record.status, StageStatus::Completed);
        assert_eq!(record.output_summary, Some(json!({"take": 1})));
    }

    #[tokio::test]
    async fn test_restore_rejects_foreign_checkpoint() {
        let f = fixture().await;
        for id in ["p1", "p2"] {
            f.store
                .create_project(NewProject::new("demo", "theme").with_id(id))
                .await
                .expect("project");
            f.store
                .create_stage_records(id, &[StageDef::new("only")])
                .await
                .expect("records");
        }
        f.checkpoints.save("p2").await.expect("checkpoint");
        let foreign = f
            .checkpoints
            .latest("p2")
            .await
            .expect("latest")
            .expect("some");
        let result = f.recovery.restore("p1", &foreign).await;
        assert!(matches!(result, Err(EngineError::Checkpoint(_))));
    }
}
