//! Checkpointing.
//!
//! A checkpoint is a self-describing JSON snapshot of one project: project
//! row, every stage record, the artifact ledger, a monotonic sequence number
//! and a sha-256 checksum over the canonical encoding. Files are written
//! atomically (`NNN.json.tmp`, fsync, rename) under
//! `{project}/checkpoints/` and pruned to a retention count.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use mediaforge_core::layout;
use mediaforge_core::store::{ArtifactLedger, ProjectStore, StoreError};
use mediaforge_core::types::{ArtifactRef, Project, StageRecord, StageStatus};

/// Supported checkpoint format version.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Checkpoint error types.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("no valid checkpoint for project: {0}")]
    NoCheckpoint(String),

    #[error("unsupported checkpoint format: {0}")]
    InvalidFormat(String),

    #[error("checksum mismatch: stored {stored}, computed {computed}")]
    ChecksumMismatch { stored: String, computed: String },

    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<std::io::Error> for CheckpointError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// The persisted checkpoint document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointDocument {
    pub format_version: u32,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub project: Project,
    pub stages: Vec<StageRecord>,
    pub artifacts: Vec<ArtifactRef>,
    /// hex sha-256 of the canonical JSON of every field above.
    pub checksum: String,
}

impl CheckpointDocument {
    /// Checksum over the canonical encoding (this document with an empty
    /// checksum field).
    pub fn compute_checksum(&self) -> Result<String, CheckpointError> {
        let mut body = self.clone();
        body.checksum = String::new();
        let canonical = serde_json::to_vec(&body)?;
        let digest = Sha256::digest(&canonical);
        Ok(hex_encode(&digest))
    }

    pub fn seal(mut self) -> Result<Self, CheckpointError> {
        self.checksum = self.compute_checksum()?;
        Ok(self)
    }

    /// Typecheck an externally supplied document.
    pub fn validate(&self) -> Result<(), CheckpointError> {
        if self.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(CheckpointError::InvalidFormat(format!(
                "format_version {} (supported: {})",
                self.format_version, CHECKPOINT_FORMAT_VERSION
            )));
        }
        let computed = self.compute_checksum()?;
        if computed != self.checksum {
            return Err(CheckpointError::ChecksumMismatch {
                stored: self.checksum.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// Whether the snapshot caught any stage mid-run - the signature of an
    /// interrupted scheduler.
    pub fn has_running_stage(&self) -> bool {
        self.stages.iter().any(|s| s.status == StageStatus::Running)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Saves, loads and prunes checkpoint files.
pub struct CheckpointManager {
    projects_root: PathBuf,
    store: Arc<dyn ProjectStore>,
    ledger: Arc<dyn ArtifactLedger>,
    retention: usize,
    /// Serializes saves per project; the periodic timer and the scheduler
    /// both write here.
    locks: tokio::sync::Mutex<std::collections::HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CheckpointManager {
    pub fn new(
        projects_root: impl Into<PathBuf>,
        store: Arc<dyn ProjectStore>,
        ledger: Arc<dyn ArtifactLedger>,
        retention: usize,
    ) -> Self {
        Self {
            projects_root: projects_root.into(),
            store,
            ledger,
            retention: retention.max(1),
            locks: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    async fn save_lock(&self, project_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    fn dir_for(&self, project_id: &str) -> PathBuf {
        layout::checkpoints_dir(&self.projects_root, project_id)
    }

    /// Snapshot the project's current store state to disk. Returns the
    /// sequence number written.
    pub async fn save(&self, project_id: &str) -> Result<u64, CheckpointError> {
        let lock = self.save_lock(project_id).await;
        let _guard = lock.lock().await;
        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| CheckpointError::ProjectNotFound(project_id.to_string()))?;
        let stages = self.store.stage_records(project_id).await?;
        let artifacts = self.ledger.list_artifacts(project_id).await?;

        let dir = self.dir_for(project_id);
        tokio::fs::create_dir_all(&dir).await?;
        let sequence = self.next_sequence(&dir).await?;

        let document = CheckpointDocument {
            format_version: CHECKPOINT_FORMAT_VERSION,
            sequence,
            timestamp: Utc::now(),
            project,
            stages,
            artifacts,
            checksum: String::new(),
        }
        .seal()?;

        let final_path = dir.join(format!("{sequence:03}.json"));
        let tmp_path = dir.join(format!("{sequence:03}.json.tmp"));
        let encoded = serde_json::to_vec_pretty(&document)?;
        {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&encoded).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp_path, &final_path).await?;
        tracing::debug!(project_id, sequence, "checkpoint saved");

        self.prune(&dir).await?;
        Ok(sequence)
    }

    /// Load and validate one checkpoint file.
    pub async fn load(&self, path: &Path) -> Result<CheckpointDocument, CheckpointError> {
        let raw = tokio::fs::read(path).await?;
        let document: CheckpointDocument = serde_json::from_slice(&raw)?;
        document.validate()?;
        Ok(document)
    }

    /// Checkpoint files for a project, ascending by sequence.
    pub async fn list(&self, project_id: &str) -> Result<Vec<PathBuf>, CheckpointError> {
        let dir = self.dir_for(project_id);
        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(sequence) = sequence_of(&entry.path()) {
                found.push((sequence, entry.path()));
            }
        }
        found.sort_by_key(|(sequence, _)| *sequence);
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    /// The newest checkpoint that loads and validates, if any.
    pub async fn latest(
        &self,
        project_id: &str,
    ) -> Result<Option<CheckpointDocument>, CheckpointError> {
        for path in self.list(project_id).await?.into_iter().rev() {
            match self.load(&path).await {
                Ok(document) => return Ok(Some(document)),
                Err(e) => {
                    tracing::warn!(
                        project_id,
                        path = %path.display(),
                        error = %e,
                        "skipping unreadable checkpoint"
                    );
                }
            }
        }
        Ok(None)
    }

    /// Projects whose latest checkpoint caught a stage in `running` - the
    /// scheduler died mid-stage.
    pub async fn find_interrupted(&self) -> Result<Vec<String>, CheckpointError> {
        let mut interrupted = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.projects_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let project_id = entry.file_name().to_string_lossy().into_owned();
            if let Some(document) = self.latest(&project_id).await? {
                if document.has_running_stage() {
                    interrupted.push(project_id);
                }
            }
        }
        interrupted.sort();
        Ok(interrupted)
    }

    async fn next_sequence(&self, dir: &Path) -> Result<u64, CheckpointError> {
        let mut max = 0u64;
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(sequence) = sequence_of(&entry.path()) {
                max = max.max(sequence);
            }
        }
        Ok(max + 1)
    }

    async fn prune(&self, dir: &Path) -> Result<(), CheckpointError> {
        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(sequence) = sequence_of(&entry.path()) {
                found.push((sequence, entry.path()));
            }
        }
        if found.len() <= self.retention {
            return Ok(());
        }
        found.sort_by_key(|(sequence, _)| *sequence);
        let excess = found.len() - self.retention;
        for (_, path) in found.into_iter().take(excess) {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

fn sequence_of(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".json")?;
    stem.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediaforge_core::store::ProjectStore as _;
    use mediaforge_core::types::{NewProject, StageDef, StageStatus, StageUpdate};
    use mediaforge_store::SqliteStore;
    use tempfile::TempDir;

    async fn manager(retention: usize) -> (CheckpointManager, Arc<SqliteStore>, TempDir) {
        let root = TempDir::new().expect("tempdir");
        let store = Arc::new(
            SqliteStore::connect_in_memory(root.path())
                .await
                .expect("store"),
        );
        store
            .create_project(NewProject::new("demo", "theme").with_id("p1"))
            .await
            .expect("project");
        store
            .create_stage_records("p1", &[StageDef::new("script"), StageDef::new("audio")])
            .await
            .expect("records");
        let manager =
            CheckpointManager::new(root.path(), store.clone(), store.clone(), retention);
        (manager, store, root)
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let (manager, _store, root) = manager(10).await;
        let sequence = manager.save("p1").await.expect("save");
        assert_eq!(sequence, 1);

        let path = root.path().join("p1/checkpoints/001.json");
        assert!(path.is_file());
        let document = manager.load(&path).await.expect("load");
        assert_eq!(document.format_version, CHECKPOINT_FORMAT_VERSION);
        assert_eq!(document.project.id, "p1");
        assert_eq!(document.stages.len(), 2);
        // byte-for-byte stable under the canonical encoding
        assert_eq!(
            document.compute_checksum().expect("checksum"),
            document.checksum
        );
    }

    #[tokio::test]
    async fn test_sequences_are_monotonic() {
        let (manager, _store, _root) = manager(10).await;
        assert_eq!(manager.save("p1").await.expect("save"), 1);
        assert_eq!(manager.save("p1").await.expect("save"), 2);
        assert_eq!(manager.save("p1").await.expect("save"), 3);
        let files = manager.list("p1").await.expect("list");
        assert_eq!(files.len(), 3);
    }

    #[tokio::test]
    async fn test_retention_prunes_oldest() {
        let (manager, _store, root) = manager(2).await;
        for _ in 0..4 {
            manager.save("p1").await.expect("save");
        }
        let files = manager.list("p1").await.expect("list");
        assert_eq!(files.len(), 2);
        assert!(!root.path().join("p1/checkpoints/001.json").exists());
        assert!(root.path().join("p1/checkpoints/004.json").exists());
        // sequence keeps climbing past pruned files
        assert_eq!(manager.save("p1").await.expect("save"), 5);
    }

    #[tokio::test]
    async fn test_corrupted_checksum_detected() {
        let (manager, _store, root) = manager(10).await;
        manager.save("p1").await.expect("save");
        let path = root.path().join("p1/checkpoints/001.json");
        let raw = tokio::fs::read_to_string(&path).await.expect("read");
        let tampered = raw.replace("\"theme\"", "\"hacked\"");
        tokio::fs::write(&path, tampered).await.expect("write");

        let result = manager.load(&path).await;
        assert!(matches!(
            result,
            Err(CheckpointError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_unversioned_document_rejected() {
        let document = CheckpointDocument {
            format_version: 0,
            sequence: 1,
            timestamp: Utc::now(),
            project: serde_json::from_value(serde_json::json!({
                "id": "x", "name": "x", "theme": "x", "target_length_minutes": 1,
                "status": "initialized", "config": {},
                "created_at": Utc::now(), "updated_at": Utc::now()
            }))
            .expect("project"),
            stages: Vec::new(),
            artifacts: Vec::new(),
            checksum: String::new(),
        };
        assert!(matches!(
            document.validate(),
            Err(CheckpointError::InvalidFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_find_interrupted_flags_running_stages() {
        let (manager, store, _root) = manager(10).await;
        assert!(manager
            .find_interrupted()
            .await
            .expect("scan")
            .is_empty());

        store
            .update_stage_status("p1", "script", StageUpdate::to_status(StageStatus::Running))
            .await
            .expect("running");
        manager.save("p1").await.expect("save");
        assert_eq!(
            manager.find_interrupted().await.expect("scan"),
            vec!["p1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_latest_skips_corrupt_and_finds_previous() {
        let (manager, _store, root) = manager(10).await;
        manager.save("p1").await.expect("save one");
        manager.save("p1").await.expect("save two");
        let newest = root.path().join("p1/checkpoints/002.json");
        tokio::fs::write(&newest, b"{not json").await.expect("corrupt");

        let document = manager.latest("p1").await.expect("latest").expect("some");
        assert_eq!(document.sequence, 1);
    }
}
