//! Artifact workspace implementation.
//!
//! `ProjectWorkspace` owns the on-disk side of the artifact ledger:
//! - path-safe resolution under each project root
//! - atomic artifact writes coupled to ledger registration
//! - two-way ledger/disk reconciliation
//! - quota enforcement and temporary/old file cleanup
//!
//! Per-project async locks serialize artifact writes, reconciliation and
//! cleanup so none of them can race each other.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use mediaforge_core::layout;
use mediaforge_core::store::ArtifactLedger;
use mediaforge_core::types::{
    validate_project_id, ArtifactCategory, ArtifactRef, ArtifactType, NewArtifact,
};
use mediaforge_core::workspace::{
    ArtifactOptions, ArtifactWriter, ReconcileFinding, ReconcileMode, ReconcileReport,
    WorkspaceError,
};

/// Suffix of in-progress writes; reconcile ignores these.
const TMP_SUFFIX: &str = ".tmp";

/// The artifact workspace over `{projects_root}`.
pub struct ProjectWorkspace {
    projects_root: PathBuf,
    ledger: Arc<dyn ArtifactLedger>,
    byte_quota: Option<u64>,
    reconcile_mode: ReconcileMode,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProjectWorkspace {
    pub fn new(projects_root: impl Into<PathBuf>, ledger: Arc<dyn ArtifactLedger>) -> Self {
        Self {
            projects_root: projects_root.into(),
            ledger,
            byte_quota: None,
            reconcile_mode: ReconcileMode::ReportOnly,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_byte_quota(mut self, quota: Option<u64>) -> Self {
        self.byte_quota = quota;
        self
    }

    pub fn with_reconcile_mode(mut self, mode: ReconcileMode) -> Self {
        self.reconcile_mode = mode;
        self
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    /// The per-project guard shared by writes, reconciliation and cleanup.
    async fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn project_root(&self, project_id: &str) -> Result<PathBuf, WorkspaceError> {
        if !validate_project_id(project_id) {
            return Err(WorkspaceError::InvalidProjectId(project_id.to_string()));
        }
        Ok(layout::project_dir(&self.projects_root, project_id))
    }

    /// Resolve a ledger-relative path to an absolute one.
    ///
    /// Lexical check only: the path must be relative and free of `..` (and
    /// any other non-normal component), so it cannot escape the project root
    /// regardless of what exists on disk.
    pub fn resolve_path(
        &self,
        project_id: &str,
        rel_path: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let root = self.project_root(project_id)?;
        Ok(root.join(safe_relative(rel_path)?))
    }

    /// Atomically write an artifact and register its ledger entry.
    ///
    /// Write-to-temp then rename within the same directory; the ledger row is
    /// inserted after the rename, and the file is unlinked if registration
    /// fails, so ledger and disk never disagree past this call.
    pub async fn write_file(
        &self,
        project_id: &str,
        stage_name: Option<&str>,
        rel_path: &str,
        bytes: &[u8],
        options: ArtifactOptions,
    ) -> Result<ArtifactRef, WorkspaceError> {
        let lock = self.project_lock(project_id).await;
        let _guard = lock.lock().await;

        let target = self.resolve_path(project_id, rel_path)?;
        if let Some(quota) = self.byte_quota {
            let used = self.disk_usage_locked(project_id).await?;
            let requested = bytes.len() as u64;
            if used.saturating_add(requested) > quota {
                return Err(WorkspaceError::QuotaExceeded {
                    used,
                    requested,
                    limit: quota,
                });
            }
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = tmp_sibling(&target);
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        let mut artifact = NewArtifact::new(
            project_id,
            options.artifact_type,
            options.category,
            normalize_rel(rel_path),
            bytes.len() as u64,
        )
        .with_metadata(options.metadata);
        if options.is_temporary {
            artifact = artifact.temporary();
        }
        if let Some(stage) = stage_name {
            artifact = artifact.with_stage(stage);
        }

        let rel = artifact.rel_path.clone();
        let artifact_type = artifact.artifact_type;
        let category = artifact.category;
        let metadata = artifact.metadata.clone();
        let is_temporary = artifact.is_temporary;
        let id = match self.ledger.register_artifact(artifact).await {
            Ok(id) => id,
            Err(e) => {
                let _ = tokio::fs::remove_file(&target).await;
                return Err(e.into());
            }
        };
        tracing::debug!(
            project_id,
            stage = stage_name.unwrap_or("-"),
            path = %rel,
            bytes = bytes.len(),
            "artifact written"
        );

        Ok(ArtifactRef {
            id,
            project_id: project_id.to_string(),
            stage_name: stage_name.map(str::to_string),
            artifact_type,
            category,
            file_name: rel.rsplit('/').next().unwrap_or(&rel).to_string(),
            rel_path: rel,
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
            metadata,
            is_temporary,
        })
    }

    pub async fn read_file(
        &self,
        project_id: &str,
        rel_path: &str,
    ) -> Result<Vec<u8>, WorkspaceError> {
        let path = self.resolve_path(project_id, rel_path)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(WorkspaceError::NotFound(rel_path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove an artifact's file and ledger row.
    pub async fn delete_artifact(
        &self,
        project_id: &str,
        artifact: &ArtifactRef,
    ) -> Result<(), WorkspaceError> {
        let lock = self.project_lock(project_id).await;
        let _guard = lock.lock().await;
        let path = self.resolve_path(project_id, &artifact.rel_path)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.ledger.delete_artifact(artifact.id).await?;
        Ok(())
    }

    /// Compare ledger and disk for one project using the configured mode.
    pub async fn reconcile(&self, project_id: &str) -> Result<ReconcileReport, WorkspaceError> {
        self.reconcile_with(project_id, self.reconcile_mode).await
    }

    /// Compare ledger and disk for one project and, in auto-repair mode, fix
    /// what can be fixed: register orphans, drop rows whose file is gone,
    /// adopt the on-disk size on mismatch. Integrity verification passes an
    /// explicit `ReportOnly` so it never mutates.
    pub async fn reconcile_with(
        &self,
        project_id: &str,
        mode: ReconcileMode,
    ) -> Result<ReconcileReport, WorkspaceError> {
        let lock = self.project_lock(project_id).await;
        let _guard = lock.lock().await;

        let root = self.project_root(project_id)?;
        let on_disk = scan_artifact_files(&root).await?;
        let ledger_rows = self.ledger.list_artifacts(project_id).await?;

        let mut findings = Vec::new();
        let by_path: HashMap<&str, &ArtifactRef> = ledger_rows
            .iter()
            .map(|a| (a.rel_path.as_str(), a))
            .collect();

        for (rel, size) in &on_disk {
            match by_path.get(rel.as_str()) {
                None => findings.push(ReconcileFinding::Orphan {
                    rel_path: rel.clone(),
                    size_bytes: *size,
                }),
                Some(row) if row.size_bytes != *size => {
                    findings.push(ReconcileFinding::SizeMismatch {
                        artifact_id: row.id,
                        rel_path: rel.clone(),
                        ledger_bytes: row.size_bytes,
                        disk_bytes: *size,
                    })
                }
                Some(_) => {}
            }
        }
        let disk_paths: HashMap<&str, u64> =
            on_disk.iter().map(|(rel, size)| (rel.as_str(), *size)).collect();
        for row in &ledger_rows {
            if !disk_paths.contains_key(row.rel_path.as_str()) {
                findings.push(ReconcileFinding::Missing {
                    artifact_id: row.id,
                    rel_path: row.rel_path.clone(),
                });
            }
        }

        let mut repaired = 0;
        if mode == ReconcileMode::AutoRepair {
            for finding in &findings {
                match finding {
                    ReconcileFinding::Orphan {
                        rel_path,
                        size_bytes,
                    } => {
                        self.ledger
                            .register_artifact(NewArtifact::new(
                                project_id,
                                infer_artifact_type(rel_path),
                                ArtifactCategory::Intermediate,
                                rel_path.clone(),
                                *size_bytes,
                            ))
                            .await?;
                        repaired += 1;
                    }
                    ReconcileFinding::Missing { artifact_id, .. } => {
                        self.ledger.delete_artifact(*artifact_id).await?;
                        repaired += 1;
                    }
                    ReconcileFinding::SizeMismatch {
                        artifact_id,
                        disk_bytes,
                        ..
                    } => {
                        self.ledger
                            .update_artifact_size(*artifact_id, *disk_bytes)
                            .await?;
                        repaired += 1;
                    }
                }
            }
        }

        if !findings.is_empty() {
            tracing::info!(
                project_id,
                findings = findings.len(),
                repaired,
                mode = ?mode,
                "reconciliation found ledger/disk drift"
            );
        }
        Ok(ReconcileReport {
            project_id: project_id.to_string(),
            mode,
            findings,
            repaired,
        })
    }

    /// Remove temporary artifacts older than the cutoff, files and rows.
    /// Idempotent: a second call finds nothing left to remove.
    pub async fn cleanup_temporary(
        &self,
        project_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<usize, WorkspaceError> {
        let lock = self.project_lock(project_id).await;
        let _guard = lock.lock().await;

        let stale = self.ledger.temporary_artifacts(project_id, older_than).await?;
        let mut removed = 0;
        for artifact in stale {
            let path = self.resolve_path(project_id, &artifact.rel_path)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.ledger.delete_artifact(artifact.id).await?;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(project_id, removed, "temporary artifacts cleaned up");
        }
        Ok(removed)
    }

    /// Remove cache files whose mtime is older than the cutoff.
    pub async fn cleanup_old_files(
        &self,
        project_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<usize, WorkspaceError> {
        let lock = self.project_lock(project_id).await;
        let _guard = lock.lock().await;

        let cache = self.project_root(project_id)?.join(layout::CACHE_DIR);
        let mut removed = 0;
        let mut stack = vec![cache];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                    continue;
                }
                let modified: DateTime<Utc> = entry.metadata().await?.modified()?.into();
                if modified < older_than {
                    tokio::fs::remove_file(entry.path()).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Recursive byte count of the project subtree.
    pub async fn disk_usage(&self, project_id: &str) -> Result<u64, WorkspaceError> {
        let lock = self.project_lock(project_id).await;
        let _guard = lock.lock().await;
        self.disk_usage_locked(project_id).await
    }

    async fn disk_usage_locked(&self, project_id: &str) -> Result<u64, WorkspaceError> {
        let root = self.project_root(project_id)?;
        let mut total = 0u64;
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else {
                    total = total.saturating_add(entry.metadata().await?.len());
                }
            }
        }
        Ok(total)
    }
}

/// Artifact writer bound to one (project, stage) pair - the only filesystem
/// surface stage processors see.
pub struct StageArtifacts {
    workspace: Arc<ProjectWorkspace>,
    project_id: String,
    stage_name: String,
}

impl StageArtifacts {
    pub fn new(
        workspace: Arc<ProjectWorkspace>,
        project_id: impl Into<String>,
        stage_name: impl Into<String>,
    ) -> Self {
        Self {
            workspace,
            project_id: project_id.into(),
            stage_name: stage_name.into(),
        }
    }
}

#[async_trait]
impl ArtifactWriter for StageArtifacts {
    async fn write(
        &self,
        rel_path: &str,
        bytes: &[u8],
        options: ArtifactOptions,
    ) -> Result<ArtifactRef, WorkspaceError> {
        self.workspace
            .write_file(
                &self.project_id,
                Some(&self.stage_name),
                rel_path,
                bytes,
                options,
            )
            .await
    }

    async fn resolve(&self, rel_path: &str) -> Result<PathBuf, WorkspaceError> {
        self.workspace.resolve_path(&self.project_id, rel_path)
    }

    async fn read(&self, rel_path: &str) -> Result<Vec<u8>, WorkspaceError> {
        self.workspace.read_file(&self.project_id, rel_path).await
    }
}

fn safe_relative(rel_path: &str) -> Result<PathBuf, WorkspaceError> {
    let path = PathBuf::from(rel_path);
    if path.is_absolute() || rel_path.is_empty() {
        return Err(WorkspaceError::PathTraversal(rel_path.to_string()));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(WorkspaceError::PathTraversal(rel_path.to_string())),
        }
    }
    Ok(path)
}

/// Canonical '/'-separated form stored in the ledger.
fn normalize_rel(rel_path: &str) -> String {
    PathBuf::from(rel_path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn tmp_sibling(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    name.push_str(TMP_SUFFIX);
    target.with_file_name(name)
}

/// Best-effort type inference for orphaned files, from their layout
/// directory.
fn infer_artifact_type(rel_path: &str) -> ArtifactType {
    for ty in [
        ArtifactType::Audio,
        ArtifactType::Video,
        ArtifactType::Image,
        ArtifactType::Script,
    ] {
        if rel_path.starts_with(layout::artifact_dir(ty)) {
            return ty;
        }
    }
    ArtifactType::Metadata
}

/// Collect (rel_path, size) for every file in the ledger-covered `files/`
/// subtree, skipping in-progress `.tmp` writes.
async fn scan_artifact_files(
    project_root: &Path,
) -> Result<Vec<(String, u64)>, WorkspaceError> {
    let mut out = Vec::new();
    let mut stack = vec![project_root.join(layout::FILES_DIR)];
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
                continue;
            }
            let path = entry.path();
            if path
                .file_name()
                .map(|n| n.to_string_lossy().ends_with(TMP_SUFFIX))
                .unwrap_or(false)
            {
                continue;
            }
            let rel = path
                .strip_prefix(project_root)
                .map_err(|_| WorkspaceError::Io("scan escaped project root".to_string()))?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.push((rel, entry.metadata().await?.len()));
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediaforge_core::types::NewProject;
    use mediaforge_core::workspace::ReconcileFinding;
    use mediaforge_store::SqliteStore;
    use tempfile::TempDir;

    async fn workspace(mode: ReconcileMode) -> (Arc<ProjectWorkspace>, Arc<SqliteStore>, TempDir)
    {
        let root = TempDir::new().expect("tempdir");
        let store = Arc::new(
            SqliteStore::connect_in_memory(root.path())
                .await
                .expect("store"),
        );
        use mediaforge_core::store::ProjectStore;
        store
            .create_project(NewProject::new("demo", "theme").with_id("p1"))
            .await
            .expect("project");
        let ws = Arc::new(
            ProjectWorkspace::new(root.path(), store.clone()).with_reconcile_mode(mode),
        );
        (ws, store, root)
    }

    fn audio_opts() -> ArtifactOptions {
        ArtifactOptions::new(ArtifactType::Audio, ArtifactCategory::Output)
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (ws, _store, _root) = workspace(ReconcileMode::ReportOnly).await;
        for bad in ["../outside.txt", "files/../../escape", "/etc/passwd", ""] {
            let result = ws.resolve_path("p1", bad);
            assert!(
                matches!(result, Err(WorkspaceError::PathTraversal(_))),
                "{bad} should be rejected"
            );
        }
        assert!(ws.resolve_path("p1", "files/audio/a.wav").is_ok());
        assert!(matches!(
            ws.resolve_path("../p1", "files/audio/a.wav"),
            Err(WorkspaceError::InvalidProjectId(_))
        ));
    }

    #[tokio::test]
    async fn test_write_registers_ledger_entry() {
        let (ws, store, root) = workspace(ReconcileMode::ReportOnly).await;
        let artifact = ws
            .write_file("p1", Some("audio"), "files/audio/take.wav", b"pcm", audio_opts())
            .await
            .expect("write");
        assert_eq!(artifact.rel_path, "files/audio/take.wav");
        assert_eq!(artifact.size_bytes, 3);
        assert!(root.path().join("p1/files/audio/take.wav").is_file());

        use mediaforge_core::store::ArtifactLedger;
        let rows = store.list_artifacts("p1").await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].stage_name.as_deref(), Some("audio"));
    }

    #[tokio::test]
    async fn test_failed_registration_unlinks_file() {
        let (ws, _store, root) = workspace(ReconcileMode::ReportOnly).await;
        // unknown project: ledger insert hits the foreign key and the file
        // written under the (pre-created) directory must not survive
        tokio::fs::create_dir_all(root.path().join("ghost/files/audio"))
            .await
            .expect("mkdir");
        let result = ws
            .write_file("ghost", None, "files/audio/a.wav", b"x", audio_opts())
            .await;
        assert!(matches!(result, Err(WorkspaceError::Ledger(_))));
        assert!(!root.path().join("ghost/files/audio/a.wav").exists());
    }

    #[tokio::test]
    async fn test_quota_enforced() {
        let (ws, store, _root) = workspace(ReconcileMode::ReportOnly).await;
        let ws = Arc::new(
            ProjectWorkspace::new(ws.projects_root(), store.clone()).with_byte_quota(Some(10)),
        );
        ws.write_file("p1", None, "files/audio/a.wav", b"12345", audio_opts())
            .await
            .expect("first write fits");
        let result = ws
            .write_file("p1", None, "files/audio/b.wav", b"1234567890", audio_opts())
            .await;
        assert!(matches!(result, Err(WorkspaceError::QuotaExceeded { .. })));
    }

    #[tokio::test]
    async fn test_reconcile_reports_drift() {
        let (ws, store, root) = workspace(ReconcileMode::ReportOnly).await;
        // clean write
        ws.write_file("p1", None, "files/audio/ok.wav", b"ok", audio_opts())
            .await
            .expect("write");
        // orphan: on disk, not in ledger
        tokio::fs::write(root.path().join("p1/files/audio/orphan.wav"), b"???")
            .await
            .expect("orphan");
        // missing: in ledger, not on disk
        use mediaforge_core::store::ArtifactLedger;
        store
            .register_artifact(NewArtifact::new(
                "p1",
                ArtifactType::Video,
                ArtifactCategory::Final,
                "files/video/gone.mp4",
                99,
            ))
            .await
            .expect("ledger row");
        // size mismatch
        let drifted = ws
            .write_file("p1", None, "files/audio/drift.wav", b"abc", audio_opts())
            .await
            .expect("write");
        tokio::fs::write(root.path().join("p1").join(&drifted.rel_path), b"abcdef")
            .await
            .expect("drift");

        let report = ws.reconcile("p1").await.expect("reconcile");
        assert_eq!(report.repaired, 0);
        assert_eq!(report.findings.len(), 3);
        assert!(report
            .findings
            .iter()
            .any(|f| matches!(f, ReconcileFinding::Orphan { rel_path, .. } if rel_path == "files/audio/orphan.wav")));
        assert!(report
            .findings
            .iter()
            .any(|f| matches!(f, ReconcileFinding::Missing { rel_path, .. } if rel_path == "files/video/gone.mp4")));
        assert!(report.findings.iter().any(|f| matches!(
            f,
            ReconcileFinding::SizeMismatch {
                ledger_bytes: 3,
                disk_bytes: 6,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_reconcile_auto_repair_converges() {
        let (ws, store, root) = workspace(ReconcileMode::AutoRepair).await;
        ws.write_file("p1", None, "files/audio/ok.wav", b"ok", audio_opts())
            .await
            .expect("write");
        tokio::fs::write(root.path().join("p1/files/scripts/found.md"), b"# hi")
            .await
            .expect("orphan");
        use mediaforge_core::store::ArtifactLedger;
        store
            .register_artifact(NewArtifact::new(
                "p1",
                ArtifactType::Video,
                ArtifactCategory::Final,
                "files/video/gone.mp4",
                99,
            ))
            .await
            .expect("ledger row");

        let report = ws.reconcile("p1").await.expect("reconcile");
        assert_eq!(report.repaired, report.findings.len());

        // after repair: every file has exactly one row, every row resolves
        let rows = store.list_artifacts("p1").await.expect("rows");
        assert_eq!(rows.len(), 2);
        for row in &rows {
            let path = ws.resolve_path("p1", &row.rel_path).expect("resolve");
            let size = tokio::fs::metadata(&path).await.expect("meta").len();
            assert_eq!(size, row.size_bytes);
        }
        let orphan_row = rows
            .iter()
            .find(|r| r.rel_path == "files/scripts/found.md")
            .expect("orphan registered");
        assert_eq!(orphan_row.artifact_type, ArtifactType::Script);

        let clean = ws.reconcile("p1").await.expect("second pass");
        assert!(clean.is_clean());
    }

    #[tokio::test]
    async fn test_cleanup_temporary_is_idempotent() {
        let (ws, _store, root) = workspace(ReconcileMode::ReportOnly).await;
        ws.write_file(
            "p1",
            None,
            "files/audio/tmp.wav",
            b"scratch",
            audio_opts().temporary(),
        )
        .await
        .expect("write");
        ws.write_file("p1", None, "files/audio/keep.wav", b"keep", audio_opts())
            .await
            .expect("write");

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let removed = ws.cleanup_temporary("p1", cutoff).await.expect("cleanup");
        assert_eq!(removed, 1);
        assert!(!root.path().join("p1/files/audio/tmp.wav").exists());
        assert!(root.path().join("p1/files/audio/keep.wav").exists());

        let removed_again = ws.cleanup_temporary("p1", cutoff).await.expect("cleanup");
        assert_eq!(removed_again, 0);
    }

    #[tokio::test]
    async fn test_disk_usage_counts_subtree() {
        let (ws, _store, _root) = workspace(ReconcileMode::ReportOnly).await;
        ws.write_file("p1", None, "files/audio/a.wav", b"12345", audio_opts())
            .await
            .expect("write");
        ws.write_file("p1", None, "files/video/b.mp4", b"123", audio_opts())
            .await
            .expect("write");
        assert_eq!(ws.disk_usage("p1").await.expect("usage"), 8);
    }

    #[tokio::test]
    async fn test_stage_writer_attributes_to_stage() {
        let (ws, store, _root) = workspace(ReconcileMode::ReportOnly).await;
        let writer = StageArtifacts::new(ws.clone(), "p1", "compose");
        writer
            .write("files/video/out.mp4", b"mp4", audio_opts())
            .await
            .expect("write");
        use mediaforge_core::store::ArtifactLedger;
        let rows = store.list_artifacts("p1").await.expect("rows");
        assert_eq!(rows[0].stage_name.as_deref(), Some("compose"));
    }
}
