//! SqliteStore - the embedded store behind every persistence trait.
//!
//! A single pooled connection is shared so writes serialize through the
//! store; every multi-row mutation runs inside an explicit transaction and
//! rolls back on any error.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use mediaforge_core::layout;
use mediaforge_core::store::{ArtifactLedger, ProjectStore, StoreError, TelemetryStore};
use mediaforge_core::types::{
    validate_project_id, ApiUsageRecord, ApiUsageSummary, ArtifactCategory, ArtifactQuery,
    ArtifactRef, ArtifactType, ConfigValue, NewArtifact, NewProject, Project, ProjectFilter,
    ProjectStatus, StageDef, StageRecord, StageStatus, StageUpdate, StatRecord,
    SystemConfigEntry,
};

use crate::migrations::{latest_version, MIGRATIONS};

/// Upper bound for a persisted stage output summary.
pub const MAX_OUTPUT_SUMMARY_BYTES: usize = 64 * 1024;

/// Store health report.
#[derive(Debug, Clone)]
pub enum HealthStatus {
    Healthy {
        database_bytes: u64,
        project_count: u64,
    },
    Degraded {
        reason: String,
    },
}

/// SQLite-backed store.
pub struct SqliteStore {
    pool: SqlitePool,
    projects_root: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database file and apply pending migrations.
    pub async fn connect(store_path: &Path, projects_root: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = store_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(store_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        Self::connect_with(options, projects_root).await
    }

    /// In-memory database, used by tests and ephemeral tooling.
    pub async fn connect_in_memory(projects_root: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(conn_err)?
            .foreign_keys(true);
        Self::connect_with(options, projects_root).await
    }

    async fn connect_with(
        options: SqliteConnectOptions,
        projects_root: &Path,
    ) -> Result<Self, StoreError> {
        // One connection: writes serialize through the pool, reads queue
        // behind the writer instead of racing it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(conn_err)?;
        let store = Self {
            pool,
            projects_root: projects_root.to_path_buf(),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the connection pool; subsequent operations fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }

    /// Apply pending migrations; refuses to open a newer-versioned database.
    pub async fn migrate(&self) -> Result<Vec<i64>, StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(conn_err)?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await
                .map_err(conn_err)?;
        let current = current.unwrap_or(0);
        if current > latest_version() {
            return Err(StoreError::Migration(format!(
                "database schema version {} is newer than supported version {}",
                current,
                latest_version()
            )));
        }

        let mut applied = Vec::new();
        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            let mut tx = self.pool.begin().await.map_err(conn_err)?;
            for statement in migration.statements {
                sqlx::query(statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        StoreError::Migration(format!(
                            "migration {} failed: {}",
                            migration.version, e
                        ))
                    })?;
            }
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
                .bind(migration.version)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await
                .map_err(conn_err)?;
            tx.commit().await.map_err(conn_err)?;
            tracing::info!(
                version = migration.version,
                description = migration.description,
                "schema migration applied"
            );
            applied.push(migration.version);
        }
        Ok(applied)
    }

    /// Currently applied schema version.
    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await
                .map_err(conn_err)?;
        Ok(version.unwrap_or(0))
    }

    /// Snapshot the database into `path` using SQLite's online VACUUM INTO.
    pub async fn backup(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        if tokio::fs::try_exists(path).await.map_err(io_err)? {
            return Err(StoreError::Invalid(format!(
                "backup target already exists: {}",
                path.display()
            )));
        }
        let escaped = path.display().to_string().replace('\'', "''");
        sqlx::query(&format!("VACUUM INTO '{}'", escaped))
            .execute(&self.pool)
            .await
            .map_err(conn_err)?;
        tracing::info!(path = %path.display(), "store backup written");
        Ok(())
    }

    pub async fn health_check(&self) -> HealthStatus {
        let probe = async {
            let project_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects")
                .fetch_one(&self.pool)
                .await?;
            let database_bytes: i64 = sqlx::query_scalar(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            )
            .fetch_one(&self.pool)
            .await?;
            Ok::<_, sqlx::Error>((project_count, database_bytes))
        };
        match probe.await {
            Ok((projects, bytes)) => HealthStatus::Healthy {
                database_bytes: bytes.max(0) as u64,
                project_count: projects.max(0) as u64,
            },
            Err(e) => HealthStatus::Degraded {
                reason: e.to_string(),
            },
        }
    }

    async fn generate_project_id(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    ) -> Result<String, StoreError> {
        let date = Utc::now().format("%Y%m%d").to_string();
        let pattern = format!("{}_%", date);
        let last: Option<String> =
            sqlx::query_scalar("SELECT id FROM projects WHERE id LIKE ? ORDER BY id DESC LIMIT 1")
                .bind(&pattern)
                .fetch_optional(&mut **tx)
                .await
                .map_err(conn_err)?;
        let next = last
            .and_then(|id| {
                id.rsplit('_')
                    .next()
                    .and_then(|suffix| suffix.parse::<u32>().ok())
            })
            .map(|n| n + 1)
            .unwrap_or(1);
        Ok(format!("{}_{:03}", date, next))
    }

    async fn create_project_subtree(&self, project_id: &str) -> std::io::Result<()> {
        let root = layout::project_dir(&self.projects_root, project_id);
        for subdir in layout::PROJECT_SUBTREE {
            tokio::fs::create_dir_all(root.join(subdir)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for SqliteStore {
    async fn create_project(&self, new: NewProject) -> Result<Project, StoreError> {
        if new.target_length_minutes < 1 {
            return Err(StoreError::Invalid(
                "target_length_minutes must be >= 1".to_string(),
            ));
        }
        if let Some(id) = &new.id {
            if !validate_project_id(id) {
                return Err(StoreError::Invalid(format!("invalid project id: {}", id)));
            }
        }

        let mut tx = self.pool.begin().await.map_err(conn_err)?;

        let id = match &new.id {
            Some(id) => {
                let existing = sqlx::query("SELECT * FROM projects WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(conn_err)?;
                if let Some(row) = existing {
                    let project = project_from_row(&row)?;
                    // Idempotent on identical input; a colliding id with
                    // different attributes is a conflict.
                    if project.name == new.name
                        && project.theme == new.theme
                        && project.target_length_minutes == new.target_length_minutes
                    {
                        return Ok(project);
                    }
                    return Err(StoreError::AlreadyExists(id.clone()));
                }
                id.clone()
            }
            None => self.generate_project_id(&mut tx).await?,
        };

        let now = Utc::now();
        let config_json = new.config.to_string();
        sqlx::query(
            "INSERT INTO projects (
                id, name, created_at, updated_at, status, config_json,
                theme, target_length_minutes
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.name)
        .bind(now)
        .bind(now)
        .bind(ProjectStatus::Initialized.as_str())
        .bind(&config_json)
        .bind(&new.theme)
        .bind(new.target_length_minutes as i64)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        // Row and directory subtree appear together or not at all.
        if let Err(e) = self.create_project_subtree(&id).await {
            tx.rollback().await.ok();
            let _ =
                tokio::fs::remove_dir_all(layout::project_dir(&self.projects_root, &id)).await;
            return Err(io_err(e));
        }
        if let Err(e) = tx.commit().await {
            let _ =
                tokio::fs::remove_dir_all(layout::project_dir(&self.projects_root, &id)).await;
            return Err(conn_err(e));
        }

        tracing::info!(project_id = %id, theme = %new.theme, "project created");
        Ok(Project {
            id,
            name: new.name,
            description: None,
            theme: new.theme,
            target_length_minutes: new.target_length_minutes,
            status: ProjectStatus::Initialized,
            config: new.config,
            estimated_duration_secs: None,
            actual_duration_secs: None,
            external_id: None,
            external_url: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_project(&self, project_id: &str) -> Result<Option<Project>, StoreError> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn_err)?;
        row.map(|r| project_from_row(&r)).transpose()
    }

    async fn list_projects(&self, filter: &ProjectFilter) -> Result<Vec<Project>, StoreError> {
        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        let rows = match filter.status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM projects WHERE status = ?
                     ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM projects
                     ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(conn_err)?;
        rows.iter().map(project_from_row).collect()
    }

    async fn update_project_status(
        &self,
        project_id: &str,
        status: ProjectStatus,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(conn_err)?;
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM projects WHERE id = ?")
                .bind(project_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(conn_err)?;
        let current = current.ok_or_else(|| StoreError::NotFound(project_id.to_string()))?;
        let current = ProjectStatus::parse(&current)
            .ok_or_else(|| StoreError::Integrity(format!("unknown project status: {current}")))?;
        if !current.can_transition_to(status) {
            return Err(StoreError::Invalid(format!(
                "illegal project transition {} -> {}",
                current.as_str(),
                status.as_str()
            )));
        }
        sqlx::query("UPDATE projects SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(project_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        tx.commit().await.map_err(conn_err)?;
        tracing::debug!(project_id, status = status.as_str(), "project status updated");
        Ok(())
    }

    async fn set_estimated_duration(
        &self,
        project_id: &str,
        secs: f64,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE projects SET estimated_duration = ?, updated_at = ? WHERE id = ?")
                .bind(secs)
                .bind(Utc::now())
                .bind(project_id)
                .execute(&self.pool)
                .await
                .map_err(conn_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(project_id.to_string()));
        }
        Ok(())
    }

    async fn set_actual_duration(&self, project_id: &str, secs: f64) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE projects SET actual_duration = ?, updated_at = ? WHERE id = ?")
                .bind(secs)
                .bind(Utc::now())
                .bind(project_id)
                .execute(&self.pool)
                .await
                .map_err(conn_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(project_id.to_string()));
        }
        Ok(())
    }

    async fn set_external_reference(
        &self,
        project_id: &str,
        external_id: &str,
        external_url: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE projects SET external_id = ?, external_url = ?, updated_at = ? WHERE id = ?",
        )
        .bind(external_id)
        .bind(external_url)
        .bind(Utc::now())
        .bind(project_id)
        .execute(&self.pool)
        .await
        .map_err(conn_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(project_id.to_string()));
        }
        Ok(())
    }

    async fn delete_project(&self, project_id: &str) -> Result<bool, StoreError> {
        // Child rows cascade, api_usage attribution is severed by the
        // ON DELETE SET NULL foreign key.
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        let dir = layout::project_dir(&self.projects_root, project_id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(project_id, error = %e, "project subtree removal failed");
            }
        }
        tracing::info!(project_id, "project deleted");
        Ok(true)
    }

    async fn create_stage_records(
        &self,
        project_id: &str,
        stages: &[StageDef],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(conn_err)?;
        for (position, stage) in stages.iter().enumerate() {
            sqlx::query(
                "INSERT INTO workflow_steps (project_id, step_name, step_order, status, retry_count)
                 VALUES (?, ?, ?, 'pending', 0)
                 ON CONFLICT (project_id, step_name) DO NOTHING",
            )
            .bind(project_id)
            .bind(&stage.name)
            .bind(position as i64)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(conn_err)?;
        Ok(())
    }

    async fn stage_records(&self, project_id: &str) -> Result<Vec<StageRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_steps WHERE project_id = ? ORDER BY step_order ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(conn_err)?;
        rows.iter().map(stage_from_row).collect()
    }

    async fn stage_record(
        &self,
        project_id: &str,
        stage_name: &str,
    ) -> Result<Option<StageRecord>, StoreError> {
        let row =
            sqlx::query("SELECT * FROM workflow_steps WHERE project_id = ? AND step_name = ?")
                .bind(project_id)
                .bind(stage_name)
                .fetch_optional(&self.pool)
                .await
                .map_err(conn_err)?;
        row.map(|r| stage_from_row(&r)).transpose()
    }

    async fn update_stage_status(
        &self,
        project_id: &str,
        stage_name: &str,
        update: StageUpdate,
    ) -> Result<(), StoreError> {
        if let Some(output) = &update.output_summary {
            let size = output.to_string().len();
            if size > MAX_OUTPUT_SUMMARY_BYTES {
                return Err(StoreError::Invalid(format!(
                    "output summary is {size} bytes, limit is {MAX_OUTPUT_SUMMARY_BYTES}"
                )));
            }
        }

        let mut tx = self.pool.begin().await.map_err(conn_err)?;
        let row =
            sqlx::query("SELECT * FROM workflow_steps WHERE project_id = ? AND step_name = ?")
                .bind(project_id)
                .bind(stage_name)
                .fetch_optional(&mut *tx)
                .await
                .map_err(conn_err)?
                .ok_or_else(|| {
                    StoreError::NotFound(format!("{project_id}/{stage_name}"))
                })?;
        let mut record = stage_from_row(&row)?;

        if let Some(next) = update.status {
            if next != record.status && !record.status.can_transition_to(next) {
                return Err(StoreError::Invalid(format!(
                    "illegal stage transition {} -> {} for {}/{}",
                    record.status.as_str(),
                    next.as_str(),
                    project_id,
                    stage_name
                )));
            }
            let now = Utc::now();
            if next == StageStatus::Running {
                record.started_at = Some(now);
                record.completed_at = None;
            } else if next.is_terminal() || next == StageStatus::Failed {
                record.completed_at = Some(now);
            }
            record.status = next;
        }
        if let Some(input) = update.input_params {
            record.input_params = Some(input);
        }
        if let Some(output) = update.output_summary {
            record.output_summary = Some(output);
        }
        if let Some(error) = update.error_message {
            record.error_message = Some(error);
        }
        if let Some(retries) = update.retry_count {
            record.retry_count = retries;
        }
        if let Some(elapsed) = update.elapsed_secs {
            record.elapsed_secs = Some(elapsed);
        }

        sqlx::query(
            "UPDATE workflow_steps SET
                status = ?, started_at = ?, completed_at = ?,
                input_params_json = ?, output_summary_json = ?,
                error_message = ?, retry_count = ?, processing_time_seconds = ?
             WHERE project_id = ? AND step_name = ?",
        )
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.input_params.as_ref().map(Value::to_string))
        .bind(record.output_summary.as_ref().map(Value::to_string))
        .bind(&record.error_message)
        .bind(record.retry_count as i64)
        .bind(record.elapsed_secs)
        .bind(project_id)
        .bind(stage_name)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        tx.commit().await.map_err(conn_err)?;
        Ok(())
    }

    async fn replace_stage_records(
        &self,
        project_id: &str,
        records: &[StageRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(conn_err)?;
        sqlx::query("DELETE FROM workflow_steps WHERE project_id = ?")
            .bind(project_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        for record in records {
            sqlx::query(
                "INSERT INTO workflow_steps (
                    project_id, step_name, step_order, status, started_at, completed_at,
                    input_params_json, output_summary_json, error_message, retry_count,
                    processing_time_seconds
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(project_id)
            .bind(&record.name)
            .bind(record.position as i64)
            .bind(record.status.as_str())
            .bind(record.started_at)
            .bind(record.completed_at)
            .bind(record.input_params.as_ref().map(Value::to_string))
            .bind(record.output_summary.as_ref().map(Value::to_string))
            .bind(&record.error_message)
            .bind(record.retry_count as i64)
            .bind(record.elapsed_secs)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(conn_err)?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactLedger for SqliteStore {
    async fn register_artifact(&self, artifact: NewArtifact) -> Result<i64, StoreError> {
        if artifact.rel_path.trim().is_empty() {
            return Err(StoreError::Invalid("artifact path is empty".to_string()));
        }
        let file_name = artifact
            .rel_path
            .rsplit('/')
            .next()
            .unwrap_or(artifact.rel_path.as_str())
            .to_string();
        let size = i64::try_from(artifact.size_bytes)
            .map_err(|_| StoreError::Invalid("artifact size exceeds i64 range".to_string()))?;
        let result = sqlx::query(
            "INSERT INTO project_files (
                project_id, step_name, file_type, file_category, file_path,
                file_name, file_size_bytes, created_at, metadata_json, is_temporary
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&artifact.project_id)
        .bind(&artifact.stage_name)
        .bind(artifact.artifact_type.as_str())
        .bind(artifact.category.as_str())
        .bind(&artifact.rel_path)
        .bind(&file_name)
        .bind(size)
        .bind(Utc::now())
        .bind(artifact.metadata.to_string())
        .bind(artifact.is_temporary)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.last_insert_rowid())
    }

    async fn list_artifacts(&self, project_id: &str) -> Result<Vec<ArtifactRef>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM project_files WHERE project_id = ? ORDER BY id ASC")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await
                .map_err(conn_err)?;
        rows.iter().map(artifact_from_row).collect()
    }

    async fn query_artifacts(
        &self,
        project_id: &str,
        query: &ArtifactQuery,
    ) -> Result<Vec<ArtifactRef>, StoreError> {
        let mut sql = String::from("SELECT * FROM project_files WHERE project_id = ?");
        if query.stage_name.is_some() {
            sql.push_str(" AND step_name = ?");
        }
        if query.artifact_type.is_some() {
            sql.push_str(" AND file_type = ?");
        }
        if query.category.is_some() {
            sql.push_str(" AND file_category = ?");
        }
        sql.push_str(" ORDER BY id ASC");

        let mut q = sqlx::query(&sql).bind(project_id);
        if let Some(stage) = &query.stage_name {
            q = q.bind(stage);
        }
        if let Some(artifact_type) = query.artifact_type {
            q = q.bind(artifact_type.as_str());
        }
        if let Some(category) = query.category {
            q = q.bind(category.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(conn_err)?;
        rows.iter().map(artifact_from_row).collect()
    }

    async fn delete_artifact(&self, artifact_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM project_files WHERE id = ?")
            .bind(artifact_id)
            .execute(&self.pool)
            .await
            .map_err(conn_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_artifact_size(
        &self,
        artifact_id: i64,
        size_bytes: u64,
    ) -> Result<(), StoreError> {
        let size = i64::try_from(size_bytes)
            .map_err(|_| StoreError::Invalid("artifact size exceeds i64 range".to_string()))?;
        let result = sqlx::query("UPDATE project_files SET file_size_bytes = ? WHERE id = ?")
            .bind(size)
            .bind(artifact_id)
            .execute(&self.pool)
            .await
            .map_err(conn_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("artifact {artifact_id}")));
        }
        Ok(())
    }

    async fn temporary_artifacts(
        &self,
        project_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ArtifactRef>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM project_files
             WHERE project_id = ? AND is_temporary = 1 AND created_at < ?
             ORDER BY id ASC",
        )
        .bind(project_id)
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(conn_err)?;
        rows.iter().map(artifact_from_row).collect()
    }
}

#[async_trait]
impl TelemetryStore for SqliteStore {
    async fn record_api_usage(&self, usage: &ApiUsageRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO api_usage (
                project_id, api_provider, api_endpoint, request_timestamp,
                tokens_input, tokens_output, estimated_cost_usd,
                response_time_ms, status_code, step_name
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&usage.project_id)
        .bind(&usage.provider)
        .bind(&usage.endpoint)
        .bind(usage.requested_at)
        .bind(usage.tokens_input as i64)
        .bind(usage.tokens_output as i64)
        .bind(usage.estimated_cost_usd)
        .bind(usage.response_time_ms)
        .bind(usage.status_code.map(|c| c as i64))
        .bind(&usage.stage_name)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn api_usage_summary(
        &self,
        provider: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<ApiUsageSummary>, StoreError> {
        let mut sql = String::from(
            "SELECT api_provider,
                    COUNT(*) AS call_count,
                    COALESCE(SUM(tokens_input), 0) AS tokens_input,
                    COALESCE(SUM(tokens_output), 0) AS tokens_output,
                    COALESCE(SUM(estimated_cost_usd), 0) AS estimated_cost_usd
             FROM api_usage WHERE request_timestamp >= ?",
        );
        if provider.is_some() {
            sql.push_str(" AND api_provider = ?");
        }
        sql.push_str(" GROUP BY api_provider ORDER BY api_provider ASC");

        let mut q = sqlx::query(&sql).bind(since);
        if let Some(provider) = provider {
            q = q.bind(provider);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(conn_err)?;
        rows.iter()
            .map(|row| {
                Ok(ApiUsageSummary {
                    provider: get(row, "api_provider")?,
                    call_count: get::<i64>(row, "call_count")?.max(0) as u64,
                    tokens_input: get::<i64>(row, "tokens_input")?.max(0) as u64,
                    tokens_output: get::<i64>(row, "tokens_output")?.max(0) as u64,
                    estimated_cost_usd: get(row, "estimated_cost_usd")?,
                })
            })
            .collect()
    }

    async fn record_stat(
        &self,
        project_id: &str,
        stage_name: Option<&str>,
        name: &str,
        value: f64,
        unit: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO project_statistics (
                project_id, stat_name, stat_value, stat_unit, step_name, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(project_id)
        .bind(name)
        .bind(value)
        .bind(unit)
        .bind(stage_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn project_stats(&self, project_id: &str) -> Result<Vec<StatRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM project_statistics WHERE project_id = ? ORDER BY recorded_at ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(conn_err)?;
        rows.iter()
            .map(|row| {
                Ok(StatRecord {
                    project_id: get(row, "project_id")?,
                    stage_name: get(row, "step_name")?,
                    name: get(row, "stat_name")?,
                    value: get(row, "stat_value")?,
                    unit: get(row, "stat_unit")?,
                    recorded_at: get(row, "recorded_at")?,
                })
            })
            .collect()
    }

    async fn set_config(
        &self,
        key: &str,
        value: ConfigValue,
        description: Option<&str>,
        updated_by: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO system_config (
                config_key, config_value, config_type, description, updated_at, updated_by
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (config_key) DO UPDATE SET
                config_value = excluded.config_value,
                config_type = excluded.config_type,
                description = excluded.description,
                updated_at = excluded.updated_at,
                updated_by = excluded.updated_by",
        )
        .bind(key)
        .bind(value.encode())
        .bind(value.type_name())
        .bind(description)
        .bind(Utc::now())
        .bind(updated_by)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_config(&self, key: &str) -> Result<Option<SystemConfigEntry>, StoreError> {
        let row = sqlx::query("SELECT * FROM system_config WHERE config_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let config_type: String = get(&row, "config_type")?;
        let raw: String = get(&row, "config_value")?;
        let value = ConfigValue::decode(&config_type, &raw).ok_or_else(|| {
            StoreError::Serialization(format!(
                "config row '{key}' does not decode as {config_type}"
            ))
        })?;
        Ok(Some(SystemConfigEntry {
            key: get(&row, "config_key")?,
            value,
            description: get(&row, "description")?,
            updated_at: get(&row, "updated_at")?,
            updated_by: get(&row, "updated_by")?,
        }))
    }
}

fn get<'r, T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>>(
    row: &'r SqliteRow,
    column: &str,
) -> Result<T, StoreError> {
    row.try_get(column)
        .map_err(|e| StoreError::Serialization(format!("column {column}: {e}")))
}

fn parse_json(raw: Option<String>) -> Result<Option<Value>, StoreError> {
    raw.map(|s| serde_json::from_str(&s).map_err(|e| StoreError::Serialization(e.to_string())))
        .transpose()
}

fn project_from_row(row: &SqliteRow) -> Result<Project, StoreError> {
    let status: String = get(row, "status")?;
    let status = ProjectStatus::parse(&status)
        .ok_or_else(|| StoreError::Integrity(format!("unknown project status: {status}")))?;
    let config_json: String = get(row, "config_json")?;
    let config = serde_json::from_str(&config_json)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(Project {
        id: get(row, "id")?,
        name: get(row, "name")?,
        description: get(row, "description")?,
        theme: get(row, "theme")?,
        target_length_minutes: get::<i64>(row, "target_length_minutes")?.max(0) as u32,
        status,
        config,
        estimated_duration_secs: get(row, "estimated_duration")?,
        actual_duration_secs: get(row, "actual_duration")?,
        external_id: get(row, "external_id")?,
        external_url: get(row, "external_url")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn stage_from_row(row: &SqliteRow) -> Result<StageRecord, StoreError> {
    let status: String = get(row, "status")?;
    let status = StageStatus::parse(&status)
        .ok_or_else(|| StoreError::Integrity(format!("unknown stage status: {status}")))?;
    Ok(StageRecord {
        project_id: get(row, "project_id")?,
        name: get(row, "step_name")?,
        position: get::<i64>(row, "step_order")?.max(0) as u32,
        status,
        input_params: parse_json(get(row, "input_params_json")?)?,
        output_summary: parse_json(get(row, "output_summary_json")?)?,
        error_message: get(row, "error_message")?,
        retry_count: get::<i64>(row, "retry_count")?.max(0) as u32,
        started_at: get(row, "started_at")?,
        completed_at: get(row, "completed_at")?,
        elapsed_secs: get(row, "processing_time_seconds")?,
    })
}

fn artifact_from_row(row: &SqliteRow) -> Result<ArtifactRef, StoreError> {
    let file_type: String = get(row, "file_type")?;
    let artifact_type = ArtifactType::parse(&file_type)
        .ok_or_else(|| StoreError::Integrity(format!("unknown artifact type: {file_type}")))?;
    let file_category: String = get(row, "file_category")?;
    let category = ArtifactCategory::parse(&file_category).ok_or_else(|| {
        StoreError::Integrity(format!("unknown artifact category: {file_category}"))
    })?;
    let metadata_json: String = get(row, "metadata_json")?;
    let metadata = serde_json::from_str(&metadata_json)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(ArtifactRef {
        id: get(row, "id")?,
        project_id: get(row, "project_id")?,
        stage_name: get(row, "step_name")?,
        artifact_type,
        category,
        rel_path: get(row, "file_path")?,
        file_name: get(row, "file_name")?,
        size_bytes: get::<i64>(row, "file_size_bytes")?.max(0) as u64,
        created_at: get(row, "created_at")?,
        metadata,
        is_temporary: get(row, "is_temporary")?,
    })
}

fn conn_err(e: sqlx::Error) -> StoreError {
    StoreError::Connection(e.to_string())
}

fn io_err(e: std::io::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

fn map_sqlx(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            StoreError::Integrity(db.to_string())
        }
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::AlreadyExists(db.to_string())
        }
        sqlx::Error::Database(db) if db.is_check_violation() => {
            StoreError::Integrity(db.to_string())
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(e.to_string()),
        _ => StoreError::Connection(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn store() -> (SqliteStore, TempDir) {
        let root = TempDir::new().expect("tempdir");
        let store = SqliteStore::connect_in_memory(root.path())
            .await
            .expect("store");
        (store, root)
    }

    async fn seed_project(store: &SqliteStore, id: &str) -> Project {
        store
            .create_project(NewProject::new("demo", "space whales").with_id(id))
            .await
            .expect("create project")
    }

    #[tokio::test]
    async fn test_create_project_builds_subtree_and_is_idempotent() {
        let (store, root) = store().await;
        let project = seed_project(&store, "p1").await;
        assert_eq!(project.status, ProjectStatus::Initialized);
        for subdir in layout::PROJECT_SUBTREE {
            assert!(root.path().join("p1").join(subdir).is_dir(), "{subdir}");
        }

        // identical input returns the existing row
        let again = store
            .create_project(NewProject::new("demo", "space whales").with_id("p1"))
            .await
            .expect("idempotent create");
        assert_eq!(again.created_at, project.created_at);

        // same id, different attributes, is a conflict
        let conflict = store
            .create_project(NewProject::new("other", "space whales").with_id("p1"))
            .await;
        assert!(matches!(conflict, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_generated_ids_are_date_sortable() {
        let (store, _root) = store().await;
        let first = store
            .create_project(NewProject::new("a", "t"))
            .await
            .expect("first");
        let second = store
            .create_project(NewProject::new("b", "t"))
            .await
            .expect("second");
        assert!(first.id.ends_with("_001"), "{}", first.id);
        assert!(second.id.ends_with("_002"), "{}", second.id);
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn test_project_status_transition_validation() {
        let (store, _root) = store().await;
        seed_project(&store, "p1").await;

        let jump = store
            .update_project_status("p1", ProjectStatus::Completed)
            .await;
        assert!(matches!(jump, Err(StoreError::Invalid(_))));

        store
            .update_project_status("p1", ProjectStatus::Processing)
            .await
            .expect("to processing");
        store
            .update_project_status("p1", ProjectStatus::Completed)
            .await
            .expect("to completed");

        let reopen = store
            .update_project_status("p1", ProjectStatus::Processing)
            .await;
        assert!(matches!(reopen, Err(StoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_stage_records_roundtrip_and_transitions() {
        let (store, _root) = store().await;
        seed_project(&store, "p1").await;
        let stages = vec![StageDef::new("script"), StageDef::new("audio")];
        store
            .create_stage_records("p1", &stages)
            .await
            .expect("create records");
        // repeat with identical input is a no-op
        store
            .create_stage_records("p1", &stages)
            .await
            .expect("idempotent records");

        let records = store.stage_records("p1").await.expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "script");
        assert_eq!(records[0].position, 0);
        assert_eq!(records[0].status, StageStatus::Pending);

        store
            .update_stage_status(
                "p1",
                "script",
                StageUpdate::to_status(StageStatus::Running).with_input(json!({"k": 1})),
            )
            .await
            .expect("to running");
        store
            .update_stage_status(
                "p1",
                "script",
                StageUpdate::to_status(StageStatus::Completed)
                    .with_output(json!({"text": "done"}))
                    .with_elapsed(1.5),
            )
            .await
            .expect("to completed");

        let record = store
            .stage_record("p1", "script")
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(record.status, StageStatus::Completed);
        assert_eq!(record.output_summary, Some(json!({"text": "done"})));
        assert!(record.started_at.is_some());
        assert!(record.completed_at.is_some());
        assert!(record.completed_at >= record.started_at);

        let illegal = store
            .update_stage_status("p1", "script", StageUpdate::to_status(StageStatus::Running))
            .await;
        assert!(matches!(illegal, Err(StoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_oversized_output_summary_rejected() {
        let (store, _root) = store().await;
        seed_project(&store, "p1").await;
        store
            .create_stage_records("p1", &[StageDef::new("s")])
            .await
            .expect("records");
        let huge = json!({"blob": "x".repeat(MAX_OUTPUT_SUMMARY_BYTES + 1)});
        let result = store
            .update_stage_status("p1", "s", StageUpdate::default().with_output(huge))
            .await;
        assert!(matches!(result, Err(StoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_artifact_ledger_register_and_query() {
        let (store, _root) = store().await;
        seed_project(&store, "p1").await;
        let id = store
            .register_artifact(
                NewArtifact::new(
                    "p1",
                    ArtifactType::Audio,
                    ArtifactCategory::Output,
                    "files/audio/take1.wav",
                    1024,
                )
                .with_stage("audio"),
            )
            .await
            .expect("register");
        assert!(id > 0);

        let hits = store
            .query_artifacts(
                "p1",
                &ArtifactQuery::for_stage("audio").of_type(ArtifactType::Audio),
            )
            .await
            .expect("query");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_name, "take1.wav");
        assert_eq!(hits[0].size_bytes, 1024);

        let misses = store
            .query_artifacts("p1", &ArtifactQuery::for_stage("video"))
            .await
            .expect("query");
        assert!(misses.is_empty());

        // unknown project violates the foreign key
        let orphan = store
            .register_artifact(NewArtifact::new(
                "ghost",
                ArtifactType::Audio,
                ArtifactCategory::Output,
                "files/audio/x.wav",
                1,
            ))
            .await;
        assert!(matches!(orphan, Err(StoreError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_delete_project_cascades_and_severs_usage() {
        let (store, root) = store().await;
        seed_project(&store, "p1").await;
        store
            .create_stage_records("p1", &[StageDef::new("s")])
            .await
            .expect("records");
        store
            .register_artifact(NewArtifact::new(
                "p1",
                ArtifactType::Script,
                ArtifactCategory::Final,
                "files/scripts/s.md",
                10,
            ))
            .await
            .expect("artifact");
        store
            .record_api_usage(
                &ApiUsageRecord::new("llm", "/v1/generate")
                    .for_project("p1")
                    .with_tokens(100, 50)
                    .with_cost(0.02),
            )
            .await
            .expect("usage");

        assert!(store.delete_project("p1").await.expect("delete"));
        assert!(store.get_project("p1").await.expect("get").is_none());
        assert!(store.stage_records("p1").await.expect("records").is_empty());
        assert!(store.list_artifacts("p1").await.expect("arts").is_empty());
        assert!(!root.path().join("p1").exists());

        // billing row survives with severed attribution
        let summary = store
            .api_usage_summary(Some("llm"), Utc::now() - chrono::Duration::hours(1))
            .await
            .expect("summary");
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].call_count, 1);
        assert_eq!(summary[0].tokens_input, 100);
    }

    #[tokio::test]
    async fn test_system_config_typed_roundtrip() {
        let (store, _root) = store().await;
        store
            .set_config(
                "max_concurrent_stages",
                ConfigValue::Integer(8),
                Some("worker cap"),
                Some("ops"),
            )
            .await
            .expect("set");
        store
            .set_config("max_concurrent_stages", ConfigValue::Integer(2), None, None)
            .await
            .expect("overwrite");

        let entry = store
            .get_config("max_concurrent_stages")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(entry.value, ConfigValue::Integer(2));
        assert!(store.get_config("missing").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_external_reference_recorded() {
        let (store, _root) = store().await;
        seed_project(&store, "p1").await;
        store
            .set_external_reference("p1", "yt-abc123", Some("https://example.com/watch?v=abc123"))
            .await
            .expect("set");
        let project = store.get_project("p1").await.expect("get").expect("exists");
        assert_eq!(project.external_id.as_deref(), Some("yt-abc123"));
        assert!(project.external_url.as_deref().expect("url").contains("abc123"));

        assert!(matches!(
            store.set_external_reference("ghost", "x", None).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stats_recording() {
        let (store, _root) = store().await;
        seed_project(&store, "p1").await;
        store
            .record_stat("p1", Some("audio"), "bytes_written", 2048.0, Some("bytes"))
            .await
            .expect("stat");
        let stats = store.project_stats("p1").await.expect("stats");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "bytes_written");
        assert_eq!(stats[0].stage_name.as_deref(), Some("audio"));
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let (store, _root) = store().await;
        // connect already migrated; a second call applies nothing
        let applied = store.migrate().await.expect("migrate");
        assert!(applied.is_empty());
        assert_eq!(store.schema_version().await.expect("version"), 1);
    }

    #[tokio::test]
    async fn test_migrate_refuses_downgrade() {
        let (store, _root) = store().await;
        sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (999, ?)")
            .bind(Utc::now())
            .execute(store.pool())
            .await
            .expect("insert");
        assert!(matches!(
            store.migrate().await,
            Err(StoreError::Migration(_))
        ));
    }

    #[tokio::test]
    async fn test_backup_writes_snapshot() {
        let root = TempDir::new().expect("tempdir");
        let store = SqliteStore::connect(&root.path().join("data/store.db"), root.path())
            .await
            .expect("store");
        seed_project(&store, "p1").await;

        let backup_path = root.path().join("backups/store.db");
        store.backup(&backup_path).await.expect("backup");
        assert!(backup_path.is_file());

        let restored = SqliteStore::connect(&backup_path, root.path())
            .await
            .expect("open backup");
        assert!(restored.get_project("p1").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn test_health_check_reports_counts() {
        let (store, _root) = store().await;
        seed_project(&store, "p1").await;
        match store.health_check().await {
            HealthStatus::Healthy { project_count, .. } => assert_eq!(project_count, 1),
            HealthStatus::Degraded { reason } => panic!("degraded: {reason}"),
        }
    }

    #[tokio::test]
    async fn test_list_projects_filtering() {
        let (store, _root) = store().await;
        seed_project(&store, "p1").await;
        seed_project(&store, "p2").await;
        store
            .update_project_status("p2", ProjectStatus::Processing)
            .await
            .expect("status");

        let all = store
            .list_projects(&ProjectFilter::default())
            .await
            .expect("list");
        assert_eq!(all.len(), 2);

        let processing = store
            .list_projects(&ProjectFilter {
                status: Some(ProjectStatus::Processing),
                ..Default::default()
            })
            .await
            .expect("list");
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id, "p2");
    }
}
