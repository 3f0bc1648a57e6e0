//! Store trait seams.
//!
//! The engine and workspace depend on these traits only; the SQLite
//! implementation lives in `mediaforge-store`. All operations that mutate
//! more than one row must be transactional in the implementation: no
//! operation leaves partial state behind on error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{
    ApiUsageRecord, ApiUsageSummary, ArtifactQuery, ArtifactRef, ConfigValue, NewArtifact,
    NewProject, Project, ProjectFilter, ProjectStatus, StageDef, StageRecord, StageUpdate,
    StatRecord, SystemConfigEntry,
};

/// Store error types.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    /// Constraint violations (foreign key, not-null, status machine).
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("migration error: {0}")]
    Migration(String),
}

/// Project and stage-record persistence.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Atomically insert the project row and create its on-disk subtree.
    ///
    /// Idempotent on identical input: a second call returns the existing
    /// project. A colliding ID with different attributes is
    /// [`StoreError::AlreadyExists`].
    async fn create_project(&self, new: NewProject) -> Result<Project, StoreError>;

    async fn get_project(&self, project_id: &str) -> Result<Option<Project>, StoreError>;

    async fn list_projects(&self, filter: &ProjectFilter) -> Result<Vec<Project>, StoreError>;

    /// Apply a lifecycle transition; illegal transitions are
    /// [`StoreError::Invalid`].
    async fn update_project_status(
        &self,
        project_id: &str,
        status: ProjectStatus,
    ) -> Result<(), StoreError>;

    async fn set_estimated_duration(&self, project_id: &str, secs: f64)
        -> Result<(), StoreError>;

    async fn set_actual_duration(&self, project_id: &str, secs: f64) -> Result<(), StoreError>;

    /// Record identifiers assigned by an external publishing target.
    async fn set_external_reference(
        &self,
        project_id: &str,
        external_id: &str,
        external_url: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Delete the project and everything it transitively owns; api_usage
    /// rows keep a severed NULL attribution. Returns whether a row existed.
    async fn delete_project(&self, project_id: &str) -> Result<bool, StoreError>;

    /// Bulk-insert stage records in one transaction; idempotent on repeat
    /// with identical definitions.
    async fn create_stage_records(
        &self,
        project_id: &str,
        stages: &[StageDef],
    ) -> Result<(), StoreError>;

    async fn stage_records(&self, project_id: &str) -> Result<Vec<StageRecord>, StoreError>;

    async fn stage_record(
        &self,
        project_id: &str,
        stage_name: &str,
    ) -> Result<Option<StageRecord>, StoreError>;

    /// Apply a stage transition; the store validates it against the stage
    /// state machine and maintains start/completion timestamps.
    async fn update_stage_status(
        &self,
        project_id: &str,
        stage_name: &str,
        update: StageUpdate,
    ) -> Result<(), StoreError>;

    /// Overwrite a project's stage rows from a checkpoint, in one
    /// transaction.
    async fn replace_stage_records(
        &self,
        project_id: &str,
        records: &[StageRecord],
    ) -> Result<(), StoreError>;
}

/// File-artifact ledger persistence.
#[async_trait]
pub trait ArtifactLedger: Send + Sync {
    async fn register_artifact(&self, artifact: NewArtifact) -> Result<i64, StoreError>;

    async fn list_artifacts(&self, project_id: &str) -> Result<Vec<ArtifactRef>, StoreError>;

    async fn query_artifacts(
        &self,
        project_id: &str,
        query: &ArtifactQuery,
    ) -> Result<Vec<ArtifactRef>, StoreError>;

    async fn delete_artifact(&self, artifact_id: i64) -> Result<bool, StoreError>;

    async fn update_artifact_size(
        &self,
        artifact_id: i64,
        size_bytes: u64,
    ) -> Result<(), StoreError>;

    /// Temporary artifacts created before the cutoff.
    async fn temporary_artifacts(
        &self,
        project_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ArtifactRef>, StoreError>;
}

/// Statistics, API usage, and process-wide configuration rows.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn record_api_usage(&self, usage: &ApiUsageRecord) -> Result<(), StoreError>;

    /// Per-provider aggregates since the given instant; `provider` narrows
    /// the report to one provider.
    async fn api_usage_summary(
        &self,
        provider: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<ApiUsageSummary>, StoreError>;

    async fn record_stat(
        &self,
        project_id: &str,
        stage_name: Option<&str>,
        name: &str,
        value: f64,
        unit: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn project_stats(&self, project_id: &str) -> Result<Vec<StatRecord>, StoreError>;

    async fn set_config(
        &self,
        key: &str,
        value: ConfigValue,
        description: Option<&str>,
        updated_by: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn get_config(&self, key: &str) -> Result<Option<SystemConfigEntry>, StoreError>;
}
