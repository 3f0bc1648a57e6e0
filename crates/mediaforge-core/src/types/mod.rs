//! Domain types shared across the workspace.
//!
//! - Project: the aggregate root a workflow runs against
//! - StageDef / StageRecord: declarative stage definition and its persisted state
//! - ArtifactRef: one row of the file ledger
//! - telemetry rows (statistics, API usage, system configuration)

mod artifact;
mod project;
mod stage;
mod telemetry;

pub use artifact::{ArtifactCategory, ArtifactQuery, ArtifactRef, ArtifactType, NewArtifact};
pub use project::{
    validate_project_id, NewProject, Project, ProjectFilter, ProjectId, ProjectStatus,
};
pub use stage::{
    FailurePolicy, StageDef, StagePriority, StageRecord, StageStatus, StageUpdate,
};
pub use telemetry::{
    ApiUsageRecord, ApiUsageSummary, ConfigValue, StatRecord, SystemConfigEntry,
};
