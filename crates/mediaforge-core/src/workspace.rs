//! Workspace abstractions.
//!
//! This module defines storage-neutral contracts for the artifact workspace;
//! the implementation lives in `mediaforge-files`. Stage processors interact
//! with the filesystem only through [`ArtifactWriter`], which keeps every
//! write attributed to the executing stage and under the project root.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::StoreError;
use crate::types::{ArtifactCategory, ArtifactRef, ArtifactType};

/// Workspace error types.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("path escapes project root: {0}")]
    PathTraversal(String),

    #[error("project byte quota exceeded: {used} + {requested} > {limit}")]
    QuotaExceeded {
        used: u64,
        requested: u64,
        limit: u64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid project id: {0}")]
    InvalidProjectId(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] StoreError),
}

impl From<std::io::Error> for WorkspaceError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// Options accompanying an artifact write.
#[derive(Debug, Clone)]
pub struct ArtifactOptions {
    pub artifact_type: ArtifactType,
    pub category: ArtifactCategory,
    pub is_temporary: bool,
    pub metadata: Value,
}

impl ArtifactOptions {
    pub fn new(artifact_type: ArtifactType, category: ArtifactCategory) -> Self {
        Self {
            artifact_type,
            category,
            is_temporary: false,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn temporary(mut self) -> Self {
        self.is_temporary = true;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Artifact-write facility exposed to stage processors through the context.
#[async_trait]
pub trait ArtifactWriter: Send + Sync {
    /// Atomically write `bytes` at `rel_path` under the project root and
    /// register the ledger entry, attributed to the bound stage.
    async fn write(
        &self,
        rel_path: &str,
        bytes: &[u8],
        options: ArtifactOptions,
    ) -> Result<ArtifactRef, WorkspaceError>;

    /// Resolve a ledger-relative path to an absolute one.
    async fn resolve(&self, rel_path: &str) -> Result<PathBuf, WorkspaceError>;

    /// Read an artifact's bytes.
    async fn read(&self, rel_path: &str) -> Result<Vec<u8>, WorkspaceError>;
}

/// Reconciliation decision mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    #[default]
    ReportOnly,
    AutoRepair,
}

/// One ledger/disk disagreement found during reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconcileFinding {
    /// File on disk with no ledger entry.
    Orphan { rel_path: String, size_bytes: u64 },
    /// Ledger entry whose file is absent.
    Missing { artifact_id: i64, rel_path: String },
    /// Sizes disagree between ledger and disk.
    SizeMismatch {
        artifact_id: i64,
        rel_path: String,
        ledger_bytes: u64,
        disk_bytes: u64,
    },
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub project_id: String,
    pub mode: ReconcileMode,
    pub findings: Vec<ReconcileFinding>,
    /// Number of findings repaired (0 in report-only mode).
    pub repaired: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}
