//! On-disk project layout.
//!
//! ```text
//! {projects_root}/{project_id}/
//!   files/{audio|video|images|scripts|metadata}/
//!   logs/
//!   cache/
//!   checkpoints/
//! ```
//!
//! Both the store (which creates the subtree with the project row) and the
//! workspace (which writes artifacts into it) go through this module so the
//! layout is defined exactly once.

use std::path::{Path, PathBuf};

use crate::types::ArtifactType;

/// Subtree of a project that holds ledger-tracked artifacts.
pub const FILES_DIR: &str = "files";
pub const LOGS_DIR: &str = "logs";
pub const CACHE_DIR: &str = "cache";
pub const CHECKPOINTS_DIR: &str = "checkpoints";

/// Every directory created for a fresh project, relative to the project root.
pub const PROJECT_SUBTREE: &[&str] = &[
    "files/audio",
    "files/video",
    "files/images",
    "files/scripts",
    "files/metadata",
    LOGS_DIR,
    CACHE_DIR,
    CHECKPOINTS_DIR,
];

/// Absolute path of a project's root directory.
pub fn project_dir(projects_root: &Path, project_id: &str) -> PathBuf {
    projects_root.join(project_id)
}

/// Absolute path of a project's checkpoint directory.
pub fn checkpoints_dir(projects_root: &Path, project_id: &str) -> PathBuf {
    project_dir(projects_root, project_id).join(CHECKPOINTS_DIR)
}

/// Default artifact directory (relative to the project root) for a type.
pub fn artifact_dir(artifact_type: ArtifactType) -> &'static str {
    match artifact_type {
        ArtifactType::Audio => "files/audio",
        ArtifactType::Video => "files/video",
        ArtifactType::Image => "files/images",
        ArtifactType::Script => "files/scripts",
        ArtifactType::Subtitle | ArtifactType::Metadata => "files/metadata",
    }
}
