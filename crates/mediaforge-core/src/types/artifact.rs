//! Artifact ledger row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Logical artifact type, mapped onto the `files/` subtree by the layout
/// helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Audio,
    Video,
    Image,
    Script,
    Subtitle,
    Metadata,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Image => "image",
            Self::Script => "script",
            Self::Subtitle => "subtitle",
            Self::Metadata => "metadata",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            "image" => Some(Self::Image),
            "script" => Some(Self::Script),
            "subtitle" => Some(Self::Subtitle),
            "metadata" => Some(Self::Metadata),
            _ => None,
        }
    }
}

/// Where the artifact sits in the stage's data flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactCategory {
    Input,
    Output,
    Intermediate,
    Final,
}

impl ArtifactCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Intermediate => "intermediate",
            Self::Final => "final",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "input" => Some(Self::Input),
            "output" => Some(Self::Output),
            "intermediate" => Some(Self::Intermediate),
            "final" => Some(Self::Final),
            _ => None,
        }
    }
}

/// One entry of the file ledger. Paths are stored relative to the project
/// root; absolute paths are resolved by the workspace on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: i64,
    pub project_id: String,
    /// Stage that produced the artifact, when attributable.
    #[serde(default)]
    pub stage_name: Option<String>,
    pub artifact_type: ArtifactType,
    pub category: ArtifactCategory,
    pub rel_path: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub is_temporary: bool,
}

/// Insert payload for the ledger.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub project_id: String,
    pub stage_name: Option<String>,
    pub artifact_type: ArtifactType,
    pub category: ArtifactCategory,
    pub rel_path: String,
    pub size_bytes: u64,
    pub metadata: Value,
    pub is_temporary: bool,
}

impl NewArtifact {
    pub fn new(
        project_id: impl Into<String>,
        artifact_type: ArtifactType,
        category: ArtifactCategory,
        rel_path: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            stage_name: None,
            artifact_type,
            category,
            rel_path: rel_path.into(),
            size_bytes,
            metadata: Value::Object(Default::default()),
            is_temporary: false,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage_name = Some(stage.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn temporary(mut self) -> Self {
        self.is_temporary = true;
        self
    }
}

/// Equality predicate for ledger queries.
#[derive(Debug, Clone, Default)]
pub struct ArtifactQuery {
    pub stage_name: Option<String>,
    pub artifact_type: Option<ArtifactType>,
    pub category: Option<ArtifactCategory>,
}

impl ArtifactQuery {
    pub fn for_stage(stage: impl Into<String>) -> Self {
        Self {
            stage_name: Some(stage.into()),
            ..Self::default()
        }
    }

    pub fn of_type(mut self, artifact_type: ArtifactType) -> Self {
        self.artifact_type = Some(artifact_type);
        self
    }

    pub fn in_category(mut self, category: ArtifactCategory) -> Self {
        self.category = Some(category);
        self
    }
}
