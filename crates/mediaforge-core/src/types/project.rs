//! Project type definitions
//!
//! A project is the aggregate root: it exclusively owns stage records,
//! ledger entries, statistics and checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type alias for project IDs.
///
/// Generated IDs use the human-sortable `YYYYMMDD_nnn` scheme; caller-supplied
/// IDs (including UUIDs) are accepted when they pass [`validate_project_id`].
pub type ProjectId = String;

const MAX_PROJECT_ID_LEN: usize = 64;

/// Validate a caller-supplied project ID.
///
/// IDs double as directory names under the projects root, so the accepted
/// alphabet is deliberately narrow.
pub fn validate_project_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_PROJECT_ID_LEN
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-'))
}

/// Project lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Initialized,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ProjectStatus {
    /// Check if the project is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition to `next` is legal.
    ///
    /// There is no shortcut from `initialized` straight to `completed`; a
    /// project must pass through `processing`.
    pub fn can_transition_to(&self, next: ProjectStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::Initialized => matches!(next, Self::Processing | Self::Cancelled),
            Self::Processing => {
                matches!(next, Self::Completed | Self::Failed | Self::Cancelled)
            }
            // Failed and cancelled projects may be re-driven after recovery.
            Self::Failed | Self::Cancelled => matches!(next, Self::Processing),
            Self::Completed => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "initialized" => Some(Self::Initialized),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Project aggregate root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Free-form theme string driving content generation.
    pub theme: String,
    /// Target output length in minutes (>= 1).
    pub target_length_minutes: u32,
    pub status: ProjectStatus,
    /// Opaque configuration blob owned by the caller.
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub estimated_duration_secs: Option<f64>,
    #[serde(default)]
    pub actual_duration_secs: Option<f64>,
    /// Externally-assigned output identifiers (e.g. a published video ID).
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub external_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for creating a project.
#[derive(Debug, Clone)]
pub struct NewProject {
    /// Caller-supplied ID; a `YYYYMMDD_nnn` ID is generated when absent.
    pub id: Option<ProjectId>,
    pub name: String,
    pub theme: String,
    pub target_length_minutes: u32,
    pub config: Value,
}

impl NewProject {
    pub fn new(name: impl Into<String>, theme: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            theme: theme.into(),
            target_length_minutes: 5,
            config: Value::Object(Default::default()),
        }
    }

    pub fn with_id(mut self, id: impl Into<ProjectId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_target_length(mut self, minutes: u32) -> Self {
        self.target_length_minutes = minutes;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Read filter for project listings.
#[derive(Debug, Clone, Default)]
pub struct ProjectFilter {
    pub status: Option<ProjectStatus>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_validation() {
        assert!(validate_project_id("20260802_001"));
        assert!(validate_project_id("550e8400-e29b-41d4-a716-446655440000"));
        assert!(!validate_project_id(""));
        assert!(!validate_project_id("../escape"));
        assert!(!validate_project_id("white space"));
        assert!(!validate_project_id(&"x".repeat(65)));
    }

    #[test]
    fn test_status_transitions() {
        use ProjectStatus::*;
        assert!(Initialized.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Processing));
        assert!(Cancelled.can_transition_to(Processing));
        // no shortcut past processing
        assert!(!Initialized.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
    }

    #[test]
    fn test_terminal_states() {
        assert!(ProjectStatus::Completed.is_terminal());
        assert!(ProjectStatus::Failed.is_terminal());
        assert!(ProjectStatus::Cancelled.is_terminal());
        assert!(!ProjectStatus::Processing.is_terminal());
        assert!(!ProjectStatus::Initialized.is_terminal());
    }
}
