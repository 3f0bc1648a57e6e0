//! Stage type definitions
//!
//! `StageDef` is the declarative description a workflow is registered with;
//! `StageRecord` is the persisted per-(project, stage) execution state.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stage execution status with the state machine from the scheduler:
///
/// ```text
/// pending ──► running ──► completed
///            │          └► failed ──► (retry) running
///            │                     └► (give up) failed (terminal)
///            └► skipped
/// ```
///
/// `cancelled` is reachable from `pending` or `running` when the whole
/// execution is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Cancelled)
    }

    /// Whether a transition to `next` is legal.
    pub fn can_transition_to(&self, next: StageStatus) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                StageStatus::Running | StageStatus::Skipped | StageStatus::Cancelled
            ),
            Self::Running => matches!(
                next,
                StageStatus::Completed | StageStatus::Failed | StageStatus::Cancelled
            ),
            // failed stages may be re-driven while retries remain
            Self::Failed => matches!(next, StageStatus::Running | StageStatus::Skipped),
            Self::Completed | Self::Skipped | Self::Cancelled => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Stage priority - a tiebreaker for dispatch order within a phase.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum StagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// What happens to dependents when a stage exhausts its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The failure fails the whole workflow once its phase completes.
    #[default]
    FailWorkflow,
    /// Dependents are marked skipped and the rest of the plan continues.
    SkipDependents,
}

fn default_retry_count() -> u32 {
    3
}

/// Declarative stage definition within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDef {
    /// Unique name within the workflow.
    pub name: String,
    /// Names of stages that must complete before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: StagePriority,
    /// Wall-clock timeout; the engine default applies when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Retry budget: the stage is attempted at most `retry_count + 1` times.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default)]
    pub can_skip: bool,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Named resources held simultaneously for the duration of execution.
    #[serde(default)]
    pub required_resources: BTreeSet<String>,
    /// Optimistic duration estimate used for progress reporting.
    #[serde(default)]
    pub estimated_duration_secs: f64,
}

impl StageDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            priority: StagePriority::Normal,
            timeout_secs: None,
            retry_count: default_retry_count(),
            can_skip: false,
            failure_policy: FailurePolicy::FailWorkflow,
            required_resources: BTreeSet::new(),
            estimated_duration_secs: 0.0,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_priority(mut self, priority: StagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_estimated_duration(mut self, secs: f64) -> Self {
        self.estimated_duration_secs = secs;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Persisted execution state of one (project, stage) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub project_id: String,
    pub name: String,
    /// Ordinal position in the registered workflow.
    pub position: u32,
    pub status: StageStatus,
    #[serde(default)]
    pub input_params: Option<Value>,
    #[serde(default)]
    pub output_summary: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub retry_count: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub elapsed_secs: Option<f64>,
}

/// Mutation payload for a stage status transition.
///
/// The store fills `started_at` / `completed_at` from its own clock when the
/// transition enters or leaves `running`.
#[derive(Debug, Clone, Default)]
pub struct StageUpdate {
    pub status: Option<StageStatus>,
    pub input_params: Option<Value>,
    pub output_summary: Option<Value>,
    pub error_message: Option<String>,
    pub retry_count: Option<u32>,
    pub elapsed_secs: Option<f64>,
}

impl StageUpdate {
    pub fn to_status(status: StageStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input_params = Some(input);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output_summary = Some(output);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = Some(retries);
        self
    }

    pub fn with_elapsed(mut self, secs: f64) -> Self {
        self.elapsed_secs = Some(secs);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_transitions() {
        use StageStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Skipped));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Failed.can_transition_to(Running));
        assert!(Failed.can_transition_to(Skipped));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Skipped.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Running));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(StagePriority::Critical > StagePriority::High);
        assert!(StagePriority::High > StagePriority::Normal);
        assert!(StagePriority::Normal > StagePriority::Low);
    }

    #[test]
    fn test_stage_def_builder() {
        let def = StageDef::new("render")
            .with_dependencies(vec!["script".to_string()])
            .with_priority(StagePriority::High)
            .with_timeout(Duration::from_secs(120))
            .with_resources(["video_encoder"])
            .with_retries(1);

        assert_eq!(def.name, "render");
        assert_eq!(def.timeout(), Some(Duration::from_secs(120)));
        assert!(def.required_resources.contains("video_encoder"));
        assert_eq!(def.retry_count, 1);
    }

    #[test]
    fn test_stage_def_serde_defaults() {
        let def: StageDef = serde_json::from_str(r#"{"name":"compose"}"#).expect("parse");
        assert_eq!(def.retry_count, 3);
        assert_eq!(def.priority, StagePriority::Normal);
        assert_eq!(def.failure_policy, FailurePolicy::FailWorkflow);
        assert!(def.dependencies.is_empty());
    }
}
