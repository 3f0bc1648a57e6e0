//! StageResult type definition

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Failure classification, mirroring the engine-wide error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input; never retried.
    Validation,
    /// Workflow graph problem surfaced at runtime.
    Dependency,
    /// Resource arbitration failure (deadlock refusal, quota).
    Resource,
    /// Stage wall-clock exceeded.
    Timeout,
    /// The processor's own failure.
    Execution,
    /// Store I/O failure.
    Store,
    /// Filesystem I/O failure.
    Filesystem,
    /// Cancellation propagated through the context.
    Cancelled,
    /// Ledger/store/checkpoint disagreement.
    Integrity,
}

impl ErrorKind {
    /// Kinds that never participate in retry regardless of declared action.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Validation | Self::Cancelled | Self::Integrity)
    }
}

/// Severity declared by the failing processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Recovery action declared by the failing processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    #[default]
    Retry,
    Skip,
    Abort,
    Manual,
}

/// Structured stage failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: ErrorKind,
    #[serde(default)]
    pub severity: ErrorSeverity,
    #[serde(default)]
    pub action: RecoveryAction,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl StageFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: ErrorSeverity::default(),
            action: RecoveryAction::default(),
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_action(mut self, action: RecoveryAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = details;
        self
    }

    /// Whether the scheduler may re-attempt the stage.
    pub fn is_retryable(&self) -> bool {
        self.action == RecoveryAction::Retry && !self.kind.is_fatal()
    }
}

/// Stage execution result - a tagged sum the engine matches on without
/// structural introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageResult {
    /// Execution succeeded; `output` feeds dependent stages' input maps.
    Success {
        #[serde(default)]
        output: Map<String, Value>,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    /// Execution failed with declared recovery semantics.
    Failure { failure: StageFailure },
}

impl StageResult {
    /// Convenience: success with no output.
    pub fn success() -> Self {
        Self::Success {
            output: Map::new(),
            metadata: Map::new(),
        }
    }

    /// Convenience: success with an output summary.
    pub fn success_with(output: Map<String, Value>) -> Self {
        Self::Success {
            output,
            metadata: Map::new(),
        }
    }

    /// Convenience: success with a single output key.
    pub fn success_with_one(key: impl Into<String>, value: Value) -> Self {
        let mut output = Map::new();
        output.insert(key.into(), value);
        Self::success_with(output)
    }

    /// Convenience: failure from a structured classification.
    pub fn failure(failure: StageFailure) -> Self {
        Self::Failure { failure }
    }

    /// Convenience: retryable execution failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Failure {
            failure: StageFailure::new(ErrorKind::Execution, message)
                .with_action(RecoveryAction::Retry),
        }
    }

    /// Convenience: terminal execution failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Failure {
            failure: StageFailure::new(ErrorKind::Execution, message)
                .with_severity(ErrorSeverity::High)
                .with_action(RecoveryAction::Abort),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retryability_classification() {
        assert!(StageFailure::new(ErrorKind::Execution, "flaky").is_retryable());
        assert!(StageFailure::new(ErrorKind::Timeout, "slow").is_retryable());
        assert!(!StageFailure::new(ErrorKind::Validation, "bad input").is_retryable());
        assert!(!StageFailure::new(ErrorKind::Cancelled, "stopped").is_retryable());
        assert!(!StageFailure::new(ErrorKind::Execution, "broken")
            .with_action(RecoveryAction::Abort)
            .is_retryable());
    }

    #[test]
    fn test_result_serde_tagging() {
        let result = StageResult::success_with_one("x", json!(1));
        let encoded = serde_json::to_value(&result).expect("encode");
        assert_eq!(encoded["type"], "success");
        assert_eq!(encoded["output"]["x"], 1);

        let failure = StageResult::retryable("rate limited");
        let encoded = serde_json::to_value(&failure).expect("encode");
        assert_eq!(encoded["type"], "failure");
        assert_eq!(encoded["failure"]["kind"], "execution");
    }
}
