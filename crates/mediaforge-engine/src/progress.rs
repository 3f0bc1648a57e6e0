//! Execution progress reporting.
//!
//! Snapshots are pushed to the caller's [`ProgressSink`] after state-relevant
//! transitions, rate-limited so bursty phases cannot storm the caller;
//! terminal transitions always flush.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use mediaforge_core::types::StageStatus;

/// Minimum interval between non-forced emissions.
const EMIT_INTERVAL: Duration = Duration::from_millis(100);

/// Point-in-time view of a running execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSnapshot {
    pub project_id: String,
    pub workflow: String,
    pub total_stages: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// completed / total.
    pub percent_complete: f64,
    /// Remaining estimate divided by the effective parallelism.
    pub estimated_remaining_secs: f64,
    pub started_at: DateTime<Utc>,
    pub is_paused: bool,
    pub is_cancelled: bool,
}

/// Sink interface for execution progress reporting.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, snapshot: ExecutionSnapshot);
}

/// Mutable execution state shared between the scheduler loop and workers.
pub(crate) struct RunState {
    pub project_id: String,
    pub workflow: String,
    pub started_at: DateTime<Utc>,
    statuses: HashMap<String, StageStatus>,
    estimates: HashMap<String, f64>,
    max_concurrency: usize,
    pub is_paused: bool,
    pub is_cancelled: bool,
}

impl RunState {
    pub fn new(
        project_id: impl Into<String>,
        workflow: impl Into<String>,
        statuses: HashMap<String, StageStatus>,
        estimates: HashMap<String, f64>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            workflow: workflow.into(),
            started_at: Utc::now(),
            statuses,
            estimates,
            max_concurrency,
            is_paused: false,
            is_cancelled: false,
        }
    }

    pub fn status(&self, stage: &str) -> Option<StageStatus> {
        self.statuses.get(stage).copied()
    }

    pub fn set_status(&mut self, stage: &str, status: StageStatus) {
        self.statuses.insert(stage.to_string(), status);
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.statuses.values().filter(|s| **s == status).count()
    }

    pub fn any_failed(&self) -> bool {
        self.statuses.values().any(|s| *s == StageStatus::Failed)
    }

    pub fn stages_in(&self, status: StageStatus) -> Vec<String> {
        let mut names: Vec<String> = self
            .statuses
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        let total = self.statuses.len();
        let completed = self.count(StageStatus::Completed);
        let skipped = self.count(StageStatus::Skipped);
        let remaining_estimate: f64 = self
            .statuses
            .iter()
            .filter(|(_, s)| !matches!(s, StageStatus::Completed | StageStatus::Skipped))
            .map(|(name, _)| self.estimates.get(name).copied().unwrap_or(0.0))
            .sum();
        let in_progress = self.count(StageStatus::Running) + self.count(StageStatus::Pending);
        let parallelism = self.max_concurrency.min(in_progress.max(1)).max(1) as f64;

        ExecutionSnapshot {
            project_id: self.project_id.clone(),
            workflow: self.workflow.clone(),
            total_stages: total,
            pending: self.count(StageStatus::Pending),
            running: self.count(StageStatus::Running),
            completed,
            failed: self.count(StageStatus::Failed),
            skipped,
            cancelled: self.count(StageStatus::Cancelled),
            percent_complete: if total == 0 {
                100.0
            } else {
                (completed + skipped) as f64 / total as f64 * 100.0
            },
            estimated_remaining_secs: remaining_estimate / parallelism,
            started_at: self.started_at,
            is_paused: self.is_paused,
            is_cancelled: self.is_cancelled,
        }
    }
}

/// Rate-limited snapshot emitter shared by the loop and its workers.
pub(crate) struct ProgressEmitter {
    sink: Option<Arc<dyn ProgressSink>>,
    last_emit: RwLock<Option<Instant>>,
}

impl ProgressEmitter {
    pub fn new(sink: Option<Arc<dyn ProgressSink>>) -> Self {
        Self {
            sink,
            last_emit: RwLock::new(None),
        }
    }

    /// Emit a snapshot. Non-forced emissions within the rate window are
    /// coalesced away; terminal transitions pass `force` so the last state
    /// always reaches the caller.
    pub async fn emit(&self, snapshot: ExecutionSnapshot, force: bool) {
        let Some(sink) = &self.sink else {
            return;
        };
        {
            let mut last = self.last_emit.write().expect("emit lock");
            if !force {
                if let Some(at) = *last {
                    if at.elapsed() < EMIT_INTERVAL {
                        return;
                    }
                }
            }
            *last = Some(Instant::now());
        }
        sink.report(snapshot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct CountingSink {
        seen: Mutex<Vec<ExecutionSnapshot>>,
    }

    #[async_trait]
    impl ProgressSink for CountingSink {
        async fn report(&self, snapshot: ExecutionSnapshot) {
            self.seen.lock().await.push(snapshot);
        }
    }

    fn state() -> RunState {
        let statuses = [
            ("a", StageStatus::Completed),
            ("b", StageStatus::Running),
            ("c", StageStatus::Pending),
            ("d", StageStatus::Pending),
        ]
        .into_iter()
        .map(|(name, status)| (name.to_string(), status))
        .collect();
        let estimates = [("b", 30.0), ("c", 30.0), ("d", 60.0)]
            .into_iter()
            .map(|(name, est)| (name.to_string(), est))
            .collect();
        RunState::new("p1", "wf", statuses, estimates, 2)
    }

    #[test]
    fn test_snapshot_counts_and_percent() {
        let snapshot = state().snapshot();
        assert_eq!(snapshot.total_stages, 4);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.running, 1);
        assert_eq!(snapshot.pending, 2);
        assert_eq!(snapshot.percent_complete, 25.0);
        // 120s of estimates over effective parallelism 2
        assert_eq!(snapshot.estimated_remaining_secs, 60.0);
    }

    #[tokio::test]
    async fn test_emitter_rate_limits_but_forces_terminal() {
        let sink = Arc::new(CountingSink {
            seen: Mutex::new(Vec::new()),
        });
        let emitter = ProgressEmitter::new(Some(sink.clone()));
        let state = state();

        for _ in 0..10 {
            emitter.emit(state.snapshot(), false).await;
        }
        emitter.emit(state.snapshot(), true).await;

        let seen = sink.seen.lock().await;
        // first non-forced emission plus the forced one
        assert_eq!(seen.len(), 2);
    }
}
