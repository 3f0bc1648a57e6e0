//! Workflow scheduler.
//!
//! Drives an execution plan phase by phase under a `max_concurrent_stages`
//! bound. Workers acquire declared resources, run the registered processor
//! under the stage timeout, and persist every transition before the
//! corresponding progress event is emitted. A later phase begins dispatch
//! only after every stage of the previous phase reached a terminal state.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use mediaforge_config::PipelineConfig;
use mediaforge_core::planner::{self, ExecutionPlan};
use mediaforge_core::stage::{
    ErrorKind, ErrorSeverity, RecoveryAction, StageContext, StageFailure, StageInput,
    StageProcessor, StageResult,
};
use mediaforge_core::store::{ProjectStore, StoreError};
use mediaforge_core::types::{
    FailurePolicy, ProjectStatus, StageDef, StageRecord, StageStatus, StageUpdate,
};
use mediaforge_files::{ProjectWorkspace, StageArtifacts};

use crate::checkpoint::CheckpointManager;
use crate::progress::{ProgressEmitter, ProgressSink, RunState};
use crate::resources::{Reservation, ResourceError, ResourcePool};
use crate::EngineError;

/// Output summaries beyond this size are replaced with a truncation marker
/// before persisting.
const MAX_OUTPUT_SUMMARY_BYTES: usize = 64 * 1024;

/// Backoff before retrying a failed store write once.
const STORE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Terminal status of a whole execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Exit code for a core-hosting CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Failed => 1,
            Self::Cancelled => 3,
        }
    }
}

/// Per-stage outcome carried in the execution result.
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub status: StageStatus,
    pub output_summary: Option<Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub elapsed_secs: Option<f64>,
}

impl From<&StageRecord> for StageSummary {
    fn from(record: &StageRecord) -> Self {
        Self {
            status: record.status,
            output_summary: record.output_summary.clone(),
            error_message: record.error_message.clone(),
            retry_count: record.retry_count,
            elapsed_secs: record.elapsed_secs,
        }
    }
}

/// The value `execute` resolves to. Partial results are preserved: every
/// stage is enumerated with its persisted status and error.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub project_id: String,
    pub workflow: String,
    pub status: ExecutionStatus,
    pub stages: BTreeMap<String, StageSummary>,
    pub elapsed_secs: f64,
    /// completed / total.
    pub success_rate: f64,
    /// Human-readable summary of the first fatal error.
    pub error_summary: Option<String>,
}

impl ExecutionResult {
    pub fn is_successful(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

struct ExecutionHandle {
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    state: Arc<StdRwLock<RunState>>,
}

/// The workflow engine. One instance hosts any number of registered
/// workflows and drives one execution per project at a time.
pub struct WorkflowEngine {
    config: PipelineConfig,
    store: Arc<dyn ProjectStore>,
    workspace: Arc<ProjectWorkspace>,
    checkpoints: Arc<CheckpointManager>,
    pool: Arc<ResourcePool>,
    workflows: StdRwLock<HashMap<String, Vec<StageDef>>>,
    processors: StdRwLock<HashMap<String, Arc<dyn StageProcessor>>>,
    executions: StdMutex<HashMap<String, ExecutionHandle>>,
}

impl WorkflowEngine {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ProjectStore>,
        workspace: Arc<ProjectWorkspace>,
        checkpoints: Arc<CheckpointManager>,
    ) -> Self {
        let pool = Arc::new(ResourcePool::new(config.resource_pool.clone()));
        Self {
            config,
            store,
            workspace,
            checkpoints,
            pool,
            workflows: StdRwLock::new(HashMap::new()),
            processors: StdRwLock::new(HashMap::new()),
            executions: StdMutex::new(HashMap::new()),
        }
    }

    pub fn resource_pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    /// Register a workflow; the stage graph is cycle-checked eagerly.
    pub fn register_workflow(
        &self,
        name: impl Into<String>,
        stages: Vec<StageDef>,
    ) -> Result<(), EngineError> {
        let name = name.into();
        planner::plan(&name, &stages)?;
        tracing::info!(workflow = %name, stages = stages.len(), "workflow registered");
        self.workflows
            .write()
            .expect("workflows lock")
            .insert(name, stages);
        Ok(())
    }

    pub fn register_processor(
        &self,
        stage_name: impl Into<String>,
        processor: Arc<dyn StageProcessor>,
    ) {
        self.processors
            .write()
            .expect("processors lock")
            .insert(stage_name.into(), processor);
    }

    /// Plan without executing: cycle detection plus a resource feasibility
    /// check against the pool.
    pub fn dry_run(&self, workflow: &str) -> Result<ExecutionPlan, EngineError> {
        let stages = self.workflow_stages(workflow)?;
        let plan = planner::plan(workflow, &stages)?;
        for stage in &stages {
            self.pool.check_request(&stage.required_resources)?;
        }
        Ok(plan)
    }

    /// Request cancellation of a project's active execution.
    pub fn cancel(&self, project_id: &str, reason: &str) -> bool {
        let executions = self.executions.lock().expect("executions lock");
        match executions.get(project_id) {
            Some(handle) => {
                tracing::warn!(project_id, reason, "execution cancellation requested");
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Pause dispatch; already-running stages are not interrupted. A
    /// checkpoint is saved at the pause point.
    pub fn pause(&self, project_id: &str) -> bool {
        let executions = self.executions.lock().expect("executions lock");
        match executions.get(project_id) {
            Some(handle) => {
                let paused = handle.pause.send(true).is_ok();
                if paused {
                    tracing::info!(project_id, "execution paused");
                    let checkpoints = self.checkpoints.clone();
                    let project_id = project_id.to_string();
                    tokio::spawn(async move {
                        if let Err(e) = checkpoints.save(&project_id).await {
                            tracing::warn!(%project_id, error = %e, "pause checkpoint failed");
                        }
                    });
                }
                paused
            }
            None => false,
        }
    }

    /// Resume a paused execution.
    pub fn resume(&self, project_id: &str) -> bool {
        let executions = self.executions.lock().expect("executions lock");
        match executions.get(project_id) {
            Some(handle) => {
                tracing::info!(project_id, "execution resumed");
                handle.pause.send(false).is_ok()
            }
            None => false,
        }
    }

    /// Live snapshot of an active execution.
    pub fn execution_status(&self, project_id: &str) -> Option<crate::ExecutionSnapshot> {
        let executions = self.executions.lock().expect("executions lock");
        executions
            .get(project_id)
            .map(|handle| handle.state.read().expect("state lock").snapshot())
    }

    /// Project ids with an active execution.
    pub fn active_executions(&self) -> Vec<String> {
        let executions = self.executions.lock().expect("executions lock");
        let mut ids: Vec<String> = executions.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn workflow_stages(&self, workflow: &str) -> Result<Vec<StageDef>, EngineError> {
        self.workflows
            .read()
            .expect("workflows lock")
            .get(workflow)
            .cloned()
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow.to_string()))
    }

    /// Execute a registered workflow against a project.
    ///
    /// Re-invocation on a partly completed project skips `completed` stages
    /// and feeds their persisted output summaries to dependents; invocation
    /// on a fully completed project returns the cached result immediately.
    pub async fn execute(
        &self,
        workflow: &str,
        project_id: &str,
        initial_input: StageInput,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<ExecutionResult, EngineError> {
        let stages = self.workflow_stages(workflow)?;
        let processors: HashMap<String, Arc<dyn StageProcessor>> = {
            let registry = self.processors.read().expect("processors lock");
            let mut map = HashMap::new();
            for stage in &stages {
                let processor = registry
                    .get(&stage.name)
                    .cloned()
                    .ok_or_else(|| EngineError::MissingProcessor(stage.name.clone()))?;
                map.insert(stage.name.clone(), processor);
            }
            map
        };
        let plan = planner::plan(workflow, &stages)?;
        for stage in &stages {
            self.pool.check_request(&stage.required_resources)?;
        }

        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| EngineError::UnknownProject(project_id.to_string()))?;
        self.store.create_stage_records(project_id, &stages).await?;
        let records = self.relevant_records(project_id, &stages).await?;

        if records.values().all(|r| r.status == StageStatus::Completed) {
            tracing::info!(project_id, workflow, "all stages already completed");
            return Ok(build_result(
                project_id,
                workflow,
                ExecutionStatus::Completed,
                records.values(),
                records.values().filter_map(|r| r.elapsed_secs).sum::<f64>(),
                None,
            ));
        }

        let cancel = CancellationToken::new();
        let (pause_tx, pause_rx) = watch::channel(false);
        let statuses = records
            .values()
            .map(|r| (r.name.clone(), r.status))
            .collect();
        let estimates = stages
            .iter()
            .map(|s| (s.name.clone(), s.estimated_duration_secs))
            .collect();
        let state = Arc::new(StdRwLock::new(RunState::new(
            project_id,
            workflow,
            statuses,
            estimates,
            self.config.max_concurrent_stages,
        )));

        {
            let mut executions = self.executions.lock().expect("executions lock");
            if executions.contains_key(project_id) {
                return Err(EngineError::AlreadyRunning(project_id.to_string()));
            }
            executions.insert(
                project_id.to_string(),
                ExecutionHandle {
                    cancel: cancel.clone(),
                    pause: pause_tx,
                    state: state.clone(),
                },
            );
        }

        let result = self
            .run_plan(
                workflow,
                project_id,
                &project.status,
                plan,
                stages,
                processors,
                records,
                initial_input,
                progress,
                cancel,
                pause_rx,
                state,
            )
            .await;

        self.executions
            .lock()
            .expect("executions lock")
            .remove(project_id);
        result
    }

    async fn relevant_records(
        &self,
        project_id: &str,
        stages: &[StageDef],
    ) -> Result<BTreeMap<String, StageRecord>, EngineError> {
        let all = self.store.stage_records(project_id).await?;
        let wanted: BTreeMap<String, StageRecord> = all
            .into_iter()
            .filter(|r| stages.iter().any(|s| s.name == r.name))
            .map(|r| (r.name.clone(), r))
            .collect();
        Ok(wanted)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_plan(
        &self,
        workflow: &str,
        project_id: &str,
        project_status: &ProjectStatus,
        plan: ExecutionPlan,
        stages: Vec<StageDef>,
        processors: HashMap<String, Arc<dyn StageProcessor>>,
        records: BTreeMap<String, StageRecord>,
        initial_input: StageInput,
        progress: Option<Arc<dyn ProgressSink>>,
        cancel: CancellationToken,
        pause_rx: watch::Receiver<bool>,
        state: Arc<StdRwLock<RunState>>,
    ) -> Result<ExecutionResult, EngineError> {
        let started = Instant::now();
        tracing::info!(project_id, workflow, phases = plan.phases.len(), "execution started");

        if *project_status != ProjectStatus::Processing {
            self.store
                .update_project_status(project_id, ProjectStatus::Processing)
                .await?;
        }
        self.store
            .set_estimated_duration(project_id, plan.estimated_total_secs)
            .await?;

        let defs: HashMap<String, StageDef> =
            stages.iter().map(|s| (s.name.clone(), s.clone())).collect();
        let closure = planner::transitive_dependencies(&stages);
        let dependents = planner::transitive_dependents(&stages);
        let mut outputs: HashMap<String, Map<String, Value>> = records
            .values()
            .filter(|r| r.status == StageStatus::Completed)
            .filter_map(|r| {
                r.output_summary
                    .as_ref()
                    .and_then(Value::as_object)
                    .map(|o| (r.name.clone(), o.clone()))
            })
            .collect();
        let retry_counts: HashMap<String, u32> = records
            .values()
            .map(|r| (r.name.clone(), r.retry_count))
            .collect();
        let emitter = Arc::new(ProgressEmitter::new(progress));

        // Background periodic checkpointing while the workflow is running.
        let ticker_guard = cancel.child_token();
        if let Some(interval) = self.config.checkpoint_interval() {
            let checkpoints = self.checkpoints.clone();
            let ticker_cancel = ticker_guard.clone();
            let project = project_id.to_string();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = ticker_cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            if let Err(e) = checkpoints.save(&project).await {
                                tracing::warn!(project_id = %project, error = %e, "periodic checkpoint failed");
                            }
                        }
                    }
                }
            });
        }

        let mut fatal_error: Option<String> = None;
        let mut pause_rx = pause_rx;

        'phases: for (phase_index, phase) in plan.phases.iter().enumerate() {
            let mut queue: Vec<String> = phase
                .iter()
                .filter(|name| {
                    matches!(
                        state.read().expect("state lock").status(name),
                        Some(StageStatus::Pending) | Some(StageStatus::Failed)
                            | Some(StageStatus::Running)
                    )
                })
                .cloned()
                .collect();
            // planner order is dispatch order; pop() takes from the back
            queue.reverse();
            let mut in_flight: FuturesUnordered<
                Pin<Box<dyn Future<Output = WorkerOutcome> + Send>>,
            > = FuturesUnordered::new();
            tracing::debug!(project_id, phase = phase_index, stages = queue.len(), "phase started");

            loop {
                // Pause gate: block dispatch until resumed or cancelled.
                while *pause_rx.borrow() && !cancel.is_cancelled() {
                    set_paused(&state, true);
                    let snapshot = state.read().expect("state lock").snapshot();
                    emitter.emit(snapshot, true).await;
                    tokio::select! {
                        _ = pause_rx.changed() => {}
                        _ = cancel.cancelled() => {}
                    }
                }
                if state.read().expect("state lock").is_paused {
                    set_paused(&state, false);
                    let snapshot = state.read().expect("state lock").snapshot();
                    emitter.emit(snapshot, true).await;
                }

                if cancel.is_cancelled() {
                    // Stop launching; queued stages are cancelled, in-flight
                    // stages observe the token and drain.
                    while let Some(outcome) = in_flight.next().await {
                        self.fold_outcome(
                            project_id, &defs, &dependents, &mut outputs, &state, &emitter,
                            &cancel, &mut fatal_error, outcome,
                        )
                        .await;
                    }
                    self.cancel_pending(project_id, &state, &emitter).await;
                    state.write().expect("state lock").is_cancelled = true;
                    break 'phases;
                }

                loop {
                    if in_flight.len() >= self.config.max_concurrent_stages {
                        break;
                    }
                    let Some(stage_name) = queue.pop() else { break };
                    let (Some(def), Some(processor)) = (
                        defs.get(&stage_name).cloned(),
                        processors.get(&stage_name).cloned(),
                    ) else {
                        continue;
                    };

                    if def.can_skip && processor.can_skip() {
                        self.persist_and_mark(
                            project_id,
                            &stage_name,
                            StageUpdate::to_status(StageStatus::Skipped),
                            StageStatus::Skipped,
                            &state,
                        )
                        .await;
                        let snapshot = state.read().expect("state lock").snapshot();
                        emitter.emit(snapshot, true).await;
                        continue;
                    }

                    // Reservations are taken in dispatch order so resource
                    // grants follow priority order under contention.
                    let reservation = if def.required_resources.is_empty() {
                        None
                    } else {
                        match self
                            .pool
                            .reserve(&holder_key(project_id, &stage_name), &def.required_resources)
                        {
                            Ok(reservation) => Some(reservation),
                            Err(e) => {
                                fatal_error
                                    .get_or_insert(format!("stage '{stage_name}': {e}"));
                                continue;
                            }
                        }
                    };

                    let input = build_input(&initial_input, &closure, &stage_name, &outputs);
                    let task = WorkerTask {
                        project_id: project_id.to_string(),
                        def,
                        processor,
                        input,
                        reservation,
                        store: self.store.clone(),
                        workspace: self.workspace.clone(),
                        pool: self.pool.clone(),
                        emitter: emitter.clone(),
                        state: state.clone(),
                        cancel: cancel.clone(),
                        default_timeout: self.config.default_stage_timeout(),
                        retry_base: self.config.retry_base_delay(),
                        exponential: self.config.retry_exponential_backoff,
                        retries_used: retry_counts.get(&stage_name).copied().unwrap_or(0),
                    };
                    in_flight.push(Box::pin(run_stage(task)));
                }

                if in_flight.is_empty() && queue.is_empty() {
                    break;
                }

                if let Some(outcome) = in_flight.next().await {
                    let store_failed = self
                        .fold_outcome(
                            project_id, &defs, &dependents, &mut outputs, &state, &emitter,
                            &cancel, &mut fatal_error, outcome,
                        )
                        .await;
                    if store_failed {
                        // Persistent store failure: stop the scheduler after
                        // draining what is already in flight.
                        cancel.cancel();
                        while let Some(outcome) = in_flight.next().await {
                            self.fold_outcome(
                                project_id, &defs, &dependents, &mut outputs, &state,
                                &emitter, &cancel, &mut fatal_error, outcome,
                            )
                            .await;
                        }
                        break 'phases;
                    }
                }
            }

            if fatal_error.is_some() {
                break 'phases;
            }
        }

        ticker_guard.cancel();

        let was_cancelled = cancel.is_cancelled()
            || state.read().expect("state lock").is_cancelled;
        let any_failed = state.read().expect("state lock").any_failed();
        // stale cancelled stages from an earlier run are not success either
        let stale_cancelled = state
            .read()
            .expect("state lock")
            .count(StageStatus::Cancelled)
            > 0;
        let status = if was_cancelled {
            ExecutionStatus::Cancelled
        } else if fatal_error.is_some() || any_failed || stale_cancelled {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };

        let project_status = match status {
            ExecutionStatus::Completed => ProjectStatus::Completed,
            ExecutionStatus::Failed => ProjectStatus::Failed,
            ExecutionStatus::Cancelled => ProjectStatus::Cancelled,
        };
        if let Err(e) = self
            .store
            .update_project_status(project_id, project_status)
            .await
        {
            tracing::warn!(project_id, error = %e, "final project status update failed");
        }
        let elapsed = started.elapsed().as_secs_f64();
        if let Err(e) = self.store.set_actual_duration(project_id, elapsed).await {
            tracing::warn!(project_id, error = %e, "actual duration update failed");
        }
        if let Err(e) = self.checkpoints.save(project_id).await {
            tracing::warn!(project_id, error = %e, "final checkpoint failed");
        }
        let snapshot = state.read().expect("state lock").snapshot();
        emitter.emit(snapshot, true).await;

        let records = self.relevant_records(project_id, &stages).await?;
        if fatal_error.is_none() && any_failed {
            fatal_error = records
                .values()
                .find(|r| r.status == StageStatus::Failed)
                .map(|r| {
                    format!(
                        "stage '{}' failed: {}",
                        r.name,
                        r.error_message.as_deref().unwrap_or("unknown error")
                    )
                });
        }
        tracing::info!(
            project_id,
            workflow,
            status = ?status,
            elapsed_secs = elapsed,
            "execution finished"
        );
        Ok(build_result(
            project_id,
            workflow,
            status,
            records.values(),
            elapsed,
            fatal_error,
        ))
    }

    /// Fold one worker outcome into the run. Returns true on a persistent
    /// store failure (the scheduler must stop).
    #[allow(clippy::too_many_arguments)]
    async fn fold_outcome(
        &self,
        project_id: &str,
        defs: &HashMap<String, StageDef>,
        dependents: &BTreeMap<String, std::collections::BTreeSet<String>>,
        outputs: &mut HashMap<String, Map<String, Value>>,
        state: &Arc<StdRwLock<RunState>>,
        emitter: &Arc<ProgressEmitter>,
        cancel: &CancellationToken,
        fatal_error: &mut Option<String>,
        outcome: WorkerOutcome,
    ) -> bool {
        let stage = outcome.stage.clone();
        match outcome.kind {
            OutcomeKind::Completed { output } => {
                state
                    .write()
                    .expect("state lock")
                    .set_status(&stage, StageStatus::Completed);
                outputs.insert(stage.clone(), output);
            }
            OutcomeKind::Cancelled { persisted } => {
                state
                    .write()
                    .expect("state lock")
                    .set_status(&stage, persisted);
            }
            OutcomeKind::Failed { failure } => {
                state
                    .write()
                    .expect("state lock")
                    .set_status(&stage, StageStatus::Failed);
                let policy = defs
                    .get(&stage)
                    .map(|d| d.failure_policy)
                    .unwrap_or_default();
                if policy == FailurePolicy::SkipDependents && !cancel.is_cancelled() {
                    if let Some(downstream) = dependents.get(&stage) {
                        for dependent in downstream {
                            let is_pending = matches!(
                                state.read().expect("state lock").status(dependent),
                                Some(StageStatus::Pending)
                            );
                            if is_pending {
                                self.persist_and_mark(
                                    project_id,
                                    dependent,
                                    StageUpdate::to_status(StageStatus::Skipped).with_error(
                                        format!("dependency '{stage}' failed"),
                                    ),
                                    StageStatus::Skipped,
                                    state,
                                )
                                .await;
                            }
                        }
                    }
                } else if policy == FailurePolicy::FailWorkflow {
                    fatal_error
                        .get_or_insert(format!("stage '{stage}' failed: {}", failure.message));
                }
            }
            OutcomeKind::StoreFailure(message) => {
                tracing::error!(project_id, stage = %stage, error = %message, "store failure stops scheduler");
                *fatal_error = Some(format!("store failure in stage '{stage}': {message}"));
                return true;
            }
        }

        // Stage reached a terminal state: checkpoint, then flush progress.
        if let Err(e) = self.checkpoints.save(project_id).await {
            tracing::warn!(project_id, error = %e, "stage checkpoint failed");
        }
        let snapshot = state.read().expect("state lock").snapshot();
        emitter.emit(snapshot, true).await;
        false
    }

    /// Mark every still-pending stage cancelled, store first.
    async fn cancel_pending(
        &self,
        project_id: &str,
        state: &Arc<StdRwLock<RunState>>,
        emitter: &Arc<ProgressEmitter>,
    ) {
        let pending = state
            .read()
            .expect("state lock")
            .stages_in(StageStatus::Pending);
        for stage in pending {
            self.persist_and_mark(
                project_id,
                &stage,
                StageUpdate::to_status(StageStatus::Cancelled),
                StageStatus::Cancelled,
                state,
            )
            .await;
        }
        let snapshot = state.read().expect("state lock").snapshot();
        emitter.emit(snapshot, true).await;
    }

    async fn persist_and_mark(
        &self,
        project_id: &str,
        stage: &str,
        update: StageUpdate,
        status: StageStatus,
        state: &Arc<StdRwLock<RunState>>,
    ) {
        if let Err(e) =
            persist_update(self.store.as_ref(), project_id, stage, update).await
        {
            tracing::warn!(project_id, stage, error = %e, "stage update failed");
        }
        state.write().expect("state lock").set_status(stage, status);
    }
}

fn set_paused(state: &Arc<StdRwLock<RunState>>, paused: bool) {
    state.write().expect("state lock").is_paused = paused;
}

fn holder_key(project_id: &str, stage: &str) -> String {
    format!("{project_id}:{stage}")
}

/// Stage input: caller-provided initial input plus the output summary of
/// every transitively-depended completed stage, keyed by stage name.
fn build_input(
    initial: &StageInput,
    closure: &BTreeMap<String, std::collections::BTreeSet<String>>,
    stage: &str,
    outputs: &HashMap<String, Map<String, Value>>,
) -> StageInput {
    let mut input = initial.clone();
    if let Some(deps) = closure.get(stage) {
        for dep in deps {
            if let Some(output) = outputs.get(dep) {
                input.insert(dep.clone(), Value::Object(output.clone()));
            }
        }
    }
    input
}

fn bounded_summary(output: &Map<String, Value>) -> Value {
    let value = Value::Object(output.clone());
    let size = value.to_string().len();
    if size > MAX_OUTPUT_SUMMARY_BYTES {
        json!({
            "truncated": true,
            "original_bytes": size,
        })
    } else {
        value
    }
}

fn build_result<'a>(
    project_id: &str,
    workflow: &str,
    status: ExecutionStatus,
    records: impl Iterator<Item = &'a StageRecord>,
    elapsed_secs: f64,
    error_summary: Option<String>,
) -> ExecutionResult {
    let stages: BTreeMap<String, StageSummary> = records
        .map(|record| (record.name.clone(), StageSummary::from(record)))
        .collect();
    let total = stages.len().max(1);
    let completed = stages
        .values()
        .filter(|s| s.status == StageStatus::Completed)
        .count();
    ExecutionResult {
        project_id: project_id.to_string(),
        workflow: workflow.to_string(),
        status,
        elapsed_secs,
        success_rate: completed as f64 / total as f64,
        error_summary,
        stages,
    }
}

/// Store writes are retried once with a short backoff before giving up.
async fn persist_update(
    store: &dyn ProjectStore,
    project_id: &str,
    stage: &str,
    update: StageUpdate,
) -> Result<(), StoreError> {
    match store
        .update_stage_status(project_id, stage, update.clone())
        .await
    {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::warn!(project_id, stage, error = %e, "stage update failed, retrying once");
            tokio::time::sleep(STORE_RETRY_DELAY).await;
            store.update_stage_status(project_id, stage, update).await
        }
    }
}

struct WorkerOutcome {
    stage: String,
    kind: OutcomeKind,
}

enum OutcomeKind {
    Completed {
        output: Map<String, Value>,
    },
    /// The stage stopped because the execution was cancelled; `persisted`
    /// is the status actually written (cancelled, or failed when the run
    /// was cancelled mid-backoff).
    Cancelled {
        persisted: StageStatus,
    },
    Failed {
        failure: StageFailure,
    },
    StoreFailure(String),
}

struct WorkerTask {
    project_id: String,
    def: StageDef,
    processor: Arc<dyn StageProcessor>,
    input: StageInput,
    reservation: Option<Reservation>,
    store: Arc<dyn ProjectStore>,
    workspace: Arc<ProjectWorkspace>,
    pool: Arc<ResourcePool>,
    emitter: Arc<ProgressEmitter>,
    state: Arc<StdRwLock<RunState>>,
    cancel: CancellationToken,
    default_timeout: Duration,
    retry_base: Duration,
    exponential: bool,
    retries_used: u32,
}

enum Attempt {
    Result(StageResult),
    TimedOut,
    Panicked(String),
}

/// One stage worker: acquire resources, run the processor under the stage
/// timeout, retry with exponential backoff while budget remains.
async fn run_stage(mut task: WorkerTask) -> WorkerOutcome {
    let stage = task.def.name.clone();
    let holder = holder_key(&task.project_id, &stage);
    let timeout = task.def.timeout().unwrap_or(task.default_timeout);
    let mut retries_used = task.retries_used;
    let mut first_attempt = true;

    loop {
        // Resource gate. The dispatch-time reservation covers the first
        // attempt; retries re-enter the queue at the back.
        let gate = match task.reservation.take() {
            Some(reservation) => task.pool.wait(reservation, &task.cancel).await,
            None if !task.def.required_resources.is_empty() => {
                task.pool
                    .acquire(&holder, &task.def.required_resources, &task.cancel)
                    .await
            }
            None => Ok(()),
        };
        match gate {
            Ok(()) => {}
            Err(ResourceError::Cancelled) => {
                let persisted = persist_cancelled(&task, &stage).await;
                return WorkerOutcome {
                    stage,
                    kind: OutcomeKind::Cancelled { persisted },
                };
            }
            Err(e @ ResourceError::DeadlockDetected(_)) => {
                // Fail fast and let the retry budget re-drive the stage.
                let failure = StageFailure::new(ErrorKind::Resource, e.to_string())
                    .with_action(RecoveryAction::Retry);
                match handle_failure(&mut task, &stage, &mut retries_used, failure, None).await {
                    FailureFlow::Retry => continue,
                    FailureFlow::Done(outcome) => return outcome,
                }
            }
            Err(e) => {
                let failure = StageFailure::new(ErrorKind::Resource, e.to_string())
                    .with_severity(ErrorSeverity::Critical)
                    .with_action(RecoveryAction::Abort);
                match handle_failure(&mut task, &stage, &mut retries_used, failure, None).await {
                    FailureFlow::Retry => continue,
                    FailureFlow::Done(outcome) => return outcome,
                }
            }
        }

        // pending/failed -> running, input persisted on the first attempt
        let mut update = StageUpdate::to_status(StageStatus::Running);
        if first_attempt {
            update = update.with_input(Value::Object(task.input.clone()));
            first_attempt = false;
        }
        if let Err(e) = persist_update(task.store.as_ref(), &task.project_id, &stage, update).await
        {
            task.pool.release(&holder);
            return WorkerOutcome {
                stage,
                kind: OutcomeKind::StoreFailure(e.to_string()),
            };
        }
        task.state
            .write()
            .expect("state lock")
            .set_status(&stage, StageStatus::Running);
        let snapshot = task.state.read().expect("state lock").snapshot();
        task.emitter.emit(snapshot, false).await;
        tracing::info!(
            project_id = %task.project_id,
            stage = %stage,
            attempt = retries_used + 1,
            "stage execution started"
        );

        // The processor runs in its own task: a panic is contained and a
        // timeout can abandon it without tearing down the scheduler.
        let ctx = StageContext::new(
            &task.project_id,
            &stage,
            uuid::Uuid::new_v4().to_string(),
            Arc::new(StageArtifacts::new(
                task.workspace.clone(),
                &task.project_id,
                &stage,
            )),
            task.cancel.child_token(),
        );
        let attempt_started = Instant::now();
        let mut handle = {
            let processor = task.processor.clone();
            let input = task.input.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { processor.execute(&ctx, &input).await })
        };
        let attempt = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => Attempt::Result(result),
            Ok(Err(join_error)) => Attempt::Panicked(join_error.to_string()),
            Err(_) => {
                handle.abort();
                Attempt::TimedOut
            }
        };
        let elapsed = attempt_started.elapsed().as_secs_f64();

        // Units are returned only after the terminal record is durable, so a
        // successor's started_at never precedes this stage's completed_at.
        match attempt {
            Attempt::Result(StageResult::Success { output, .. }) => {
                let update = StageUpdate::to_status(StageStatus::Completed)
                    .with_output(bounded_summary(&output))
                    .with_elapsed(elapsed);
                let persisted =
                    persist_update(task.store.as_ref(), &task.project_id, &stage, update).await;
                task.pool.release(&holder);
                if let Err(e) = persisted {
                    return WorkerOutcome {
                        stage,
                        kind: OutcomeKind::StoreFailure(e.to_string()),
                    };
                }
                tracing::info!(
                    project_id = %task.project_id,
                    stage = %stage,
                    elapsed_secs = elapsed,
                    "stage execution completed"
                );
                return WorkerOutcome {
                    stage,
                    kind: OutcomeKind::Completed { output },
                };
            }
            Attempt::Result(StageResult::Failure { failure })
                if failure.kind == ErrorKind::Cancelled || task.cancel.is_cancelled() =>
            {
                let update = StageUpdate::to_status(StageStatus::Cancelled)
                    .with_error(failure.message.clone())
                    .with_elapsed(elapsed);
                let persisted =
                    persist_update(task.store.as_ref(), &task.project_id, &stage, update).await;
                task.pool.release(&holder);
                if let Err(e) = persisted {
                    return WorkerOutcome {
                        stage,
                        kind: OutcomeKind::StoreFailure(e.to_string()),
                    };
                }
                return WorkerOutcome {
                    stage,
                    kind: OutcomeKind::Cancelled {
                        persisted: StageStatus::Cancelled,
                    },
                };
            }
            Attempt::Result(StageResult::Failure { failure }) => {
                match handle_failure(&mut task, &stage, &mut retries_used, failure, Some(elapsed))
                    .await
                {
                    FailureFlow::Retry => continue,
                    FailureFlow::Done(outcome) => return outcome,
                }
            }
            Attempt::TimedOut => {
                let failure = StageFailure::new(
                    ErrorKind::Timeout,
                    format!("stage exceeded its {}s timeout", timeout.as_secs()),
                )
                .with_action(RecoveryAction::Retry);
                match handle_failure(&mut task, &stage, &mut retries_used, failure, Some(elapsed))
                    .await
                {
                    FailureFlow::Retry => continue,
                    FailureFlow::Done(outcome) => return outcome,
                }
            }
            Attempt::Panicked(message) => {
                let failure = StageFailure::new(
                    ErrorKind::Execution,
                    format!("stage processor panicked: {message}"),
                )
                .with_severity(ErrorSeverity::Critical)
                .with_action(RecoveryAction::Abort);
                match handle_failure(&mut task, &stage, &mut retries_used, failure, Some(elapsed))
                    .await
                {
                    FailureFlow::Retry => continue,
                    FailureFlow::Done(outcome) => return outcome,
                }
            }
        }
    }
}

enum FailureFlow {
    Retry,
    Done(WorkerOutcome),
}

/// Persist a failure and decide between retry and terminal failure.
async fn handle_failure(
    task: &mut WorkerTask,
    stage: &str,
    retries_used: &mut u32,
    failure: StageFailure,
    elapsed: Option<f64>,
) -> FailureFlow {
    // The stage may still be pending when resource arbitration failed; pass
    // through running so the recorded transitions stay legal.
    let currently_pending = !matches!(
        task.state.read().expect("state lock").status(stage),
        Some(StageStatus::Running)
    );
    if currently_pending {
        if let Err(e) = persist_update(
            task.store.as_ref(),
            &task.project_id,
            stage,
            StageUpdate::to_status(StageStatus::Running),
        )
        .await
        {
            return FailureFlow::Done(WorkerOutcome {
                stage: stage.to_string(),
                kind: OutcomeKind::StoreFailure(e.to_string()),
            });
        }
    }

    let mut update = StageUpdate::to_status(StageStatus::Failed).with_error(failure.message.clone());
    if let Some(elapsed) = elapsed {
        update = update.with_elapsed(elapsed);
    }

    let may_retry =
        failure.is_retryable() && *retries_used < task.def.retry_count && !task.cancel.is_cancelled();
    if may_retry {
        *retries_used += 1;
        update = update.with_retry_count(*retries_used);
    }
    let persisted = persist_update(task.store.as_ref(), &task.project_id, stage, update).await;
    // return any held units after the failure is durable and before backoff
    task.pool.release(&holder_key(&task.project_id, stage));
    if let Err(e) = persisted {
        return FailureFlow::Done(WorkerOutcome {
            stage: stage.to_string(),
            kind: OutcomeKind::StoreFailure(e.to_string()),
        });
    }
    task.state
        .write()
        .expect("state lock")
        .set_status(stage, StageStatus::Failed);
    let snapshot = task.state.read().expect("state lock").snapshot();
    task.emitter.emit(snapshot, false).await;

    if !may_retry {
        tracing::error!(
            project_id = %task.project_id,
            stage = %stage,
            kind = ?failure.kind,
            error = %failure.message,
            "stage failed terminally"
        );
        return FailureFlow::Done(WorkerOutcome {
            stage: stage.to_string(),
            kind: OutcomeKind::Failed { failure },
        });
    }

    let delay = if task.exponential {
        task.retry_base.mul_f64(2f64.powi(*retries_used as i32))
    } else {
        task.retry_base
    };
    tracing::warn!(
        project_id = %task.project_id,
        stage = %stage,
        retry = *retries_used,
        delay_ms = delay.as_millis() as u64,
        error = %failure.message,
        "stage failed, retrying after backoff"
    );
    tokio::select! {
        _ = tokio::time::sleep(delay) => FailureFlow::Retry,
        _ = task.cancel.cancelled() => FailureFlow::Done(WorkerOutcome {
            stage: stage.to_string(),
            // record keeps its persisted failed status for later resume
            kind: OutcomeKind::Cancelled { persisted: StageStatus::Failed },
        }),
    }
}

/// Persist the cancellation of a stage that never reached running.
async fn persist_cancelled(task: &WorkerTask, stage: &str) -> StageStatus {
    let update = StageUpdate::to_status(StageStatus::Cancelled);
    match persist_update(task.store.as_ref(), &task.project_id, stage, update).await {
        Ok(()) => StageStatus::Cancelled,
        Err(e) => {
            tracing::warn!(project_id = %task.project_id, stage, error = %e, "cancel persist failed");
            task.state
                .read()
                .expect("state lock")
                .status(stage)
                .unwrap_or(StageStatus::Cancelled)
        }
    }
}
