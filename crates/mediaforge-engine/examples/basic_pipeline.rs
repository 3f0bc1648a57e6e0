//! Basic pipeline example for mediaforge
//!
//! This example demonstrates:
//! - Wiring the store, workspace, checkpoint manager and engine together
//! - Registering a workflow and its stage processors
//! - Executing with a progress sink and reading the result

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use mediaforge_config::PipelineConfig;
use mediaforge_core::stage::{StageContext, StageInput, StageProcessor, StageResult};
use mediaforge_core::types::{
    ArtifactCategory, ArtifactType, NewProject, StageDef, StagePriority,
};
use mediaforge_core::workspace::{ArtifactOptions, ArtifactWriter};
use mediaforge_engine::{
    CheckpointManager, ExecutionSnapshot, ProgressSink, WorkflowEngine,
};
use mediaforge_files::ProjectWorkspace;
use mediaforge_store::SqliteStore;

/// Picks a theme and hands it to the downstream stages.
struct ThemeStage;

#[async_trait]
impl StageProcessor for ThemeStage {
    async fn execute(&self, _ctx: &StageContext, input: &StageInput) -> StageResult {
        let requested = input
            .get("requested_theme")
            .and_then(|v| v.as_str())
            .unwrap_or("deep sea creatures");
        StageResult::success_with_one("theme", json!(requested))
    }
}

/// Writes a tiny script file and reports its path.
struct ScriptStage;

#[async_trait]
impl StageProcessor for ScriptStage {
    async fn execute(&self, ctx: &StageContext, input: &StageInput) -> StageResult {
        if ctx.is_cancelled() {
            return StageResult::retryable("cancelled before scripting started");
        }
        let theme = input
            .get("select_theme")
            .and_then(|v| v.get("theme"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let script = format!("[narrator] Today we explore: {theme}\n");
        match ctx
            .artifacts()
            .write(
                "files/scripts/episode.md",
                script.as_bytes(),
                ArtifactOptions::new(ArtifactType::Script, ArtifactCategory::Final),
            )
            .await
        {
            Ok(artifact) => StageResult::success_with_one("script_path", json!(artifact.rel_path)),
            Err(e) => StageResult::retryable(e.to_string()),
        }
    }
}

struct PrintProgress;

#[async_trait]
impl ProgressSink for PrintProgress {
    async fn report(&self, snapshot: ExecutionSnapshot) {
        println!(
            "progress: {:.0}% ({} running, {} completed)",
            snapshot.percent_complete, snapshot.running, snapshot.completed
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Mediaforge Basic Pipeline Example ===\n");

    let workdir = tempfile::tempdir()?;
    let mut config = PipelineConfig::default();
    config.projects_root = workdir.path().to_path_buf();
    config.resource_pool.insert("llm_api".to_string(), 2);

    let store = Arc::new(SqliteStore::connect_in_memory(workdir.path()).await?);
    let workspace = Arc::new(ProjectWorkspace::new(workdir.path(), store.clone()));
    let checkpoints = Arc::new(CheckpointManager::new(
        workdir.path(),
        store.clone(),
        store.clone(),
        config.checkpoint_retention_count,
    ));
    let engine = WorkflowEngine::new(config, store.clone(), workspace, checkpoints);

    engine.register_workflow(
        "shorts",
        vec![
            StageDef::new("select_theme").with_priority(StagePriority::High),
            StageDef::new("write_script")
                .with_dependencies(vec!["select_theme".to_string()])
                .with_resources(["llm_api"]),
        ],
    )?;
    engine.register_processor("select_theme", Arc::new(ThemeStage));
    engine.register_processor("write_script", Arc::new(ScriptStage));

    use mediaforge_core::store::ProjectStore;
    let project = store
        .create_project(NewProject::new("episode one", "deep sea creatures"))
        .await?;
    println!("created project: {}", project.id);

    let mut initial = serde_json::Map::new();
    initial.insert("requested_theme".to_string(), json!("bioluminescence"));
    let result = engine
        .execute("shorts", &project.id, initial, Some(Arc::new(PrintProgress)))
        .await?;

    println!("\nexecution finished: {:?}", result.status);
    for (stage, summary) in &result.stages {
        println!(
            "  {stage}: {} (retries: {})",
            summary.status.as_str(),
            summary.retry_count
        );
    }
    Ok(())
}
