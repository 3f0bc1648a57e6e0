//! Command definitions and dispatch.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use thiserror::Error;

use mediaforge_config::{load_config, ConfigError, PipelineConfig};
use mediaforge_core::planner::PlanError;
use mediaforge_core::store::{ProjectStore, StoreError, TelemetryStore};
use mediaforge_core::types::{NewProject, ProjectFilter, StageDef};
use mediaforge_engine::{
    CheckpointError, CheckpointManager, EngineError, RecoveryManager, ResourcePool,
};
use mediaforge_files::ProjectWorkspace;
use mediaforge_store::{HealthStatus, SqliteStore};

/// A workflow description file: named stage definitions for planning.
#[derive(Debug, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    pub stages: Vec<StageDef>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("workflow file error: {0}")]
    WorkflowFile(String),

    #[error("unknown project: {0}")]
    UnknownProject(String),
}

/// Exit codes: 0 success, 1 execution failure, 2 misconfiguration/planner
/// error, 3 cancelled, 4 store or filesystem error.
pub fn exit_code_for(error: &CliError) -> u8 {
    match error {
        CliError::Config(_) | CliError::Plan(_) | CliError::WorkflowFile(_) => 2,
        CliError::Store(_) | CliError::Checkpoint(_) => 4,
        CliError::UnknownProject(_) => 2,
        CliError::Engine(engine) => match engine {
            EngineError::UnknownWorkflow(_)
            | EngineError::UnknownProject(_)
            | EngineError::MissingProcessor(_)
            | EngineError::AlreadyRunning(_)
            | EngineError::Plan(_)
            | EngineError::Resource(_) => 2,
            EngineError::Store(_)
            | EngineError::Workspace(_)
            | EngineError::Checkpoint(_) => 4,
        },
    }
}

#[derive(Debug, Parser)]
#[command(name = "mediaforge", about = "Media pipeline orchestration core")]
pub struct Cli {
    /// Path to mediaforge.yaml; defaults apply when absent.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a project.
    Create {
        name: String,
        theme: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long, default_value_t = 5)]
        target_minutes: u32,
    },
    /// List projects, newest first.
    List {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Show one project's stages and statistics.
    Status { project_id: String },
    /// Validate a workflow file and print its execution phases.
    Plan { workflow_file: PathBuf },
    /// List projects whose last checkpoint shows an interrupted run.
    Interrupted,
    /// Cross-check checkpoint, store and disk for a project.
    Verify { project_id: String },
    /// Normalize an interrupted project so it can be re-executed.
    Resume { project_id: String },
    /// Remove temporary artifacts older than the given age.
    Cleanup {
        project_id: String,
        #[arg(long, default_value_t = 24)]
        older_than_hours: i64,
    },
    /// Snapshot the store to a file.
    Backup { target: PathBuf },
    /// Apply pending schema migrations.
    Migrate,
    /// Store health check.
    Health,
}

struct App {
    store: Arc<SqliteStore>,
    workspace: Arc<ProjectWorkspace>,
    recovery: RecoveryManager,
    config: PipelineConfig,
}

async fn build_app(config: PipelineConfig) -> Result<App, CliError> {
    let store = Arc::new(SqliteStore::connect(&config.store_path, &config.projects_root).await?);
    let workspace = Arc::new(
        ProjectWorkspace::new(&config.projects_root, store.clone())
            .with_byte_quota(config.project_byte_quota)
            .with_reconcile_mode(config.reconcile_mode),
    );
    let checkpoints = Arc::new(CheckpointManager::new(
        &config.projects_root,
        store.clone(),
        store.clone(),
        config.checkpoint_retention_count,
    ));
    let recovery = RecoveryManager::new(store.clone(), workspace.clone(), checkpoints);
    Ok(App {
        store,
        workspace,
        recovery,
        config,
    })
}

fn load_or_default(path: Option<&PathBuf>) -> Result<PipelineConfig, CliError> {
    match path {
        Some(path) => Ok(load_config(path)?),
        None => Ok(PipelineConfig::default()),
    }
}

pub async fn run(args: Cli) -> Result<(), CliError> {
    let config = load_or_default(args.config.as_ref())?;
    let app = build_app(config).await?;

    match args.command {
        Command::Create {
            name,
            theme,
            id,
            target_minutes,
        } => {
            let mut new = NewProject::new(name, theme).with_target_length(target_minutes);
            if let Some(id) = id {
                new = new.with_id(id);
            }
            let project = app.store.create_project(new).await?;
            println!("{}", project.id);
        }
        Command::List { limit } => {
            let projects = app
                .store
                .list_projects(&ProjectFilter {
                    limit: Some(limit),
                    ..Default::default()
                })
                .await?;
            for project in projects {
                println!(
                    "{}\t{}\t{}\t{}",
                    project.id,
                    project.status.as_str(),
                    project.created_at.format("%Y-%m-%d %H:%M"),
                    project.name
                );
            }
        }
        Command::Status { project_id } => {
            let project = app
                .store
                .get_project(&project_id)
                .await?
                .ok_or_else(|| CliError::UnknownProject(project_id.clone()))?;
            println!("project: {} ({})", project.id, project.status.as_str());
            println!("theme: {}", project.theme);
            for record in app.store.stage_records(&project_id).await? {
                println!(
                    "  {:>2}. {:<24} {:<10} retries={} {}",
                    record.position + 1,
                    record.name,
                    record.status.as_str(),
                    record.retry_count,
                    record.error_message.as_deref().unwrap_or("")
                );
            }
            for stat in app.store.project_stats(&project_id).await? {
                println!(
                    "  stat {} = {} {}",
                    stat.name,
                    stat.value,
                    stat.unit.as_deref().unwrap_or("")
                );
            }
        }
        Command::Plan { workflow_file } => {
            let raw = std::fs::read_to_string(&workflow_file)
                .map_err(|e| CliError::WorkflowFile(e.to_string()))?;
            let spec: WorkflowSpec =
                serde_yaml::from_str(&raw).map_err(|e| CliError::WorkflowFile(e.to_string()))?;
            let plan = mediaforge_core::planner::plan(&spec.name, &spec.stages)?;
            let pool = ResourcePool::new(app.config.resource_pool.clone());
            for stage in &spec.stages {
                pool.check_request(&stage.required_resources)
                    .map_err(EngineError::from)?;
            }
            println!(
                "workflow '{}': {} stages in {} phases, ~{:.0}s",
                spec.name,
                plan.total_stages(),
                plan.phases.len(),
                plan.estimated_total_secs
            );
            for (index, phase) in plan.phases.iter().enumerate() {
                println!("  phase {}: {}", index + 1, phase.join(", "));
            }
        }
        Command::Interrupted => {
            for project_id in app.recovery.find_interrupted().await? {
                println!("{project_id}");
            }
        }
        Command::Verify { project_id } => {
            let report = app.recovery.verify(&project_id).await?;
            if report.is_clean() {
                println!("{project_id}: clean");
            } else {
                for issue in &report.issues {
                    println!("issue: {issue}");
                }
                for finding in &report.reconcile.findings {
                    println!("ledger: {finding:?}");
                }
            }
        }
        Command::Resume { project_id } => {
            let normalized = app.recovery.resume(&project_id).await?;
            if normalized.is_empty() {
                println!("{project_id}: nothing to normalize");
            } else {
                println!("{project_id}: normalized {}", normalized.join(", "));
            }
        }
        Command::Cleanup {
            project_id,
            older_than_hours,
        } => {
            let cutoff = Utc::now() - Duration::hours(older_than_hours);
            let removed = app
                .workspace
                .cleanup_temporary(&project_id, cutoff)
                .await
                .map_err(EngineError::from)?;
            let old = app
                .workspace
                .cleanup_old_files(&project_id, cutoff)
                .await
                .map_err(EngineError::from)?;
            println!("removed {removed} temporary artifacts, {old} cached files");
        }
        Command::Backup { target } => {
            app.store.backup(&target).await?;
            println!("backup written to {}", target.display());
        }
        Command::Migrate => {
            let applied = app.store.migrate().await?;
            if applied.is_empty() {
                println!("schema is current (v{})", app.store.schema_version().await?);
            } else {
                for version in applied {
                    println!("applied migration v{version}");
                }
            }
        }
        Command::Health => match app.store.health_check().await {
            HealthStatus::Healthy {
                database_bytes,
                project_count,
            } => println!("healthy: {project_count} projects, {database_bytes} bytes"),
            HealthStatus::Degraded { reason } => {
                println!("degraded: {reason}");
                return Err(CliError::Store(StoreError::Connection(reason)));
            }
        },
    }
    Ok(())
}
