//! Versioned schema migrations.
//!
//! Applied versions are tracked in `schema_migrations`; the store refuses to
//! open a database whose recorded version is newer than the binary knows
//! (no downgrades).

/// One schema migration step.
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub statements: &'static [&'static str],
}

/// All known migrations, ascending by version.
pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "initial schema",
    statements: &[
        "CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'initialized',
            config_json TEXT NOT NULL DEFAULT '{}',
            estimated_duration REAL,
            actual_duration REAL,
            theme TEXT NOT NULL,
            target_length_minutes INTEGER NOT NULL,
            external_id TEXT,
            external_url TEXT,
            CHECK (status IN ('initialized', 'processing', 'completed', 'failed', 'cancelled')),
            CHECK (target_length_minutes >= 1)
        )",
        "CREATE TABLE IF NOT EXISTS workflow_steps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL,
            step_name TEXT NOT NULL,
            step_order INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            started_at TEXT,
            completed_at TEXT,
            input_params_json TEXT,
            output_summary_json TEXT,
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            processing_time_seconds REAL,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
            CHECK (status IN ('pending', 'running', 'completed', 'failed', 'skipped', 'cancelled')),
            UNIQUE (project_id, step_name)
        )",
        "CREATE TABLE IF NOT EXISTS project_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL,
            step_name TEXT,
            file_type TEXT NOT NULL,
            file_category TEXT NOT NULL,
            file_path TEXT NOT NULL,
            file_name TEXT NOT NULL,
            file_size_bytes INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            is_temporary INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
            CHECK (file_type IN ('audio', 'video', 'image', 'script', 'subtitle', 'metadata')),
            CHECK (file_category IN ('input', 'output', 'intermediate', 'final'))
        )",
        "CREATE TABLE IF NOT EXISTS project_statistics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT NOT NULL,
            stat_name TEXT NOT NULL,
            stat_value REAL NOT NULL,
            stat_unit TEXT,
            step_name TEXT,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        )",
        "CREATE TABLE IF NOT EXISTS api_usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT,
            api_provider TEXT NOT NULL,
            api_endpoint TEXT NOT NULL,
            request_timestamp TEXT NOT NULL,
            tokens_input INTEGER NOT NULL DEFAULT 0,
            tokens_output INTEGER NOT NULL DEFAULT 0,
            estimated_cost_usd REAL NOT NULL DEFAULT 0,
            response_time_ms REAL,
            status_code INTEGER,
            step_name TEXT,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE SET NULL
        )",
        "CREATE TABLE IF NOT EXISTS system_config (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            config_key TEXT NOT NULL UNIQUE,
            config_value TEXT NOT NULL,
            config_type TEXT NOT NULL,
            description TEXT,
            updated_at TEXT NOT NULL,
            updated_by TEXT,
            CHECK (config_type IN ('string', 'integer', 'boolean', 'json'))
        )",
        "CREATE INDEX IF NOT EXISTS idx_projects_created ON projects (created_at)",
        "CREATE INDEX IF NOT EXISTS idx_workflow_steps_project_status ON workflow_steps (project_id, status)",
        "CREATE INDEX IF NOT EXISTS idx_workflow_steps_name ON workflow_steps (step_name)",
        "CREATE INDEX IF NOT EXISTS idx_project_files_project_type ON project_files (project_id, file_type)",
        "CREATE INDEX IF NOT EXISTS idx_project_files_step_category ON project_files (step_name, file_category)",
        "CREATE INDEX IF NOT EXISTS idx_api_usage_provider_day ON api_usage (api_provider, date(request_timestamp))",
    ],
}];

/// Highest migration version the binary knows.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}
