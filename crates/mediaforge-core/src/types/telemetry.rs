//! Telemetry row types: statistics, API usage and system configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A numeric metric keyed by (project, stage, name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatRecord {
    pub project_id: String,
    #[serde(default)]
    pub stage_name: Option<String>,
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// One outbound API call, retained for billing even after its project is
/// deleted (the project link is severed, not the row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiUsageRecord {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub stage_name: Option<String>,
    pub provider: String,
    pub endpoint: String,
    pub requested_at: DateTime<Utc>,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub estimated_cost_usd: f64,
    #[serde(default)]
    pub response_time_ms: Option<f64>,
    #[serde(default)]
    pub status_code: Option<u16>,
}

impl ApiUsageRecord {
    pub fn new(provider: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            project_id: None,
            stage_name: None,
            provider: provider.into(),
            endpoint: endpoint.into(),
            requested_at: Utc::now(),
            tokens_input: 0,
            tokens_output: 0,
            estimated_cost_usd: 0.0,
            response_time_ms: None,
            status_code: None,
        }
    }

    pub fn for_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn for_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage_name = Some(stage.into());
        self
    }

    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.tokens_input = input;
        self.tokens_output = output;
        self
    }

    pub fn with_cost(mut self, usd: f64) -> Self {
        self.estimated_cost_usd = usd;
        self
    }

    pub fn with_response(mut self, status_code: u16, response_time_ms: f64) -> Self {
        self.status_code = Some(status_code);
        self.response_time_ms = Some(response_time_ms);
        self
    }
}

/// Per-provider aggregate over a time window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiUsageSummary {
    pub provider: String,
    pub call_count: u64,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub estimated_cost_usd: f64,
}

/// Typed value of a system configuration row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ConfigValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Json(Value),
}

impl ConfigValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Integer(_) => "integer",
            Self::Boolean(_) => "boolean",
            Self::Json(_) => "json",
        }
    }

    /// Encode the value for the `config_value` column.
    pub fn encode(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::Json(v) => v.to_string(),
        }
    }

    /// Decode a `(config_type, config_value)` column pair.
    pub fn decode(type_name: &str, raw: &str) -> Option<Self> {
        match type_name {
            "string" => Some(Self::String(raw.to_string())),
            "integer" => raw.parse().ok().map(Self::Integer),
            "boolean" => raw.parse().ok().map(Self::Boolean),
            "json" => serde_json::from_str(raw).ok().map(Self::Json),
            _ => None,
        }
    }
}

/// A process-wide configuration row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfigEntry {
    pub key: String,
    pub value: ConfigValue,
    #[serde(default)]
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_by: Option<String>,
}
