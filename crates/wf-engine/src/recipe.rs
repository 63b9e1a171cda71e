//! Recipe model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use wf_conditions::Condition;

use crate::execution::ExecutionStatus;

/// Rolling window size for recent execution summaries
pub const RECENT_WINDOW: usize = 100;

fn default_true() -> bool {
    true
}

fn default_config() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A named, owned automation definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub id: String,
    pub user_id: String,
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub trigger: TriggerDef,
    pub actions: Vec<ActionDef>,

    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub stats: Stats,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Trigger half of a recipe: type, config filters, gating conditions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDef {
    #[serde(rename = "type")]
    pub trigger_type: String,

    #[serde(default = "default_config")]
    pub config: Value,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// One step inside a recipe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDef {
    pub id: String,

    #[serde(rename = "type")]
    pub action_type: String,

    #[serde(default = "default_config")]
    pub config: Value,

    /// Per-action gate; a false result skips the action, not the run
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub continue_on_error: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Deterministic exponential backoff with a ceiling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_seconds: f64,

    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: f64,
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> f64 {
    300.0
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), no jitter
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let delay = self.delay_seconds * self.backoff_multiplier.powi(exp);
        Duration::from_secs_f64(delay.min(self.max_delay_seconds).max(0.0))
    }
}

/// Queue priority; high-priority executions jump the FIFO queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Per-recipe execution settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Whole-run timeout; unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Throttle gate checked before enqueuing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_executions_per_hour: Option<u32>,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    /// Recipe-scope variable defaults
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

/// Counters plus a rolling window of recent execution summaries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    #[serde(default)]
    pub total_executions: u64,

    #[serde(default)]
    pub successful_executions: u64,

    #[serde(default)]
    pub failed_executions: u64,

    #[serde(default)]
    pub cancelled_executions: u64,

    #[serde(default)]
    pub average_duration_ms: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub recent: Vec<ExecutionSummary>,
}

/// One line of the rolling window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

impl Stats {
    /// Fold one finished execution into the counters
    pub fn record(&mut self, summary: ExecutionSummary) {
        self.total_executions += 1;
        match summary.status {
            ExecutionStatus::Completed => self.successful_executions += 1,
            ExecutionStatus::Failed => self.failed_executions += 1,
            ExecutionStatus::Cancelled => self.cancelled_executions += 1,
            _ => {}
        }

        let n = self.total_executions as f64;
        self.average_duration_ms =
            (self.average_duration_ms * (n - 1.0) + summary.duration_ms as f64) / n;
        self.last_executed_at = Some(summary.started_at);

        self.recent.push(summary);
        if self.recent.len() > RECENT_WINDOW {
            let overflow = self.recent.len() - RECENT_WINDOW;
            self.recent.drain(..overflow);
        }
    }
}

/// Recipe creation/update payload: everything but identity and stats
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeDefinition {
    /// Caller-chosen id; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub trigger: TriggerDef,
    pub actions: Vec<ActionDef>,

    #[serde(default)]
    pub settings: Settings,
}
