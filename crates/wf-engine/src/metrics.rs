//! Engine metrics snapshot

use serde::Serialize;

/// Point-in-time view of engine state, cheap to compute on demand
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMetrics {
    pub total_recipes: usize,
    pub enabled_recipes: usize,
    pub total_executions: usize,
    pub queued_executions: usize,
    pub running_executions: usize,
    pub completed_executions: usize,
    pub failed_executions: usize,
    pub cancelled_executions: usize,
    pub queue_depth: usize,
    pub active_executions: usize,
    pub average_duration_ms: f64,
}
