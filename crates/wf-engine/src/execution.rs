//! Execution model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Execution state machine
///
/// `queued → running → completed | failed | cancelled`; `paused` is a
/// legal source state for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Cancellation is only legal from these states
    pub fn can_cancel(&self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// The event that started an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerInfo {
    #[serde(rename = "type")]
    pub trigger_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// One run of a recipe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub recipe_id: String,
    pub user_id: String,
    pub trigger: TriggerInfo,
    pub status: ExecutionStatus,

    /// Per-action records, appended in declared order
    #[serde(default)]
    pub actions: Vec<ActionExecution>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(recipe_id: impl Into<String>, user_id: impl Into<String>, trigger: TriggerInfo) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            recipe_id: recipe_id.into(),
            user_id: user_id.into(),
            trigger,
            status: ExecutionStatus::Queued,
            actions: Vec::new(),
            started_at: None,
            ended_at: None,
            duration_ms: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Stamp end time and duration
    pub fn finalize(&mut self, status: ExecutionStatus) {
        self.status = status;
        let ended = Utc::now();
        self.ended_at = Some(ended);
        if let Some(started) = self.started_at {
            self.duration_ms = Some((ended - started).num_milliseconds().max(0) as u64);
        } else {
            self.duration_ms = Some(0);
        }
    }
}

/// Per-action state within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Running,
    Completed,
    Failed,
}

/// One retry attempt's record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

/// Per-action record: resolved input, output, retry trail, timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionExecution {
    pub action_id: String,

    #[serde(rename = "type")]
    pub action_type: String,

    pub status: ActionStatus,

    /// Config after variable resolution
    pub input: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default)]
    pub retries: Vec<RetryAttempt>,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionExecution {
    pub fn start(action_id: impl Into<String>, action_type: impl Into<String>, input: Value) -> Self {
        Self {
            action_id: action_id.into(),
            action_type: action_type.into(),
            status: ActionStatus::Running,
            input,
            output: None,
            retries: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn complete(&mut self, output: Value) {
        self.status = ActionStatus::Completed;
        self.output = Some(output);
        self.stamp_end();
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = ActionStatus::Failed;
        self.error = Some(error.into());
        self.stamp_end();
    }

    fn stamp_end(&mut self) {
        let ended = Utc::now();
        self.ended_at = Some(ended);
        self.duration_ms = Some((ended - self.started_at).num_milliseconds().max(0) as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        assert!(ExecutionStatus::Queued.can_cancel());
        assert!(ExecutionStatus::Running.can_cancel());
        assert!(ExecutionStatus::Paused.can_cancel());
        assert!(!ExecutionStatus::Completed.can_cancel());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn test_execution_finalize() {
        let mut execution = Execution::new(
            "recipe-1",
            "user-1",
            TriggerInfo {
                trigger_type: "manual".to_string(),
                data: json!({}),
                timestamp: Utc::now(),
            },
        );
        execution.started_at = Some(Utc::now());
        execution.finalize(ExecutionStatus::Completed);

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.ended_at.is_some());
        assert!(execution.duration_ms.is_some());
    }

    #[test]
    fn test_action_record_json_shape() {
        let mut record = ActionExecution::start("a1", "log", json!({"message": "hi"}));
        record.retries.push(RetryAttempt {
            attempt: 1,
            timestamp: Utc::now(),
            error: "boom".to_string(),
        });
        record.fail("boom");

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], json!("log"));
        assert_eq!(value["status"], json!("failed"));
        assert_eq!(value["retries"][0]["attempt"], json!(1));

        let back: ActionExecution = serde_json::from_value(value).unwrap();
        assert_eq!(back.status, ActionStatus::Failed);
    }
}
