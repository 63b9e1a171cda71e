//! Core types for the workflow automation engine
//!
//! This crate provides the fundamental types used throughout the engine:
//! Context, Event, the five-scope VariableContext, and value-path lookup.

mod context;
mod event;
mod path;
mod scope;

pub use context::Context;
pub use event::{Event, EventData, EventType};
pub use path::get_path;
pub use scope::{ScopeError, VariableContext, VariableScope};

/// Lifecycle event types emitted by the engine and job manager
pub mod events {
    use super::*;
    use chrono::{DateTime, Utc};

    /// An execution was created and appended to the queue
    pub const EXECUTION_QUEUED: &str = "execution_queued";

    /// An execution transitioned from queued to running
    pub const EXECUTION_STARTED: &str = "execution_started";

    /// An execution finished with all actions completed
    pub const EXECUTION_COMPLETED: &str = "execution_completed";

    /// An execution aborted on a non-continuable action failure
    pub const EXECUTION_FAILED: &str = "execution_failed";

    /// An execution was cancelled before completion
    pub const EXECUTION_CANCELLED: &str = "execution_cancelled";

    /// A recurring or one-time job was accepted by the job manager
    pub const JOB_SCHEDULED: &str = "job_scheduled";

    /// A job self-disabled on window expiry or max-run exhaustion
    pub const JOB_EXPIRED: &str = "job_expired";

    /// A job reached its due time; the engine runs the bound recipe
    pub const EXECUTE_JOB: &str = "execute_job";

    /// Data for EXECUTION_QUEUED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct ExecutionQueuedData {
        pub execution_id: String,
        pub recipe_id: String,
        pub trigger_type: String,
    }

    impl EventData for ExecutionQueuedData {
        fn event_type() -> &'static str {
            EXECUTION_QUEUED
        }
    }

    /// Data for EXECUTION_STARTED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct ExecutionStartedData {
        pub execution_id: String,
        pub recipe_id: String,
        pub started_at: DateTime<Utc>,
    }

    impl EventData for ExecutionStartedData {
        fn event_type() -> &'static str {
            EXECUTION_STARTED
        }
    }

    /// Data for EXECUTION_COMPLETED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct ExecutionCompletedData {
        pub execution_id: String,
        pub recipe_id: String,
        pub duration_ms: u64,
        pub action_count: usize,
    }

    impl EventData for ExecutionCompletedData {
        fn event_type() -> &'static str {
            EXECUTION_COMPLETED
        }
    }

    /// Data for EXECUTION_FAILED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct ExecutionFailedData {
        pub execution_id: String,
        pub recipe_id: String,
        pub error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub failed_action_id: Option<String>,
    }

    impl EventData for ExecutionFailedData {
        fn event_type() -> &'static str {
            EXECUTION_FAILED
        }
    }

    /// Data for EXECUTION_CANCELLED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct ExecutionCancelledData {
        pub execution_id: String,
        pub recipe_id: String,
    }

    impl EventData for ExecutionCancelledData {
        fn event_type() -> &'static str {
            EXECUTION_CANCELLED
        }
    }

    /// Data for JOB_SCHEDULED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct JobScheduledData {
        pub job_id: String,
        pub recipe_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub next_run: Option<DateTime<Utc>>,
    }

    impl EventData for JobScheduledData {
        fn event_type() -> &'static str {
            JOB_SCHEDULED
        }
    }

    /// Data for JOB_EXPIRED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct JobExpiredData {
        pub job_id: String,
        pub recipe_id: String,
        pub reason: String,
    }

    impl EventData for JobExpiredData {
        fn event_type() -> &'static str {
            JOB_EXPIRED
        }
    }

    /// Data for EXECUTE_JOB events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct ExecuteJobData {
        pub job_id: String,
        pub recipe_id: String,
        pub scheduled_for: DateTime<Utc>,
    }

    impl EventData for ExecuteJobData {
        fn event_type() -> &'static str {
            EXECUTE_JOB
        }
    }
}
