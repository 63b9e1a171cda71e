//! Engine errors

use thiserror::Error;

use wf_actions::ActionError;
use wf_conditions::ConditionError;
use wf_cron::CronError;
use wf_storage::StoreError;
use wf_triggers::TriggerError;
use wf_variables::VariableError;

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad recipe/trigger/action config, rejected before any state change
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Recipe not found: {0}")]
    RecipeNotFound(String),

    #[error("Recipe is disabled: {0}")]
    RecipeDisabled(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution {execution_id} is {status} and cannot be cancelled")]
    NotCancellable {
        execution_id: String,
        status: String,
    },

    #[error("Recipe {recipe_id} exceeded {limit} executions per hour")]
    Throttled { recipe_id: String, limit: u32 },

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Condition(#[from] ConditionError),

    #[error(transparent)]
    Variable(#[from] VariableError),

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Failed to read recipe file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse recipe file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
