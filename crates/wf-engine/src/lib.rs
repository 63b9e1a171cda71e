//! Automation engine
//!
//! The orchestrator over the other crates: owns recipes and executions,
//! matches incoming events against enabled recipes, runs a tick-driven
//! execution loop with a global concurrency cap, executes actions in
//! declared order with per-action conditions and retry policy, and keeps
//! recipe statistics and a bounded execution history.

mod cancellation;
mod engine;
mod error;
mod execution;
mod loader;
mod metrics;
mod recipe;

pub use cancellation::CancelToken;
pub use engine::{AutomationEngine, EngineConfig};
pub use error::{EngineError, EngineResult};
pub use execution::{
    ActionExecution, ActionStatus, Execution, ExecutionStatus, RetryAttempt, TriggerInfo,
};
pub use loader::load_recipes_from_yaml;
pub use metrics::EngineMetrics;
pub use recipe::{
    ActionDef, ExecutionSummary, Priority, Recipe, RecipeDefinition, RetryPolicy, Settings, Stats,
    TriggerDef,
};
