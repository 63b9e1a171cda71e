//! Registry of action executors

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use wf_core::VariableContext;

/// Action errors
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Unknown action type: {0}")]
    UnknownActionType(String),

    #[error("Invalid action configuration for {action_type}: {reason}")]
    InvalidConfig {
        action_type: String,
        reason: String,
    },

    #[error("Action {action_type} failed: {reason}")]
    Failed {
        action_type: String,
        reason: String,
    },
}

/// Result type for action operations
pub type ActionResult<T> = Result<T, ActionError>;

/// Per-run information handed to every action executor
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// Execution this action belongs to
    pub execution_id: String,

    /// Recipe being run
    pub recipe_id: String,

    /// User who owns the recipe
    pub user_id: String,

    /// Trigger event payload
    pub trigger_data: Value,

    /// Variable scopes for this run
    pub variables: VariableContext,
}

/// One action kind: a validator plus an async executor
#[async_trait::async_trait]
pub trait ActionExecutor: Send + Sync {
    /// The type string recipes reference this kind by
    fn action_type(&self) -> &'static str;

    /// Cheap structural validation of an action config
    fn validate_config(&self, config: &Value) -> ActionResult<()>;

    /// Run the action with a fully-resolved config
    ///
    /// The registry is passed back in so composite actions can run nested
    /// actions through the same catalog.
    async fn execute(
        &self,
        config: &Value,
        ctx: &ActionContext,
        registry: &ActionRegistry,
    ) -> ActionResult<Value>;
}

/// Catalog of action executors keyed by type string
pub struct ActionRegistry {
    executors: DashMap<String, Arc<dyn ActionExecutor>>,
}

/// Shared handle to the action registry
pub type SharedActionRegistry = Arc<ActionRegistry>;

impl ActionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            executors: DashMap::new(),
        }
    }

    /// Register an action executor
    pub fn register(&self, executor: Arc<dyn ActionExecutor>) {
        let action_type = executor.action_type().to_string();
        debug!(action_type = %action_type, "Registering action executor");
        self.executors.insert(action_type, executor);
    }

    /// Check whether an action type is registered
    pub fn is_valid_action(&self, action_type: &str) -> bool {
        self.executors.contains_key(action_type)
    }

    /// Validate an action config against its kind's validator
    pub fn validate_action_config(&self, action_type: &str, config: &Value) -> ActionResult<()> {
        let executor = self.executors.get(action_type).ok_or_else(|| {
            warn!(action_type = %action_type, "Unknown action type");
            ActionError::UnknownActionType(action_type.to_string())
        })?;
        executor.validate_config(config)
    }

    /// Run a single action through its registered executor
    ///
    /// Boxed so composite actions can recurse through the registry.
    pub fn execute_action<'a>(
        &'a self,
        action_type: &'a str,
        config: &'a Value,
        ctx: &'a ActionContext,
    ) -> BoxFuture<'a, ActionResult<Value>> {
        Box::pin(async move {
            let executor = self
                .executors
                .get(action_type)
                .ok_or_else(|| ActionError::UnknownActionType(action_type.to_string()))?
                .clone();

            debug!(
                action_type = %action_type,
                execution_id = %ctx.execution_id,
                "Executing action"
            );
            executor.execute(config, ctx, self).await
        })
    }

    /// Number of registered action kinds
    pub fn len(&self) -> usize {
        self.executors.len()
    }

    /// True when no kinds are registered
    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait::async_trait]
    impl ActionExecutor for Echo {
        fn action_type(&self) -> &'static str {
            "echo"
        }

        fn validate_config(&self, config: &Value) -> ActionResult<()> {
            if config.get("message").is_some() {
                Ok(())
            } else {
                Err(ActionError::InvalidConfig {
                    action_type: "echo".to_string(),
                    reason: "message is required".to_string(),
                })
            }
        }

        async fn execute(
            &self,
            config: &Value,
            _ctx: &ActionContext,
            _registry: &ActionRegistry,
        ) -> ActionResult<Value> {
            Ok(config.get("message").cloned().unwrap_or(Value::Null))
        }
    }

    fn ctx() -> ActionContext {
        ActionContext {
            execution_id: "exec-1".to_string(),
            recipe_id: "recipe-1".to_string(),
            user_id: "user-1".to_string(),
            trigger_data: json!({}),
            variables: VariableContext::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let registry = ActionRegistry::new();
        registry.register(Arc::new(Echo));

        assert!(registry.is_valid_action("echo"));
        let result = registry
            .execute_action("echo", &json!({"message": "hi"}), &ctx())
            .await
            .unwrap();
        assert_eq!(result, json!("hi"));
    }

    #[tokio::test]
    async fn test_unknown_action_fails() {
        let registry = ActionRegistry::new();
        let err = registry
            .execute_action("ghost", &json!({}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::UnknownActionType(_)));
    }

    #[test]
    fn test_validation_dispatch() {
        let registry = ActionRegistry::new();
        registry.register(Arc::new(Echo));

        assert!(registry
            .validate_action_config("echo", &json!({"message": "x"}))
            .is_ok());
        assert!(registry.validate_action_config("echo", &json!({})).is_err());
    }
}
