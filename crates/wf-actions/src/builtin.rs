//! Built-in action executors

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use wf_conditions::{Condition, ConditionEvaluator, Logic};
use wf_core::VariableScope;

use crate::registry::{ActionContext, ActionError, ActionExecutor, ActionRegistry, ActionResult};

fn invalid(action_type: &str, reason: impl Into<String>) -> ActionError {
    ActionError::InvalidConfig {
        action_type: action_type.to_string(),
        reason: reason.into(),
    }
}

fn require_string<'a>(
    action_type: &str,
    config: &'a Value,
    key: &str,
) -> ActionResult<&'a str> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| invalid(action_type, format!("{} is required", key)))
}

/// Parse a duration config value: seconds as a number, or "HH:MM:SS"
fn parse_duration(action_type: &str, value: &Value) -> ActionResult<Duration> {
    if let Some(secs) = value.as_f64() {
        if secs < 0.0 {
            return Err(invalid(action_type, "duration must not be negative"));
        }
        return Ok(Duration::from_secs_f64(secs));
    }

    let Some(text) = value.as_str() else {
        return Err(invalid(action_type, "duration must be a number or HH:MM:SS"));
    };
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 3 {
        return Err(invalid(action_type, "duration string must be HH:MM:SS"));
    }
    let mut total: u64 = 0;
    for part in parts {
        let n: u64 = part
            .parse()
            .map_err(|_| invalid(action_type, "duration string must be HH:MM:SS"))?;
        total = total * 60 + n;
    }
    Ok(Duration::from_secs(total))
}

/// Write a line to the structured log
struct LogAction;

#[async_trait::async_trait]
impl ActionExecutor for LogAction {
    fn action_type(&self) -> &'static str {
        "log"
    }

    fn validate_config(&self, config: &Value) -> ActionResult<()> {
        require_string(self.action_type(), config, "message").map(|_| ())
    }

    async fn execute(
        &self,
        config: &Value,
        ctx: &ActionContext,
        _registry: &ActionRegistry,
    ) -> ActionResult<Value> {
        let message = require_string(self.action_type(), config, "message")?;
        let level = config.get("level").and_then(|v| v.as_str()).unwrap_or("info");

        match level {
            "warn" => warn!(recipe_id = %ctx.recipe_id, execution_id = %ctx.execution_id, "{}", message),
            _ => info!(recipe_id = %ctx.recipe_id, execution_id = %ctx.execution_id, "{}", message),
        }
        Ok(json!({"logged": message}))
    }
}

/// Pause before the next action
struct WaitAction;

#[async_trait::async_trait]
impl ActionExecutor for WaitAction {
    fn action_type(&self) -> &'static str {
        "wait"
    }

    fn validate_config(&self, config: &Value) -> ActionResult<()> {
        let value = config
            .get("duration")
            .ok_or_else(|| invalid(self.action_type(), "duration is required"))?;
        parse_duration(self.action_type(), value).map(|_| ())
    }

    async fn execute(
        &self,
        config: &Value,
        _ctx: &ActionContext,
        _registry: &ActionRegistry,
    ) -> ActionResult<Value> {
        let value = config
            .get("duration")
            .ok_or_else(|| invalid(self.action_type(), "duration is required"))?;
        let duration = parse_duration(self.action_type(), value)?;
        tokio::time::sleep(duration).await;
        Ok(json!({"waited_ms": duration.as_millis() as u64}))
    }
}

/// Delivery target for notifications
///
/// The default sink writes to the log; hosts plug in real channels.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, channel: &str, title: &str, body: &str) -> ActionResult<()>;
}

/// Notification sink that writes to the structured log
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn deliver(&self, channel: &str, title: &str, body: &str) -> ActionResult<()> {
        info!(channel = %channel, title = %title, "Notification: {}", body);
        Ok(())
    }
}

/// Send a notification through the configured sink
struct SendNotificationAction {
    sink: Arc<dyn NotificationSink>,
}

#[async_trait::async_trait]
impl ActionExecutor for SendNotificationAction {
    fn action_type(&self) -> &'static str {
        "send_notification"
    }

    fn validate_config(&self, config: &Value) -> ActionResult<()> {
        require_string(self.action_type(), config, "title").map(|_| ())
    }

    async fn execute(
        &self,
        config: &Value,
        _ctx: &ActionContext,
        _registry: &ActionRegistry,
    ) -> ActionResult<Value> {
        let title = require_string(self.action_type(), config, "title")?;
        let body = config.get("body").and_then(|v| v.as_str()).unwrap_or("");
        let channel = config
            .get("channel")
            .and_then(|v| v.as_str())
            .unwrap_or("default");

        self.sink.deliver(channel, title, body)?;
        Ok(json!({"delivered": true, "channel": channel}))
    }
}

/// Write a value into execution scope
struct SetVariableAction;

#[async_trait::async_trait]
impl ActionExecutor for SetVariableAction {
    fn action_type(&self) -> &'static str {
        "set_variable"
    }

    fn validate_config(&self, config: &Value) -> ActionResult<()> {
        require_string(self.action_type(), config, "name")?;
        if config.get("value").is_none() {
            return Err(invalid(self.action_type(), "value is required"));
        }
        Ok(())
    }

    async fn execute(
        &self,
        config: &Value,
        _ctx: &ActionContext,
        _registry: &ActionRegistry,
    ) -> ActionResult<Value> {
        let name = require_string(self.action_type(), config, "name")?;
        let value = config.get("value").cloned().unwrap_or(Value::Null);

        // The engine applies the write to execution scope when it merges
        // this result; the context copy here is not shared.
        Ok(json!({
            "set": {"scope": VariableScope::Execution.as_str(), "name": name, "value": value}
        }))
    }
}

/// Branch between two action lists on a condition set
struct ConditionalAction {
    evaluator: Arc<ConditionEvaluator>,
}

impl ConditionalAction {
    fn parse_branch(
        &self,
        config: &Value,
        key: &str,
    ) -> ActionResult<Vec<(String, Value)>> {
        let Some(items) = config.get(key).and_then(|v| v.as_array()) else {
            return Ok(Vec::new());
        };
        items
            .iter()
            .map(|item| {
                let action_type = item
                    .get("type")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| invalid("conditional", format!("{} entries need a type", key)))?;
                let action_config = item.get("config").cloned().unwrap_or(json!({}));
                Ok((action_type.to_string(), action_config))
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ActionExecutor for ConditionalAction {
    fn action_type(&self) -> &'static str {
        "conditional"
    }

    fn validate_config(&self, config: &Value) -> ActionResult<()> {
        if config.get("conditions").and_then(|v| v.as_array()).is_none() {
            return Err(invalid(self.action_type(), "conditions must be an array"));
        }
        self.parse_branch(config, "true_actions")?;
        self.parse_branch(config, "false_actions")?;
        Ok(())
    }

    async fn execute(
        &self,
        config: &Value,
        ctx: &ActionContext,
        registry: &ActionRegistry,
    ) -> ActionResult<Value> {
        let conditions: Vec<Condition> = config
            .get("conditions")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| invalid(self.action_type(), format!("bad conditions: {}", e)))?
            .unwrap_or_default();

        let logic = match config.get("logic").and_then(|v| v.as_str()) {
            Some("OR") => Logic::Or,
            _ => Logic::And,
        };

        let passed = self
            .evaluator
            .evaluate_all(&conditions, &ctx.trigger_data, &ctx.variables, logic)
            .map_err(|e| ActionError::Failed {
                action_type: self.action_type().to_string(),
                reason: e.to_string(),
            })?;

        let branch = if passed { "true_actions" } else { "false_actions" };
        let actions = self.parse_branch(config, branch)?;

        let mut results = Vec::with_capacity(actions.len());
        for (action_type, action_config) in &actions {
            let result = registry
                .execute_action(action_type, action_config, ctx)
                .await?;
            results.push(result);
        }

        Ok(json!({"branch": passed, "results": results}))
    }
}

/// Register all built-in action kinds
pub fn register_builtin_actions(
    registry: &ActionRegistry,
    evaluator: Arc<ConditionEvaluator>,
    sink: Arc<dyn NotificationSink>,
) {
    registry.register(Arc::new(LogAction));
    registry.register(Arc::new(WaitAction));
    registry.register(Arc::new(SendNotificationAction { sink }));
    registry.register(Arc::new(SetVariableAction));
    registry.register(Arc::new(ConditionalAction { evaluator }));
}
