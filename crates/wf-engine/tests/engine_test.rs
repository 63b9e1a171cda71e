//! End-to-end engine behavior

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use wf_actions::{ActionContext, ActionError, ActionExecutor, ActionRegistry, ActionResult};
use wf_engine::{
    AutomationEngine, EngineConfig, EngineError, ExecutionStatus, RecipeDefinition,
};
use wf_event_bus::{EventBus, SharedEventBus};
use wf_storage::{MemoryStore, SharedStore};
use wf_triggers::TriggerEvent;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        max_concurrent_executions: 5,
        tick_interval: Duration::from_millis(10),
        history_limit: 1000,
        shutdown_timeout: Duration::from_secs(5),
    }
}

async fn started_engine(config: EngineConfig) -> (Arc<AutomationEngine>, SharedStore) {
    init_tracing();
    let store: SharedStore = Arc::new(MemoryStore::new());
    let bus: SharedEventBus = Arc::new(EventBus::new());
    let engine = Arc::new(AutomationEngine::new(store.clone(), bus).with_config(config));
    engine.clone().start().await;
    (engine, store)
}

fn definition(raw: Value) -> RecipeDefinition {
    serde_json::from_value(raw).expect("bad recipe fixture")
}

/// Wait until the execution reaches a terminal state
async fn wait_terminal(engine: &AutomationEngine, execution_id: &str) -> ExecutionStatus {
    for _ in 0..300 {
        if let Some(execution) = engine.get_execution(execution_id) {
            if execution.status.is_terminal() {
                return execution.status;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {} never finished", execution_id);
}

/// Always fails, for retry and continue-on-error coverage
struct FlakyAction;

#[async_trait::async_trait]
impl ActionExecutor for FlakyAction {
    fn action_type(&self) -> &'static str {
        "flaky"
    }

    fn validate_config(&self, _config: &Value) -> ActionResult<()> {
        Ok(())
    }

    async fn execute(
        &self,
        _config: &Value,
        _ctx: &ActionContext,
        _registry: &ActionRegistry,
    ) -> ActionResult<Value> {
        Err(ActionError::Failed {
            action_type: "flaky".to_string(),
            reason: "collaborator unavailable".to_string(),
        })
    }
}

/// Panics when executed, for slot-release coverage
struct ExplodingAction;

#[async_trait::async_trait]
impl ActionExecutor for ExplodingAction {
    fn action_type(&self) -> &'static str {
        "explode"
    }

    fn validate_config(&self, _config: &Value) -> ActionResult<()> {
        Ok(())
    }

    async fn execute(
        &self,
        _config: &Value,
        _ctx: &ActionContext,
        _registry: &ActionRegistry,
    ) -> ActionResult<Value> {
        panic!("executor crashed");
    }
}

#[tokio::test]
async fn test_urgent_email_end_to_end() -> Result<()> {
    let (engine, _store) = started_engine(fast_config()).await;

    engine
        .create_recipe(
            "user-1",
            definition(json!({
                "name": "urgent email alert",
                "trigger": {
                    "type": "email_received",
                    "conditions": [
                        {"field": "subject", "operator": "contains", "value": "URGENT"}
                    ]
                },
                "actions": [
                    {"id": "notify", "type": "send_notification",
                     "config": {"title": "Urgent: {{subject}}"}}
                ]
            })),
        )
        .await?;

    let created = engine
        .handle_event(&TriggerEvent::new(
            "email_received",
            json!({"subject": "URGENT: server down", "from": "ops@example.com"}),
        ))
        .await?;
    assert_eq!(created.len(), 1, "exactly one execution per matching event");

    let status = wait_terminal(&engine, &created[0]).await;
    assert_eq!(status, ExecutionStatus::Completed);

    let execution = engine.get_execution(&created[0]).expect("execution retained");
    assert_eq!(execution.actions.len(), 1);
    assert_eq!(
        execution.actions[0].input["title"],
        json!("Urgent: URGENT: server down")
    );
    assert!(execution.actions[0].output.is_some());

    let ignored = engine
        .handle_event(&TriggerEvent::new(
            "email_received",
            json!({"subject": "weekly digest"}),
        ))
        .await?;
    assert!(ignored.is_empty(), "non-matching event creates no executions");
    Ok(())
}

#[tokio::test]
async fn test_step_scope_visible_to_next_action() -> Result<()> {
    let (engine, _store) = started_engine(fast_config()).await;

    let recipe = engine
        .create_recipe(
            "user-1",
            definition(json!({
                "name": "chained",
                "trigger": {"type": "manual"},
                "actions": [
                    {"id": "first", "type": "log", "config": {"message": "step one done"}},
                    {"id": "second", "type": "log",
                     "config": {"message": "$step.action_0_result.logged"}}
                ]
            })),
        )
        .await?;

    let execution_id = engine.execute_recipe(&recipe.id, json!({})).await?;
    assert_eq!(wait_terminal(&engine, &execution_id).await, ExecutionStatus::Completed);

    let execution = engine.get_execution(&execution_id).unwrap();
    assert_eq!(execution.actions[1].input["message"], json!("step one done"));
    Ok(())
}

#[tokio::test]
async fn test_retry_trail_and_failure() -> Result<()> {
    let (engine, _store) = started_engine(fast_config()).await;
    engine.action_registry().register(Arc::new(FlakyAction));

    let recipe = engine
        .create_recipe(
            "user-1",
            definition(json!({
                "name": "retrying",
                "trigger": {"type": "manual"},
                "actions": [
                    {"id": "doomed", "type": "flaky", "config": {},
                     "retry": {"maxAttempts": 3, "delaySeconds": 0.05, "backoffMultiplier": 2.0}},
                    {"id": "after", "type": "log", "config": {"message": "unreachable"}}
                ]
            })),
        )
        .await?;

    let execution_id = engine.execute_recipe(&recipe.id, json!({})).await?;
    assert_eq!(wait_terminal(&engine, &execution_id).await, ExecutionStatus::Failed);

    let execution = engine.get_execution(&execution_id).unwrap();
    assert_eq!(execution.actions.len(), 1, "no actions run after a fatal failure");
    let doomed = &execution.actions[0];
    assert_eq!(doomed.retries.len(), 3, "every attempt is recorded");
    assert_eq!(doomed.retries[0].attempt, 1);
    assert_eq!(doomed.retries[2].attempt, 3);
    assert!(doomed.error.as_deref().unwrap_or("").contains("collaborator unavailable"));

    // Deterministic backoff: gap 1->2 roughly 50ms, gap 2->3 roughly 100ms
    let gap1 = (doomed.retries[1].timestamp - doomed.retries[0].timestamp).num_milliseconds();
    let gap2 = (doomed.retries[2].timestamp - doomed.retries[1].timestamp).num_milliseconds();
    assert!(gap1 >= 45, "first backoff too short: {}ms", gap1);
    assert!(gap2 >= 90, "second backoff too short: {}ms", gap2);
    assert!(gap2 > gap1, "backoff must grow");

    assert!(execution.error.is_some());
    Ok(())
}

#[tokio::test]
async fn test_continue_on_error_runs_remaining_actions() -> Result<()> {
    let (engine, _store) = started_engine(fast_config()).await;
    engine.action_registry().register(Arc::new(FlakyAction));

    let recipe = engine
        .create_recipe(
            "user-1",
            definition(json!({
                "name": "tolerant",
                "trigger": {"type": "manual"},
                "actions": [
                    {"id": "doomed", "type": "flaky", "config": {}, "continueOnError": true},
                    {"id": "after", "type": "log", "config": {"message": "still here"}}
                ]
            })),
        )
        .await?;

    let execution_id = engine.execute_recipe(&recipe.id, json!({})).await?;
    assert_eq!(wait_terminal(&engine, &execution_id).await, ExecutionStatus::Completed);

    let execution = engine.get_execution(&execution_id).unwrap();
    assert_eq!(execution.actions.len(), 2);
    assert!(execution.actions[0].error.is_some());
    assert!(execution.actions[1].output.is_some());
    Ok(())
}

#[tokio::test]
async fn test_action_conditions_skip_without_failing() -> Result<()> {
    let (engine, _store) = started_engine(fast_config()).await;

    let recipe = engine
        .create_recipe(
            "user-1",
            definition(json!({
                "name": "gated",
                "trigger": {"type": "manual"},
                "actions": [
                    {"id": "gated", "type": "log", "config": {"message": "never"},
                     "conditions": [
                        {"field": "priority", "operator": "equals", "value": "high"}
                     ]},
                    {"id": "always", "type": "log", "config": {"message": "ran"}}
                ]
            })),
        )
        .await?;

    let execution_id = engine
        .execute_recipe(&recipe.id, json!({"priority": "low"}))
        .await?;
    assert_eq!(wait_terminal(&engine, &execution_id).await, ExecutionStatus::Completed);

    let execution = engine.get_execution(&execution_id).unwrap();
    assert_eq!(execution.actions[0].output, Some(json!({"skipped": true})));
    assert_eq!(execution.actions[1].output, Some(json!({"logged": "ran"})));
    Ok(())
}

#[tokio::test]
async fn test_concurrency_cap_respected() -> Result<()> {
    let mut config = fast_config();
    config.max_concurrent_executions = 2;
    let (engine, _store) = started_engine(config).await;

    let recipe = engine
        .create_recipe(
            "user-1",
            definition(json!({
                "name": "slow",
                "trigger": {"type": "manual"},
                "actions": [
                    {"id": "nap", "type": "wait", "config": {"duration": 0.3}}
                ]
            })),
        )
        .await?;

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(engine.execute_recipe(&recipe.id, json!({})).await?);
    }

    let mut max_running = 0usize;
    loop {
        let running = ids
            .iter()
            .filter(|id| {
                engine
                    .get_execution(id)
                    .map(|e| e.status == ExecutionStatus::Running)
                    .unwrap_or(false)
            })
            .count();
        max_running = max_running.max(running);

        let done = ids
            .iter()
            .all(|id| engine.get_execution(id).map(|e| e.status.is_terminal()).unwrap_or(false));
        if done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    assert!(max_running >= 1);
    assert!(max_running <= 2, "observed {} running at once", max_running);
    for id in &ids {
        assert_eq!(engine.get_execution(id).unwrap().status, ExecutionStatus::Completed);
    }
    Ok(())
}

#[tokio::test]
async fn test_panicking_action_releases_concurrency_slot() -> Result<()> {
    let mut config = fast_config();
    config.max_concurrent_executions = 1;
    let (engine, _store) = started_engine(config).await;
    engine.action_registry().register(Arc::new(ExplodingAction));

    let crasher = engine
        .create_recipe(
            "user-1",
            definition(json!({
                "name": "crasher",
                "trigger": {"type": "manual"},
                "actions": [{"id": "boom", "type": "explode", "config": {}}]
            })),
        )
        .await?;
    let healthy = engine
        .create_recipe(
            "user-1",
            definition(json!({
                "name": "healthy",
                "trigger": {"type": "manual"},
                "actions": [{"id": "log", "type": "log", "config": {"message": "alive"}}]
            })),
        )
        .await?;

    let crashed_id = engine.execute_recipe(&crasher.id, json!({})).await?;
    assert_eq!(wait_terminal(&engine, &crashed_id).await, ExecutionStatus::Failed);
    let crashed = engine.get_execution(&crashed_id).unwrap();
    assert!(crashed.error.as_deref().unwrap_or("").contains("panicked"));

    // The single slot must be free again for the next run
    let next_id = engine.execute_recipe(&healthy.id, json!({})).await?;
    assert_eq!(wait_terminal(&engine, &next_id).await, ExecutionStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn test_execution_timestamp_is_trigger_time() -> Result<()> {
    let (engine, _store) = started_engine(fast_config()).await;

    let recipe = engine
        .create_recipe(
            "user-1",
            definition(json!({
                "name": "stamped",
                "trigger": {"type": "manual"},
                "actions": [
                    {"id": "nap", "type": "wait", "config": {"duration": 0.05}},
                    {"id": "stamp", "type": "log",
                     "config": {"message": "at {{$execution.timestamp}}"}}
                ]
            })),
        )
        .await?;

    let execution_id = engine.execute_recipe(&recipe.id, json!({})).await?;
    assert_eq!(wait_terminal(&engine, &execution_id).await, ExecutionStatus::Completed);

    // The wait before the log action moves wall-clock past the trigger time,
    // so the interpolated value must come from the trigger, not from now()
    let execution = engine.get_execution(&execution_id).unwrap();
    let expected = format!("at {}", execution.trigger.timestamp.to_rfc3339());
    assert_eq!(execution.actions[1].input["message"], json!(expected));
    Ok(())
}

#[tokio::test]
async fn test_execution_events_carry_user_and_causality() -> Result<()> {
    init_tracing();
    let store: SharedStore = Arc::new(MemoryStore::new());
    let bus: SharedEventBus = Arc::new(EventBus::new());
    let engine =
        Arc::new(AutomationEngine::new(store, bus.clone()).with_config(fast_config()));
    engine.clone().start().await;

    let mut rx = bus.subscribe_all();
    let recipe = engine
        .create_recipe(
            "user-9",
            definition(json!({
                "name": "traced",
                "trigger": {"type": "manual"},
                "actions": [{"id": "log", "type": "log", "config": {"message": "x"}}]
            })),
        )
        .await?;
    let execution_id = engine.execute_recipe(&recipe.id, json!({})).await?;
    wait_terminal(&engine, &execution_id).await;

    let mut started_ctx = None;
    let mut completed_ctx = None;
    while let Ok(event) = rx.try_recv() {
        match event.event_type.as_str() {
            "execution_started" => started_ctx = Some(event.context),
            "execution_completed" => completed_ctx = Some(event.context),
            _ => {}
        }
    }
    let started = started_ctx.expect("started event observed");
    let completed = completed_ctx.expect("completed event observed");
    assert_eq!(started.user_id.as_deref(), Some("user-9"));
    assert_eq!(completed.parent_id.as_deref(), Some(started.id.as_str()));
    Ok(())
}

#[tokio::test]
async fn test_throttle_gate_bounds_event_intake() -> Result<()> {
    let (engine, _store) = started_engine(fast_config()).await;

    engine
        .create_recipe(
            "user-1",
            definition(json!({
                "name": "throttled",
                "trigger": {"type": "webhook", "config": {"webhook_id": "hook-1"}},
                "actions": [
                    {"id": "log", "type": "log", "config": {"message": "hit"}}
                ],
                "settings": {"maxExecutionsPerHour": 2}
            })),
        )
        .await?;

    let mut total = 0;
    for _ in 0..5 {
        total += engine
            .handle_event(&TriggerEvent::new("webhook", json!({"webhook_id": "hook-1"})))
            .await?
            .len();
    }
    assert_eq!(total, 2, "throttle gate caps executions per hour");
    Ok(())
}

#[tokio::test]
async fn test_cooperative_cancellation() -> Result<()> {
    let (engine, _store) = started_engine(fast_config()).await;

    let recipe = engine
        .create_recipe(
            "user-1",
            definition(json!({
                "name": "cancellable",
                "trigger": {"type": "manual"},
                "actions": [
                    {"id": "nap1", "type": "wait", "config": {"duration": 0.2}},
                    {"id": "nap2", "type": "wait", "config": {"duration": 0.2}}
                ]
            })),
        )
        .await?;

    let execution_id = engine.execute_recipe(&recipe.id, json!({})).await?;

    // Let it start, then cancel mid-first-action
    for _ in 0..100 {
        if engine
            .get_execution(&execution_id)
            .map(|e| e.status == ExecutionStatus::Running)
            .unwrap_or(false)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine.cancel_execution(&execution_id).await?;

    assert_eq!(wait_terminal(&engine, &execution_id).await, ExecutionStatus::Cancelled);
    let execution = engine.get_execution(&execution_id).unwrap();
    assert!(
        execution.actions.len() <= 1,
        "cancellation takes effect before the next step"
    );

    // Terminal executions cannot be cancelled again
    assert!(matches!(
        engine.cancel_execution(&execution_id).await,
        Err(EngineError::NotCancellable { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_cancel_queued_execution() -> Result<()> {
    // Tick loop deliberately not started: the execution stays queued
    init_tracing();
    let store: SharedStore = Arc::new(MemoryStore::new());
    let bus: SharedEventBus = Arc::new(EventBus::new());
    let engine = AutomationEngine::new(store, bus).with_config(fast_config());

    let recipe = engine
        .create_recipe(
            "user-1",
            definition(json!({
                "name": "queued only",
                "trigger": {"type": "manual"},
                "actions": [{"id": "log", "type": "log", "config": {"message": "x"}}]
            })),
        )
        .await?;

    let execution_id = engine.execute_recipe(&recipe.id, json!({})).await?;
    engine.cancel_execution(&execution_id).await?;

    let execution = engine.get_execution(&execution_id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert!(execution.actions.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_restart_marks_interrupted_executions_failed() -> Result<()> {
    init_tracing();
    let store: SharedStore = Arc::new(MemoryStore::new());
    let bus: SharedEventBus = Arc::new(EventBus::new());
    let engine = AutomationEngine::new(store.clone(), bus);

    let recipe = engine
        .create_recipe(
            "user-1",
            definition(json!({
                "name": "survivor",
                "trigger": {"type": "manual"},
                "actions": [{"id": "log", "type": "log", "config": {"message": "x"}}]
            })),
        )
        .await?;
    let execution_id = engine.execute_recipe(&recipe.id, json!({})).await?;
    // Still queued: the tick loop never started. Simulates dying mid-flight.

    let bus2: SharedEventBus = Arc::new(EventBus::new());
    let engine2 = AutomationEngine::new(store, bus2);
    engine2.recover().await?;

    assert!(engine2.get_recipe(&recipe.id).is_some(), "recipes survive restart");
    let execution = engine2.get_execution(&execution_id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.as_deref(), Some("interrupted by restart"));
    Ok(())
}

#[tokio::test]
async fn test_metrics_snapshot() -> Result<()> {
    let (engine, _store) = started_engine(fast_config()).await;

    let recipe = engine
        .create_recipe(
            "user-1",
            definition(json!({
                "name": "counted",
                "trigger": {"type": "manual"},
                "actions": [{"id": "log", "type": "log", "config": {"message": "x"}}]
            })),
        )
        .await?;

    let execution_id = engine.execute_recipe(&recipe.id, json!({})).await?;
    wait_terminal(&engine, &execution_id).await;

    let metrics = engine.get_metrics().await;
    assert_eq!(metrics.total_recipes, 1);
    assert_eq!(metrics.enabled_recipes, 1);
    assert_eq!(metrics.completed_executions, 1);
    assert_eq!(metrics.active_executions, 0);

    let stats = engine.get_recipe(&recipe.id).unwrap().stats;
    assert_eq!(stats.total_executions, 1);
    assert_eq!(stats.successful_executions, 1);
    assert_eq!(stats.recent.len(), 1);
    Ok(())
}
