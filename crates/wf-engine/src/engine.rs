//! The automation engine

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

use wf_actions::{
    register_builtin_actions, ActionContext, ActionError, ActionRegistry, NotificationSink,
    TracingSink,
};
use wf_conditions::{ConditionEvaluator, Logic};
use wf_core::events::{
    ExecuteJobData, ExecutionCancelledData, ExecutionCompletedData, ExecutionFailedData,
    ExecutionQueuedData, ExecutionStartedData,
};
use wf_core::{Context, VariableContext, VariableScope};
use wf_cron::CronManager;
use wf_event_bus::SharedEventBus;
use wf_storage::SharedStore;
use wf_triggers::{register_builtin_triggers, TriggerEvent, TriggerRegistry};
use wf_variables::VariableResolver;

use crate::cancellation::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::execution::{ActionExecution, Execution, ExecutionStatus, RetryAttempt, TriggerInfo};
use crate::metrics::EngineMetrics;
use crate::recipe::{ActionDef, ExecutionSummary, Priority, Recipe, RecipeDefinition};

const RECIPE_KIND: &str = "recipes";
const EXECUTION_KIND: &str = "executions";

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global cap on in-flight executions
    pub max_concurrent_executions: usize,

    /// Queue poll interval
    pub tick_interval: Duration,

    /// Bounded execution history; oldest terminal runs pruned first
    pub history_limit: usize,

    /// How long shutdown waits for active executions to drain
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 5,
            tick_interval: Duration::from_millis(100),
            history_limit: 1000,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Orchestrator over recipes, executions, triggers, and actions
pub struct AutomationEngine {
    config: EngineConfig,
    recipes: DashMap<String, Recipe>,
    executions: DashMap<String, Execution>,

    /// Execution ids in creation order, for pruning
    history: Mutex<VecDeque<String>>,

    /// FIFO of queued execution ids; high priority jumps to the front
    queue: Mutex<VecDeque<String>>,

    /// In-flight executions and their cancel tokens
    active: DashMap<String, CancelToken>,

    triggers: Arc<TriggerRegistry>,
    actions: Arc<ActionRegistry>,
    evaluator: Arc<ConditionEvaluator>,
    resolver: Arc<VariableResolver>,

    /// Process-wide variable scope
    globals: DashMap<String, Value>,

    store: SharedStore,
    bus: SharedEventBus,
    cron: Option<Arc<CronManager>>,

    accepting: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AutomationEngine {
    /// Create an engine with built-in trigger and action kinds registered
    pub fn new(store: SharedStore, bus: SharedEventBus) -> Self {
        Self::with_sink(store, bus, Arc::new(TracingSink))
    }

    /// Create an engine with a custom notification sink
    pub fn with_sink(
        store: SharedStore,
        bus: SharedEventBus,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let evaluator = Arc::new(ConditionEvaluator::new());

        let triggers = Arc::new(TriggerRegistry::new());
        register_builtin_triggers(&triggers);

        let actions = Arc::new(ActionRegistry::new());
        register_builtin_actions(&actions, evaluator.clone(), sink);

        let resolver = Arc::new(VariableResolver::new().with_evaluator(evaluator.clone()));

        Self {
            config: EngineConfig::default(),
            recipes: DashMap::new(),
            executions: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            queue: Mutex::new(VecDeque::new()),
            active: DashMap::new(),
            triggers,
            actions,
            evaluator,
            resolver,
            globals: DashMap::new(),
            store,
            bus,
            cron: None,
            accepting: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a cron manager so schedule triggers create jobs
    pub fn with_cron(mut self, cron: Arc<CronManager>) -> Self {
        self.cron = Some(cron);
        self
    }

    /// Trigger catalog, for registering host-specific kinds
    pub fn trigger_registry(&self) -> &Arc<TriggerRegistry> {
        &self.triggers
    }

    /// Action catalog, for registering host-specific kinds
    pub fn action_registry(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    /// Set a process-wide variable visible as `$global.<key>`
    pub fn set_global_variable(&self, key: impl Into<String>, value: Value) {
        self.globals.insert(key.into(), value);
    }

    /// Rebuild recipe and execution state from the store
    ///
    /// Executions that were queued or running when the process died are
    /// marked failed; they are not resumed.
    pub async fn recover(&self) -> EngineResult<()> {
        for (id, record) in self.store.list_all(RECIPE_KIND).await? {
            match serde_json::from_value::<Recipe>(record) {
                Ok(recipe) => {
                    self.recipes.insert(recipe.id.clone(), recipe);
                }
                Err(e) => warn!(recipe_id = %id, error = %e, "Skipping unreadable recipe"),
            }
        }

        let mut recovered: Vec<Execution> = Vec::new();
        for (id, record) in self.store.list_all(EXECUTION_KIND).await? {
            match serde_json::from_value::<Execution>(record) {
                Ok(mut execution) => {
                    if !execution.status.is_terminal() {
                        execution.error = Some("interrupted by restart".to_string());
                        execution.finalize(ExecutionStatus::Failed);
                        self.persist_execution(&execution).await?;
                    }
                    recovered.push(execution);
                }
                Err(e) => warn!(execution_id = %id, error = %e, "Skipping unreadable execution"),
            }
        }
        recovered.sort_by_key(|e| e.created_at);

        let mut history = self.history.lock().await;
        for execution in recovered {
            history.push_back(execution.id.clone());
            self.executions.insert(execution.id.clone(), execution);
        }
        drop(history);

        info!(
            recipes = self.recipes.len(),
            executions = self.executions.len(),
            "Recovered engine state"
        );
        Ok(())
    }

    /// Start the tick loop and the scheduled-job listener
    pub async fn start(self: Arc<Self>) {
        self.accepting.store(true, Ordering::SeqCst);

        let engine = Arc::clone(&self);
        let tick = tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config.tick_interval);
            loop {
                interval.tick().await;
                Self::tick_once(&engine).await;
            }
        });

        let engine = Arc::clone(&self);
        let mut rx = self.bus.subscribe_typed::<ExecuteJobData>();
        let jobs = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => engine.handle_job_fire(event.data).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Job listener lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.tasks.lock().await.extend([tick, jobs]);
        info!("Engine started");
    }

    /// Stop accepting work and wait for active executions to drain
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while !self.active.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !self.active.is_empty() {
            warn!(remaining = self.active.len(), "Shutdown timed out with executions in flight");
        }

        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        info!("Engine stopped");
    }

    // ---- recipe lifecycle ----

    /// Validate and persist a new recipe
    pub async fn create_recipe(
        &self,
        user_id: impl Into<String>,
        definition: RecipeDefinition,
    ) -> EngineResult<Recipe> {
        self.validate_definition(&definition)?;

        let id = definition.id.clone().unwrap_or_else(|| Ulid::new().to_string());
        if self.recipes.contains_key(&id) {
            return Err(EngineError::Validation(format!("duplicate recipe id: {}", id)));
        }

        let now = Utc::now();
        let recipe = Recipe {
            id,
            user_id: user_id.into(),
            name: definition.name,
            description: definition.description,
            enabled: definition.enabled,
            trigger: definition.trigger,
            actions: definition.actions,
            settings: definition.settings,
            stats: Default::default(),
            created_at: now,
            updated_at: now,
        };

        if recipe.trigger.trigger_type == "schedule" {
            self.register_schedule(&recipe).await?;
        }

        self.persist_recipe(&recipe).await?;
        info!(recipe_id = %recipe.id, name = %recipe.name, "Created recipe");
        self.recipes.insert(recipe.id.clone(), recipe.clone());
        Ok(recipe)
    }

    /// Replace a recipe's definition, keeping identity and stats
    pub async fn update_recipe(
        &self,
        recipe_id: &str,
        definition: RecipeDefinition,
    ) -> EngineResult<Recipe> {
        self.validate_definition(&definition)?;

        let updated = {
            let mut entry = self
                .recipes
                .get_mut(recipe_id)
                .ok_or_else(|| EngineError::RecipeNotFound(recipe_id.to_string()))?;
            entry.name = definition.name;
            entry.description = definition.description;
            entry.enabled = definition.enabled;
            entry.trigger = definition.trigger;
            entry.actions = definition.actions;
            entry.settings = definition.settings;
            entry.updated_at = Utc::now();
            entry.clone()
        };

        if let Some(cron) = &self.cron {
            cron.remove_for_recipe(recipe_id).await?;
        }
        if updated.trigger.trigger_type == "schedule" {
            self.register_schedule(&updated).await?;
        }

        self.persist_recipe(&updated).await?;
        info!(recipe_id = %recipe_id, "Updated recipe");
        Ok(updated)
    }

    /// Delete a recipe, cancel its in-flight executions, drop its schedules
    pub async fn delete_recipe(&self, recipe_id: &str) -> EngineResult<()> {
        let (id, _recipe) = self
            .recipes
            .remove(recipe_id)
            .ok_or_else(|| EngineError::RecipeNotFound(recipe_id.to_string()))?;

        let queued: Vec<String> = self
            .executions
            .iter()
            .filter(|e| e.recipe_id == id && e.status == ExecutionStatus::Queued)
            .map(|e| e.id.clone())
            .collect();
        {
            let mut queue = self.queue.lock().await;
            queue.retain(|q| !queued.contains(q));
        }
        for execution_id in queued {
            self.finalize_cancelled(&execution_id).await;
        }
        for entry in self.active.iter() {
            let belongs = self
                .executions
                .get(entry.key())
                .map(|e| e.recipe_id == id)
                .unwrap_or(false);
            if belongs {
                entry.value().cancel();
            }
        }

        if let Some(cron) = &self.cron {
            cron.remove_for_recipe(&id).await?;
        }
        self.store.delete(RECIPE_KIND, &id).await?;
        info!(recipe_id = %id, "Deleted recipe");
        Ok(())
    }

    /// Toggle a recipe without touching the rest of its definition
    pub async fn set_recipe_enabled(&self, recipe_id: &str, enabled: bool) -> EngineResult<()> {
        let updated = {
            let mut entry = self
                .recipes
                .get_mut(recipe_id)
                .ok_or_else(|| EngineError::RecipeNotFound(recipe_id.to_string()))?;
            entry.enabled = enabled;
            entry.updated_at = Utc::now();
            entry.clone()
        };
        self.persist_recipe(&updated).await
    }

    pub fn get_recipe(&self, recipe_id: &str) -> Option<Recipe> {
        self.recipes.get(recipe_id).map(|entry| entry.clone())
    }

    pub fn list_recipes(&self) -> Vec<Recipe> {
        let mut recipes: Vec<Recipe> = self.recipes.iter().map(|entry| entry.clone()).collect();
        recipes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        recipes
    }

    // ---- event intake ----

    /// Offer an external event to every enabled recipe
    ///
    /// Returns the ids of the executions created. A recipe whose trigger
    /// matches but whose throttle gate rejects is skipped, not an error.
    pub async fn handle_event(&self, event: &TriggerEvent) -> EngineResult<Vec<String>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }

        let candidates: Vec<Recipe> = self
            .recipes
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| entry.clone())
            .collect();

        let mut created = Vec::new();
        for recipe in candidates {
            let matched = self
                .triggers
                .matches(&recipe.trigger.trigger_type, &recipe.trigger.config, event)
                .unwrap_or(false);
            if !matched {
                continue;
            }

            match self.evaluator.evaluate_all(
                &recipe.trigger.conditions,
                &event.data,
                &VariableContext::new(),
                Logic::And,
            ) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(recipe_id = %recipe.id, error = %e, "Trigger condition evaluation failed");
                    continue;
                }
            }

            if !self.throttle_allows(&recipe) {
                debug!(recipe_id = %recipe.id, "Throttle gate rejected event");
                continue;
            }

            let trigger = TriggerInfo {
                trigger_type: event.event_type.clone(),
                data: event.data.clone(),
                timestamp: Utc::now(),
            };
            created.push(self.enqueue(&recipe, trigger).await?);
        }
        Ok(created)
    }

    /// Manually run a recipe, bypassing trigger matching but not the gates
    pub async fn execute_recipe(
        &self,
        recipe_id: &str,
        context_data: Value,
    ) -> EngineResult<String> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::Validation("engine is shutting down".to_string()));
        }
        let recipe = self
            .recipes
            .get(recipe_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| EngineError::RecipeNotFound(recipe_id.to_string()))?;
        if !recipe.enabled {
            return Err(EngineError::RecipeDisabled(recipe_id.to_string()));
        }
        if !self.throttle_allows(&recipe) {
            return Err(EngineError::Throttled {
                recipe_id: recipe_id.to_string(),
                limit: recipe.settings.max_executions_per_hour.unwrap_or(0),
            });
        }

        let trigger = TriggerInfo {
            trigger_type: "manual".to_string(),
            data: context_data,
            timestamp: Utc::now(),
        };
        self.enqueue(&recipe, trigger).await
    }

    async fn handle_job_fire(&self, data: ExecuteJobData) {
        if !self.accepting.load(Ordering::SeqCst) {
            return;
        }
        let Some(recipe) = self.recipes.get(&data.recipe_id).map(|entry| entry.clone()) else {
            warn!(job_id = %data.job_id, recipe_id = %data.recipe_id, "Job fired for unknown recipe");
            return;
        };
        if !recipe.enabled {
            return;
        }
        if !self.throttle_allows(&recipe) {
            debug!(recipe_id = %recipe.id, "Throttle gate rejected scheduled run");
            return;
        }

        let trigger = TriggerInfo {
            trigger_type: "schedule".to_string(),
            data: json!({
                "job_id": data.job_id,
                "scheduled_for": data.scheduled_for.to_rfc3339(),
            }),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.enqueue(&recipe, trigger).await {
            warn!(recipe_id = %recipe.id, error = %e, "Failed to enqueue scheduled run");
        }
    }

    // ---- execution lifecycle ----

    async fn enqueue(&self, recipe: &Recipe, trigger: TriggerInfo) -> EngineResult<String> {
        let execution = Execution::new(&recipe.id, &recipe.user_id, trigger);
        let execution_id = execution.id.clone();
        let trigger_type = execution.trigger.trigger_type.clone();

        self.persist_execution(&execution).await?;
        self.executions.insert(execution_id.clone(), execution);
        self.history.lock().await.push_back(execution_id.clone());
        {
            let mut queue = self.queue.lock().await;
            if recipe.settings.priority == Priority::High {
                queue.push_front(execution_id.clone());
            } else {
                queue.push_back(execution_id.clone());
            }
        }

        self.bus.fire_typed(
            ExecutionQueuedData {
                execution_id: execution_id.clone(),
                recipe_id: recipe.id.clone(),
                trigger_type,
            },
            Context::with_user(&recipe.user_id),
        );
        info!(execution_id = %execution_id, recipe_id = %recipe.id, "Queued execution");
        Ok(execution_id)
    }

    /// Dequeue at most one execution per tick, subject to the global cap
    async fn tick_once(engine: &Arc<Self>) {
        let this = engine.as_ref();
        if this.active.len() >= this.config.max_concurrent_executions {
            return;
        }
        let Some(execution_id) = this.queue.lock().await.pop_front() else {
            return;
        };
        let status = match this.executions.get(&execution_id) {
            Some(execution) => execution.status,
            None => return,
        };
        if status != ExecutionStatus::Queued {
            return;
        }

        let token = CancelToken::new();
        this.active.insert(execution_id.clone(), token.clone());
        let engine = Arc::clone(engine);
        tokio::spawn(async move {
            // The slot guard releases even if an action panics the task
            let slot = ActiveSlot {
                engine: Arc::clone(&engine),
                execution_id,
            };
            engine.run_execution(&slot.execution_id, token).await;
            drop(slot);
        });
    }

    async fn run_execution(&self, execution_id: &str, token: CancelToken) {
        let (recipe, mut execution) = {
            let Some(execution) = self.executions.get(execution_id).map(|e| e.clone()) else {
                return;
            };
            match self.recipes.get(&execution.recipe_id).map(|r| r.clone()) {
                Some(recipe) => (recipe, execution),
                None => {
                    let mut execution = execution;
                    execution.error = Some("recipe deleted".to_string());
                    execution.finalize(ExecutionStatus::Failed);
                    self.store_back(execution).await;
                    return;
                }
            }
        };

        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        self.executions.insert(execution.id.clone(), execution.clone());
        // Terminal events carry a child of the start context so a run's
        // events form a traceable chain
        let run_ctx = Context::with_user(&execution.user_id);
        self.bus.fire_typed(
            ExecutionStartedData {
                execution_id: execution.id.clone(),
                recipe_id: execution.recipe_id.clone(),
                started_at: execution.started_at.unwrap_or_else(Utc::now),
            },
            run_ctx.clone(),
        );
        info!(execution_id = %execution.id, recipe_id = %recipe.id, "Execution started");

        let mut vars = self.build_variables(&recipe, &execution);
        let deadline = recipe
            .settings
            .timeout_seconds
            .map(|secs| Instant::now() + Duration::from_secs(secs));

        let mut outcome = ExecutionStatus::Completed;
        let mut failed_action_id = None;

        for (index, action) in recipe.actions.iter().enumerate() {
            // Cancellation and timeouts are observed between steps only
            if token.is_cancelled() {
                outcome = ExecutionStatus::Cancelled;
                break;
            }
            if matches!(deadline, Some(d) if Instant::now() >= d) {
                execution.error = Some("execution timed out".to_string());
                outcome = ExecutionStatus::Failed;
                break;
            }

            match self
                .run_action(index, action, &recipe, &mut execution, &mut vars)
                .await
            {
                Ok(()) => {}
                Err(error) => {
                    if action.continue_on_error {
                        debug!(
                            execution_id = %execution.id,
                            action_id = %action.id,
                            "Action failed, continuing"
                        );
                    } else {
                        execution.error = Some(error);
                        failed_action_id = Some(action.id.clone());
                        outcome = ExecutionStatus::Failed;
                        break;
                    }
                }
            }
            self.executions.insert(execution.id.clone(), execution.clone());
        }

        execution.finalize(outcome);
        self.resolver.invalidate_execution(&execution.id);

        let summary = ExecutionSummary {
            execution_id: execution.id.clone(),
            status: execution.status,
            duration_ms: execution.duration_ms.unwrap_or(0),
            started_at: execution.started_at.unwrap_or(execution.created_at),
        };
        let recipe_snapshot = self.recipes.get_mut(&execution.recipe_id).map(|mut entry| {
            entry.stats.record(summary);
            entry.clone()
        });
        if let Some(snapshot) = recipe_snapshot {
            if let Err(e) = self.persist_recipe(&snapshot).await {
                warn!(recipe_id = %snapshot.id, error = %e, "Failed to persist recipe stats");
            }
        }

        match execution.status {
            ExecutionStatus::Completed => {
                info!(
                    execution_id = %execution.id,
                    duration_ms = execution.duration_ms.unwrap_or(0),
                    "Execution completed"
                );
                self.bus.fire_typed(
                    ExecutionCompletedData {
                        execution_id: execution.id.clone(),
                        recipe_id: execution.recipe_id.clone(),
                        duration_ms: execution.duration_ms.unwrap_or(0),
                        action_count: execution.actions.len(),
                    },
                    run_ctx.child(),
                );
            }
            ExecutionStatus::Cancelled => {
                info!(execution_id = %execution.id, "Execution cancelled");
                self.bus.fire_typed(
                    ExecutionCancelledData {
                        execution_id: execution.id.clone(),
                        recipe_id: execution.recipe_id.clone(),
                    },
                    run_ctx.child(),
                );
            }
            _ => {
                warn!(
                    execution_id = %execution.id,
                    error = execution.error.as_deref().unwrap_or("unknown"),
                    "Execution failed"
                );
                self.bus.fire_typed(
                    ExecutionFailedData {
                        execution_id: execution.id.clone(),
                        recipe_id: execution.recipe_id.clone(),
                        error: execution.error.clone().unwrap_or_default(),
                        failed_action_id,
                    },
                    run_ctx.child(),
                );
            }
        }

        self.store_back(execution).await;
        self.prune_history().await;
    }

    /// Run one action: condition gate, resolve, execute with retries
    ///
    /// Ok means the pipeline continues; Err carries the terminal error of
    /// an exhausted action.
    async fn run_action(
        &self,
        index: usize,
        action: &ActionDef,
        recipe: &Recipe,
        execution: &mut Execution,
        vars: &mut VariableContext,
    ) -> Result<(), String> {
        let step_key = format!("action_{}_result", index);

        if !action.conditions.is_empty() {
            let passed = self
                .evaluator
                .evaluate_all(&action.conditions, &execution.trigger.data, vars, Logic::And)
                .map_err(|e| {
                    let mut record = ActionExecution::start(
                        &action.id,
                        &action.action_type,
                        action.config.clone(),
                    );
                    record.fail(e.to_string());
                    execution.actions.push(record);
                    e.to_string()
                })?;
            if !passed {
                debug!(action_id = %action.id, "Action conditions not met, skipping");
                let mut record = ActionExecution::start(
                    &action.id,
                    &action.action_type,
                    action.config.clone(),
                );
                record.complete(json!({"skipped": true}));
                execution.actions.push(record);
                vars.set_step(step_key, json!({"skipped": true}));
                return Ok(());
            }
        }

        let resolved = match self.resolver.resolve(&action.config, vars) {
            Ok(resolved) => resolved,
            Err(e) => {
                let mut record = ActionExecution::start(
                    &action.id,
                    &action.action_type,
                    action.config.clone(),
                );
                record.fail(e.to_string());
                execution.actions.push(record);
                return Err(e.to_string());
            }
        };

        let mut record = ActionExecution::start(&action.id, &action.action_type, resolved.clone());
        let ctx = ActionContext {
            execution_id: execution.id.clone(),
            recipe_id: recipe.id.clone(),
            user_id: execution.user_id.clone(),
            trigger_data: execution.trigger.data.clone(),
            variables: vars.clone(),
        };

        let max_attempts = action
            .retry
            .as_ref()
            .map(|r| r.max_attempts.max(1))
            .unwrap_or(1);
        let mut last_error = String::new();
        let mut output = None;

        for attempt in 1..=max_attempts {
            let fut = self
                .actions
                .execute_action(&action.action_type, &resolved, &ctx);
            let result = match action.timeout_seconds {
                Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), fut).await {
                    Ok(result) => result,
                    Err(_) => Err(ActionError::Failed {
                        action_type: action.action_type.clone(),
                        reason: format!("timed out after {}s", secs),
                    }),
                },
                None => fut.await,
            };

            match result {
                Ok(value) => {
                    output = Some(value);
                    break;
                }
                Err(e) => {
                    last_error = e.to_string();
                    record.retries.push(RetryAttempt {
                        attempt,
                        timestamp: Utc::now(),
                        error: last_error.clone(),
                    });
                    warn!(
                        action_id = %action.id,
                        attempt = attempt,
                        error = %last_error,
                        "Action attempt failed"
                    );
                    if attempt < max_attempts {
                        if let Some(retry) = &action.retry {
                            tokio::time::sleep(retry.delay_before(attempt)).await;
                        }
                    }
                }
            }
        }

        match output {
            Some(value) => {
                // set_variable writes land in execution scope
                if let Some(set) = value.get("set") {
                    if let (Some(name), Some(var_value)) =
                        (set.get("name").and_then(|n| n.as_str()), set.get("value"))
                    {
                        vars.set(VariableScope::Execution, name, var_value.clone());
                    }
                }
                vars.set_step(step_key, value.clone());
                record.complete(value);
                execution.actions.push(record);
                Ok(())
            }
            None => {
                record.fail(last_error.clone());
                execution.actions.push(record);
                Err(last_error)
            }
        }
    }

    fn build_variables(&self, recipe: &Recipe, execution: &Execution) -> VariableContext {
        let mut vars = VariableContext::new();
        for entry in self.globals.iter() {
            vars.set(VariableScope::Global, entry.key().clone(), entry.value().clone());
        }
        for (key, value) in &recipe.settings.variables {
            vars.set(VariableScope::Recipe, key.clone(), value.clone());
        }
        vars.set(VariableScope::Execution, "trigger", execution.trigger.data.clone());
        vars.set(
            VariableScope::Execution,
            "timestamp",
            json!(execution.trigger.timestamp.to_rfc3339()),
        );
        vars.set(VariableScope::Execution, "execution_id", json!(execution.id));
        vars.set(VariableScope::Execution, "recipe_id", json!(execution.recipe_id));
        vars.set(VariableScope::Execution, "user", json!(execution.user_id));
        if let Some(environment) = &recipe.settings.environment {
            vars.set(VariableScope::Execution, "environment", json!(environment));
        }
        vars
    }

    /// Cancel a queued, running, or paused execution
    pub async fn cancel_execution(&self, execution_id: &str) -> EngineResult<()> {
        let status = self
            .executions
            .get(execution_id)
            .map(|e| e.status)
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
        if !status.can_cancel() {
            return Err(EngineError::NotCancellable {
                execution_id: execution_id.to_string(),
                status: status.as_str().to_string(),
            });
        }

        if status == ExecutionStatus::Queued {
            self.queue.lock().await.retain(|q| q != execution_id);
            self.finalize_cancelled(execution_id).await;
        } else if let Some(entry) = self.active.get(execution_id) {
            // The run loop observes the token before its next step
            entry.value().cancel();
        } else {
            self.finalize_cancelled(execution_id).await;
        }
        Ok(())
    }

    async fn finalize_cancelled(&self, execution_id: &str) {
        // Re-check under the entry lock: the runner may have finished
        // between the caller's status read and now
        let cancelled = self.executions.get_mut(execution_id).and_then(|mut entry| {
            if !entry.status.can_cancel() {
                return None;
            }
            entry.finalize(ExecutionStatus::Cancelled);
            Some(entry.clone())
        });
        let Some(execution) = cancelled else { return };
        self.bus.fire_typed(
            ExecutionCancelledData {
                execution_id: execution.id.clone(),
                recipe_id: execution.recipe_id.clone(),
            },
            Context::with_user(&execution.user_id),
        );
        info!(execution_id = %execution_id, "Execution cancelled");
        self.store_back(execution).await;
    }

    // ---- queries ----

    pub fn get_execution(&self, execution_id: &str) -> Option<Execution> {
        self.executions.get(execution_id).map(|entry| entry.clone())
    }

    /// Executions filtered by recipe and status, newest first
    pub fn get_executions(
        &self,
        recipe_id: Option<&str>,
        status: Option<ExecutionStatus>,
        limit: Option<usize>,
    ) -> Vec<Execution> {
        let mut executions: Vec<Execution> = self
            .executions
            .iter()
            .filter(|e| recipe_id.map_or(true, |r| e.recipe_id == r))
            .filter(|e| status.map_or(true, |s| e.status == s))
            .map(|e| e.clone())
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            executions.truncate(limit);
        }
        executions
    }

    pub async fn get_metrics(&self) -> EngineMetrics {
        let mut metrics = EngineMetrics {
            total_recipes: self.recipes.len(),
            enabled_recipes: self.recipes.iter().filter(|r| r.enabled).count(),
            queue_depth: self.queue.lock().await.len(),
            active_executions: self.active.len(),
            ..Default::default()
        };

        let mut duration_sum = 0u64;
        let mut duration_count = 0u64;
        for execution in self.executions.iter() {
            metrics.total_executions += 1;
            match execution.status {
                ExecutionStatus::Queued => metrics.queued_executions += 1,
                ExecutionStatus::Running | ExecutionStatus::Paused => {
                    metrics.running_executions += 1
                }
                ExecutionStatus::Completed => metrics.completed_executions += 1,
                ExecutionStatus::Failed => metrics.failed_executions += 1,
                ExecutionStatus::Cancelled => metrics.cancelled_executions += 1,
            }
            if let Some(duration) = execution.duration_ms {
                duration_sum += duration;
                duration_count += 1;
            }
        }
        if duration_count > 0 {
            metrics.average_duration_ms = duration_sum as f64 / duration_count as f64;
        }
        metrics
    }

    // ---- internals ----

    fn validate_definition(&self, definition: &RecipeDefinition) -> EngineResult<()> {
        if definition.name.trim().is_empty() {
            return Err(EngineError::Validation("recipe name must not be empty".to_string()));
        }
        if definition.actions.is_empty() {
            return Err(EngineError::Validation(
                "recipe needs at least one action".to_string(),
            ));
        }

        self.triggers.validate_trigger_config(
            &definition.trigger.trigger_type,
            &definition.trigger.config,
        )?;

        let mut seen_ids = std::collections::HashSet::new();
        for action in &definition.actions {
            if action.id.trim().is_empty() {
                return Err(EngineError::Validation("action id must not be empty".to_string()));
            }
            if !seen_ids.insert(action.id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate action id: {}",
                    action.id
                )));
            }
            if !self.actions.is_valid_action(&action.action_type) {
                return Err(ActionError::UnknownActionType(action.action_type.clone()).into());
            }
            // Configs holding variable references are validated after
            // resolution, at execution time
            if !has_variable_markers(&action.config) {
                self.actions
                    .validate_action_config(&action.action_type, &action.config)?;
            }
        }
        Ok(())
    }

    /// Per-recipe rate limit over the trailing hour
    fn throttle_allows(&self, recipe: &Recipe) -> bool {
        let Some(limit) = recipe.settings.max_executions_per_hour else {
            return true;
        };
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let recent = self
            .executions
            .iter()
            .filter(|e| e.recipe_id == recipe.id && e.created_at > cutoff)
            .count();
        recent < limit as usize
    }

    async fn register_schedule(&self, recipe: &Recipe) -> EngineResult<()> {
        let Some(cron) = &self.cron else {
            warn!(recipe_id = %recipe.id, "Schedule trigger without a cron manager; recipe will only run manually");
            return Ok(());
        };
        let config = &recipe.trigger.config;

        if let Some(expression) = config.get("cron").and_then(|v| v.as_str()) {
            let timezone = config
                .get("timezone")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let max_runs = config
                .get("max_runs")
                .and_then(|v| v.as_u64())
                .map(|n| n as u32);
            let start_at = config
                .get("start_at")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc));
            let end_at = config
                .get("end_at")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc));
            cron.schedule_recurring_job(&recipe.id, expression, timezone, start_at, end_at, max_runs)
                .await?;
        } else if let Some(at) = config.get("at").and_then(|v| v.as_str()) {
            let execute_at = chrono::DateTime::parse_from_rfc3339(at)
                .map_err(|e| EngineError::Validation(format!("invalid at timestamp: {}", e)))?
                .with_timezone(&Utc);
            cron.schedule_one_time_job(&recipe.id, execute_at).await?;
        }
        Ok(())
    }

    async fn prune_history(&self) {
        let mut history = self.history.lock().await;
        while history.len() > self.config.history_limit {
            let Some(position) = history.iter().position(|id| {
                self.executions
                    .get(id)
                    .map(|e| e.status.is_terminal())
                    .unwrap_or(true)
            }) else {
                break;
            };
            let Some(execution_id) = history.remove(position) else { break };
            self.executions.remove(&execution_id);
            if let Err(e) = self.store.delete(EXECUTION_KIND, &execution_id).await {
                warn!(execution_id = %execution_id, error = %e, "Failed to prune execution");
            }
        }
    }

    async fn persist_recipe(&self, recipe: &Recipe) -> EngineResult<()> {
        self.store
            .save(RECIPE_KIND, &recipe.id, serde_json::to_value(recipe)?)
            .await?;
        Ok(())
    }

    async fn persist_execution(&self, execution: &Execution) -> EngineResult<()> {
        self.store
            .save(EXECUTION_KIND, &execution.id, serde_json::to_value(execution)?)
            .await?;
        Ok(())
    }

    /// Write an execution back to the map and the store, logging failures
    async fn store_back(&self, execution: Execution) {
        if let Err(e) = self.persist_execution(&execution).await {
            warn!(execution_id = %execution.id, error = %e, "Failed to persist execution");
        }
        self.executions.insert(execution.id.clone(), execution);
    }
}

/// Holds one slot in `active` for the lifetime of a run task
///
/// Dropping releases the slot; if the execution is still non-terminal at
/// that point the task unwound mid-run, so the execution is failed and
/// persisted rather than left stuck in Running.
struct ActiveSlot {
    engine: Arc<AutomationEngine>,
    execution_id: String,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.engine.active.remove(&self.execution_id);

        let aborted = self
            .engine
            .executions
            .get_mut(&self.execution_id)
            .and_then(|mut entry| {
                if entry.status.is_terminal() {
                    return None;
                }
                entry.error = Some("execution task panicked".to_string());
                entry.finalize(ExecutionStatus::Failed);
                Some(entry.clone())
            });
        let Some(execution) = aborted else { return };

        warn!(execution_id = %execution.id, "Execution task aborted mid-run");
        self.engine.bus.fire_typed(
            ExecutionFailedData {
                execution_id: execution.id.clone(),
                recipe_id: execution.recipe_id.clone(),
                error: execution.error.clone().unwrap_or_default(),
                failed_action_id: None,
            },
            Context::with_user(&execution.user_id),
        );

        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            if let Err(e) = engine.persist_execution(&execution).await {
                warn!(execution_id = %execution.id, error = %e, "Failed to persist execution");
            }
        });
    }
}

/// True when any string in the tree is a variable reference or template
fn has_variable_markers(value: &Value) -> bool {
    match value {
        Value::String(s) => s.starts_with('$') || s.contains("{{"),
        Value::Array(items) => items.iter().any(has_variable_markers),
        Value::Object(map) => map.values().any(has_variable_markers),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wf_event_bus::EventBus;
    use wf_storage::MemoryStore;

    fn engine() -> AutomationEngine {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let bus: SharedEventBus = Arc::new(EventBus::new());
        AutomationEngine::new(store, bus)
    }

    fn definition(name: &str) -> RecipeDefinition {
        serde_json::from_value(json!({
            "name": name,
            "trigger": {"type": "manual"},
            "actions": [
                {"id": "a1", "type": "log", "config": {"message": "hi"}}
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_recipe_validation() {
        let engine = engine();

        let mut no_actions = definition("x");
        no_actions.actions.clear();
        assert!(matches!(
            engine.create_recipe("u1", no_actions).await,
            Err(EngineError::Validation(_))
        ));

        let mut bad_trigger = definition("x");
        bad_trigger.trigger.trigger_type = "teleport".to_string();
        assert!(matches!(
            engine.create_recipe("u1", bad_trigger).await,
            Err(EngineError::Trigger(_))
        ));

        let mut bad_action = definition("x");
        bad_action.actions[0].action_type = "explode".to_string();
        assert!(matches!(
            engine.create_recipe("u1", bad_action).await,
            Err(EngineError::Action(_))
        ));

        let mut bad_config = definition("x");
        bad_config.actions[0].config = json!({});
        assert!(matches!(
            engine.create_recipe("u1", bad_config).await,
            Err(EngineError::Action(_))
        ));

        // Variable references defer config validation to run time
        let mut with_refs = definition("x");
        with_refs.actions[0].config = json!({"note": "$trigger.subject"});
        assert!(engine.create_recipe("u1", with_refs).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let engine = engine();
        let mut def = definition("first");
        def.id = Some("fixed".to_string());
        engine.create_recipe("u1", def.clone()).await.unwrap();

        def.name = "second".to_string();
        assert!(matches!(
            engine.create_recipe("u1", def).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_disabled_recipe_rejected() {
        let engine = engine();
        let mut def = definition("off");
        def.enabled = false;
        let recipe = engine.create_recipe("u1", def).await.unwrap();

        assert!(matches!(
            engine.execute_recipe(&recipe.id, json!({})).await,
            Err(EngineError::RecipeDisabled(_))
        ));

        engine.set_recipe_enabled(&recipe.id, true).await.unwrap();
        assert!(engine.execute_recipe(&recipe.id, json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let engine = engine();
        let recipe = engine.create_recipe("u1", definition("original")).await.unwrap();

        let mut def = definition("renamed");
        def.settings.max_executions_per_hour = Some(3);
        let updated = engine.update_recipe(&recipe.id, def).await.unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.settings.max_executions_per_hour, Some(3));
        assert_eq!(updated.created_at, recipe.created_at);

        engine.delete_recipe(&recipe.id).await.unwrap();
        assert!(engine.get_recipe(&recipe.id).is_none());
        assert!(matches!(
            engine.delete_recipe(&recipe.id).await,
            Err(EngineError::RecipeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_manual_throttle() {
        let engine = engine();
        let mut def = definition("tight");
        def.settings.max_executions_per_hour = Some(1);
        let recipe = engine.create_recipe("u1", def).await.unwrap();

        engine.execute_recipe(&recipe.id, json!({})).await.unwrap();
        assert!(matches!(
            engine.execute_recipe(&recipe.id, json!({})).await,
            Err(EngineError::Throttled { .. })
        ));
    }

    #[tokio::test]
    async fn test_finalize_cancelled_leaves_terminal_executions_alone() {
        let engine = engine();
        let recipe = engine.create_recipe("u1", definition("done")).await.unwrap();
        let execution_id = engine.execute_recipe(&recipe.id, json!({})).await.unwrap();
        engine.run_execution(&execution_id, CancelToken::new()).await;
        assert_eq!(
            engine.get_execution(&execution_id).unwrap().status,
            ExecutionStatus::Completed
        );

        // A cancel that loses the race against a finishing runner is a no-op
        engine.finalize_cancelled(&execution_id).await;
        assert_eq!(
            engine.get_execution(&execution_id).unwrap().status,
            ExecutionStatus::Completed
        );
    }

    #[test]
    fn test_variable_marker_detection() {
        assert!(has_variable_markers(&json!({"a": "$trigger.x"})));
        assert!(has_variable_markers(&json!(["plain", {"b": "say {{hi}}"}])));
        assert!(!has_variable_markers(&json!({"a": "plain", "n": 7})));
    }
}
