//! The cron job manager

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

use wf_core::events::{ExecuteJobData, JobExpiredData, JobScheduledData};
use wf_core::Context;
use wf_event_bus::SharedEventBus;
use wf_storage::{SharedStore, StoreError};

use crate::job::{parse_cron, JobStatus, OneTimeJob, ScheduledJob};

const RECURRING_KIND: &str = "scheduled_jobs";
const ONE_TIME_KIND: &str = "one_time_jobs";

/// Tick interval for due-time checks
const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Cron manager errors
#[derive(Debug, Error)]
pub enum CronError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid schedule window: {0}")]
    InvalidWindow(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for cron operations
pub type CronResult<T> = Result<T, CronError>;

/// Owns schedule state, fires `execute_job` events at due times
///
/// The manager never runs recipes itself. Every mutation is written
/// through to the store before the call returns.
pub struct CronManager {
    recurring: DashMap<String, ScheduledJob>,
    one_time: DashMap<String, OneTimeJob>,
    store: SharedStore,
    bus: SharedEventBus,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

impl CronManager {
    /// Create a manager with empty schedule state
    pub fn new(store: SharedStore, bus: SharedEventBus) -> Self {
        Self {
            recurring: DashMap::new(),
            one_time: DashMap::new(),
            store,
            bus,
            tick_task: Mutex::new(None),
        }
    }

    /// Rebuild schedule state from the store
    ///
    /// Overdue one-time jobs fire exactly once here; recurring jobs whose
    /// window has passed self-disable instead of catching up.
    pub async fn recover(&self) -> CronResult<()> {
        let now = Utc::now();

        for (id, record) in self.store.list_all(ONE_TIME_KIND).await? {
            let mut job: OneTimeJob = match serde_json::from_value(record) {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Skipping unreadable one-time job");
                    continue;
                }
            };
            if !job.fired && job.execute_at <= now {
                info!(job_id = %job.id, recipe_id = %job.recipe_id, "Firing overdue one-time job");
                self.fire_execute(&job.id, &job.recipe_id, job.execute_at);
                job.fired = true;
                self.persist_one_time(&job).await?;
            }
            self.one_time.insert(job.id.clone(), job);
        }

        for (id, record) in self.store.list_all(RECURRING_KIND).await? {
            let mut job: ScheduledJob = match serde_json::from_value(record) {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Skipping unreadable scheduled job");
                    continue;
                }
            };
            if job.status != JobStatus::Disabled {
                if job.is_expired(now) || job.runs_exhausted() {
                    self.expire(&mut job, "window expired during downtime").await?;
                } else {
                    job.status = JobStatus::Active;
                    job.next_run = job.compute_next_run(now);
                    job.updated_at = now;
                    self.persist_recurring(&job).await?;
                }
            }
            self.recurring.insert(job.id.clone(), job);
        }

        info!(
            recurring = self.recurring.len(),
            one_time = self.one_time.len(),
            "Recovered schedule state"
        );
        Ok(())
    }

    /// Create a recurring job bound to a recipe
    pub async fn schedule_recurring_job(
        &self,
        recipe_id: impl Into<String>,
        cron: impl Into<String>,
        timezone: Option<String>,
        start_at: Option<DateTime<Utc>>,
        end_at: Option<DateTime<Utc>>,
        max_runs: Option<u32>,
    ) -> CronResult<ScheduledJob> {
        let cron = cron.into();
        parse_cron(&cron).map_err(|e| CronError::InvalidCron {
            expression: cron.clone(),
            reason: e.to_string(),
        })?;
        if let Some(tz) = &timezone {
            tz.parse::<chrono_tz::Tz>()
                .map_err(|_| CronError::InvalidTimezone(tz.clone()))?;
        }
        if let (Some(start), Some(end)) = (start_at, end_at) {
            if start >= end {
                return Err(CronError::InvalidWindow(
                    "start must be before end".to_string(),
                ));
            }
        }

        let now = Utc::now();
        let mut job = ScheduledJob {
            id: Ulid::new().to_string(),
            recipe_id: recipe_id.into(),
            cron,
            timezone,
            start_at,
            end_at,
            max_runs,
            run_count: 0,
            status: JobStatus::Scheduled,
            next_run: None,
            created_at: now,
            updated_at: now,
        };
        job.next_run = job.compute_next_run(now);

        self.persist_recurring(&job).await?;
        self.bus.fire_typed(
            JobScheduledData {
                job_id: job.id.clone(),
                recipe_id: job.recipe_id.clone(),
                next_run: job.next_run,
            },
            Context::new(),
        );
        info!(job_id = %job.id, recipe_id = %job.recipe_id, cron = %job.cron, "Scheduled recurring job");
        self.recurring.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    /// Create a one-time job bound to a recipe
    pub async fn schedule_one_time_job(
        &self,
        recipe_id: impl Into<String>,
        execute_at: DateTime<Utc>,
    ) -> CronResult<OneTimeJob> {
        if execute_at <= Utc::now() {
            return Err(CronError::InvalidWindow(
                "execute_at must be future-dated".to_string(),
            ));
        }

        let job = OneTimeJob {
            id: Ulid::new().to_string(),
            recipe_id: recipe_id.into(),
            execute_at,
            fired: false,
            created_at: Utc::now(),
        };

        self.persist_one_time(&job).await?;
        self.bus.fire_typed(
            JobScheduledData {
                job_id: job.id.clone(),
                recipe_id: job.recipe_id.clone(),
                next_run: Some(job.execute_at),
            },
            Context::new(),
        );
        info!(job_id = %job.id, recipe_id = %job.recipe_id, "Scheduled one-time job");
        self.one_time.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    /// Re-enable a disabled recurring job
    pub async fn enable_job(&self, job_id: &str) -> CronResult<()> {
        let updated = {
            let mut entry = self
                .recurring
                .get_mut(job_id)
                .ok_or_else(|| CronError::JobNotFound(job_id.to_string()))?;
            let now = Utc::now();
            entry.status = JobStatus::Active;
            entry.next_run = entry.compute_next_run(now);
            entry.updated_at = now;
            entry.clone()
        };
        self.persist_recurring(&updated).await
    }

    /// Disable a recurring job without deleting it
    pub async fn disable_job(&self, job_id: &str) -> CronResult<()> {
        let updated = {
            let mut entry = self
                .recurring
                .get_mut(job_id)
                .ok_or_else(|| CronError::JobNotFound(job_id.to_string()))?;
            entry.status = JobStatus::Disabled;
            entry.next_run = None;
            entry.updated_at = Utc::now();
            entry.clone()
        };
        self.persist_recurring(&updated).await
    }

    /// Delete a job of either kind
    pub async fn delete_job(&self, job_id: &str) -> CronResult<()> {
        if self.recurring.remove(job_id).is_some() {
            self.store.delete(RECURRING_KIND, job_id).await?;
            return Ok(());
        }
        if self.one_time.remove(job_id).is_some() {
            self.store.delete(ONE_TIME_KIND, job_id).await?;
            return Ok(());
        }
        Err(CronError::JobNotFound(job_id.to_string()))
    }

    /// Remove all jobs bound to a recipe; used on recipe deletion
    pub async fn remove_for_recipe(&self, recipe_id: &str) -> CronResult<()> {
        let recurring_ids: Vec<String> = self
            .recurring
            .iter()
            .filter(|entry| entry.recipe_id == recipe_id)
            .map(|entry| entry.id.clone())
            .collect();
        for id in recurring_ids {
            self.recurring.remove(&id);
            self.store.delete(RECURRING_KIND, &id).await?;
        }

        let one_time_ids: Vec<String> = self
            .one_time
            .iter()
            .filter(|entry| entry.recipe_id == recipe_id)
            .map(|entry| entry.id.clone())
            .collect();
        for id in one_time_ids {
            self.one_time.remove(&id);
            self.store.delete(ONE_TIME_KIND, &id).await?;
        }
        Ok(())
    }

    /// Look up a recurring job
    pub fn get_job(&self, job_id: &str) -> Option<ScheduledJob> {
        self.recurring.get(job_id).map(|entry| entry.clone())
    }

    /// Look up a one-time job
    pub fn get_one_time_job(&self, job_id: &str) -> Option<OneTimeJob> {
        self.one_time.get(job_id).map(|entry| entry.clone())
    }

    /// Start the due-time tick loop
    pub async fn start(self: Arc<Self>) {
        let manager = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = manager.tick(Utc::now()).await {
                    warn!(error = %e, "Schedule tick failed");
                }
            }
        });
        *self.tick_task.lock().await = Some(handle);
    }

    /// Stop the tick loop
    pub async fn shutdown(&self) {
        if let Some(handle) = self.tick_task.lock().await.take() {
            handle.abort();
        }
        debug!("Cron manager stopped");
    }

    /// One pass over due jobs; public for deterministic tests
    pub async fn tick(&self, now: DateTime<Utc>) -> CronResult<()> {
        let due_recurring: Vec<String> = self
            .recurring
            .iter()
            .filter(|entry| {
                entry.status != JobStatus::Disabled
                    && matches!(entry.next_run, Some(next) if next <= now)
            })
            .map(|entry| entry.id.clone())
            .collect();

        for id in due_recurring {
            let updated = {
                let Some(mut entry) = self.recurring.get_mut(&id) else {
                    continue;
                };
                let scheduled_for = match entry.next_run {
                    Some(next) => next,
                    None => continue,
                };
                self.fire_execute(&entry.id, &entry.recipe_id, scheduled_for);
                entry.run_count += 1;
                entry.status = JobStatus::Active;
                entry.next_run = entry.compute_next_run(now);
                entry.updated_at = now;
                entry.clone()
            };

            if updated.runs_exhausted() || updated.is_expired(now) || updated.next_run.is_none() {
                let mut job = updated;
                self.expire(&mut job, "schedule exhausted").await?;
                self.recurring.insert(job.id.clone(), job);
            } else {
                self.persist_recurring(&updated).await?;
            }
        }

        let due_one_time: Vec<String> = self
            .one_time
            .iter()
            .filter(|entry| !entry.fired && entry.execute_at <= now)
            .map(|entry| entry.id.clone())
            .collect();

        for id in due_one_time {
            let updated = {
                let Some(mut entry) = self.one_time.get_mut(&id) else {
                    continue;
                };
                self.fire_execute(&entry.id, &entry.recipe_id, entry.execute_at);
                entry.fired = true;
                entry.clone()
            };
            self.persist_one_time(&updated).await?;
        }

        Ok(())
    }

    fn fire_execute(&self, job_id: &str, recipe_id: &str, scheduled_for: DateTime<Utc>) {
        debug!(job_id = %job_id, recipe_id = %recipe_id, "Job due");
        self.bus.fire_typed(
            ExecuteJobData {
                job_id: job_id.to_string(),
                recipe_id: recipe_id.to_string(),
                scheduled_for,
            },
            Context::new(),
        );
    }

    async fn expire(&self, job: &mut ScheduledJob, reason: &str) -> CronResult<()> {
        info!(job_id = %job.id, recipe_id = %job.recipe_id, reason = %reason, "Disabling job");
        job.status = JobStatus::Disabled;
        job.next_run = None;
        job.updated_at = Utc::now();
        self.persist_recurring(job).await?;
        self.bus.fire_typed(
            JobExpiredData {
                job_id: job.id.clone(),
                recipe_id: job.recipe_id.clone(),
                reason: reason.to_string(),
            },
            Context::new(),
        );
        Ok(())
    }

    async fn persist_recurring(&self, job: &ScheduledJob) -> CronResult<()> {
        self.store
            .save(RECURRING_KIND, &job.id, serde_json::to_value(job)?)
            .await?;
        Ok(())
    }

    async fn persist_one_time(&self, job: &OneTimeJob) -> CronResult<()> {
        self.store
            .save(ONE_TIME_KIND, &job.id, serde_json::to_value(job)?)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use wf_event_bus::EventBus;
    use wf_storage::MemoryStore;

    fn setup() -> (Arc<CronManager>, SharedEventBus, SharedStore) {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let bus: SharedEventBus = Arc::new(EventBus::new());
        let manager = Arc::new(CronManager::new(store.clone(), bus.clone()));
        (manager, bus, store)
    }

    #[tokio::test]
    async fn test_schedule_validation() {
        let (manager, _bus, _store) = setup();

        assert!(matches!(
            manager
                .schedule_recurring_job("r1", "bogus", None, None, None, None)
                .await,
            Err(CronError::InvalidCron { .. })
        ));
        assert!(matches!(
            manager
                .schedule_recurring_job("r1", "0 9 * * *", Some("Mars/Olympus".to_string()), None, None, None)
                .await,
            Err(CronError::InvalidTimezone(_))
        ));

        let start = Utc::now() + Duration::hours(2);
        let end = Utc::now() + Duration::hours(1);
        assert!(matches!(
            manager
                .schedule_recurring_job("r1", "0 9 * * *", None, Some(start), Some(end), None)
                .await,
            Err(CronError::InvalidWindow(_))
        ));

        assert!(matches!(
            manager
                .schedule_one_time_job("r1", Utc::now() - Duration::hours(1))
                .await,
            Err(CronError::InvalidWindow(_))
        ));
    }

    #[tokio::test]
    async fn test_due_job_fires_execute_event() {
        let (manager, bus, _store) = setup();
        let mut rx = bus.subscribe_typed::<ExecuteJobData>();

        let job = manager
            .schedule_recurring_job("recipe-1", "* * * * *", None, None, None, None)
            .await
            .unwrap();

        // Pretend a minute has passed
        manager.tick(Utc::now() + Duration::minutes(2)).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.data.job_id, job.id);
        assert_eq!(event.data.recipe_id, "recipe-1");

        let after = manager.get_job(&job.id).unwrap();
        assert_eq!(after.run_count, 1);
        assert_eq!(after.status, JobStatus::Active);
    }

    #[tokio::test]
    async fn test_max_runs_self_disable() {
        let (manager, bus, _store) = setup();
        let mut expired = bus.subscribe_typed::<JobExpiredData>();

        let job = manager
            .schedule_recurring_job("recipe-1", "* * * * *", None, None, None, Some(1))
            .await
            .unwrap();

        manager.tick(Utc::now() + Duration::minutes(2)).await.unwrap();

        let event = expired.recv().await.unwrap();
        assert_eq!(event.data.job_id, job.id);
        assert_eq!(manager.get_job(&job.id).unwrap().status, JobStatus::Disabled);

        // A disabled job never fires again
        manager.tick(Utc::now() + Duration::minutes(5)).await.unwrap();
        assert_eq!(manager.get_job(&job.id).unwrap().run_count, 1);
    }

    #[tokio::test]
    async fn test_one_time_fires_once() {
        let (manager, bus, _store) = setup();
        let mut rx = bus.subscribe_typed::<ExecuteJobData>();

        let job = manager
            .schedule_one_time_job("recipe-1", Utc::now() + Duration::seconds(30))
            .await
            .unwrap();

        let later = Utc::now() + Duration::minutes(1);
        manager.tick(later).await.unwrap();
        manager.tick(later + Duration::minutes(1)).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.data.job_id, job.id);
        assert!(manager.get_one_time_job(&job.id).unwrap().fired);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv())
                .await
                .is_err(),
            "one-time job fired twice"
        );
    }

    #[tokio::test]
    async fn test_recovery_fires_overdue_one_time() {
        let (manager, _bus, store) = setup();
        let job = manager
            .schedule_one_time_job("recipe-1", Utc::now() + Duration::milliseconds(10))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        // Fresh manager over the same store simulates a restart
        let bus2: SharedEventBus = Arc::new(EventBus::new());
        let manager2 = CronManager::new(store.clone(), bus2.clone());
        let mut rx = bus2.subscribe_typed::<ExecuteJobData>();
        manager2.recover().await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.data.job_id, job.id);
        assert!(manager2.get_one_time_job(&job.id).unwrap().fired);
    }

    #[tokio::test]
    async fn test_recovery_disables_expired_recurring() {
        let (manager, _bus, store) = setup();
        let job = manager
            .schedule_recurring_job(
                "recipe-1",
                "0 9 * * *",
                None,
                None,
                Some(Utc::now() + Duration::milliseconds(10)),
                None,
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        let bus2: SharedEventBus = Arc::new(EventBus::new());
        let manager2 = CronManager::new(store, bus2);
        manager2.recover().await.unwrap();

        assert_eq!(manager2.get_job(&job.id).unwrap().status, JobStatus::Disabled);
    }

    #[tokio::test]
    async fn test_delete_and_remove_for_recipe() {
        let (manager, _bus, store) = setup();
        let a = manager
            .schedule_recurring_job("recipe-1", "0 9 * * *", None, None, None, None)
            .await
            .unwrap();
        let b = manager
            .schedule_one_time_job("recipe-1", Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        let other = manager
            .schedule_recurring_job("recipe-2", "0 9 * * *", None, None, None, None)
            .await
            .unwrap();

        manager.remove_for_recipe("recipe-1").await.unwrap();
        assert!(manager.get_job(&a.id).is_none());
        assert!(manager.get_one_time_job(&b.id).is_none());
        assert!(manager.get_job(&other.id).is_some());
        assert!(store.load(RECURRING_KIND, &a.id).await.unwrap().is_none());

        manager.delete_job(&other.id).await.unwrap();
        assert!(matches!(
            manager.delete_job(&other.id).await,
            Err(CronError::JobNotFound(_))
        ));
    }
}
