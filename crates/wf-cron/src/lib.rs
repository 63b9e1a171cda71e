//! Cron job manager
//!
//! Owns recurring and one-time schedule state bound to recipes. At due
//! times it fires `execute_job` events on the bus; running the recipe is
//! the engine's job. Every schedule mutation is persisted immediately so
//! a restart reconstructs identical state.

mod job;
mod manager;

pub use job::{JobStatus, OneTimeJob, ScheduledJob};
pub use manager::{CronError, CronManager, CronResult};
