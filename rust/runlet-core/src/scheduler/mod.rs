//! Cron scheduling.
//!
//! Schedule expression parsing plus the live scheduler that keeps one timer
//! per stored cron definition.

pub mod cron;
pub mod executor;

pub use cron::{CronExpression, CronParser, Schedule};
pub use executor::CronScheduler;

use serde::Serialize;

/// Lifecycle of the timer set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    #[default]
    Stopped,
    Running,
}
