//! Live cron scheduler.
//!
//! Holds one timer task per cron definition. On every reload signal the whole
//! timer set is torn down and rebuilt from the store's current cron map.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use super::{CronParser, Schedule, SchedulerState};
use crate::sandbox::{CapabilityConfig, NetworkCapability, Sandbox};
use crate::store::{CronDefinition, Store};

/// Runs cron jobs through the sandbox and keeps them in sync with the store.
#[derive(Clone)]
pub struct CronScheduler {
    store: Arc<Store>,
    sandbox: Sandbox,
    net: NetworkCapability,
    timeout: Duration,
    inner: Arc<Mutex<Timers>>,
}

#[derive(Default)]
struct Timers {
    state: SchedulerState,
    tasks: JoinSet<()>,
    keys: BTreeSet<String>,
}

impl std::fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CronScheduler")
            .field("state", &inner.state)
            .field("active", &inner.keys)
            .finish_non_exhaustive()
    }
}

impl CronScheduler {
    /// Jobs run with the given allow-list and time budget.
    pub fn new(sandbox: Sandbox, net: NetworkCapability, timeout: Duration) -> Self {
        Self {
            store: Arc::clone(sandbox.store()),
            sandbox,
            net,
            timeout,
            inner: Arc::new(Mutex::new(Timers::default())),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.lock().state
    }

    /// Keys of the crons that currently have a timer.
    pub fn active_keys(&self) -> Vec<String> {
        self.inner.lock().keys.iter().cloned().collect()
    }

    /// Stop every timer. Jobs already running are left to finish.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        // Dropping the set aborts every timer.
        inner.tasks = JoinSet::new();
        inner.keys.clear();
        inner.state = SchedulerState::Stopped;
    }

    /// Tear down the timer set and register one timer per stored cron.
    pub fn rebuild(&self) {
        self.stop();

        let crons = self.store.crons_get();
        let mut inner = self.inner.lock();
        for (key, definition) in crons {
            let schedule = match CronParser::parse(&definition.interval) {
                Ok(schedule) => schedule,
                Err(e) => {
                    tracing::warn!(
                        cron_key = %key,
                        error = %e,
                        "Skipping cron with invalid interval"
                    );
                    continue;
                }
            };
            inner.keys.insert(key.clone());
            inner.tasks.spawn(self.clone().tick_loop(key, definition, schedule));
        }
        inner.state = SchedulerState::Running;
        tracing::info!(active = inner.keys.len(), "Cron schedule rebuilt");
    }

    /// Build the schedule, then rebuild on every signal until the channel closes.
    pub async fn run(self, mut reload: mpsc::Receiver<()>) {
        self.rebuild();
        while reload.recv().await.is_some() {
            tracing::debug!("Cron reload signal received");
            self.rebuild();
        }
        self.stop();
        tracing::info!("Cron scheduler stopped");
    }

    /// Take the store's reload receiver and run in the background.
    pub fn spawn(self) -> Option<JoinHandle<()>> {
        let reload = self.store.take_reload_receiver()?;
        Some(tokio::spawn(self.run(reload)))
    }

    async fn tick_loop(self, key: String, definition: CronDefinition, schedule: Schedule) {
        loop {
            let now = Utc::now();
            let Some(next) = schedule.next_after(&now) else {
                tracing::warn!(cron_key = %key, "Cron has no upcoming run");
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            // Ticks never wait for each other.
            let scheduler = self.clone();
            let key = key.clone();
            let job = definition.job.clone();
            tokio::spawn(async move { scheduler.fire(&key, &job).await });
        }
    }

    async fn fire(&self, key: &str, job: &str) {
        let config = CapabilityConfig::new(self.net.clone(), self.timeout).with_cron(true);
        match self.sandbox.execute_job(job, config).await {
            Ok(_) => tracing::debug!(cron_key = key, "Cron job finished"),
            Err(err) => tracing::warn!(
                cron_key = key,
                kind = err.kind(),
                error = %err,
                "Cron job failed"
            ),
        }
    }
}
