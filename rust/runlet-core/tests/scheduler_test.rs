use std::sync::Arc;
use std::time::Duration;

use runlet_core::{CronScheduler, NetworkCapability, Sandbox, SchedulerState, Store};
use tempfile::TempDir;

fn scheduler() -> (TempDir, Arc<Store>, CronScheduler) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path()).unwrap());
    let scheduler = CronScheduler::new(
        Sandbox::new(Arc::clone(&store)),
        NetworkCapability::AllowAll,
        Duration::from_secs(2),
    );
    (dir, store, scheduler)
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

#[tokio::test]
async fn test_rebuild_tracks_store_crons() {
    let (_dir, store, scheduler) = scheduler();
    assert_eq!(scheduler.state(), SchedulerState::Stopped);

    store.crons_set("a", "@hourly", "|| 1").unwrap();
    store.crons_set("b", "*/5 * * * * *", "|| 2").unwrap();
    scheduler.rebuild();
    assert_eq!(scheduler.state(), SchedulerState::Running);
    assert_eq!(scheduler.active_keys(), vec!["a", "b"]);

    store.crons_unset("a").unwrap();
    scheduler.rebuild();
    assert_eq!(scheduler.active_keys(), vec!["b"]);

    scheduler.stop();
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    assert!(scheduler.active_keys().is_empty());
}

#[tokio::test]
async fn test_reload_signal_rebuilds_running_scheduler() {
    let (_dir, store, scheduler) = scheduler();
    store.crons_set("first", "@daily", "|| 1").unwrap();

    let handle = scheduler.clone().spawn().unwrap();
    assert!(wait_for(|| scheduler.active_keys() == vec!["first"]).await);

    store.crons_set("second", "@hourly", "|| 2").unwrap();
    assert!(wait_for(|| scheduler.active_keys() == vec!["first", "second"]).await);

    store.crons_unset("first").unwrap();
    assert!(wait_for(|| scheduler.active_keys() == vec!["second"]).await);
    assert_eq!(scheduler.active_keys(), store.crons_get().keys().cloned().collect::<Vec<_>>());

    // Only one scheduler can own the reload channel.
    assert!(scheduler.clone().spawn().is_none());
    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_jobs_fire_and_failures_do_not_stop_the_schedule() {
    let (_dir, store, scheduler) = scheduler();
    store
        .crons_set(
            "marker",
            "@every 1s",
            r#"|| cron::set("fired", "@yearly", "|| 0")"#,
        )
        .unwrap();
    store.crons_set("broken", "@every 1s", "|| { throw \"nope\"; }").unwrap();

    scheduler.rebuild();
    assert!(wait_for(|| store.crons_get().contains_key("fired")).await);

    // The failing job keeps its timer.
    assert!(scheduler.active_keys().contains(&"broken".to_string()));
    scheduler.stop();
}
