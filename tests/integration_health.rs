/// Health checking and retention integration tests
///
/// This test module tests the following functions:
/// - Stuck runs aborted and rescheduled by the scheduled check
/// - Bounded recovery ending in a critical report
/// - Recovery counters cleared by a completed run
/// - Recovery ending once a retry succeeds
/// - Due retries handed back to the scheduler
/// - Retention cleanup of events, task runs and snapshots
/// - State surviving a restart on the file-backed store
use chrono::Duration;
use std::sync::Arc;
use tempfile::tempdir;
use warden::prelude::*;
use warden::store::{EventQuery, TaskRunQuery};

struct Harness {
    clock: Arc<ManualClock>,
    warden: Warden,
}

fn harness_with(store: Arc<dyn MonitorStore>, clock: Arc<ManualClock>) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let warden = Warden::new(
        WardenConfig::default(),
        store,
        Arc::new(ManualProbe::new()),
        clock.clone(),
    )
    .expect("default configuration is valid");
    Harness { clock, warden }
}

fn harness() -> Harness {
    harness_with(Arc::new(MemoryStore::new()), Arc::new(ManualClock::default()))
}

fn fail(warden: &Warden, task_name: &str) -> TaskRun {
    warden
        .tasks()
        .run_task(task_name, Tier::Standard, |_, _| {
            Err("SMTP connection refused".to_string())
        })
        .unwrap()
}

fn events_in(warden: &Warden, event_type: EventType, context: &str) -> Vec<MonitoringEvent> {
    warden
        .bus()
        .get_events(&EventQuery::new().with_type(event_type))
        .unwrap()
        .into_iter()
        .filter(|event| event.context() == context)
        .collect()
}

#[test]
fn test_stuck_run_is_aborted_and_rescheduled() {
    let h = harness();
    let handle = h.warden.tasks().start_task("sync_catalog", Tier::Intensive).unwrap();
    let run_id = handle.run().id;

    h.clock.advance(Duration::minutes(30));
    let report = h.warden.scheduled_check().expect("check runs");
    assert_eq!(report.status, HealthStatus::Ok, "thirty minutes is not stuck");

    h.clock.advance(Duration::minutes(31));
    let report = h.warden.scheduled_check().expect("check runs");
    assert_eq!(report.status, HealthStatus::Warning);
    assert_eq!(report.stuck, vec!["sync_catalog"]);
    assert_eq!(report.rescheduled.len(), 1);
    assert_eq!(report.rescheduled[0].attempt, 1);
    assert_eq!(
        report.rescheduled[0].run_at,
        h.clock.now() + Duration::seconds(300)
    );

    let stored = h.warden.bus().store().get_task_run(run_id).unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Aborted);
    assert!(stored.end_time.is_some());

    let summaries = events_in(&h.warden, EventType::Warning, "health_check");
    assert_eq!(summaries.len(), 1);

    let report = h.warden.scheduled_check().expect("check runs");
    assert_eq!(report.status, HealthStatus::Ok, "aborted runs are not found again");
}

#[test]
fn test_due_retries_are_taken_once() {
    let h = harness();
    fail(&h.warden, "mailer");
    h.warden.scheduled_check().expect("check runs");

    assert!(h.warden.due_retries().unwrap().is_empty(), "not due yet");

    h.clock.advance(Duration::seconds(301));
    let due = h.warden.due_retries().unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].task_name, "mailer");
    assert_eq!(due[0].reason, "health_check_recovery");
    assert!(h.warden.due_retries().unwrap().is_empty());
}

#[test]
fn test_pending_retry_is_not_rescheduled_again() {
    let h = harness();
    fail(&h.warden, "mailer");

    let first = h.warden.scheduled_check().expect("check runs");
    assert_eq!(first.rescheduled.len(), 1);
    let second = h.warden.scheduled_check().expect("check runs");
    assert!(second.rescheduled.is_empty());
    assert_eq!(
        h.warden.bus().store().recovery_attempts("mailer").unwrap(),
        1
    );
}

#[test]
fn test_recovery_is_bounded_then_critical() {
    let h = harness();
    fail(&h.warden, "mailer");

    for attempt in 1..=3 {
        let report = h.warden.scheduled_check().expect("check runs");
        assert_eq!(report.status, HealthStatus::Warning);
        assert_eq!(report.rescheduled.len(), 1);
        assert_eq!(report.rescheduled[0].attempt, attempt);

        h.clock.advance(Duration::seconds(301));
        assert_eq!(h.warden.due_retries().unwrap().len(), 1);
        fail(&h.warden, "mailer");
    }

    let report = h.warden.scheduled_check().expect("check runs");
    assert_eq!(report.status, HealthStatus::Critical);
    assert_eq!(report.exhausted, vec!["mailer"]);
    assert!(report.rescheduled.is_empty());

    let exhausted = events_in(&h.warden, EventType::Critical, "recovery_exhausted");
    assert_eq!(exhausted.len(), 1);
    assert_eq!(exhausted[0].data_str("task_name"), Some("mailer"));
    assert_eq!(exhausted[0].priority(), Priority::CRITICAL);
    assert_eq!(events_in(&h.warden, EventType::Critical, "health_check").len(), 1);

    let report = h.warden.scheduled_check().expect("check runs");
    assert!(report.exhausted.is_empty(), "an exhausted failure is reported once");
    assert_eq!(
        events_in(&h.warden, EventType::Critical, "recovery_exhausted").len(),
        1
    );

    h.warden
        .tasks()
        .run_task("mailer", Tier::Standard, |_, _| Ok(TaskStatus::Completed))
        .unwrap();
    assert_eq!(
        h.warden.bus().store().recovery_attempts("mailer").unwrap(),
        0,
        "a completed run clears the counter"
    );
}

#[test]
fn test_successful_retry_ends_recovery() {
    let h = harness();
    fail(&h.warden, "mailer");
    let report = h.warden.scheduled_check().expect("check runs");
    assert_eq!(report.rescheduled.len(), 1);

    h.clock.advance(Duration::seconds(301));
    assert_eq!(h.warden.due_retries().unwrap().len(), 1);
    h.warden
        .tasks()
        .run_task("mailer", Tier::Standard, |_, _| Ok(TaskStatus::Completed))
        .unwrap();
    assert_eq!(h.warden.bus().store().recovery_attempts("mailer").unwrap(), 0);

    h.clock.advance(Duration::seconds(60));
    let report = h.warden.scheduled_check().expect("check runs");
    assert_eq!(report.status, HealthStatus::Ok);
    assert!(report.failed.is_empty());
    assert!(report.rescheduled.is_empty());
    assert_eq!(h.warden.bus().store().recovery_attempts("mailer").unwrap(), 0);
    assert!(h.warden.bus().store().scheduled_tasks().unwrap().is_empty());
}

#[test]
fn test_failure_is_recovered_once() {
    let h = harness();
    fail(&h.warden, "mailer");
    assert_eq!(h.warden.scheduled_check().unwrap().rescheduled.len(), 1);

    h.clock.advance(Duration::seconds(301));
    h.warden.due_retries().unwrap();

    let report = h.warden.scheduled_check().expect("check runs");
    assert!(report.failed.is_empty(), "the failure was already handled");
    assert!(report.rescheduled.is_empty());
    assert_eq!(h.warden.bus().store().recovery_attempts("mailer").unwrap(), 1);
}

#[test]
fn test_many_recent_failures_are_critical() {
    let h = harness();
    for i in 0..6 {
        fail(&h.warden, &format!("job_{}", i));
    }
    let report = h.warden.scheduled_check().expect("check runs");
    assert_eq!(report.failed.len(), 6);
    assert_eq!(report.status, HealthStatus::Critical);
    assert!(report.exhausted.is_empty());
}

#[test]
fn test_old_failures_are_ignored() {
    let h = harness();
    fail(&h.warden, "mailer");
    h.clock.advance(Duration::minutes(31));

    let report = h.warden.scheduled_check().expect("check runs");
    assert!(report.failed.is_empty());
    assert_eq!(report.status, HealthStatus::Ok);
}

#[test]
fn test_cleanup_applies_retention() {
    let h = harness();
    h.warden
        .tasks()
        .run_task("digest", Tier::Report, |_, _| Ok(TaskStatus::Completed))
        .unwrap();
    let running = h.warden.tasks().start_task("long_export", Tier::Intensive).unwrap();
    h.warden.baseline().snapshot("nightly");
    let old_events = h.warden.bus().get_events(&EventQuery::new()).unwrap().len();
    assert!(old_events > 0);

    h.clock.advance(Duration::days(31));
    h.warden.bus().emit(
        EventType::Info,
        "host",
        "test",
        "recent",
        EventData::new(),
        50,
    );

    let report = h.warden.cleanup().unwrap();
    assert_eq!(report.events_purged, old_events);
    assert_eq!(report.task_runs_purged, 1, "unfinished runs are kept");
    assert_eq!(report.snapshots_expired, 1);

    let remaining = h
        .warden
        .bus()
        .store()
        .task_runs(&TaskRunQuery::default())
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, running.run().id);
    assert_eq!(h.warden.bus().get_events(&EventQuery::new()).unwrap().len(), 1);
}

#[test]
fn test_file_store_state_survives_restart() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::default());

    {
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let h = harness_with(store, clock.clone());
        let moving = clock.clone();
        h.warden
            .tasks()
            .run_task("import_feeds", Tier::Standard, move |_, _| {
                moving.advance(Duration::seconds(12));
                Ok(TaskStatus::Completed)
            })
            .unwrap();
        fail(&h.warden, "mailer");
        h.warden.scheduled_check().expect("check runs");
    }

    let reopened = FileStore::open(dir.path()).unwrap();
    let baseline = reopened
        .get_baseline(&warden::store::BaselineKey::new("task_duration", "import_feeds"))
        .unwrap()
        .expect("baseline persisted");
    assert_eq!(baseline.sample_count, 1);
    assert!((baseline.value - 12.0).abs() < 1e-9);

    assert_eq!(reopened.task_runs(&TaskRunQuery::default()).unwrap().len(), 2);
    assert_eq!(reopened.recovery_attempts("mailer").unwrap(), 1);
    assert_eq!(reopened.scheduled_tasks().unwrap().len(), 1);
    assert!(
        !reopened
            .get_events(&EventQuery::new().with_type(EventType::Performance))
            .unwrap()
            .is_empty()
    );
}
