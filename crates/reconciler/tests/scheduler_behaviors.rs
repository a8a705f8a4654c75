//! Behavior tests for per-object scheduling and retry governance.
//!
//! All tests run on a paused clock, so backoff delays are deterministic.

#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

mod common;

use std::time::Duration;

use common::{Call, Scripted, Step, app, conflict, settle, start, transient, wait_until};
use steward_core::{Error, TriggerCause};
use steward_reconciler::{FailureClass, RetryPolicy, Scheduler, SchedulerConfig};
use steward_workflow::RetryInfo;

fn config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_workers(4)
        .with_retry(Some(RetryPolicy::quick()))
}

/// Timer deadlines land on millisecond ticks.
fn assert_gap(earlier: &Call, later: &Call, expected: Duration) {
    let gap = later.at - earlier.at;
    assert!(
        gap >= expected && gap <= expected + Duration::from_millis(2),
        "expected a gap of {expected:?}, got {gap:?}"
    );
}

const fn info(attempt_count: u32, last_attempt: bool) -> Option<RetryInfo> {
    Some(RetryInfo {
        attempt_count,
        last_attempt,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// AT MOST ONE IN FLIGHT / COALESCING
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn given_busy_identity_when_triggers_arrive_then_one_follow_up_dispatch() {
    // GIVEN: a dispatch of "shop" held in flight
    let (dispatch, gate) = Scripted::gated();
    let scheduler = Scheduler::new(dispatch.clone(), config());
    let runner = start(&scheduler);
    let id = app("shop");
    scheduler.submit(id.clone(), TriggerCause::Added).await;
    wait_until(|| dispatch.calls().len() == 1).await;
    assert!(scheduler.is_under_processing(&id).await);

    // WHEN: six more triggers arrive before it finishes
    for _ in 0..5 {
        scheduler.submit(id.clone(), TriggerCause::Updated).await;
    }
    scheduler
        .submit(id.clone(), TriggerCause::DependentEvent)
        .await;
    gate.add_permits(2);
    settle().await;

    // THEN: exactly one follow-up ran, carrying the coalesced causes
    let calls = dispatch.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].causes, vec![TriggerCause::Added]);
    assert_eq!(
        calls[1].causes,
        vec![TriggerCause::Updated, TriggerCause::DependentEvent]
    );
    assert!(!dispatch.overlapped());

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn given_two_workers_when_four_identities_trigger_then_two_run_at_once() {
    // GIVEN: a pool of two workers
    let (dispatch, gate) = Scripted::gated();
    let scheduler = Scheduler::new(dispatch.clone(), config().with_workers(2));
    let runner = start(&scheduler);

    // WHEN: four identities trigger at once
    for name in ["a", "b", "c", "d"] {
        scheduler.submit(app(name), TriggerCause::Added).await;
    }
    settle().await;

    // THEN: only two are dispatched until a worker frees up
    assert_eq!(dispatch.calls().len(), 2);
    gate.add_permits(4);
    wait_until(|| dispatch.calls().len() == 4).await;
    settle().await;
    assert_eq!(dispatch.peak_concurrency(), 2);

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn given_stopped_scheduler_when_triggered_then_dispatched_on_next_run() {
    // GIVEN: a scheduler that is not running
    let dispatch = Scripted::new();
    let scheduler = Scheduler::new(dispatch.clone(), config());

    // WHEN: triggers arrive before it starts
    scheduler.submit(app("early"), TriggerCause::Added).await;
    settle().await;
    assert!(dispatch.calls().is_empty());
    let runner = start(&scheduler);

    // THEN: they are dispatched once it runs
    wait_until(|| dispatch.calls().len() == 1).await;

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════
// CONFLICTS AND RETRIES
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn given_conflicts_when_dispatch_fails_then_redispatched_without_retry_budget() {
    // GIVEN: two conflicts, then success
    let dispatch = Scripted::new();
    let id = app("shop");
    dispatch.script(&id, [Step::Fail(conflict(&id)), Step::Fail(conflict(&id))]);
    let scheduler = Scheduler::new(dispatch.clone(), config());
    let runner = start(&scheduler);

    // WHEN
    scheduler.submit(id.clone(), TriggerCause::Added).await;
    settle().await;

    // THEN: re-dispatched immediately, no attempt counted
    let calls = dispatch.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|call| call.retry.is_none()));
    assert!(calls[2].at - calls[0].at < Duration::from_millis(2));
    assert_eq!(scheduler.stats().conflicts, 2);
    assert_eq!(scheduler.retry_info(&id).await, None);
    assert!(scheduler.failure(&id).await.is_none());

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn given_retry_in_progress_when_conflict_then_attempt_count_unchanged() {
    // GIVEN: a transient failure followed by a conflict
    let dispatch = Scripted::new();
    let id = app("shop");
    dispatch.script(&id, [Step::Fail(transient()), Step::Fail(conflict(&id))]);
    let scheduler = Scheduler::new(dispatch.clone(), config());
    let runner = start(&scheduler);

    // WHEN
    scheduler.submit(id.clone(), TriggerCause::Added).await;
    settle().await;

    // THEN: the conflict re-dispatch sees the same attempt count
    let retries: Vec<_> = dispatch.calls().iter().map(|call| call.retry).collect();
    assert_eq!(retries, vec![None, info(1, false), info(1, false)]);
    assert_eq!(scheduler.retry_info(&id).await, None);

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn given_transient_failures_when_retried_then_backoff_grows() {
    // GIVEN: 10ms initial delay doubling per attempt
    let dispatch = Scripted::new();
    let id = app("shop");
    dispatch.script(&id, [Step::Fail(transient()), Step::Fail(transient())]);
    let scheduler = Scheduler::new(dispatch.clone(), config());
    let runner = start(&scheduler);

    // WHEN
    scheduler.submit(id.clone(), TriggerCause::Added).await;
    settle().await;

    // THEN
    let calls = dispatch.calls();
    assert_eq!(calls.len(), 3);
    assert_gap(&calls[0], &calls[1], Duration::from_millis(10));
    assert_gap(&calls[1], &calls[2], Duration::from_millis(20));
    assert_eq!(calls[1].causes, vec![TriggerCause::Retry]);
    let retries: Vec<_> = calls.iter().map(|call| call.retry).collect();
    assert_eq!(retries, vec![None, info(1, false), info(2, false)]);

    // success clears retry state and the failure record
    assert_eq!(scheduler.retry_info(&id).await, None);
    assert!(scheduler.failure(&id).await.is_none());

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn given_persistent_failure_when_budget_spent_then_terminal_until_next_trigger() {
    // GIVEN: two retries allowed and a dispatch that keeps failing
    let dispatch = Scripted::new();
    let id = app("shop");
    dispatch.script(&id, std::iter::repeat_n(Step::Fail(transient()), 10));
    let policy = RetryPolicy::quick().with_max_attempts(Some(2));
    let scheduler = Scheduler::new(dispatch.clone(), config().with_retry(Some(policy)));
    let runner = start(&scheduler);

    // WHEN
    scheduler.submit(id.clone(), TriggerCause::Added).await;
    settle().await;

    // THEN: first attempt plus two retries, the last flagged
    let calls = dispatch.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2].retry, info(2, true));
    let failure = scheduler.failure(&id).await.unwrap();
    assert!(failure.terminal);
    assert_eq!(failure.attempts, 2);
    assert_eq!(failure.class, FailureClass::Transient);
    assert_eq!(scheduler.stats().retries_exhausted, 1);

    // AND: a new trigger still dispatches
    scheduler.submit(id.clone(), TriggerCause::Updated).await;
    settle().await;
    assert_eq!(dispatch.calls().len(), 4);
    assert!(scheduler.failure(&id).await.unwrap().terminal);

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn given_terminal_error_when_dispatch_fails_then_not_retried() {
    // GIVEN
    let dispatch = Scripted::new();
    let id = app("shop");
    dispatch.script(&id, [Step::Fail(Error::invalid_config("bad graph"))]);
    let scheduler = Scheduler::new(dispatch.clone(), config());
    let runner = start(&scheduler);

    // WHEN
    scheduler.submit(id.clone(), TriggerCause::Added).await;
    settle().await;

    // THEN
    assert_eq!(dispatch.calls().len(), 1);
    let failure = scheduler.failure(&id).await.unwrap();
    assert!(failure.terminal);
    assert_eq!(failure.class, FailureClass::Terminal);
    assert!(failure.message.contains("bad graph"));

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn given_no_retry_with_reschedule_when_failed_then_rescheduled_instead() {
    // GIVEN: the error handler suppressed retry but asked for a later look
    let dispatch = Scripted::new();
    let id = app("shop");
    dispatch.script(
        &id,
        [Step::FailWithoutRetry(transient(), Some(Duration::from_millis(50)))],
    );
    let scheduler = Scheduler::new(dispatch.clone(), config());
    let runner = start(&scheduler);

    // WHEN
    scheduler.submit(id.clone(), TriggerCause::Added).await;
    settle().await;

    // THEN
    let calls = dispatch.calls();
    assert_eq!(calls.len(), 2);
    assert_gap(&calls[0], &calls[1], Duration::from_millis(50));
    assert_eq!(calls[1].causes, vec![TriggerCause::Rescheduled]);
    assert_eq!(calls[1].retry, None);

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn given_panicking_dispatch_when_run_then_recorded_and_others_continue() {
    // GIVEN
    let dispatch = Scripted::new();
    let broken = app("broken");
    dispatch.script(&broken, [Step::Panic]);
    let scheduler = Scheduler::new(dispatch.clone(), config());
    let runner = start(&scheduler);

    // WHEN
    scheduler.submit(broken.clone(), TriggerCause::Added).await;
    settle().await;
    scheduler.submit(app("fine"), TriggerCause::Added).await;
    settle().await;

    // THEN
    let failure = scheduler.failure(&broken).await.unwrap();
    assert!(failure.terminal);
    assert!(failure.message.contains("panicked"));
    assert_eq!(scheduler.stats().panicked, 1);
    assert_eq!(dispatch.calls_for(&app("fine")).len(), 1);
    assert!(!scheduler.is_under_processing(&broken).await);

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════
// TIMERS
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn given_two_reschedules_when_armed_then_last_one_wins() {
    // GIVEN
    let dispatch = Scripted::new();
    let scheduler = Scheduler::new(dispatch.clone(), config());
    let runner = start(&scheduler);
    let id = app("shop");

    // WHEN: a 10s re-schedule is replaced by a 1s one
    scheduler.reschedule(&id, Duration::from_secs(10)).await;
    scheduler.reschedule(&id, Duration::from_secs(1)).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // THEN: one dispatch after 1s, none after 10s
    assert_eq!(dispatch.calls().len(), 1);
    assert_eq!(dispatch.calls()[0].causes, vec![TriggerCause::Rescheduled]);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(dispatch.calls().len(), 1);
    assert!(!scheduler.has_timer(&id).await);

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn given_reschedule_outcome_when_delay_elapses_then_dispatched_again() {
    // GIVEN
    let dispatch = Scripted::new();
    let id = app("shop");
    dispatch.script(&id, [Step::Reschedule(Duration::from_millis(100))]);
    let scheduler = Scheduler::new(dispatch.clone(), config());
    let runner = start(&scheduler);

    // WHEN
    scheduler.submit(id.clone(), TriggerCause::Added).await;
    settle().await;

    // THEN
    let calls = dispatch.calls();
    assert_eq!(calls.len(), 2);
    assert_gap(&calls[0], &calls[1], Duration::from_millis(100));

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn given_max_interval_when_idle_then_resynced_periodically() {
    // GIVEN: a one second resync interval
    let dispatch = Scripted::new();
    let scheduler = Scheduler::new(
        dispatch.clone(),
        config().with_max_reconciliation_interval(Some(Duration::from_secs(1))),
    );
    let runner = start(&scheduler);

    // WHEN
    scheduler.submit(app("shop"), TriggerCause::Added).await;
    tokio::time::sleep(Duration::from_millis(3500)).await;

    // THEN: the initial dispatch plus three resyncs
    assert_eq!(dispatch.calls().len(), 4);

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════
// DELETION AND SHUTDOWN
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn given_idle_identity_when_deleted_then_state_dropped() {
    // GIVEN: an identity with a pending re-schedule
    let dispatch = Scripted::new();
    let id = app("shop");
    dispatch.script(&id, [Step::Reschedule(Duration::from_secs(5))]);
    let scheduler = Scheduler::new(dispatch.clone(), config());
    let runner = start(&scheduler);
    scheduler.submit(id.clone(), TriggerCause::Added).await;
    settle().await;
    assert!(scheduler.has_timer(&id).await);

    // WHEN
    scheduler.submit(id.clone(), TriggerCause::Deleted).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    // THEN: the timer never fired
    assert_eq!(scheduler.tracked_count().await, 0);
    assert_eq!(dispatch.calls().len(), 1);

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn given_in_flight_identity_when_deleted_then_dropped_after_completion() {
    // GIVEN
    let (dispatch, gate) = Scripted::gated();
    let id = app("shop");
    dispatch.script(&id, [Step::Fail(transient())]);
    let scheduler = Scheduler::new(dispatch.clone(), config());
    let runner = start(&scheduler);
    scheduler.submit(id.clone(), TriggerCause::Added).await;
    wait_until(|| dispatch.calls().len() == 1).await;

    // WHEN: the delete arrives mid-dispatch, which then fails
    scheduler.submit(id.clone(), TriggerCause::Deleted).await;
    assert_eq!(scheduler.tracked_count().await, 1);
    gate.add_permits(1);
    settle().await;

    // THEN: no retry, no state
    assert_eq!(dispatch.calls().len(), 1);
    assert_eq!(scheduler.tracked_count().await, 0);

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn given_finalizer_removed_when_terminating_updates_arrive_then_ignored() {
    // GIVEN: cleanup finished and the finalizer is gone
    let dispatch = Scripted::new();
    let id = app("shop");
    dispatch.script(&id, [Step::RemoveFinalizer]);
    let scheduler = Scheduler::new(dispatch.clone(), config());
    let runner = start(&scheduler);
    scheduler
        .submit_terminating(id.clone(), TriggerCause::Updated)
        .await;
    settle().await;

    // WHEN: more updates of the terminating object arrive
    scheduler
        .submit_terminating(id.clone(), TriggerCause::Updated)
        .await;
    settle().await;

    // THEN: no second cleanup; the delete clears the state
    assert_eq!(dispatch.calls().len(), 1);
    assert_eq!(scheduler.stats().finalizers_removed, 1);
    scheduler.submit(id.clone(), TriggerCause::Deleted).await;
    assert_eq!(scheduler.tracked_count().await, 0);

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn given_object_gone_from_cache_when_dispatch_skipped_then_state_dropped() {
    // GIVEN: the dispatch finds nothing to reconcile
    let dispatch = Scripted::new();
    let id = app("shop");
    dispatch.script(&id, [Step::Skip]);
    let scheduler = Scheduler::new(
        dispatch.clone(),
        config().with_max_reconciliation_interval(Some(Duration::from_secs(1))),
    );
    let runner = start(&scheduler);

    // WHEN
    scheduler.submit(id.clone(), TriggerCause::Updated).await;
    settle().await;

    // THEN: nothing is kept and no resync is armed
    assert_eq!(scheduler.tracked_count().await, 0);
    assert!(!scheduler.has_timer(&id).await);
    assert_eq!(scheduler.stats().succeeded, 0);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(dispatch.calls().len(), 1);

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn given_finalizer_added_when_dispatched_then_counted_and_dispatched_again() {
    // GIVEN
    let dispatch = Scripted::new();
    let id = app("shop");
    dispatch.script(&id, [Step::AddFinalizer, Step::Succeed]);
    let scheduler = Scheduler::new(dispatch.clone(), config());
    let runner = start(&scheduler);

    // WHEN
    scheduler.submit(id.clone(), TriggerCause::Added).await;
    settle().await;

    // THEN
    let calls = dispatch.calls_for(&id);
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].causes, vec![TriggerCause::Rescheduled]);
    let stats = scheduler.stats();
    assert_eq!(stats.finalizers_added, 1);
    assert_eq!(stats.succeeded, 2);

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn given_armed_timer_when_stopped_then_timer_cancelled() {
    // GIVEN: a re-schedule five seconds out
    let dispatch = Scripted::new();
    let id = app("shop");
    dispatch.script(&id, [Step::Reschedule(Duration::from_secs(5))]);
    let scheduler = Scheduler::new(dispatch.clone(), config());
    let runner = start(&scheduler);
    scheduler.submit(id.clone(), TriggerCause::Added).await;
    settle().await;
    assert!(scheduler.has_timer(&id).await);

    // WHEN
    scheduler.stop();
    runner.await.unwrap().unwrap();

    // THEN: the timer is gone and never records a trigger
    assert!(!scheduler.has_timer(&id).await);
    tokio::time::sleep(Duration::from_secs(10)).await;
    let runner = start(&scheduler);
    settle().await;
    assert_eq!(dispatch.calls().len(), 1);

    scheduler.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn given_in_flight_dispatch_when_stopped_then_run_waits_for_it() {
    // GIVEN
    let (dispatch, gate) = Scripted::gated();
    let scheduler = Scheduler::new(dispatch.clone(), config());
    let runner = start(&scheduler);
    scheduler.submit(app("shop"), TriggerCause::Added).await;
    wait_until(|| dispatch.calls().len() == 1).await;

    // WHEN
    scheduler.stop();
    settle().await;

    // THEN: run only returns after the dispatch completes
    assert!(!runner.is_finished());
    gate.add_permits(1);
    runner.await.unwrap().unwrap();
    assert!(!scheduler.is_running());
    assert_eq!(scheduler.stats().succeeded, 1);

    // AND: nothing new starts while stopped
    scheduler.submit(app("late"), TriggerCause::Added).await;
    settle().await;
    assert_eq!(dispatch.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn given_running_scheduler_when_run_again_then_rejected() {
    let scheduler = Scheduler::new(Scripted::new(), config());
    let runner = start(&scheduler);
    settle().await;

    let second = scheduler.run().await;

    assert!(matches!(second, Err(Error::InvalidConfig { .. })));
    scheduler.stop();
    runner.await.unwrap().unwrap();
}
