use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::runtime::Handle;

use batch::{Batch, BatchBuilder, BatchError, BatchState, JobOutcome, ResultState};
use executor::{DispatchConfig, DispatchEngine, handler_fn};
use scheduler::{TriggerConfig, TriggerController};

/// Handler that fails any job whose payload has `"fail": true` and echoes the
/// rest.
fn controller(cfg: TriggerConfig) -> Arc<TriggerController> {
    let handler = handler_fn(|job: batch::JobUnit| async move {
        if job.payload()["fail"] == json!(true) {
            anyhow::bail!("job {} refused", job.id());
        }
        Ok(job.payload().clone())
    });
    let engine = DispatchEngine::new(Arc::new(handler), DispatchConfig::default());
    TriggerController::new(cfg, Arc::new(engine), Handle::current())
}

fn batch_of(ids: &[&str]) -> Batch {
    let mut b = BatchBuilder::new(|_| Ok(()));
    for id in ids {
        b.add_with_id(*id, json!({ "id": id })).unwrap();
    }
    b.finalize().unwrap()
}

fn abc_with_b_failing() -> Batch {
    let mut b = BatchBuilder::with_key("nightly", |_| Ok(()));
    b.add_with_id("A", json!({ "n": 1 })).unwrap();
    b.add_with_id("B", json!({ "n": 2, "fail": true })).unwrap();
    b.add_with_id("C", json!({ "n": 3 })).unwrap();
    b.finalize().unwrap()
}

#[tokio::test]
async fn explicit_trigger_reports_partial_failure() {
    let ctl = controller(TriggerConfig::manual());
    let handle = ctl.arm(abc_with_b_failing()).unwrap();
    let id = handle.id();

    assert_eq!(handle.state().unwrap(), BatchState::Pending);
    handle.trigger().unwrap();

    let result = handle.wait().await.unwrap();
    assert_eq!(result.state(), ResultState::PartialFailure);
    assert!(result.outcome("A").unwrap().is_success());
    assert!(matches!(result.outcome("B"), Some(JobOutcome::Failure(r)) if r.contains("refused")));
    assert!(result.outcome("C").unwrap().is_success());

    assert_eq!(ctl.registry().state(id).unwrap(), BatchState::Completed);
    assert!(ctl.registry().is_empty());
}

#[tokio::test]
async fn second_trigger_loses() {
    let ctl = controller(TriggerConfig::manual());
    let handle = ctl.arm(batch_of(&["x"])).unwrap();

    handle.trigger().unwrap();
    assert_eq!(
        handle.trigger(),
        Err(BatchError::AlreadyDispatching(handle.id()))
    );

    handle.wait().await.unwrap();
    assert_eq!(ctl.counters().snapshot().lost_races, 1);
}

#[tokio::test]
async fn item_count_fires_on_arm() {
    let ctl = controller(TriggerConfig::manual().with_max_items(2));
    let handle = ctl.arm(batch_of(&["a", "b"])).unwrap();

    let result = handle.wait().await.unwrap();
    assert_eq!(result.state(), ResultState::AllSucceeded);

    let snap = ctl.counters().snapshot();
    assert_eq!(snap.fired_item_count, 1);
    assert_eq!(snap.fired_explicit, 0);
    assert_eq!(snap.batches_completed, 1);
}

#[tokio::test]
async fn below_item_count_stays_pending() {
    let ctl = controller(TriggerConfig::manual().with_max_items(3));
    let handle = ctl.arm(batch_of(&["a", "b"])).unwrap();

    tokio::task::yield_now().await;
    assert_eq!(handle.state().unwrap(), BatchState::Pending);

    handle.trigger().unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn timeout_fires_after_max_wait() {
    let ctl = controller(TriggerConfig::manual().with_max_wait(Duration::from_secs(5)));
    let handle = ctl.arm(batch_of(&["a"])).unwrap();

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(handle.state().unwrap(), BatchState::Pending);

    let result = handle.wait().await.unwrap();
    assert_eq!(result.state(), ResultState::AllSucceeded);
    assert_eq!(ctl.counters().snapshot().fired_timeout, 1);
}

#[tokio::test(start_paused = true)]
async fn explicit_trigger_beats_timeout() {
    let ctl = controller(TriggerConfig::manual().with_max_wait(Duration::from_secs(5)));
    let handle = ctl.arm(batch_of(&["a"])).unwrap();
    let id = handle.id();

    handle.trigger().unwrap();
    handle.wait().await.unwrap();

    // Well past the deadline: the aborted timer must not count anything.
    tokio::time::sleep(Duration::from_secs(10)).await;
    let snap = ctl.counters().snapshot();
    assert_eq!(snap.fired_explicit, 1);
    assert_eq!(snap.fired_timeout, 0);
    assert_eq!(ctl.registry().state(id).unwrap(), BatchState::Completed);
}

#[tokio::test]
async fn cancel_before_zero_wait_timer_runs() {
    // Current-thread runtime: the zero-delay timer cannot run before we yield.
    let ctl = controller(TriggerConfig::manual().with_max_wait(Duration::ZERO));
    let handle = ctl.arm(batch_of(&["a"])).unwrap();
    let id = handle.id();

    handle.cancel().unwrap();
    assert_eq!(handle.wait().await.unwrap_err(), BatchError::Cancelled(id));

    tokio::task::yield_now().await;
    let snap = ctl.counters().snapshot();
    assert_eq!(snap.cancelled, 1);
    assert_eq!(snap.fired_timeout, 0);
    assert_eq!(ctl.registry().state(id).unwrap(), BatchState::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_races_zero_wait_timer() {
    let ran = Arc::new(AtomicUsize::new(0));

    for _ in 0..32 {
        let counter = Arc::clone(&ran);
        let handler = handler_fn(move |_job: batch::JobUnit| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        });
        let engine = DispatchEngine::new(Arc::new(handler), DispatchConfig::default());
        let ctl = TriggerController::new(
            TriggerConfig::manual().with_max_wait(Duration::ZERO),
            Arc::new(engine),
            Handle::current(),
        );

        let before = ran.load(Ordering::SeqCst);
        let handle = ctl.arm(batch_of(&["only"])).unwrap();
        let cancelled = handle.cancel().is_ok();
        let outcome = handle.wait().await;

        // Exactly one side wins: either the job ran and delivered, or it was
        // cancelled and never ran.
        if cancelled {
            assert!(matches!(outcome, Err(BatchError::Cancelled(_))));
            assert_eq!(ran.load(Ordering::SeqCst), before);
        } else {
            assert_eq!(outcome.unwrap().state(), ResultState::AllSucceeded);
            assert_eq!(ran.load(Ordering::SeqCst), before + 1);
        }
    }
}

#[tokio::test]
async fn manual_trigger_can_be_disabled() {
    let cfg = TriggerConfig::manual()
        .with_max_items(10)
        .with_manual(false);
    let ctl = controller(cfg);
    let handle = ctl.arm(batch_of(&["a"])).unwrap();

    assert_eq!(
        handle.trigger(),
        Err(BatchError::ManualTriggerDisabled(handle.id()))
    );
    assert_eq!(handle.state().unwrap(), BatchState::Pending);
}

#[tokio::test]
async fn arming_same_batch_twice_is_rejected() {
    let ctl = controller(TriggerConfig::manual());
    let batch = batch_of(&["a"]);
    let id = batch.id();

    let handle = ctl.arm(batch.clone()).unwrap();
    assert_eq!(ctl.arm(batch.clone()).unwrap_err(), BatchError::DuplicateBatch(id));

    // Still rejected once the original has been retired.
    handle.cancel().unwrap();
    assert_eq!(ctl.arm(batch).unwrap_err(), BatchError::DuplicateBatch(id));
}

#[tokio::test]
async fn trigger_after_cancel_is_invalid() {
    let ctl = controller(TriggerConfig::manual());
    let handle = ctl.arm(batch_of(&["a"])).unwrap();
    let id = handle.id();

    handle.cancel().unwrap();
    assert_eq!(
        handle.trigger(),
        Err(BatchError::InvalidTransition {
            batch_id: id,
            from: BatchState::Cancelled,
            to: BatchState::Dispatching,
        })
    );
    assert_eq!(
        handle.cancel(),
        Err(BatchError::InvalidTransition {
            batch_id: id,
            from: BatchState::Cancelled,
            to: BatchState::Cancelled,
        })
    );
}

#[tokio::test]
async fn all_failed_batch_retires_as_failed() {
    let ctl = controller(TriggerConfig::manual());
    let mut b = BatchBuilder::new(|_| Ok(()));
    b.add_with_id("a", json!({ "fail": true })).unwrap();
    b.add_with_id("b", json!({ "fail": true })).unwrap();
    let handle = ctl.arm(b.finalize().unwrap()).unwrap();
    let id = handle.id();

    handle.trigger().unwrap();
    let result = handle.wait().await.unwrap();

    assert_eq!(result.state(), ResultState::AllFailed);
    assert_eq!(ctl.registry().state(id).unwrap(), BatchState::Failed);

    let snap = ctl.counters().snapshot();
    assert_eq!(snap.batches_failed, 1);
    assert_eq!(snap.jobs_failed, 2);
}

#[tokio::test]
async fn shutdown_cancels_pending_and_refuses_new_batches() {
    let ctl = controller(TriggerConfig::manual());
    let first = ctl.arm(batch_of(&["a"])).unwrap();
    let second = ctl.arm(batch_of(&["b"])).unwrap();

    let mut cancelled = ctl.shutdown();
    cancelled.sort();
    let mut expected = vec![first.id(), second.id()];
    expected.sort();
    assert_eq!(cancelled, expected);

    assert!(matches!(first.wait().await, Err(BatchError::Cancelled(_))));
    assert!(matches!(second.wait().await, Err(BatchError::Cancelled(_))));
    assert_eq!(ctl.arm(batch_of(&["c"])).unwrap_err(), BatchError::ShutDown);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn dispatch_is_logged_with_its_source() {
    let ctl = controller(TriggerConfig::manual().with_max_items(1));
    let handle = ctl.arm(batch_of(&["a"])).unwrap();
    handle.wait().await.unwrap();

    assert!(logs_contain("trigger fired"));
    assert!(logs_contain("item_count"));
    assert!(logs_contain("batch dispatched"));
}
