//! Saturation behaviour of the submission policies
//!
//! Every test forces saturation deterministically: a single-slot queue (or a
//! single-worker executor) is filled by the test before the policy under test
//! is exercised.

use index_orchestrator::backpressure::BoxTask;
use index_orchestrator::{
    BoundedExecutor, ErrorHandler, FailureStage, OffloadedTask, SharedError, SubmissionPolicy,
    Submitted, WorkExecutor,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Uniquely identifiable failure.
#[derive(Debug, Error)]
#[error("marker failure #{0}")]
struct Marker(u32);

fn marker_id(error: &SharedError) -> Option<u32> {
    error.downcast_ref::<Marker>().map(|marker| marker.0)
}

fn saturated_queue() -> (mpsc::Sender<u32>, mpsc::Receiver<u32>) {
    let (tx, rx) = mpsc::channel(1);
    tx.try_send(0).unwrap();
    (tx, rx)
}

/// Executor with its only worker held and its only queue slot taken.
async fn saturated_executor() -> (BoundedExecutor, oneshot::Sender<()>) {
    let executor = BoundedExecutor::new("saturated", 1, 1);
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let (started_tx, started_rx) = oneshot::channel::<()>();

    let hold: BoxTask = Box::pin(async move {
        let _ = started_tx.send(());
        let _ = release_rx.await;
        anyhow::Ok(())
    });
    assert!(executor.try_execute(hold).is_ok());
    started_rx.await.unwrap();
    let queued: BoxTask = Box::pin(async { anyhow::Ok(()) });
    assert!(executor.try_execute(queued).is_ok());

    (executor, release_tx)
}

fn recording_handler() -> (ErrorHandler, Arc<Mutex<Vec<(FailureStage, SharedError)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: ErrorHandler = Arc::new(move |stage, error| {
        sink.lock().unwrap().push((stage, error));
    });
    (handler, seen)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocking_releases_exactly_one_waiter_per_slot() {
    let (tx, mut rx) = saturated_queue();
    let cancel = CancellationToken::new();

    let spawn_waiter = |value: u32| {
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            SubmissionPolicy::Blocking
                .submit_to_queue(&tx, value, &cancel)
                .await
        })
    };
    let first = spawn_waiter(1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = spawn_waiter(2);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!first.is_finished());
    assert!(!second.is_finished());

    // One drained slot unblocks exactly one waiter.
    assert_eq!(rx.recv().await, Some(0));
    let outcome = timeout(Duration::from_secs(5), first).await.unwrap().unwrap();
    assert_eq!(outcome.unwrap(), Submitted::AfterWait);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!second.is_finished());

    assert_eq!(rx.recv().await, Some(1));
    let outcome = timeout(Duration::from_secs(5), second).await.unwrap().unwrap();
    assert_eq!(outcome.unwrap(), Submitted::AfterWait);
    assert_eq!(rx.recv().await, Some(2));
}

#[tokio::test]
async fn test_blocking_wait_observes_cancellation() {
    let (tx, mut rx) = saturated_queue();
    let cancel = CancellationToken::new();

    let waiter = {
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            SubmissionPolicy::Blocking
                .submit_to_queue(&tx, 1, &cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let err = timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(err.is_cancelled());

    // The cancelled item never reached the queue.
    assert_eq!(rx.recv().await, Some(0));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_rejecting_fails_without_blocking() {
    let (tx, _rx) = saturated_queue();
    let started = Instant::now();

    let err = timeout(
        Duration::from_millis(50),
        SubmissionPolicy::Rejecting.submit_to_queue(&tx, 1, &CancellationToken::new()),
    )
    .await
    .expect("rejecting policy must not block")
    .unwrap_err();

    assert!(err.is_capacity_exceeded());
    assert!(started.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn test_rejecting_saturated_executor() {
    let (executor, release) = saturated_executor().await;
    let (handler, seen) = recording_handler();

    let err = SubmissionPolicy::Rejecting
        .submit_to_executor(
            &executor,
            Box::pin(async { anyhow::Ok(()) }),
            handler,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(err.is_capacity_exceeded());
    assert!(seen.lock().unwrap().is_empty());

    let _ = release.send(());
    executor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_offloading_queue_invokes_fallback_once() {
    let (tx, mut rx) = saturated_queue();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let runtime = tokio::runtime::Handle::current();

    let policy = SubmissionPolicy::offloading(move |task: OffloadedTask| -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        runtime.spawn(task);
        Ok(())
    });

    let outcome = timeout(
        Duration::from_millis(100),
        policy.submit_to_queue(&tx, 1, &CancellationToken::new()),
    )
    .await
    .expect("offloading must not block")
    .unwrap();
    assert_eq!(outcome, Submitted::Offloaded);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The offloaded enqueue completes once the slot frees.
    assert_eq!(rx.recv().await, Some(0));
    assert_eq!(timeout(Duration::from_secs(5), rx.recv()).await.unwrap(), Some(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_offloading_distinguishes_producer_and_action_failures() {
    let (executor, release) = saturated_executor().await;
    let cancel = CancellationToken::new();

    // Action failure: the fallback runs the task, the task fails.
    let (handler, seen) = recording_handler();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let runtime = tokio::runtime::Handle::current();
    let running = SubmissionPolicy::offloading(move |task: OffloadedTask| -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        runtime.spawn(task);
        Ok(())
    });
    let outcome = running
        .submit_to_executor(
            &executor,
            Box::pin(async { Err::<(), _>(anyhow::Error::new(Marker(2))) }),
            handler,
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(outcome, Submitted::Offloaded);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    timeout(Duration::from_secs(5), async {
        while seen.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("action failure never reported");
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, FailureStage::Action);
        assert_eq!(marker_id(&seen[0].1), Some(2));
    }

    // Producer failure: the fallback itself refuses the work.
    let (handler, seen) = recording_handler();
    let refusing = SubmissionPolicy::offloading(|_task: OffloadedTask| -> anyhow::Result<()> {
        Err(Marker(1).into())
    });
    let outcome = refusing
        .submit_to_executor(
            &executor,
            Box::pin(async { Err::<(), _>(anyhow::Error::new(Marker(3))) }),
            handler,
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(outcome, Submitted::Offloaded);
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, FailureStage::Producer);
        assert_eq!(marker_id(&seen[0].1), Some(1));
    }

    let _ = release.send(());
    executor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_executor_waits_for_worker() {
    let (executor, release) = saturated_executor().await;
    let executor = Arc::new(executor);
    let (handler, seen) = recording_handler();
    let (done_tx, done_rx) = oneshot::channel::<()>();

    let waiter = {
        let executor = executor.clone();
        tokio::spawn(async move {
            SubmissionPolicy::Blocking
                .submit_to_executor(
                    executor.as_ref(),
                    Box::pin(async move {
                        let _ = done_tx.send(());
                        anyhow::Ok(())
                    }),
                    handler,
                    &CancellationToken::new(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    let _ = release.send(());
    let outcome = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
    assert_eq!(outcome.unwrap(), Submitted::AfterWait);
    timeout(Duration::from_secs(5), done_rx).await.unwrap().unwrap();
    assert!(seen.lock().unwrap().is_empty());

    executor.shutdown().await;
}
