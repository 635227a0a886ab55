use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::task::TaskTracker;
use tracing_test::traced_test;

use crate::utils::async_task::spawn_task;
use crate::utils::async_task::task_with_timeout_and_exponential_backoff;
use crate::utils::async_task::with_timeout;
use crate::utils::async_task::BackoffPolicy;
use crate::Error;
use crate::ErrorKind;

fn policy(max_retries: usize) -> BackoffPolicy {
    BackoffPolicy {
        base_delay_ms: 10,
        max_delay_ms: 100,
        timeout_ms: 1000,
        max_retries,
    }
}

#[tokio::test]
async fn test_task_with_timeout_and_exponential_backoff_success() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let task = move || {
        let counter = counter_clone.clone();
        async move {
            let current = counter.fetch_add(1, Ordering::SeqCst);
            if current == 0 {
                Err(Error::unavailable("first attempt fails"))
            } else {
                Ok::<_, crate::Error>(current)
            }
        }
    };

    let result = task_with_timeout_and_exponential_backoff(task, policy(3), |_| true).await;

    assert_eq!(result.unwrap(), 1);
    assert_eq!(counter.load(Ordering::SeqCst), 2); // 1 failure + 1 success
}

#[tokio::test]
async fn test_task_with_timeout_and_exponential_backoff_max_retries() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let task = move || {
        let counter = counter_clone.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<u32, _>(Error::unavailable("always fails"))
        }
    };

    let result = task_with_timeout_and_exponential_backoff(task, policy(3), |_| true).await;

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Unavailable);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_task_with_timeout_and_exponential_backoff_stops_on_permanent_error() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let task = move || {
        let counter = counter_clone.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<u32, _>(Error::invalid("bad layout"))
        }
    };

    let result = task_with_timeout_and_exponential_backoff(task, policy(5), |e| {
        e.kind() == ErrorKind::Unavailable
    })
    .await;

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Invalid);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn backoff_policy_spanning_should_cover_requested_window() {
    let p = BackoffPolicy::spanning(Duration::from_millis(1_000), 50);
    let mut delay = p.base_delay_ms;
    let mut total = 0;
    for _ in 1..p.max_retries {
        total += delay;
        delay = (delay * 2).min(p.max_delay_ms);
    }
    assert!(total >= 1_000);
}

#[tokio::test(start_paused = true)]
async fn with_timeout_should_fail_with_timeout_kind() {
    let result: crate::Result<()> = with_timeout("memory", "get", Duration::from_millis(5), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    })
    .await;

    match result.unwrap_err() {
        Error::Timeout { op, after } => {
            assert_eq!(op, "get");
            assert_eq!(after, Duration::from_millis(5));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
#[traced_test]
async fn spawn_task_should_log_task_failure() {
    let tracker = TaskTracker::new();
    spawn_task("failing", &tracker, async { Err(Error::unavailable("boom")) });
    tracker.close();
    tracker.wait().await;

    assert!(logs_contain("failing stopped or encountered an error"));
}
