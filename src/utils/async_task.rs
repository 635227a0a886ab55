use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::error;
use tracing::warn;

use crate::metrics::KV_OPS_TOTAL;
use crate::metrics::KV_OP_ERRORS_TOTAL;
use crate::Error;
use crate::Result;

/// Retry schedule of [`task_with_timeout_and_exponential_backoff`]
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Deadline of a single attempt
    pub timeout_ms: u64,
    pub max_retries: usize,
}

impl BackoffPolicy {
    /// Enough doubling attempts to keep retrying for roughly `total`.
    pub fn spanning(
        total: Duration,
        base_delay_ms: u64,
    ) -> Self {
        let base_delay_ms = base_delay_ms.max(1);
        let max_delay_ms = base_delay_ms * 16;
        let mut spent = 0u64;
        let mut delay = base_delay_ms;
        let mut max_retries = 1;
        while spent < total.as_millis() as u64 {
            spent += delay;
            delay = (delay * 2).min(max_delay_ms);
            max_retries += 1;
        }
        Self {
            base_delay_ms,
            max_delay_ms,
            timeout_ms: total.as_millis().max(1) as u64,
            max_retries,
        }
    }
}

/// Retries `task` while `retryable` accepts its error, doubling the delay
/// between attempts up to `max_delay_ms`.
pub(crate) async fn task_with_timeout_and_exponential_backoff<F, T, P, R>(
    task: F,
    policy: BackoffPolicy,
    retryable: R,
) -> Result<P>
where
    F: Fn() -> T,
    T: Future<Output = Result<P>>,
    R: Fn(&Error) -> bool,
{
    let timeout_duration = Duration::from_millis(policy.timeout_ms);
    let mut delay = Duration::from_millis(policy.base_delay_ms);
    let max_delay = Duration::from_millis(policy.max_delay_ms);
    let mut retries = 0;

    loop {
        let e = match timeout(timeout_duration, task()).await {
            Ok(Ok(r)) => return Ok(r),
            Ok(Err(error)) => {
                if !retryable(&error) {
                    return Err(error);
                }
                warn!("attempt {} failed: {}", retries + 1, error);
                error
            }
            Err(_) => {
                warn!("attempt {} timed out after {:?}", retries + 1, timeout_duration);
                Error::Timeout {
                    op: "retry",
                    after: timeout_duration,
                }
            }
        };

        retries += 1;
        if retries >= policy.max_retries {
            warn!("task failed after {} retries", retries);
            return Err(e);
        }
        sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
}

/// Runs one backend operation under `after`, counting it per backend.
pub(crate) async fn with_timeout<F, T>(
    backend: &'static str,
    op: &'static str,
    after: Duration,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    KV_OPS_TOTAL.with_label_values(&[backend, op]).inc();
    let result = match timeout(after, fut).await {
        Ok(r) => r,
        Err(_) => Err(Error::Timeout { op, after }),
    };
    if let Err(e) = &result {
        KV_OP_ERRORS_TOTAL
            .with_label_values(&[backend, op, &format!("{:?}", e.kind())])
            .inc();
    }
    result
}

/// Spawns a background task on `tracker` and logs how it ended.
pub(crate) fn spawn_task<Fut>(
    name: &str,
    tracker: &TaskTracker,
    fut: Fut,
) where
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.to_string();
    tracker.spawn(async move {
        if let Err(e) = fut.await {
            error!("spawned task: {name} stopped or encountered an error: {:?}", e);
        }
    });
}
