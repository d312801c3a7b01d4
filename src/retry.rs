use crate::error::StoreError;
use crate::telemetry::{Telemetry, TelemetryEvent};
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;

/// Wait-then-retry for store operations that fail with
/// [`StoreError::Throttled`]. The wait is the store's own hint.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: Option<u32>,
    telemetry: Arc<dyn Telemetry>,
}

impl RetryPolicy {
    /// `None` retries forever.
    pub fn new(max_retries: Option<u32>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            max_retries,
            telemetry,
        }
    }

    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut count = 0u32;
        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let retry_after = match err.downcast_ref::<StoreError>() {
                Some(StoreError::Throttled { retry_after }) => *retry_after,
                None => return Err(err),
            };

            if self.max_retries.map_or(false, |max| count >= max) {
                return Err(err);
            }

            count += 1;
            self.telemetry
                .publish(TelemetryEvent::StoreRetry { retry_after, count });
            tokio::time::sleep(retry_after).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::testing::RecordingTelemetry;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn throttled(ms: u64) -> anyhow::Error {
        StoreError::Throttled {
            retry_after: Duration::from_millis(ms),
        }
        .into()
    }

    #[tokio::test(start_paused = true)]
    async fn retries_throttled_operation_until_success() {
        let telemetry = Arc::new(RecordingTelemetry::default());
        let policy = RetryPolicy::new(None, telemetry.clone());
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = policy
            .execute(|| async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(throttled(250))
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            telemetry.events(),
            vec![
                TelemetryEvent::StoreRetry {
                    retry_after: Duration::from_millis(250),
                    count: 1
                },
                TelemetryEvent::StoreRetry {
                    retry_after: Duration::from_millis(250),
                    count: 2
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let policy = RetryPolicy::new(Some(2), Arc::new(RecordingTelemetry::default()));
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<()> = policy
            .execute(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(throttled(10))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let telemetry = Arc::new(RecordingTelemetry::default());
        let policy = RetryPolicy::new(None, telemetry.clone());
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<()> = policy
            .execute(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("connection refused"))
            })
            .await;

        assert_eq!(result.unwrap_err().to_string(), "connection refused");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(telemetry.events().is_empty());
    }
}
