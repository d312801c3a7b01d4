use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Variable-interval periodic executor.
///
/// The executor returns the delay before its next run, so the schedule can
/// follow lease expiry instead of a fixed tick.
#[derive(Debug, Default)]
pub struct SystemTimer {
    cancel: CancellationToken,
}

impl SystemTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A timer stopped whenever `parent` is cancelled.
    pub fn linked_to(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
        }
    }

    /// Waits `initial_delay`, then runs `executor` and waits for the delay it
    /// returns, until stopped or the executor fails.
    ///
    /// Stopping ends the loop with `Ok(())`. The executor gets a token that is
    /// cancelled when the timer stops.
    pub async fn execute_periodically_in<F, Fut, E>(
        &self,
        initial_delay: Duration,
        mut executor: F,
    ) -> Result<(), E>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<Duration, E>>,
    {
        let mut delay = initial_delay;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }

            delay = executor(self.cancel.clone()).await?;

            if self.cancel.is_cancelled() {
                return Ok(());
            }
        }
    }

    /// Token cancelled when this timer stops.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for SystemTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn follows_the_returned_delays() {
        let timer = SystemTimer::new();
        let started = Instant::now();
        let mut runs = Vec::new();

        let result: Result<(), &str> = timer
            .execute_periodically_in(Duration::from_secs(10), |_| {
                runs.push(started.elapsed());
                let next = Duration::from_secs(runs.len() as u64);
                let done = runs.len() == 3;
                async move {
                    if done {
                        Err("done")
                    } else {
                        Ok(next)
                    }
                }
            })
            .await;

        assert_eq!(result, Err("done"));
        assert_eq!(
            runs,
            vec![
                Duration::from_secs(10),
                Duration::from_secs(11),
                Duration::from_secs(13)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_the_loop_cleanly() {
        let timer = Arc::new(SystemTimer::new());
        let runs = Arc::new(AtomicU32::new(0));

        let task = {
            let timer = timer.clone();
            let runs = runs.clone();
            tokio::spawn(async move {
                timer
                    .execute_periodically_in(Duration::from_secs(1), |_| {
                        runs.fetch_add(1, Ordering::SeqCst);
                        async { Ok::<_, ()>(Duration::from_secs(1)) }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(3500)).await;
        timer.stop();
        timer.stop();

        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(timer.is_stopped());
    }

    #[tokio::test]
    async fn cancelled_parent_stops_linked_timer() {
        let parent = CancellationToken::new();
        let timer = SystemTimer::linked_to(&parent);
        parent.cancel();

        let result = timer
            .execute_periodically_in(Duration::from_secs(3600), |_| async {
                Ok::<_, ()>(Duration::from_secs(1))
            })
            .await;

        assert_eq!(result, Ok(()));
    }
}
