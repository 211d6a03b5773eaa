use crate::runtime::errors::WatcherError;
use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Fixed-delay retry schedule. Without `max_attempts` the operation is retried until it
/// succeeds or the cancellation token fires.
#[derive(Clone, Copy)]
pub(crate) struct RetryBackoff<'a> {
    pub delay: Duration,
    pub max_attempts: Option<usize>,
    pub cancellation: Option<&'a CancellationToken>,
}

impl<'a> RetryBackoff<'a> {
    pub(crate) fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
            cancellation: None,
        }
    }

    pub(crate) fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub(crate) fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Runs `operation` until it returns `Ok`, sleeping `config.delay` between attempts.
///
/// `on_retry` observes every failure together with whether another attempt follows. Cancellation
/// interrupts both the operation and the sleep and yields [`WatcherError::Cancelled`].
pub(crate) async fn retry_with_backoff<'a, T, F, Fut, L>(
    config: RetryBackoff<'a>,
    mut operation: F,
    mut on_retry: L,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
    L: FnMut(usize, Duration, &anyhow::Error, bool),
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let outcome = match config.cancellation {
            Some(token) => {
                if token.is_cancelled() {
                    return Err(WatcherError::Cancelled.into());
                }
                tokio::select! {
                    _ = token.cancelled() => return Err(WatcherError::Cancelled.into()),
                    result = operation(attempt) => result,
                }
            }
            None => operation(attempt).await,
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) => {
                let exhausted = config
                    .max_attempts
                    .map(|max| attempt >= max)
                    .unwrap_or(false);

                on_retry(attempt, config.delay, &err, !exhausted);

                if exhausted {
                    return Err(err);
                }

                sleep_with_cancellation(config.delay, config.cancellation).await?;
            }
        }
    }
}

/// Sleeps for `delay` unless the token fires first.
pub(crate) async fn sleep_with_cancellation(
    delay: Duration,
    cancellation: Option<&CancellationToken>,
) -> Result<()> {
    if delay.is_zero() {
        yield_now().await;
        return Ok(());
    }

    if let Some(token) = cancellation {
        tokio::select! {
            _ = token.cancelled() => Err(WatcherError::Cancelled.into()),
            _ = sleep(delay) => Ok(()),
        }
    } else {
        sleep(delay).await;
        Ok(())
    }
}
