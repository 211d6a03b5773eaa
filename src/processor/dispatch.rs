//! Ordered delivery of watcher events to subscriber callbacks.

use super::backoff::{retry_with_backoff, RetryBackoff};
use crate::runtime::config::TaskErrorHandling;
use crate::runtime::errors::WatcherError;
use crate::runtime::hooks::{CallbackFuture, NewBlockCallback, ReorgCallback};
use crate::runtime::source::WatchedBlock;
use crate::runtime::telemetry::Telemetry;
use anyhow::{anyhow, Result};
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// An event owed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WatcherEvent<B> {
    NewBlock(B),
    Reorged { updated: B, pre_reorg: B },
}

impl<B: WatchedBlock> WatcherEvent<B> {
    fn name(&self) -> &'static str {
        match self {
            WatcherEvent::NewBlock(_) => "new_block",
            WatcherEvent::Reorged { .. } => "reorged_block",
        }
    }

    fn height(&self) -> u64 {
        match self {
            WatcherEvent::NewBlock(block) => block.height(),
            WatcherEvent::Reorged { updated, .. } => updated.height(),
        }
    }
}

/// An event whose delivery has not finished, with the index of the next subscriber to run.
#[derive(Debug)]
struct PendingEvent<B> {
    event: WatcherEvent<B>,
    next_subscriber: usize,
}

/// Holds the subscriber registries and the queue of events still owed to them.
///
/// Subscribers run sequentially in registration order. Under [`TaskErrorHandling::Retry`] a
/// failing callback is retried after `retry_delay` until it succeeds, which holds back every later
/// subscriber and the next poll cycle. Under [`TaskErrorHandling::Skip`] the failed callback is
/// dropped for that event only.
///
/// The queue outlives a single run: when cancellation interrupts delivery, the interrupted event
/// stays queued at the subscriber that had not completed, and the next
/// [`CallbackDispatcher::deliver_pending`] resumes from there.
pub(crate) struct CallbackDispatcher<B> {
    new_block: RwLock<Vec<NewBlockCallback<B>>>,
    reorged_block: RwLock<Vec<ReorgCallback<B>>>,
    pending: Mutex<VecDeque<PendingEvent<B>>>,
    mode: TaskErrorHandling,
    retry_delay: Duration,
    telemetry: Arc<Telemetry>,
}

#[derive(Clone, Copy)]
struct TaskLabel {
    event: &'static str,
    height: u64,
    subscriber: usize,
}

impl<B: WatchedBlock> CallbackDispatcher<B> {
    pub(crate) fn new(
        mode: TaskErrorHandling,
        retry_delay: Duration,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            new_block: RwLock::new(Vec::new()),
            reorged_block: RwLock::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            mode,
            retry_delay,
            telemetry,
        }
    }

    pub(crate) fn subscribe_new_block(&self, callback: NewBlockCallback<B>) {
        self.new_block
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    pub(crate) fn subscribe_reorged_block(&self, callback: ReorgCallback<B>) {
        self.reorged_block
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    pub(crate) fn new_block_subscribers(&self) -> usize {
        self.new_block
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn reorged_block_subscribers(&self) -> usize {
        self.reorged_block
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of events queued or partially delivered.
    pub(crate) fn pending_events(&self) -> usize {
        self.lock_pending().len()
    }

    /// Queues events behind anything still owed from earlier. Nothing runs until
    /// [`CallbackDispatcher::deliver_pending`].
    pub(crate) fn enqueue(&self, events: impl IntoIterator<Item = WatcherEvent<B>>) {
        self.lock_pending()
            .extend(events.into_iter().map(|event| PendingEvent {
                event,
                next_subscriber: 0,
            }));
    }

    /// Queues `block` and delivers everything pending.
    pub(crate) async fn dispatch_new_block(
        &self,
        block: &B,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        self.enqueue([WatcherEvent::NewBlock(block.clone())]);
        self.deliver_pending(shutdown).await
    }

    /// Delivers queued events in order, each to every subscriber of its kind.
    ///
    /// Only returns an error when `shutdown` fires mid-delivery; the queue then still holds the
    /// interrupted event and everything behind it.
    pub(crate) async fn deliver_pending(&self, shutdown: &CancellationToken) -> Result<()> {
        loop {
            let next = self
                .lock_pending()
                .front()
                .map(|pending| (pending.event.clone(), pending.next_subscriber));
            let Some((event, first_subscriber)) = next else {
                return Ok(());
            };

            let subscribers = match &event {
                WatcherEvent::NewBlock(_) => self.new_block_subscribers(),
                WatcherEvent::Reorged { .. } => self.reorged_block_subscribers(),
            };
            for subscriber in first_subscriber..subscribers {
                self.deliver_to(&event, subscriber, shutdown).await?;
                if let Some(front) = self.lock_pending().front_mut() {
                    front.next_subscriber = subscriber + 1;
                }
            }

            self.lock_pending().pop_front();
        }
    }

    async fn deliver_to(
        &self,
        event: &WatcherEvent<B>,
        subscriber: usize,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let label = TaskLabel {
            event: event.name(),
            height: event.height(),
            subscriber,
        };

        match event {
            WatcherEvent::NewBlock(block) => {
                let callback = self
                    .new_block
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(subscriber)
                    .cloned();
                let Some(callback) = callback else {
                    return Ok(());
                };
                self.run_task(label, || callback(block.clone()), shutdown)
                    .await
            }
            WatcherEvent::Reorged { updated, pre_reorg } => {
                let callback = self
                    .reorged_block
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(subscriber)
                    .cloned();
                let Some(callback) = callback else {
                    return Ok(());
                };
                self.run_task(
                    label,
                    || callback(updated.clone(), pre_reorg.clone()),
                    shutdown,
                )
                .await
            }
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<PendingEvent<B>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_task<F>(
        &self,
        label: TaskLabel,
        mut invoke: F,
        shutdown: &CancellationToken,
    ) -> Result<()>
    where
        F: FnMut() -> CallbackFuture,
    {
        let backoff = match self.mode {
            TaskErrorHandling::Retry => RetryBackoff::fixed(self.retry_delay),
            TaskErrorHandling::Skip => RetryBackoff::fixed(self.retry_delay).with_max_attempts(1),
        }
        .with_cancellation(shutdown);

        let outcome = retry_with_backoff(
            backoff,
            |_| {
                AssertUnwindSafe(invoke())
                    .catch_unwind()
                    .map(|result| result.unwrap_or_else(|_| Err(anyhow!("callback panicked"))))
            },
            |attempt, delay, err, will_retry| {
                self.telemetry.record_callback_failure();
                if will_retry {
                    tracing::warn!(
                        event = label.event,
                        height = label.height,
                        subscriber = label.subscriber,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "subscriber callback failed; retrying"
                    );
                } else {
                    self.telemetry.record_skipped_callback();
                    tracing::warn!(
                        event = label.event,
                        height = label.height,
                        subscriber = label.subscriber,
                        error = %err,
                        "subscriber callback failed; skipping"
                    );
                }
            },
        )
        .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(err) if WatcherError::is_cancelled(&err) => Err(err),
            Err(_) => Ok(()),
        }
    }
}
