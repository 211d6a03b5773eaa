//! Block watcher orchestration.
//!
//! `BlockWatcher` composes the smaller processor modules:
//! - `window` holds the bounded, contiguous run of observed blocks.
//! - `fetcher` wraps the block source with single-shot and poll-until-found calls.
//! - `reorg` checks the window tail and repairs replaced blocks.
//! - `dispatch` delivers events to subscribers under the configured failure policy.
//! - `lifecycle` wires run-scoped cancellation, telemetry reporting, and fatal error capture.
//!
//! Each poll cycle first settles the window tail (repeating the reorg repair until a tail check
//! observes no change), then fetches the next height once. A hit is appended and delivered and the
//! next cycle starts immediately; a miss waits `poll_interval`. Cycles never overlap, so the window
//! has exactly one writer.

use super::backoff::sleep_with_cancellation;
use super::dispatch::CallbackDispatcher;
use super::fetcher::RetryingFetcher;
use super::lifecycle::{LifecycleHandles, LifecycleSpawnParams};
use super::reorg::{ReorgCheck, ReorgDetector};
use super::tip::ChainHead;
use super::window::{ObservedWindow, SharedWindow};
use crate::runtime::config::WatcherConfig;
use crate::runtime::errors::WatcherError;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::hooks::CallbackFuture;
use crate::runtime::source::{BlockSource, WatchedBlock};
use crate::runtime::telemetry::Telemetry;
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::yield_now;
use tokio_util::sync::CancellationToken;

pub struct BlockWatcher<S: BlockSource> {
    config: WatcherConfig,
    source: Arc<S>,
    window: Arc<SharedWindow<S::Block>>,
    dispatcher: Arc<CallbackDispatcher<S::Block>>,
    telemetry: Arc<Telemetry>,
    chain_head: Arc<ChainHead>,
    shutdown_root: CancellationToken,
    lifecycle: Option<LifecycleHandles>,
    running: bool,
}

enum CycleOutcome {
    Appended,
    Idle,
}

struct PollLoop<S: BlockSource> {
    window: Arc<SharedWindow<S::Block>>,
    fetcher: RetryingFetcher<S>,
    detector: ReorgDetector<S>,
    dispatcher: Arc<CallbackDispatcher<S::Block>>,
    telemetry: Arc<Telemetry>,
    fatal_handler: Arc<FatalErrorHandler>,
    poll_interval: Duration,
    start_height: u64,
    shutdown: CancellationToken,
}

impl<S: BlockSource> BlockWatcher<S> {
    /// Creates a watcher with an empty window and its own root cancellation token.
    pub fn new(config: WatcherConfig, source: S) -> Self {
        Self::with_cancellation_token(config, source, CancellationToken::new())
    }

    /// Creates a watcher whose runs are derived from `shutdown_token`.
    pub fn with_cancellation_token(
        config: WatcherConfig,
        source: S,
        shutdown_token: CancellationToken,
    ) -> Self {
        let telemetry = Arc::new(Telemetry::default());
        let window = Arc::new(SharedWindow::new(ObservedWindow::new(
            config.max_reorg_depth(),
        )));
        let dispatcher = Arc::new(CallbackDispatcher::new(
            config.task_error_handling(),
            config.retry_delay(),
            telemetry.clone(),
        ));

        Self {
            config,
            source: Arc::new(source),
            window,
            dispatcher,
            telemetry,
            chain_head: Arc::new(ChainHead::new()),
            shutdown_root: shutdown_token,
            lifecycle: None,
            running: false,
        }
    }

    /// Seeds the window with blocks observed before this process started.
    ///
    /// Fails when the blocks are unsorted, have gaps, or do not end right below the configured
    /// start block.
    pub fn with_pre_start_state(self, blocks: Vec<S::Block>) -> Result<Self> {
        let window = ObservedWindow::from_pre_start_state(
            self.config.max_reorg_depth(),
            blocks,
            self.config.start_block(),
        )
        .context("invalid pre-start block state")?;
        *self.window.write() = window;
        Ok(self)
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Registers a callback invoked once for every block appended to the window.
    pub fn on_new_block<F, Fut>(&self, callback: F)
    where
        F: Fn(S::Block) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.dispatcher
            .subscribe_new_block(Arc::new(move |block: S::Block| -> CallbackFuture {
                Box::pin(callback(block))
            }));
    }

    /// Registers a callback invoked once per replaced block with `(updated, pre_reorg)`.
    pub fn on_reorged_block<F, Fut>(&self, callback: F)
    where
        F: Fn(S::Block, S::Block) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.dispatcher.subscribe_reorged_block(Arc::new(
            move |updated: S::Block, pre_reorg: S::Block| -> CallbackFuture {
                Box::pin(callback(updated, pre_reorg))
            },
        ));
    }

    /// Returns the highest block currently believed canonical.
    pub fn highest_block(&self) -> Option<S::Block> {
        self.window.highest()
    }

    /// Returns a copy of the observed window, oldest first.
    pub fn observed_blocks(&self) -> Vec<S::Block> {
        self.window.snapshot()
    }

    /// Returns the last chain head height reported by the source, if any was fetched yet.
    pub fn last_known_chain_head(&self) -> Option<u64> {
        self.chain_head.current()
    }

    /// Reports whether the highest observed block sits at the source's chain head.
    ///
    /// Returns `false` on an empty window without querying the source. Otherwise the chain head is
    /// polled until the source reports one. While a run is active the poll is bound to that run
    /// and fails with [`WatcherError::Cancelled`] once it is cancelled. An idle watcher polls under
    /// the root token, or unbounded when the root token was already cancelled (for example by a
    /// fatal error of the previous run).
    pub async fn is_at_chain_head(&self) -> Result<bool> {
        let Some(highest) = self.window.read().highest_height() else {
            return Ok(false);
        };
        let head = self.fetcher(self.query_token()).poll_chain_head().await?;
        Ok(highest == head)
    }

    /// Number of subscriber deliveries still owed, including one interrupted by `stop`.
    ///
    /// They are finished by the next `start` before any new block is fetched.
    pub fn pending_events(&self) -> usize {
        self.dispatcher.pending_events()
    }

    /// Replaces the root shutdown token used to derive per-run cancellation tokens.
    /// This must only be called while the watcher is idle (i.e. between `stop` and `start`).
    pub fn replace_shutdown_root(&mut self, shutdown: CancellationToken) {
        debug_assert!(
            !self.running,
            "shutdown token should not change while the watcher is running"
        );
        self.shutdown_root = shutdown;
    }

    /// Returns the fatal error captured by the current run, if any.
    pub fn error(&self) -> Option<anyhow::Error> {
        self.lifecycle.as_ref().and_then(LifecycleHandles::error)
    }

    /// Starts polling.
    ///
    /// With an empty window the first height is the configured start block, or the chain head
    /// (polled until available) when none is configured. A seeded window resumes right after its
    /// highest block and is fully re-checked for reorgs before the poll loop begins. Deliveries
    /// interrupted by a previous `stop` are finished first, resuming at the subscriber that had
    /// not completed.
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(WatcherError::AlreadyStarted.into());
        }

        let (seeded, resume_height) = {
            let window = self.window.read();
            (!window.is_empty(), window.next_height())
        };
        let start_height = match (resume_height, self.config.start_block()) {
            (Some(height), _) => height,
            (None, Some(height)) => height,
            (None, None) => self
                .fetcher(self.shutdown_root.clone())
                .poll_chain_head()
                .await
                .context("failed to resolve start height from chain head")?,
        };

        tracing::info!(
            start_height,
            seeded,
            max_reorg_depth = self.config.max_reorg_depth(),
            poll_interval_ms = self.config.poll_interval().as_millis() as u64,
            new_block_subscribers = self.dispatcher.new_block_subscribers(),
            reorg_subscribers = self.dispatcher.reorged_block_subscribers(),
            "starting block watcher"
        );

        let mut lifecycle = LifecycleHandles::spawn(LifecycleSpawnParams {
            shutdown_root: &self.shutdown_root,
            telemetry: self.telemetry.clone(),
            window: self.window.clone(),
            metrics_interval: self.config.metrics_interval(),
        });
        let run_token = lifecycle.run_token.clone();
        let fetcher = self.fetcher(run_token.clone());
        let detector = ReorgDetector::new(
            fetcher.clone(),
            self.dispatcher.clone(),
            self.telemetry.clone(),
        );

        let pending = self.dispatcher.pending_events();
        if pending > 0 {
            tracing::info!(pending, "finishing deliveries interrupted by the previous run");
            if let Err(err) = self.dispatcher.deliver_pending(&run_token).await {
                lifecycle.shutdown().await;
                return Err(err).context("failed to finish interrupted subscriber deliveries");
            }
        }

        if seeded {
            if let Err(err) = detector
                .handle_detected_reorg(&self.window, &run_token)
                .await
            {
                lifecycle.shutdown().await;
                return Err(err).context("initial reorg check of pre-start state failed");
            }
        }

        let poll_loop = PollLoop {
            window: self.window.clone(),
            fetcher,
            detector,
            dispatcher: self.dispatcher.clone(),
            telemetry: self.telemetry.clone(),
            fatal_handler: lifecycle.fatal_handler(),
            poll_interval: self.config.poll_interval(),
            start_height,
            shutdown: run_token,
        };
        lifecycle.attach_poll_loop(tokio::spawn(poll_loop.run()));
        self.lifecycle = Some(lifecycle);
        self.running = true;

        Ok(())
    }

    /// Stops polling and waits for the poll loop and reporter to exit.
    ///
    /// Returns the fatal error that aborted the run, if one occurred. The window is kept, so a
    /// later `start` resumes after the highest observed block.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }

        tracing::info!("stopping block watcher");

        let outcome = match self.lifecycle.take() {
            Some(handles) => handles.shutdown().await,
            None => None,
        };
        self.running = false;

        if let Some(err) = outcome {
            return Err(err).context("block watcher aborted");
        }

        Ok(())
    }

    fn query_token(&self) -> CancellationToken {
        match &self.lifecycle {
            Some(handles) => handles.run_token.clone(),
            None if self.shutdown_root.is_cancelled() => CancellationToken::new(),
            None => self.shutdown_root.child_token(),
        }
    }

    fn fetcher(&self, shutdown: CancellationToken) -> RetryingFetcher<S> {
        RetryingFetcher::new(
            self.source.clone(),
            self.config.retry_delay(),
            self.telemetry.clone(),
            self.chain_head.clone(),
            shutdown,
        )
    }
}

impl<S: BlockSource> Drop for BlockWatcher<S> {
    fn drop(&mut self) {
        if let Some(handles) = &self.lifecycle {
            handles.run_token.cancel();
        }
    }
}

impl<S: BlockSource> PollLoop<S> {
    async fn run(self) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.run_cycle().await {
                Ok(CycleOutcome::Appended) => yield_now().await,
                Ok(CycleOutcome::Idle) => {
                    if sleep_with_cancellation(self.poll_interval, Some(&self.shutdown))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) if WatcherError::is_cancelled(&err) => break,
                Err(err) => return Err(self.fatal_handler.trigger("poll cycle", err)),
            }
        }

        tracing::info!("block watcher poll loop stopped");
        Ok(())
    }

    async fn run_cycle(&self) -> Result<CycleOutcome> {
        self.settle_tail().await?;

        let next_height = self
            .window
            .read()
            .next_height()
            .unwrap_or(self.start_height);
        let fetched = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(WatcherError::Cancelled.into()),
            block = self.fetcher.fetch_block(next_height) => block,
        };
        let Some(block) = fetched else {
            tracing::trace!(height = next_height, "no new block yet");
            return Ok(CycleOutcome::Idle);
        };

        self.window.write().push(block.clone());
        self.telemetry.record_processed_block();
        tracing::debug!(
            height = next_height,
            hash = ?block.hash(),
            "appended new block"
        );

        self.dispatcher
            .dispatch_new_block(&block, &self.shutdown)
            .await?;
        Ok(CycleOutcome::Appended)
    }

    /// Repeats tail checks until one observes no replacement; a reorg can land again while the
    /// previous one is being repaired.
    async fn settle_tail(&self) -> Result<()> {
        while let Some(ReorgCheck::Replaced(updated)) = self.detector.check_tail(&self.window).await? {
            tracing::warn!(
                height = updated.height(),
                "window tail no longer canonical; repairing"
            );
            self.detector
                .handle_detected_reorg(&self.window, &self.shutdown)
                .await?;
        }
        Ok(())
    }
}
