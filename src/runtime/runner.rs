use crate::{BlockSource, BlockWatcher, WatcherConfig};
use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Coordinates the block watcher lifecycle and handles OS signals for graceful shutdowns.
pub struct Runner<S: BlockSource> {
    watcher: BlockWatcher<S>,
    shutdown: CancellationToken,
}

impl<S: BlockSource> Runner<S> {
    /// Creates a new runner and wires a root [`CancellationToken`] through the watcher.
    pub fn new(config: WatcherConfig, source: S) -> Self {
        let shutdown = CancellationToken::new();
        let watcher = BlockWatcher::with_cancellation_token(config, source, shutdown.clone());
        Self { watcher, shutdown }
    }

    /// Wraps an already configured watcher (for example one seeded with pre-start state).
    ///
    /// The watcher's root token is replaced by the runner's.
    pub fn from_watcher(mut watcher: BlockWatcher<S>) -> Self {
        let shutdown = CancellationToken::new();
        watcher.replace_shutdown_root(shutdown.clone());
        Self { watcher, shutdown }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn watcher(&self) -> &BlockWatcher<S> {
        &self.watcher
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere,
    /// including by a fatal watcher error.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.watcher.start().await?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.shutdown.cancel();
        let outcome = self.watcher.stop().await;
        self.reinitialize_shutdown_token();
        outcome
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
        self.watcher.replace_shutdown_root(self.shutdown.clone());
    }
}
