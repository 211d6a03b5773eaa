//! Reorg detection and window repair.
//!
//! Only the tail of the window is checked before each poll. This relies on the block source
//! guaranteeing that when the highest known block is still canonical, none of its ancestors were
//! replaced either. Sources without that guarantee can silently miss deeper reorgs.

use super::dispatch::{CallbackDispatcher, WatcherEvent};
use super::fetcher::RetryingFetcher;
use super::window::SharedWindow;
use crate::runtime::errors::WatcherError;
use crate::runtime::source::{BlockSource, WatchedBlock};
use crate::runtime::telemetry::Telemetry;
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result of comparing an observed block against the source's current view of its height.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ReorgCheck<B> {
    Canonical,
    Replaced(B),
}

/// A window slot that was repaired: the block now canonical and the one it displaced.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ReplacedBlock<B> {
    pub updated: B,
    pub pre_reorg: B,
}

pub(crate) struct ReorgDetector<S: BlockSource> {
    fetcher: RetryingFetcher<S>,
    dispatcher: Arc<CallbackDispatcher<S::Block>>,
    telemetry: Arc<Telemetry>,
}

impl<S: BlockSource> ReorgDetector<S> {
    pub(crate) fn new(
        fetcher: RetryingFetcher<S>,
        dispatcher: Arc<CallbackDispatcher<S::Block>>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            fetcher,
            dispatcher,
            telemetry,
        }
    }

    /// Re-fetches the entry's height and compares hashes.
    ///
    /// A missing block is never an answer here: some sources briefly drop a height while the
    /// replacement propagates, so the fetch is repeated until the height resolves.
    pub(crate) async fn is_block_reorged(&self, entry: &S::Block) -> Result<ReorgCheck<S::Block>> {
        let current = self.fetcher.poll_block(entry.height()).await?;
        if current.hash() == entry.hash() {
            Ok(ReorgCheck::Canonical)
        } else {
            Ok(ReorgCheck::Replaced(current))
        }
    }

    /// Checks only the highest entry of the window.
    pub(crate) async fn check_tail(
        &self,
        window: &SharedWindow<S::Block>,
    ) -> Result<Option<ReorgCheck<S::Block>>> {
        let Some(tail) = window.highest() else {
            return Ok(None);
        };
        self.is_block_reorged(&tail).await.map(Some)
    }

    /// Walks the window from newest to oldest, comparing every block with the source, and stops
    /// at the first block that is still canonical.
    ///
    /// The window is only rewritten once the walk completes, together with queueing one reorg
    /// event per replaced block, oldest height first. Those events are then delivered; if
    /// delivery is cancelled they stay queued on the dispatcher for the next run.
    pub(crate) async fn handle_detected_reorg(
        &self,
        window: &SharedWindow<S::Block>,
        shutdown: &CancellationToken,
    ) -> Result<Vec<ReplacedBlock<S::Block>>> {
        let heights = window.read().heights_newest_first();
        let window_len = heights.len();

        let mut replacements = Vec::new();
        for height in heights {
            let entry = window
                .read()
                .get(height)
                .cloned()
                .ok_or(WatcherError::HeightNotInWindow { height })?;
            match self.is_block_reorged(&entry).await? {
                ReorgCheck::Canonical => break,
                ReorgCheck::Replaced(updated) => replacements.push(updated),
            }
        }

        if replacements.is_empty() {
            return Ok(Vec::new());
        }
        replacements.reverse();

        let replaced = {
            let mut guard = window.write();
            let mut replaced = Vec::with_capacity(replacements.len());
            for updated in replacements {
                let height = updated.height();
                let pre_reorg = guard.replace(height, updated.clone())?;
                tracing::warn!(
                    height,
                    old_hash = ?pre_reorg.hash(),
                    new_hash = ?updated.hash(),
                    "observed block was replaced"
                );
                replaced.push(ReplacedBlock { updated, pre_reorg });
            }
            self.dispatcher
                .enqueue(replaced.iter().map(|block| WatcherEvent::Reorged {
                    updated: block.updated.clone(),
                    pre_reorg: block.pre_reorg.clone(),
                }));
            replaced
        };

        self.telemetry.record_reorg(replaced.len() as u64);
        if replaced.len() == window_len {
            tracing::warn!(
                depth = replaced.len(),
                "every block in the observed window was replaced; reorg may be deeper than the window"
            );
        }
        if let (Some(first), Some(last)) = (replaced.first(), replaced.last()) {
            tracing::info!(
                from_height = first.updated.height(),
                to_height = last.updated.height(),
                depth = replaced.len(),
                "reorg repaired; notifying subscribers"
            );
        }

        self.dispatcher.deliver_pending(shutdown).await?;
        Ok(replaced)
    }
}
