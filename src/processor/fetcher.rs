//! Retrying fetch primitives wrapped around a [`BlockSource`].
//!
//! Single-shot calls never retry. The `poll_*` helpers retry forever at a fixed delay because
//! their callers have already decided the value must eventually exist; only cancellation ends
//! them early.

use super::backoff::{retry_with_backoff, RetryBackoff};
use super::tip::ChainHead;
use crate::runtime::source::{BlockSource, WatchedBlock};
use crate::runtime::telemetry::Telemetry;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) struct RetryingFetcher<S: BlockSource> {
    source: Arc<S>,
    retry_delay: Duration,
    telemetry: Arc<Telemetry>,
    chain_head: Arc<ChainHead>,
    shutdown: CancellationToken,
}

impl<S: BlockSource> Clone for RetryingFetcher<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            retry_delay: self.retry_delay,
            telemetry: Arc::clone(&self.telemetry),
            chain_head: Arc::clone(&self.chain_head),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S: BlockSource> RetryingFetcher<S> {
    pub(crate) fn new(
        source: Arc<S>,
        retry_delay: Duration,
        telemetry: Arc<Telemetry>,
        chain_head: Arc<ChainHead>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            retry_delay,
            telemetry,
            chain_head,
            shutdown,
        }
    }

    /// Asks the source for `height` once. Errors and mismatched heights count as "not found".
    pub(crate) async fn fetch_block(&self, height: u64) -> Option<S::Block> {
        match self.source.get_block(height).await {
            Ok(Some(block)) if block.height() == height => Some(block),
            Ok(Some(block)) => {
                self.telemetry.record_fetch_error();
                tracing::warn!(
                    requested = height,
                    returned = block.height(),
                    "block source returned a block for a different height; ignoring it"
                );
                None
            }
            Ok(None) => None,
            Err(err) => {
                self.telemetry.record_fetch_error();
                tracing::debug!(height, error = %err, "failed to fetch block");
                None
            }
        }
    }

    /// Asks the source for the chain head once; a missing head is an error for this call.
    pub(crate) async fn fetch_chain_head(&self) -> Result<u64> {
        let head = self
            .source
            .get_chain_head()
            .await
            .context("failed to fetch chain head")?
            .ok_or_else(|| anyhow!("block source reported no chain head"))?;
        self.chain_head.update(head);
        Ok(head)
    }

    /// Fetches `height` until the source returns it.
    pub(crate) async fn poll_block(&self, height: u64) -> Result<S::Block> {
        retry_with_backoff(
            RetryBackoff::fixed(self.retry_delay).with_cancellation(&self.shutdown),
            |_| async move {
                self.fetch_block(height)
                    .await
                    .ok_or_else(|| anyhow!("block {height} not available"))
            },
            |attempt, delay, err, _| {
                tracing::debug!(
                    height,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "block not found; polling again"
                );
            },
        )
        .await
    }

    /// Fetches the chain head until the source reports one.
    pub(crate) async fn poll_chain_head(&self) -> Result<u64> {
        retry_with_backoff(
            RetryBackoff::fixed(self.retry_delay).with_cancellation(&self.shutdown),
            |_| self.fetch_chain_head(),
            |attempt, delay, err, _| {
                self.telemetry.record_fetch_error();
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "chain head unavailable; polling again"
                );
            },
        )
        .await
    }
}
