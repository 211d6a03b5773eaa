//! Per-run task ownership for `BlockWatcher`: the run token, fatal error capture, the metrics
//! reporter and the poll loop handle.

use super::window::SharedWindow;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::source::WatchedBlock;
use crate::runtime::telemetry::{self, Telemetry};
use anyhow::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) struct LifecycleHandles {
    pub run_token: CancellationToken,
    fatal_handler: Arc<FatalErrorHandler>,
    metrics_handle: Option<JoinHandle<()>>,
    poll_handle: Option<JoinHandle<Result<()>>>,
}

pub(crate) struct LifecycleSpawnParams<'a, B: WatchedBlock> {
    pub shutdown_root: &'a CancellationToken,
    pub telemetry: Arc<Telemetry>,
    pub window: Arc<SharedWindow<B>>,
    pub metrics_interval: Duration,
}

impl LifecycleHandles {
    /// Derives the run token from the root and starts the metrics reporter under it.
    pub(crate) fn spawn<B: WatchedBlock>(params: LifecycleSpawnParams<'_, B>) -> Self {
        let run_token = params.shutdown_root.child_token();
        let fatal_handler = Arc::new(FatalErrorHandler::new(
            params.shutdown_root.clone(),
            run_token.clone(),
        ));
        let metrics_handle = telemetry::spawn_metrics_reporter(
            params.telemetry,
            params.window,
            run_token.clone(),
            params.metrics_interval,
        );

        Self {
            run_token,
            fatal_handler,
            metrics_handle: Some(metrics_handle),
            poll_handle: None,
        }
    }

    pub(crate) fn attach_poll_loop(&mut self, handle: JoinHandle<Result<()>>) {
        self.poll_handle = Some(handle);
    }

    pub(crate) fn fatal_handler(&self) -> Arc<FatalErrorHandler> {
        self.fatal_handler.clone()
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.fatal_handler.error()
    }

    /// Cancels the run, joins every task it owns, and returns the error that ended it, if any.
    ///
    /// An error returned by the poll loop itself takes precedence over the captured fatal error.
    pub(crate) async fn shutdown(mut self) -> Option<Error> {
        self.run_token.cancel();

        let mut loop_error = None;
        if let Some(handle) = self.poll_handle.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "poll loop exited with error");
                    loop_error = Some(err);
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to join poll loop task");
                    loop_error = Some(err.into());
                }
            }
        }

        if let Some(handle) = self.metrics_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter task panicked");
            }
        }

        loop_error.or_else(|| self.fatal_handler.error())
    }
}
