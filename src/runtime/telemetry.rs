use crate::processor::window::SharedWindow;
use crate::runtime::source::WatchedBlock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters describing what the watcher has observed and delivered.
#[derive(Default, Debug)]
pub struct Telemetry {
    processed_blocks: AtomicU64,
    reorg_events: AtomicU64,
    reorged_blocks: AtomicU64,
    fetch_errors: AtomicU64,
    callback_failures: AtomicU64,
    skipped_callbacks: AtomicU64,
}

impl Telemetry {
    pub fn record_processed_block(&self) {
        self.processed_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reorg(&self, replaced_blocks: u64) {
        if replaced_blocks == 0 {
            return;
        }
        self.reorg_events.fetch_add(1, Ordering::Relaxed);
        self.reorged_blocks
            .fetch_add(replaced_blocks, Ordering::Relaxed);
    }

    pub fn record_fetch_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_callback_failure(&self) {
        self.callback_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_callback(&self) {
        self.skipped_callbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            processed_blocks: self.processed_blocks.load(Ordering::Relaxed),
            reorg_events: self.reorg_events.load(Ordering::Relaxed),
            reorged_blocks: self.reorged_blocks.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
            skipped_callbacks: self.skipped_callbacks.load(Ordering::Relaxed),
        }
    }

    pub fn processed_blocks(&self) -> u64 {
        self.processed_blocks.load(Ordering::Relaxed)
    }

    pub fn reorged_blocks(&self) -> u64 {
        self.reorged_blocks.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub processed_blocks: u64,
    pub reorg_events: u64,
    pub reorged_blocks: u64,
    pub fetch_errors: u64,
    pub callback_failures: u64,
    pub skipped_callbacks: u64,
}

/// Spawns a background task that periodically logs throughput, window position and failure counts.
pub fn spawn_metrics_reporter<B: WatchedBlock>(
    telemetry: Arc<Telemetry>,
    window: Arc<SharedWindow<B>>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "chainwatch::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let processed_delta = current_snapshot
                        .processed_blocks
                        .saturating_sub(last_snapshot.processed_blocks);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        processed_delta as f64 / elapsed
                    };
                    let (window_len, window_limit, highest_height) = {
                        let guard = window.read();
                        (guard.len(), guard.limit(), guard.highest_height())
                    };

                    tracing::info!(
                        target: "chainwatch::metrics",
                        throughput = format!("{throughput:.2}"),
                        processed = current_snapshot.processed_blocks,
                        highest_height = ?highest_height,
                        window_len,
                        window_limit,
                        reorg_events = current_snapshot.reorg_events,
                        reorged_blocks = current_snapshot.reorged_blocks,
                        fetch_errors = current_snapshot.fetch_errors,
                        callback_failures = current_snapshot.callback_failures,
                        skipped_callbacks = current_snapshot.skipped_callbacks,
                        "watcher metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
