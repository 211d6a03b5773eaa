use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chainwatch::BlockWatcher;
use once_cell::sync::Lazy;
use tokio::time::{sleep, Instant};
use tracing_subscriber::EnvFilter;

use super::mock_chain::{MockChain, TestBlock};

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Everything delivered to the subscribers registered through [`Recorder::attach`].
#[derive(Default)]
struct Recorded {
    new_blocks: Vec<TestBlock>,
    reorgs: Vec<(TestBlock, TestBlock)>,
    events: Vec<String>,
}

#[derive(Clone, Default)]
pub struct Recorder {
    state: Arc<Mutex<Recorded>>,
}

impl Recorder {
    /// Registers one new-block and one reorg subscriber on `watcher`.
    pub fn attach(&self, watcher: &BlockWatcher<MockChain>) {
        let state = self.state.clone();
        watcher.on_new_block(move |block: TestBlock| {
            let state = state.clone();
            async move {
                let mut guard = state.lock().map_err(|_| anyhow!("recorder poisoned"))?;
                guard.events.push(format!("new:{}", block.height));
                guard.new_blocks.push(block);
                Ok::<(), anyhow::Error>(())
            }
        });

        let state = self.state.clone();
        watcher.on_reorged_block(move |updated: TestBlock, previous: TestBlock| {
            let state = state.clone();
            async move {
                let mut guard = state.lock().map_err(|_| anyhow!("recorder poisoned"))?;
                guard.events.push(format!("reorg:{}", updated.height));
                guard.reorgs.push((updated, previous));
                Ok::<(), anyhow::Error>(())
            }
        });
    }

    pub fn new_heights(&self) -> Vec<u64> {
        self.lock().new_blocks.iter().map(|block| block.height).collect()
    }

    pub fn reorgs(&self) -> Vec<(TestBlock, TestBlock)> {
        self.lock().reorgs.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.state.lock().expect("recorder poisoned")
    }
}

/// Polls `condition` every few milliseconds of (possibly paused) tokio time.
pub async fn wait_until<F>(mut condition: F, timeout: Duration, what: &str) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("timed out after {timeout:?} waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

pub fn heights(blocks: &[TestBlock]) -> Vec<u64> {
    blocks.iter().map(|block| block.height).collect()
}

pub fn assert_is_contiguous(heights: &[u64]) {
    for window in heights.windows(2) {
        if let [lhs, rhs] = window {
            assert_eq!(rhs, &(lhs + 1), "heights must increase monotonically");
        }
    }
}
