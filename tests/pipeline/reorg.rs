use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{heights, init_tracing, wait_until, Recorder},
    mock_chain::{MockChain, TestBlock},
};
use anyhow::{anyhow, bail, Result};
use chainwatch::{BlockWatcher, WatcherConfig};
use tokio::time::sleep;

const WAIT: Duration = Duration::from_secs(30);

fn config(start_block: Option<u64>, depth: usize) -> Result<WatcherConfig> {
    let builder = WatcherConfig::builder()
        .poll_interval(Duration::from_millis(50))
        .retry_delay(Duration::from_millis(10))
        .max_reorg_depth(depth);
    match start_block {
        Some(height) => builder.start_block(height).build(),
        None => builder.build(),
    }
}

fn blocks(chain: &MockChain, range: std::ops::RangeInclusive<u64>) -> Result<Vec<TestBlock>> {
    range
        .map(|height| {
            chain
                .block(height)
                .ok_or_else(|| anyhow!("mock chain has no block {height}"))
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn replaced_tail_is_reported_once() -> Result<()> {
    init_tracing();
    let chain = MockChain::with_range(100, 105);
    let mut watcher = BlockWatcher::new(config(Some(100), 8)?, chain.clone());
    let recorder = Recorder::default();
    recorder.attach(&watcher);

    watcher.start().await?;
    wait_until(|| recorder.new_heights().len() >= 6, WAIT, "blocks 100..=105").await?;

    let original = blocks(&chain, 105..=105)?;
    let rewritten = chain.force_reorg(104)?;
    wait_until(|| !recorder.reorgs().is_empty(), WAIT, "reorg of 105").await?;
    sleep(Duration::from_millis(300)).await;
    watcher.stop().await?;

    assert_eq!(recorder.reorgs(), vec![(rewritten[0].clone(), original[0].clone())]);
    assert_eq!(watcher.highest_block(), Some(rewritten[0].clone()));
    assert_eq!(
        recorder.new_heights(),
        vec![100, 101, 102, 103, 104, 105],
        "a repaired slot must not be redelivered as a new block"
    );

    let snapshot = watcher.telemetry().snapshot();
    assert_eq!(snapshot.reorg_events, 1);
    assert_eq!(snapshot.reorged_blocks, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn deep_reorg_notifies_oldest_height_first() -> Result<()> {
    init_tracing();
    let chain = MockChain::with_range(1, 5);
    let mut watcher = BlockWatcher::new(config(Some(1), 4)?, chain.clone());
    let recorder = Recorder::default();
    recorder.attach(&watcher);

    watcher.start().await?;
    wait_until(|| recorder.new_heights().len() >= 5, WAIT, "blocks 1..=5").await?;

    let before = blocks(&chain, 3..=5)?;
    let after = chain.force_reorg(2)?;
    wait_until(|| recorder.reorgs().len() >= 3, WAIT, "three reorged blocks").await?;
    watcher.stop().await?;

    let reorgs = recorder.reorgs();
    let updated: Vec<_> = reorgs.iter().map(|(updated, _)| updated.clone()).collect();
    let previous: Vec<_> = reorgs.iter().map(|(_, previous)| previous.clone()).collect();
    assert_eq!(updated, after);
    assert_eq!(previous, before);

    assert_eq!(watcher.observed_blocks(), blocks(&chain, 2..=5)?);
    assert_eq!(watcher.telemetry().reorged_blocks(), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reorg_is_repaired_before_the_next_block_is_delivered() -> Result<()> {
    init_tracing();
    let chain = MockChain::with_range(1, 3);
    let mut watcher = BlockWatcher::new(config(Some(1), 8)?, chain.clone());
    let recorder = Recorder::default();
    recorder.attach(&watcher);

    watcher.start().await?;
    wait_until(|| recorder.new_heights().len() >= 3, WAIT, "blocks 1..=3").await?;

    chain.force_reorg(1)?;
    chain.extend_to(4);
    wait_until(|| recorder.new_heights().len() >= 4, WAIT, "block 4").await?;
    watcher.stop().await?;

    assert_eq!(
        recorder.events(),
        vec!["new:1", "new:2", "new:3", "reorg:2", "reorg:3", "new:4"]
    );
    assert_eq!(watcher.observed_blocks(), blocks(&chain, 1..=4)?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stale_pre_start_state_is_repaired_on_start() -> Result<()> {
    init_tracing();
    let chain = MockChain::with_range(1, 10);
    let seed = blocks(&chain, 8..=10)?;
    let after = chain.force_reorg(8)?;

    let watcher = BlockWatcher::new(config(None, 8)?, chain.clone());
    let mut watcher = watcher.with_pre_start_state(seed.clone())?;
    let recorder = Recorder::default();
    recorder.attach(&watcher);

    watcher.start().await?;
    assert_eq!(
        recorder.reorgs(),
        vec![
            (after[0].clone(), seed[1].clone()),
            (after[1].clone(), seed[2].clone()),
        ],
        "the seeded window must be reconciled before start returns"
    );
    assert_eq!(
        chain.head_requests(),
        0,
        "a seeded watcher resumes from its window"
    );

    chain.extend_to(11);
    wait_until(|| !recorder.new_heights().is_empty(), WAIT, "block 11").await?;
    watcher.stop().await?;

    assert_eq!(recorder.events(), vec!["reorg:9", "reorg:10", "new:11"]);
    assert_eq!(heights(&watcher.observed_blocks()), (8..=11).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn canonical_pre_start_state_resumes_without_reorgs() -> Result<()> {
    init_tracing();
    let chain = MockChain::with_range(1, 12);
    let seed = blocks(&chain, 5..=9)?;

    let mut watcher =
        BlockWatcher::new(config(Some(10), 3)?, chain.clone()).with_pre_start_state(seed)?;
    assert_eq!(
        heights(&watcher.observed_blocks()),
        vec![7, 8, 9],
        "an oversized seed keeps its newest blocks"
    );
    let recorder = Recorder::default();
    recorder.attach(&watcher);

    watcher.start().await?;
    wait_until(|| recorder.new_heights().len() >= 3, WAIT, "blocks 10..=12").await?;
    watcher.stop().await?;

    assert!(recorder.reorgs().is_empty());
    assert_eq!(recorder.new_heights(), vec![10, 11, 12]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reorg_interrupted_by_stop_is_delivered_on_restart() -> Result<()> {
    init_tracing();
    let chain = MockChain::with_range(1, 3);
    let mut watcher = BlockWatcher::new(config(Some(1), 8)?, chain.clone());

    let broken = Arc::new(AtomicBool::new(true));
    let attempts = Arc::new(AtomicUsize::new(0));
    let (flag, counter) = (broken.clone(), attempts.clone());
    watcher.on_reorged_block(move |updated: TestBlock, _previous: TestBlock| {
        let (flag, counter) = (flag.clone(), counter.clone());
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if flag.load(Ordering::SeqCst) {
                bail!("reorg sink unavailable for block {}", updated.height);
            }
            Ok::<(), anyhow::Error>(())
        }
    });
    let recorder = Recorder::default();
    recorder.attach(&watcher);

    watcher.start().await?;
    wait_until(|| recorder.new_heights().len() >= 3, WAIT, "blocks 1..=3").await?;

    let before = blocks(&chain, 2..=3)?;
    let after = chain.force_reorg(1)?;
    wait_until(
        || attempts.load(Ordering::SeqCst) >= 3,
        WAIT,
        "repeated attempts on the first reorg",
    )
    .await?;
    watcher.stop().await?;

    assert!(recorder.reorgs().is_empty());
    assert_eq!(
        watcher.observed_blocks(),
        blocks(&chain, 1..=3)?,
        "the window is repaired even though delivery was cut short"
    );
    assert_eq!(watcher.pending_events(), 2);

    broken.store(false, Ordering::SeqCst);
    chain.extend_to(4);
    watcher.start().await?;
    assert_eq!(
        recorder.reorgs(),
        vec![
            (after[0].clone(), before[0].clone()),
            (after[1].clone(), before[1].clone()),
        ]
    );

    wait_until(|| recorder.new_heights().len() >= 4, WAIT, "block 4").await?;
    watcher.stop().await?;

    assert_eq!(
        recorder.events(),
        vec!["new:1", "new:2", "new:3", "reorg:2", "reorg:3", "new:4"]
    );
    let snapshot = watcher.telemetry().snapshot();
    assert_eq!(snapshot.reorg_events, 1);
    assert_eq!(snapshot.reorged_blocks, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reorg_landing_during_repair_is_settled_before_the_next_block() -> Result<()> {
    init_tracing();
    let chain = MockChain::with_range(1, 4);
    let mut watcher = BlockWatcher::new(config(Some(1), 8)?, chain.clone());

    let triggered = Arc::new(AtomicBool::new(false));
    let (flag, backend) = (triggered.clone(), chain.clone());
    watcher.on_reorged_block(move |_updated: TestBlock, _previous: TestBlock| {
        let (flag, backend) = (flag.clone(), backend.clone());
        async move {
            if !flag.swap(true, Ordering::SeqCst) {
                backend.force_reorg(2)?;
                backend.extend_to(5);
            }
            Ok::<(), anyhow::Error>(())
        }
    });
    let recorder = Recorder::default();
    recorder.attach(&watcher);

    watcher.start().await?;
    wait_until(|| recorder.new_heights().len() >= 4, WAIT, "blocks 1..=4").await?;

    let first = chain.force_reorg(1)?;
    wait_until(|| recorder.new_heights().len() >= 5, WAIT, "block 5").await?;
    watcher.stop().await?;

    assert_eq!(
        recorder.events(),
        vec![
            "new:1", "new:2", "new:3", "new:4", "reorg:2", "reorg:3", "reorg:4", "reorg:3",
            "reorg:4", "new:5",
        ]
    );

    let reorgs = recorder.reorgs();
    let updated: Vec<_> = reorgs.iter().map(|(updated, _)| updated.clone()).collect();
    assert_eq!(updated[..3], first[..]);
    let distinct: HashSet<_> = updated.iter().map(|block| block.hash.clone()).collect();
    assert_eq!(distinct.len(), updated.len(), "each replacement is reported once");
    assert_eq!(
        (reorgs[3].1.clone(), reorgs[4].1.clone()),
        (first[1].clone(), first[2].clone()),
        "the second repair replaces what the first one installed"
    );

    assert_eq!(watcher.observed_blocks(), blocks(&chain, 1..=5)?);
    let snapshot = watcher.telemetry().snapshot();
    assert_eq!(snapshot.reorg_events, 2);
    assert_eq!(snapshot.reorged_blocks, 5);
    Ok(())
}
