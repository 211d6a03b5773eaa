//! Bounded window of recently observed blocks used for reorg detection.

use crate::runtime::errors::WatcherError;
use crate::runtime::source::WatchedBlock;
use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Sliding window of observed blocks, ascending and contiguous by height.
///
/// Entries live in a ring buffer addressed by `height - lowest_height`, so lookups, in-place
/// replacement and eviction of the oldest entry are all O(1).
#[derive(Debug, Clone)]
pub struct ObservedWindow<B> {
    limit: usize,
    items: VecDeque<B>,
}

impl<B: WatchedBlock> ObservedWindow<B> {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            items: VecDeque::with_capacity(limit),
        }
    }

    /// Builds a window from blocks supplied before the watcher starts.
    ///
    /// The blocks must be strictly ascending and contiguous. When `start_block` is known the
    /// highest block must sit right below it. Only the newest `limit` blocks are retained.
    pub fn from_pre_start_state(
        limit: usize,
        blocks: Vec<B>,
        start_block: Option<u64>,
    ) -> Result<Self, WatcherError> {
        validate_pre_start_state(&blocks, start_block)?;

        let mut window = Self::new(limit);
        for block in blocks {
            window.push(block);
        }
        Ok(window)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn lowest_height(&self) -> Option<u64> {
        self.items.front().map(WatchedBlock::height)
    }

    pub fn highest(&self) -> Option<&B> {
        self.items.back()
    }

    pub fn highest_height(&self) -> Option<u64> {
        self.items.back().map(WatchedBlock::height)
    }

    /// Height the watcher should fetch next, if the window has any entries.
    pub fn next_height(&self) -> Option<u64> {
        self.highest_height().map(|height| height.saturating_add(1))
    }

    /// Appends the next block, evicting the oldest entry once the limit is exceeded.
    ///
    /// Callers must only push the block directly following the current highest one.
    pub fn push(&mut self, block: B) {
        debug_assert!(
            self.next_height()
                .map_or(true, |expected| expected == block.height()),
            "observed window must stay contiguous"
        );

        self.items.push_back(block);
        if self.items.len() > self.limit {
            self.items.pop_front();
        }
    }

    pub fn get(&self, height: u64) -> Option<&B> {
        self.index_of(height).and_then(|idx| self.items.get(idx))
    }

    /// Swaps the entry at `height` for `block`, returning the entry it displaced.
    pub fn replace(&mut self, height: u64, block: B) -> Result<B, WatcherError> {
        debug_assert_eq!(block.height(), height);
        let idx = self
            .index_of(height)
            .ok_or(WatcherError::HeightNotInWindow { height })?;
        Ok(std::mem::replace(&mut self.items[idx], block))
    }

    /// Heights currently held by the window, newest first.
    pub fn heights_newest_first(&self) -> Vec<u64> {
        self.items.iter().rev().map(WatchedBlock::height).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &B> {
        self.items.iter()
    }

    fn index_of(&self, height: u64) -> Option<usize> {
        let lowest = self.lowest_height()?;
        let offset = height.checked_sub(lowest)?;
        let idx = usize::try_from(offset).ok()?;
        (idx < self.items.len()).then_some(idx)
    }
}

fn validate_pre_start_state<B: WatchedBlock>(
    blocks: &[B],
    start_block: Option<u64>,
) -> Result<(), WatcherError> {
    let mut gaps = Vec::new();
    for pair in blocks.windows(2) {
        let (previous, next) = (pair[0].height(), pair[1].height());
        if next <= previous {
            return Err(WatcherError::UnsortedWindow { previous, next });
        }
        if next - previous > 1 {
            gaps.push(previous + 1..=next - 1);
        }
    }

    if !gaps.is_empty() {
        return Err(WatcherError::MissingHeights { gaps });
    }

    if let (Some(start_block), Some(last)) = (start_block, blocks.last()) {
        if last.height().checked_add(1) != Some(start_block) {
            return Err(WatcherError::MisalignedWindow {
                highest: last.height(),
                start_block,
            });
        }
    }

    Ok(())
}

/// Lock around the observed window shared between the poll loop (sole writer) and status queries.
///
/// Guards are never held across an await point.
#[derive(Debug)]
pub struct SharedWindow<B> {
    inner: RwLock<ObservedWindow<B>>,
}

impl<B: WatchedBlock> SharedWindow<B> {
    pub fn new(window: ObservedWindow<B>) -> Self {
        Self {
            inner: RwLock::new(window),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ObservedWindow<B>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ObservedWindow<B>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn highest(&self) -> Option<B> {
        self.read().highest().cloned()
    }

    pub fn snapshot(&self) -> Vec<B> {
        self.read().iter().cloned().collect()
    }
}
