use std::sync::atomic::{AtomicU64, Ordering};

const UNKNOWN: u64 = u64::MAX;

/// Last chain head height reported by the block source.
#[derive(Debug)]
pub struct ChainHead {
    height: AtomicU64,
}

impl ChainHead {
    pub fn new() -> Self {
        Self {
            height: AtomicU64::new(UNKNOWN),
        }
    }

    pub fn update(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub fn current(&self) -> Option<u64> {
        match self.height.load(Ordering::SeqCst) {
            UNKNOWN => None,
            height => Some(height),
        }
    }
}

impl Default for ChainHead {
    fn default() -> Self {
        Self::new()
    }
}
