use std::ops::RangeInclusive;

/// Invariant violations and lifecycle errors raised by the watcher.
///
/// Every variant except [`WatcherError::Cancelled`] is fatal: it is reported at the point of
/// detection and never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherError {
    AlreadyStarted,
    Cancelled,
    UnsortedWindow { previous: u64, next: u64 },
    /// Each gap is the inclusive run of heights absent between two seeded blocks.
    MissingHeights { gaps: Vec<RangeInclusive<u64>> },
    MisalignedWindow { highest: u64, start_block: u64 },
    HeightNotInWindow { height: u64 },
}

impl WatcherError {
    pub fn is_cancelled(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<WatcherError>(), Some(WatcherError::Cancelled))
    }
}

impl std::fmt::Display for WatcherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatcherError::AlreadyStarted => write!(f, "block watcher already started"),
            WatcherError::Cancelled => write!(f, "block watcher cancelled"),
            WatcherError::UnsortedWindow { previous, next } => write!(
                f,
                "pre-start window is not sorted by ascending height ({next} follows {previous})"
            ),
            WatcherError::MissingHeights { gaps } => {
                write!(f, "pre-start window is missing heights: ")?;
                for (idx, gap) in gaps.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    if gap.start() == gap.end() {
                        write!(f, "{}", gap.start())?;
                    } else {
                        write!(f, "{}..={}", gap.start(), gap.end())?;
                    }
                }
                Ok(())
            }
            WatcherError::MisalignedWindow {
                highest,
                start_block,
            } => write!(
                f,
                "pre-start window ends at {highest} but start block {start_block} requires it to end at {}",
                start_block.saturating_sub(1)
            ),
            WatcherError::HeightNotInWindow { height } => {
                write!(f, "height {height} is not present in the observed window")
            }
        }
    }
}

impl std::error::Error for WatcherError {}
