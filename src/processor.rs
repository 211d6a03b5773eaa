//! Processor orchestration covering the observed window, fetch primitives, reorg repair,
//! subscriber dispatch, and the watcher poll loop.

pub mod backoff;
pub mod dispatch;
pub mod fetcher;
pub mod lifecycle;
pub mod reorg;
pub mod tip;
pub mod watcher;
pub mod window;
