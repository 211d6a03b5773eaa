use anyhow::Result;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Future returned by subscriber callbacks.
pub type CallbackFuture = BoxFuture<'static, Result<()>>;

/// Invoked once per block appended to the observed window.
pub type NewBlockCallback<B> = Arc<dyn Fn(B) -> CallbackFuture + Send + Sync>;

/// Invoked once per replaced block with `(updated, pre_reorg)`.
pub type ReorgCallback<B> = Arc<dyn Fn(B, B) -> CallbackFuture + Send + Sync>;
