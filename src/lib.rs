pub mod processor;
pub mod runtime;

pub use processor::tip::ChainHead;
pub use processor::watcher::BlockWatcher;
pub use processor::window::ObservedWindow;
pub use runtime::config::{
    TaskErrorHandling, WatcherConfig, WatcherConfigBuilder, WatcherConfigParams,
};
pub use runtime::errors::WatcherError;
pub use runtime::hooks::{CallbackFuture, NewBlockCallback, ReorgCallback};
pub use runtime::runner::Runner;
pub use runtime::source::{BlockSource, FnBlockSource, WatchedBlock};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
