use std::env;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use chainwatch::{
    FnBlockSource, Runner, TaskErrorHandling, WatchedBlock, WatcherConfig, WatcherConfigBuilder,
};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const DEFAULT_START_HEIGHT: u64 = 0;
const DEFAULT_BLOCK_TIME_MS: u64 = 400;
const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_REORG_EVERY: u64 = 7;
const DEFAULT_REORG_DEPTH: u64 = 2;
const DEFAULT_MAX_REORG_DEPTH: usize = 6;
const DEFAULT_TASK_ERROR_HANDLING: &str = "retry";
const DEFAULT_LOG_DIRECTIVE: &str = "info";

#[tokio::main]
async fn main() -> Result<()> {
    init_example_tracing();

    let args = ExampleArgs::from_env()?;
    println!(
        "Simulating a chain from height {} ({}ms blocks, reorg of depth {} every {} blocks)",
        args.start_height, args.block_time_ms, args.reorg_depth, args.reorg_every
    );

    let chain = Arc::new(Mutex::new(SimChain::new(args.start_height)));
    let miner = spawn_miner(chain.clone(), &args);

    let source = {
        let blocks = chain.clone();
        let heads = chain.clone();
        FnBlockSource::new(
            move |height: u64| {
                let chain = blocks.clone();
                async move { Ok::<_, anyhow::Error>(lock(&chain).block(height)) }
            },
            move || {
                let chain = heads.clone();
                async move { Ok::<_, anyhow::Error>(lock(&chain).tip()) }
            },
        )
    };

    let mut runner = Runner::new(args.to_watcher_config()?, source);
    let config = runner.watcher().config();
    println!(
        "Watching from height {} with a {}-block reorg window, polling every {:?} ({:?} on subscriber errors)",
        args.start_height,
        config.max_reorg_depth(),
        config.poll_interval(),
        config.task_error_handling()
    );
    runner.watcher().on_new_block(|block: SimBlock| async move {
        println!("new block   {:>6} {}", block.height, block.hash);
        Ok::<(), anyhow::Error>(())
    });
    runner
        .watcher()
        .on_reorged_block(|updated: SimBlock, previous: SimBlock| async move {
            println!(
                "reorged     {:>6} {} (was {})",
                updated.height, updated.hash, previous.hash
            );
            Ok::<(), anyhow::Error>(())
        });

    let run_result = runner.run_until_ctrl_c().await;
    miner.abort();

    let snapshot = runner.watcher().telemetry().snapshot();
    println!(
        "Processed {} blocks, repaired {} reorged blocks over {} reorgs",
        snapshot.processed_blocks, snapshot.reorged_blocks, snapshot.reorg_events
    );
    run_result
}

fn init_example_tracing() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", DEFAULT_LOG_DIRECTIVE);
    }
    chainwatch::init_tracing();
}

#[derive(Debug, Clone, PartialEq)]
struct SimBlock {
    height: u64,
    hash: String,
}

impl WatchedBlock for SimBlock {
    type Hash = String;

    fn height(&self) -> u64 {
        self.height
    }

    fn hash(&self) -> &String {
        &self.hash
    }
}

/// Append-only chain that can rewrite its newest blocks on demand.
struct SimChain {
    base: u64,
    blocks: Vec<SimBlock>,
    fork: u64,
}

impl SimChain {
    fn new(base: u64) -> Self {
        let mut chain = Self {
            base,
            blocks: Vec::new(),
            fork: 0,
        };
        chain.mine();
        chain
    }

    fn tip(&self) -> Option<u64> {
        self.blocks.last().map(|block| block.height)
    }

    fn block(&self, height: u64) -> Option<SimBlock> {
        let index = usize::try_from(height.checked_sub(self.base)?).ok()?;
        self.blocks.get(index).cloned()
    }

    fn mine(&mut self) {
        let height = self.base + self.blocks.len() as u64;
        self.blocks.push(SimBlock {
            height,
            hash: format!("{height:06}-f{}", self.fork),
        });
    }

    fn reorg(&mut self, depth: u64) {
        let keep = self
            .blocks
            .len()
            .saturating_sub(usize::try_from(depth).unwrap_or(usize::MAX))
            .max(1);
        let replaced = self.blocks.len() - keep;
        self.blocks.truncate(keep);
        self.fork += 1;
        for _ in 0..replaced {
            self.mine();
        }
    }
}

fn lock(chain: &Mutex<SimChain>) -> std::sync::MutexGuard<'_, SimChain> {
    chain.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_miner(chain: Arc<Mutex<SimChain>>, args: &ExampleArgs) -> JoinHandle<()> {
    let block_time = Duration::from_millis(args.block_time_ms);
    let reorg_every = args.reorg_every;
    let reorg_depth = args.reorg_depth;
    tokio::spawn(async move {
        let mut mined: u64 = 0;
        loop {
            sleep(block_time).await;
            let mut guard = lock(&chain);
            guard.mine();
            mined += 1;
            if reorg_every > 0 && mined % reorg_every == 0 {
                guard.reorg(reorg_depth);
                tracing::info!(depth = reorg_depth, tip = ?guard.tip(), "simulated reorg");
            }
        }
    })
}

struct ExampleArgs {
    start_height: u64,
    block_time_ms: u64,
    poll_interval_ms: u64,
    reorg_every: u64,
    reorg_depth: u64,
    max_reorg_depth: usize,
    task_error_handling: TaskErrorHandling,
}

impl ExampleArgs {
    fn from_env() -> Result<Self> {
        let start_height =
            parse_env_with_default::<u64>("CHAINWATCH_START_HEIGHT", DEFAULT_START_HEIGHT)?;
        let block_time_ms =
            parse_env_with_default::<u64>("CHAINWATCH_BLOCK_TIME_MS", DEFAULT_BLOCK_TIME_MS)?;
        let poll_interval_ms =
            parse_env_with_default::<u64>("CHAINWATCH_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?;
        let reorg_every =
            parse_env_with_default::<u64>("CHAINWATCH_REORG_EVERY", DEFAULT_REORG_EVERY)?;
        let reorg_depth =
            parse_env_with_default::<u64>("CHAINWATCH_REORG_DEPTH", DEFAULT_REORG_DEPTH)?;
        let max_reorg_depth =
            parse_env_with_default::<usize>("CHAINWATCH_MAX_REORG_DEPTH", DEFAULT_MAX_REORG_DEPTH)?;
        let task_error_handling = read_env_or_default(
            "CHAINWATCH_TASK_ERROR_HANDLING",
            DEFAULT_TASK_ERROR_HANDLING,
        )
        .parse::<TaskErrorHandling>()?;

        ensure!(
            block_time_ms > 0,
            "CHAINWATCH_BLOCK_TIME_MS must be greater than 0"
        );
        ensure!(
            (reorg_depth as usize) < max_reorg_depth,
            "CHAINWATCH_REORG_DEPTH must stay below CHAINWATCH_MAX_REORG_DEPTH"
        );

        Ok(Self {
            start_height,
            block_time_ms,
            poll_interval_ms,
            reorg_every,
            reorg_depth,
            max_reorg_depth,
            task_error_handling,
        })
    }

    fn to_watcher_config(&self) -> Result<WatcherConfig> {
        let builder: WatcherConfigBuilder = WatcherConfig::builder()
            .start_block(self.start_height)
            .poll_interval(Duration::from_millis(self.poll_interval_ms))
            .retry_delay(Duration::from_millis(self.poll_interval_ms))
            .max_reorg_depth(self.max_reorg_depth)
            .task_error_handling(self.task_error_handling);
        builder.build().context("invalid watcher configuration")
    }
}

fn read_env_or_default(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn parse_env_with_default<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("failed to parse {key}")),
        Ok(_) | Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("failed to read {key}")),
    }
}
