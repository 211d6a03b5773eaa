use anyhow::Result;
use core::fmt::Debug;
use core::future::Future;
use core::marker::PhantomData;
use futures::future::BoxFuture;

/// Minimal view of a block the watcher needs: its height and an opaque content hash.
///
/// Any additional payload carried by the implementing type is passed through to subscribers
/// untouched.
pub trait WatchedBlock: Clone + Send + Sync + 'static {
    type Hash: PartialEq + Debug + Clone + Send + Sync + 'static;

    fn height(&self) -> u64;

    fn hash(&self) -> &Self::Hash;
}

/// External data source queried by the watcher.
///
/// Implementations may fail freely; the watcher never surfaces these errors to its caller and
/// instead treats them as "not available yet".
pub trait BlockSource: Send + Sync + 'static {
    type Block: WatchedBlock;

    /// Returns the block at `height`, or `None` when the source does not have it (yet).
    fn get_block(&self, height: u64) -> BoxFuture<'_, Result<Option<Self::Block>>>;

    /// Returns the height of the current canonical chain head.
    fn get_chain_head(&self) -> BoxFuture<'_, Result<Option<u64>>>;
}

/// Adapts a pair of async closures into a [`BlockSource`].
pub struct FnBlockSource<B, G, H> {
    get_block: G,
    get_chain_head: H,
    _block: PhantomData<fn() -> B>,
}

impl<B, G, H> FnBlockSource<B, G, H> {
    pub fn new(get_block: G, get_chain_head: H) -> Self {
        Self {
            get_block,
            get_chain_head,
            _block: PhantomData,
        }
    }
}

impl<B, G, GFut, H, HFut> BlockSource for FnBlockSource<B, G, H>
where
    B: WatchedBlock,
    G: Fn(u64) -> GFut + Send + Sync + 'static,
    GFut: Future<Output = Result<Option<B>>> + Send + 'static,
    H: Fn() -> HFut + Send + Sync + 'static,
    HFut: Future<Output = Result<Option<u64>>> + Send + 'static,
{
    type Block = B;

    fn get_block(&self, height: u64) -> BoxFuture<'_, Result<Option<B>>> {
        Box::pin((self.get_block)(height))
    }

    fn get_chain_head(&self) -> BoxFuture<'_, Result<Option<u64>>> {
        Box::pin((self.get_chain_head)())
    }
}
