//! The engine's configuration object.
//!
//! A [`Context`] is built once and passed by reference to every call. It owns
//! the block-size table, the kernel registries, the scratch memory pool and
//! the worker pools, so there is no process-wide mutable state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::{
    blocksize::{Arch, BlockSizeTable, BlockSizes},
    element::{Dtype, Element},
    error::{invalid_block_sizes, validation_error},
    kernels::{KernelRegistry, KernelTables},
    partition::Threading,
    pool::MemPool,
    Result,
};

pub struct Context {
    arch: Arch,
    block_sizes: BlockSizeTable,
    kernels: KernelTables,
    pool: MemPool,
    threading: Option<Threading>,
    workers: Mutex<HashMap<usize, Arc<Workers>>>,
}

/// A worker pool whose threads all take part in every broadcast.
///
/// Broadcasts are serialized: two calls interleaving their jobs on the same
/// threads could each hold a thread the other waits for at a barrier.
pub(crate) struct Workers {
    pool: ThreadPool,
    busy: Mutex<()>,
}

impl Workers {
    /// Runs `f(thread_index)` once on every thread of the pool.
    pub(crate) fn broadcast(&self, f: impl Fn(usize) + Sync) {
        let _busy = self.busy.lock();
        self.pool.broadcast(|bc| f(bc.index()));
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("arch", &self.arch)
            .field("block_sizes", &self.block_sizes)
            .field("pool", &self.pool)
            .field("threading", &self.threading)
            .finish()
    }
}

impl Context {
    /// A context for the detected architecture with default settings.
    pub fn new() -> Result<Self> {
        ContextBuilder::new().build()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Block sizes used for element type `T`.
    pub fn block_sizes<T: Element>(&self) -> BlockSizes {
        self.block_sizes.get(T::DTYPE)
    }

    pub fn kernels<T: Element>(&self) -> &KernelRegistry<T> {
        T::kernels(&self.kernels)
    }

    pub fn pool(&self) -> &MemPool {
        &self.pool
    }

    /// Thread shape for an `m × n` output: the configured one, else the
    /// environment's.
    pub fn threading_for(&self, m: usize, n: usize) -> Threading {
        self.threading.unwrap_or_else(|| Threading::from_env(m, n))
    }

    /// A worker pool of exactly `num_threads` threads, created on first use.
    pub(crate) fn workers(&self, num_threads: usize) -> Result<Arc<Workers>> {
        let mut workers = self.workers.lock();
        if let Some(pool) = workers.get(&num_threads) {
            return Ok(Arc::clone(pool));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("gemmly-{i}"))
            .build()
            .map_err(|e| validation_error(format!("failed to start {num_threads} worker threads: {e}")))?;
        debug!(num_threads, "started worker pool");
        let pool = Arc::new(Workers {
            pool,
            busy: Mutex::new(()),
        });
        workers.insert(num_threads, Arc::clone(&pool));
        Ok(pool)
    }
}

/// Builder for [`Context`].
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    arch: Option<Arch>,
    macro_overrides: Vec<(Dtype, usize, usize, usize)>,
    threading: Option<Threading>,
    pool_limit: Option<usize>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the tables of `arch` instead of the detected one.
    pub fn arch(mut self, arch: Arch) -> Self {
        self.arch = Some(arch);
        self
    }

    /// Overrides MC, NC and KC of `dtype`.
    pub fn macro_block_sizes(mut self, dtype: Dtype, mc: usize, nc: usize, kc: usize) -> Self {
        self.macro_overrides.push((dtype, mc, nc, kc));
        self
    }

    /// Fixes the thread shape of every call instead of reading the environment.
    pub fn threading(mut self, threading: Threading) -> Self {
        self.threading = Some(threading);
        self
    }

    /// Caps the bytes of scratch memory checked out at any time.
    pub fn pool_limit(mut self, bytes: usize) -> Self {
        self.pool_limit = Some(bytes);
        self
    }

    pub fn build(self) -> Result<Context> {
        let detected = Arch::detect();
        let arch = self.arch.unwrap_or(detected);
        if arch == Arch::Haswell && detected != Arch::Haswell {
            return Err(validation_error("AVX2/FMA kernels are not available on this CPU"));
        }

        let mut block_sizes = BlockSizeTable::for_arch(arch);
        for (dtype, mc, nc, kc) in self.macro_overrides {
            block_sizes.set_macro(dtype, mc, nc, kc)?;
        }

        let kernels = KernelTables::for_arch(arch)?;
        check_family(&block_sizes, Dtype::F32, &kernels.s)?;
        check_family(&block_sizes, Dtype::F64, &kernels.d)?;
        check_family(&block_sizes, Dtype::C32, &kernels.c)?;
        check_family(&block_sizes, Dtype::C64, &kernels.z)?;

        debug!(?arch, threading = ?self.threading, pool_limit = ?self.pool_limit, "context ready");
        Ok(Context {
            arch,
            block_sizes,
            kernels,
            pool: MemPool::new(self.pool_limit),
            threading: self.threading,
            workers: Mutex::new(HashMap::new()),
        })
    }
}

fn check_family<T: Element>(table: &BlockSizeTable, dtype: Dtype, registry: &KernelRegistry<T>) -> Result<()> {
    let bs = table.get(dtype);
    bs.validate()?;
    if bs.mr != registry.mr() || bs.nr != registry.nr() {
        return Err(invalid_block_sizes(format!(
            "{dtype:?} micro-tile {}x{} differs from its kernel family {}x{}",
            bs.mr,
            bs.nr,
            registry.mr(),
            registry.nr()
        )));
    }
    Ok(())
}
