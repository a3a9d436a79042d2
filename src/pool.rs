//! Scratch memory for packed panels.
//!
//! [`MemPool`] hands out cache-aligned blocks tagged by what they will hold
//! and recycles released blocks for later requests. It is shared by every
//! thread of a call (and by every call made through one [`crate::Context`]);
//! all bookkeeping happens under one lock, the blocks themselves are used
//! lock-free by their owners.
//!
//! An optional byte limit turns the pool into a bounded resource: a request
//! that would push the bytes checked out past the limit fails with
//! [`GemmError::AllocationError`](crate::GemmError::AllocationError) and is
//! never retried.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use parking_lot::Mutex;
use tracing::warn;

use crate::{
    error::{allocation_error, layout_error},
    Result,
};

/// Alignment of every pool block, one cache line.
pub const POOL_ALIGNMENT: usize = 64;

/// What a block is used for; each tag has its own free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolTag {
    /// Private per-thread panel of A.
    APanel,
    /// Panel of B shared by an inner thread group.
    BPanel,
}

/// An owned, cache-aligned allocation, zeroed when first allocated.
///
/// Blocks recycled from a free list keep whatever the previous owner wrote.
struct RawBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: a RawBlock is plain owned memory with no thread affinity.
unsafe impl Send for RawBlock {}

impl RawBlock {
    fn alloc(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(1), POOL_ALIGNMENT)
            .map_err(|e| layout_error(size, POOL_ALIGNMENT, e.to_string()))?;

        // SAFETY: layout has a non-zero size.
        let raw_ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw_ptr)
            .ok_or_else(|| allocation_error(size, POOL_ALIGNMENT, "system allocator returned null"))?;

        Ok(RawBlock { ptr, layout })
    }

    fn capacity(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for RawBlock {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Handle to memory obtained from a [`MemPool`].
///
/// A default handle is unallocated; releasing it is a no-op.
pub struct MemBlock {
    raw: Option<RawBlock>,
    tag: PoolTag,
    accounted: usize,
}

impl MemBlock {
    /// A handle that owns nothing.
    pub fn unallocated(tag: PoolTag) -> Self {
        MemBlock {
            raw: None,
            tag,
            accounted: 0,
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.raw.is_some()
    }

    pub fn tag(&self) -> PoolTag {
        self.tag
    }

    /// Usable bytes, at least the requested size.
    pub fn capacity(&self) -> usize {
        self.raw.as_ref().map_or(0, RawBlock::capacity)
    }

    /// Base address, null when unallocated.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.raw
            .as_ref()
            .map_or(std::ptr::null_mut(), |raw| raw.ptr.as_ptr())
    }
}

struct PoolState {
    in_use: usize,
    free_a: Vec<RawBlock>,
    free_b: Vec<RawBlock>,
}

impl PoolState {
    fn free_list(&mut self, tag: PoolTag) -> &mut Vec<RawBlock> {
        match tag {
            PoolTag::APanel => &mut self.free_a,
            PoolTag::BPanel => &mut self.free_b,
        }
    }
}

pub struct MemPool {
    limit: Option<usize>,
    state: Mutex<PoolState>,
}

impl Default for MemPool {
    fn default() -> Self {
        MemPool::new(None)
    }
}

impl std::fmt::Debug for MemPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemPool")
            .field("limit", &self.limit)
            .field("in_use", &self.in_use_bytes())
            .finish()
    }
}

impl MemPool {
    /// A pool that refuses requests once `limit` bytes are checked out.
    pub fn new(limit: Option<usize>) -> Self {
        MemPool {
            limit,
            state: Mutex::new(PoolState {
                in_use: 0,
                free_a: Vec::new(),
                free_b: Vec::new(),
            }),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Bytes currently checked out by callers.
    pub fn in_use_bytes(&self) -> usize {
        self.state.lock().in_use
    }

    /// Number of released blocks kept for reuse under `tag`.
    pub fn cached_blocks(&self, tag: PoolTag) -> usize {
        self.state.lock().free_list(tag).len()
    }

    /// Obtains a block of at least `size` bytes.
    pub fn acquire(&self, size: usize, tag: PoolTag) -> Result<MemBlock> {
        let mut state = self.state.lock();

        if let Some(limit) = self.limit {
            if state.in_use + size > limit {
                warn!(size, ?tag, limit, in_use = state.in_use, "memory pool exhausted");
                return Err(allocation_error(
                    size,
                    POOL_ALIGNMENT,
                    format!("memory pool limit of {limit} bytes exceeded"),
                ));
            }
        }

        let free = state.free_list(tag);
        let raw = match free.iter().position(|b| b.capacity() >= size) {
            Some(idx) => free.swap_remove(idx),
            None => RawBlock::alloc(size)?,
        };
        state.in_use += size;

        Ok(MemBlock {
            raw: Some(raw),
            tag,
            accounted: size,
        })
    }

    /// Returns `block` to the pool and leaves it unallocated.
    pub fn release(&self, block: &mut MemBlock) {
        if let Some(raw) = block.raw.take() {
            let mut state = self.state.lock();
            state.in_use -= block.accounted;
            state.free_list(block.tag).push(raw);
            block.accounted = 0;
        }
    }

    /// Drops every cached block.
    pub fn trim(&self) {
        let mut state = self.state.lock();
        state.free_a.clear();
        state.free_b.clear();
    }
}
