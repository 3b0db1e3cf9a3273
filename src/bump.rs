//! Monotonic bump arena on top of the block manager
//!
//! [`Bump`] serves per-object allocations by bumping an offset through the
//! payload of its current block, chaining one more block when the current
//! one cannot fit a request. There is no per-object reclamation at all:
//! `deallocate` is a documented no-op, and the only way memory flows back to
//! the provider is [`reset`](Bump::reset) (called automatically on drop).
//!
//! A bump arena is single-threaded by contract. Pairing it with the
//! internally synchronized [`PageAllocator`](crate::PageAllocator) as its
//! provider is fine; sharing one arena across threads is not, and the raw
//! block pointers inside keep the type `!Sync` to enforce that.

use std::{marker::PhantomData, mem, ptr, ptr::NonNull};

use crate::{
    align::align_up,
    block::{BlockHeader, HEADER_SIZE},
    platform::Heap,
    BlockConfig, BlockManager, Grow, Limit, Provider,
};

/// Arena allocator handing out `T`-aligned sub-allocations
///
/// The element type fixes a floor on the arena's alignment; the rest of the
/// geometry (nominal block size, extra alignment, growth policy) comes from
/// a [`BlockConfig`]. Two arenas always compare equal, whatever their
/// element types, so containers that rebind an allocator to a different
/// element type can treat them as interchangeable.
///
/// ```
/// use strata::Bump;
///
/// let mut arena = Bump::<u64>::new();
/// let a = arena.allocate(8).unwrap();
/// let b = arena.allocate(8).unwrap();
/// assert_ne!(a, b);
/// arena.reset();
/// ```
pub struct Bump<T, P: Provider = Heap> {
    /// Block producer; its config carries the arena-adjusted alignment
    manager: BlockManager<P>,

    /// Head of the owned block chain, null until first use
    chunks: *mut BlockHeader,

    /// Tail-most block, the one currently being bumped through
    current: *mut BlockHeader,

    /// Next free byte within the current block's payload
    offset: usize,

    _element: PhantomData<T>,
}

/// Alignment actually used by an arena over `T`
///
/// The strictest of the element's natural alignment, pointer size, and
/// whatever the caller configured.
fn element_alignment<T>(configured: usize) -> usize {
    configured
        .max(mem::align_of::<T>())
        .max(mem::size_of::<*const u8>())
}

impl<T> Bump<T, Heap> {
    /// Arena with default geometry over the C heap
    pub fn new() -> Self {
        Self::with_config(BlockConfig::new())
    }

    /// Arena with the given geometry over the C heap
    ///
    /// The heap provider is constructed to match the arena's final
    /// alignment, so block bases are always usable as `T` storage.
    pub fn with_config(config: BlockConfig) -> Self {
        let alignment = element_alignment::<T>(config.alignment_value());
        Self::with_provider_and_config(Heap::new(alignment), config)
    }
}

impl<T> Default for Bump<T, Heap> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, P: Provider> Bump<T, P> {
    /// Arena with default geometry over a caller-supplied provider
    pub fn with_provider(provider: P) -> Self {
        Self::with_provider_and_config(provider, BlockConfig::new())
    }

    /// Arena with the given geometry over a caller-supplied provider
    ///
    /// The provider must return memory aligned to the arena's alignment
    /// (the configured alignment raised to the element's requirements).
    /// The configured limit policy is overridden: an arena always sizes its
    /// blocks as "at least the nominal size of payload", because its whole
    /// capacity contract is expressed in usable bytes.
    pub fn with_provider_and_config(provider: P, config: BlockConfig) -> Self {
        let alignment = element_alignment::<T>(config.alignment_value());
        let config = config
            .alignment(alignment)
            .limit(Limit::HaveAtLeastSizeBytes);

        Self {
            manager: BlockManager::new(provider, config),
            chunks: ptr::null_mut(),
            current: ptr::null_mut(),
            offset: 0,
            _element: PhantomData,
        }
    }

    /// Alignment of every pointer this arena returns
    pub fn alignment(&self) -> usize {
        self.manager.config().alignment_value()
    }

    /// Footprint of each block in the arena's chain, header included
    pub fn aligned_size(&self) -> usize {
        self.manager.aligned_block_size()
    }

    /// Offset of the first served byte within a block
    ///
    /// The header is rounded up to the arena alignment so that the first
    /// sub-allocation of every block is as aligned as all the others.
    fn data_offset(&self) -> usize {
        align_up(HEADER_SIZE, self.alignment())
    }

    /// Usable bytes in each block, i.e. the most one request can ask for
    pub fn capacity(&self) -> usize {
        self.aligned_size() - self.data_offset()
    }

    /// Allocate `n` bytes of `T`-aligned storage
    ///
    /// Returns null-as-`None` on any failure: a request too large for a
    /// single block, exhaustion under [`Grow::ReturnNull`], or the provider
    /// refusing a fresh block. The returned storage is uninitialized.
    pub fn allocate(&mut self, n: usize) -> Option<NonNull<T>> {
        let request = align_up(n, self.alignment());
        // No block can ever serve more than its payload; rejecting here
        // also makes the post-grow retry below infallible.
        if request > self.capacity() {
            return None;
        }

        if self.chunks.is_null() {
            let block = self.manager.new_block(ptr::null_mut()).ok()?;
            self.chunks = block.as_ptr();
            self.current = block.as_ptr();
            self.offset = 0;
        }

        let remaining = self.capacity() - self.offset;
        if request > remaining {
            if self.manager.config().grow_value() == Grow::ReturnNull {
                return None;
            }

            let block = self.manager.new_block(ptr::null_mut()).ok()?;
            // This is safe because a non-null `current` always points at the
            // live tail block of the chain.
            unsafe { (*self.current).next = block.as_ptr() };
            self.current = block.as_ptr();
            self.offset = 0;
        }

        // This is safe because `current` is a live block and
        // `data_offset + offset + request` fits its footprint by the checks
        // above.
        let result = unsafe {
            self.current
                .cast::<u8>()
                .add(self.data_offset() + self.offset)
        };
        self.offset += request;
        NonNull::new(result.cast::<T>())
    }

    /// Per-object deallocation, a no-op by contract
    ///
    /// Present so the arena satisfies the conventional allocator shape;
    /// memory only flows back through [`reset`](Self::reset).
    pub fn deallocate(&mut self, _ptr: NonNull<T>, _n: usize) {}

    /// Release the whole chain and start over
    ///
    /// Every pointer previously returned by this arena is invalidated.
    /// Infallible from the caller's perspective: a provider that refuses to
    /// take a block back gets logged, and the arena forgets the chain either
    /// way.
    pub fn reset(&mut self) {
        self.offset = 0;

        if !self.chunks.is_null() {
            // This is safe because `chunks` heads the list of live blocks
            // this arena's own manager produced, and we drop every pointer
            // into it right after.
            if let Err(err) = unsafe { self.manager.release_all(self.chunks, ptr::null_mut()) } {
                log::warn!("leaking bump arena blocks: {err}");
            }
        }

        self.chunks = ptr::null_mut();
        self.current = ptr::null_mut();
    }
}

impl<T, P: Provider> Drop for Bump<T, P> {
    fn drop(&mut self) {
        self.reset();
    }
}

// Arenas are interchangeable for rebinding purposes: equality deliberately
// ignores element types, providers and state.
impl<T, U, P: Provider, Q: Provider> PartialEq<Bump<U, Q>> for Bump<T, P> {
    fn eq(&self, _other: &Bump<U, Q>) -> bool {
        true
    }
}

impl<T, P: Provider> Eq for Bump<T, P> {}
