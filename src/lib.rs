//! This crate provides a small toolkit of composable memory allocators. You
//! can use it when you need memory with a lifecycle that the system allocator
//! does not model well: arena-style workloads that allocate many short-lived
//! objects and free them all at once, or subsystems that want to fetch whole
//! pages from the operating system and account for them precisely.
//!
//! The toolkit is built as three layers, each usable on its own:
//!
//! - [`PageAllocator`] requests spans of whole pages from the operating
//!   system and remembers, in a lock-free registry, which base address maps
//!   to which span, so that a span can be released from its pointer alone.
//!   After construction, any number of threads may allocate and release
//!   pages concurrently without taking a lock.
//! - [`BlockManager`] sits on top of any [`Provider`] and cuts its memory
//!   into fixed-size, aligned blocks. Every block starts with an in-band
//!   header that records the block's footprint and links it into a singly
//!   linked list, so a whole chain of blocks can be handed back in one walk.
//! - [`Bump`] is a monotonic arena on top of the block manager: allocation
//!   is a pointer bump within the current block, growth is chaining one more
//!   block, and the only way to reclaim memory is to reset the whole arena.
//!
//! # Bump allocation primer
//!
//! A bump allocator does not track individual objects. It owns a chain of
//! blocks and an offset into the current one; serving a request means
//! rounding the requested size up to the arena's alignment, handing out the
//! bytes at the current offset, and advancing the offset. When the current
//! block cannot fit a request, the arena either chains a fresh block or
//! reports exhaustion, depending on its growth policy. `deallocate` is a
//! no-op by contract; dropping or resetting the arena returns every block to
//! the provider it came from.
//!
//! This design trades reclamation granularity for speed and simplicity:
//! there is no per-object bookkeeping, no fragmentation within a block, and
//! the release path is a single list walk. The price is that one long-lived
//! object keeps its whole block alive.
//!
//! # Progress guarantee
//!
//! The page layer is lock-free on targets with a native double-word
//! compare-and-swap: the only shared mutable state is a 16-byte registry
//! header updated by CAS. On targets without such an instruction the atomic
//! is emulated by `portable-atomic`'s fallback and the lock-freedom claim no
//! longer holds, although the API and its semantics are unchanged. The block
//! and bump layers are single-threaded by contract and hold no shared state.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod align;
mod block;
mod blocks;
mod bump;
mod config;
mod page;
pub mod platform;
mod registry;

use std::ptr::NonNull;

use thiserror::Error;

pub use crate::{
    block::{BlockHeader, HEADER_SIZE},
    blocks::BlockManager,
    bump::Bump,
    config::{BlockConfig, Grow, Limit, DEFAULT_BLOCK_SIZE, MIN_ALIGNMENT},
    page::PageAllocator,
    platform::Heap,
};

/// Errors reported by the allocators in this crate
///
/// The variants are deliberately coarse: callers of an allocator can rarely
/// do anything smarter than distinguishing "you asked for something
/// nonsensical" from "the machine said no".
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// The request itself was malformed: a null or unknown pointer on
    /// release, or a page count outside the supported range on allocation.
    #[error("invalid request: null/unknown pointer or out-of-range size")]
    InvalidInput,

    /// The platform refused a memory operation, or an internal structure
    /// could not be maintained. Opaque by design.
    #[error("platform memory operation failed")]
    Internal,

    /// A block-list walk could not return one of its blocks to the provider.
    /// Blocks released before the failure stay released; the walk cannot be
    /// rolled back because the header bytes are the memory being returned.
    #[error("failed to return a block to its provider")]
    ReleaseFailed,
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Source of backing memory for the block manager
///
/// A provider hands out byte buffers of a requested size and takes them back
/// by base pointer alone, without being reminded of the size. The two
/// implementations shipped with this crate are [`PageAllocator`], which
/// resolves the size at release time from its span registry, and [`Heap`],
/// which delegates to the C heap where `free` has the same contract.
///
/// Implementations must return memory aligned at least as strictly as the
/// consumer that is plugged into them requires; see the block manager's
/// configuration for details.
pub trait Provider {
    /// Provide a buffer of at least `size` bytes
    fn provide(&self, size: usize) -> Result<NonNull<u8>>;

    /// Take back a buffer previously handed out by `provide`
    ///
    /// # Safety
    ///
    /// `base` must have been returned by `provide` on this very provider and
    /// must not have been reclaimed before. The memory is invalid once this
    /// call starts, even if it reports an error.
    unsafe fn reclaim(&self, base: NonNull<u8>) -> Result<()>;
}

// Allow a single provider (e.g. one shared PageAllocator) to back several
// block managers at once.
impl<P: Provider + ?Sized> Provider for &P {
    fn provide(&self, size: usize) -> Result<NonNull<u8>> {
        (**self).provide(size)
    }

    unsafe fn reclaim(&self, base: NonNull<u8>) -> Result<()> {
        unsafe { (**self).reclaim(base) }
    }
}
