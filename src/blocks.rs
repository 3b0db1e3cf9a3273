//! Fixed-size block production over a provider
//!
//! [`BlockManager`] turns any [`Provider`] into a source of uniform blocks:
//! every block it produces has the footprint derived from its
//! [`BlockConfig`], starts with an in-band [`BlockHeader`], and can be
//! handed back individually or as a whole list. The manager itself is
//! single-threaded by contract; thread safety, if any, comes from the
//! provider underneath.

use std::ptr::NonNull;

use crate::{
    block::{self, BlockHeader, HEADER_SIZE},
    BlockConfig, Error, Provider, Result,
};

/// Producer of fixed-size, aligned, header-prefixed blocks
#[derive(Debug)]
pub struct BlockManager<P> {
    /// Where the blocks' memory comes from and goes back to
    provider: P,

    /// Block geometry and policies
    config: BlockConfig,
}

impl<P: Provider> BlockManager<P> {
    /// Wrap `provider` into a manager producing blocks per `config`
    ///
    /// The provider must hand out memory aligned to the configuration's
    /// alignment; both providers in this crate do so when constructed
    /// consistently ([`Heap`](crate::Heap) takes the alignment up front, and
    /// page spans are page-aligned).
    pub fn new(provider: P, config: BlockConfig) -> Self {
        Self { provider, config }
    }

    /// The configuration the manager was built with
    pub const fn config(&self) -> &BlockConfig {
        &self.config
    }

    /// Real footprint of every block this manager produces
    pub const fn aligned_block_size(&self) -> usize {
        self.config.aligned_block_size()
    }

    /// Produce one block, linked to `next`
    ///
    /// A configuration whose footprint cannot even hold the header (possible
    /// under [`Limit::NoMoreThanSizeBytes`](crate::Limit) with a nominal
    /// size below the alignment) is reported as [`Error::InvalidInput`]
    /// rather than producing an unusable block.
    pub fn new_block(&self, next: *mut BlockHeader) -> Result<NonNull<BlockHeader>> {
        let size = self.aligned_block_size();
        if size <= HEADER_SIZE {
            return Err(Error::InvalidInput);
        }

        let base = self.provider.provide(size)?;
        debug_assert_eq!(
            base.as_ptr() as usize % self.config.alignment_value(),
            0,
            "Provider returned a misaligned block base"
        );

        // This is safe because the provider just handed us `size` writable
        // bytes at `base`, and `size` exceeds the header footprint.
        Ok(unsafe { BlockHeader::write(base, size, next) })
    }

    /// Return a single block to the provider
    ///
    /// The block is unhooked from nothing: the caller owns the list
    /// structure and must have unlinked it first.
    ///
    /// # Safety
    ///
    /// `block` must have been produced by this manager and not yet released;
    /// it is invalid once this call starts.
    pub unsafe fn release_block(&self, block: NonNull<BlockHeader>) -> Result<()> {
        unsafe { self.provider.reclaim(block.cast::<u8>()) }.map_err(|err| {
            log::error!("block release failed: {err}");
            Error::Internal
        })
    }

    /// Return every block of a list to the provider
    ///
    /// Walks `head → next → …` until null or `sentinel`. On a provider
    /// failure the walk stops and [`Error::Internal`] is reported; blocks
    /// released before the failure stay released.
    ///
    /// # Safety
    ///
    /// `head` must be null or the head of a list of blocks produced by this
    /// manager, none of them already released; the caller must not touch the
    /// list afterwards.
    pub unsafe fn release_all(
        &self,
        head: *mut BlockHeader,
        sentinel: *mut BlockHeader,
    ) -> Result<()> {
        let release = |base: NonNull<u8>| {
            // This is safe because release_list feeds us each block base
            // exactly once and the caller vouches for the list.
            unsafe { self.provider.reclaim(base) }.map_err(|err| {
                log::error!("block release failed: {err}");
                err
            })
        };

        unsafe { block::release_list(head, release, sentinel) }.map_err(|_| Error::Internal)
    }
}
