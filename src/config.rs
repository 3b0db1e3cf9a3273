//! Block manager configuration
//!
//! All tuning knobs of the block layer are gathered in [`BlockConfig`], a
//! record of named options that each come with a sensible default. The
//! setters validate eagerly, so an invalid configuration is caught where it
//! is written rather than where the first block is produced.

use crate::{
    align::{align_down, align_up},
    block::HEADER_SIZE,
};

/// Default nominal block size in bytes
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Smallest supported block alignment: one pointer
///
/// Block headers store a pointer, so nothing smaller is representable
/// anyway, and it matches the strictest alignment `posix_memalign` insists
/// on for the default heap provider.
pub const MIN_ALIGNMENT: usize = std::mem::size_of::<*const u8>();

const _: () = assert!(MIN_ALIGNMENT.is_power_of_two());

/// What the nominal `size` of a block means
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Limit {
    /// The usable payload must be at least `size` bytes; the footprint grows
    /// past `size` to fit the header and alignment
    #[default]
    HaveAtLeastSizeBytes,

    /// The total footprint must not exceed `size` bytes; the caller must
    /// leave room for the header, or the block is unusable
    NoMoreThanSizeBytes,
}

/// What to do when a client needs one more block
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Grow {
    /// Request another block from the provider
    #[default]
    GrowStorage,

    /// Report exhaustion instead of growing
    ReturnNull,
}

/// Named options of a block manager, all defaulted
///
/// ```
/// use strata::{BlockConfig, Grow, Limit};
///
/// let config = BlockConfig::new()
///     .alignment(64)
///     .size(16 * 1024)
///     .limit(Limit::NoMoreThanSizeBytes)
///     .grow(Grow::ReturnNull);
/// assert_eq!(config.aligned_block_size(), 16 * 1024);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockConfig {
    /// Alignment of block base addresses (not of sub-allocations)
    alignment: usize,

    /// Nominal block size, interpreted per `limit`
    size: usize,

    /// How `size` bounds the real footprint
    limit: Limit,

    /// Growth policy when a block fills up
    grow: Grow,
}

impl BlockConfig {
    /// Start from the default configuration
    pub const fn new() -> Self {
        Self {
            alignment: MIN_ALIGNMENT,
            size: DEFAULT_BLOCK_SIZE,
            limit: Limit::HaveAtLeastSizeBytes,
            grow: Grow::GrowStorage,
        }
    }

    /// Set the alignment of block base addresses
    ///
    /// Must be a power of two no smaller than [`MIN_ALIGNMENT`].
    pub fn alignment(mut self, alignment: usize) -> Self {
        assert!(
            alignment.is_power_of_two(),
            "Alignment must be a power of 2"
        );
        assert!(
            alignment >= MIN_ALIGNMENT,
            "Alignment must be at least the platform minimum"
        );
        self.alignment = alignment;
        self
    }

    /// Set the nominal block size
    ///
    /// Must be nonzero; how it bounds the real footprint depends on the
    /// `limit` policy.
    pub fn size(mut self, size: usize) -> Self {
        assert!(size != 0, "Block size must not be zero");
        self.size = size;
        self
    }

    /// Choose how the nominal size bounds the real footprint
    pub fn limit(mut self, limit: Limit) -> Self {
        self.limit = limit;
        self
    }

    /// Choose the growth policy
    pub fn grow(mut self, grow: Grow) -> Self {
        self.grow = grow;
        self
    }

    /// Configured alignment
    pub const fn alignment_value(&self) -> usize {
        self.alignment
    }

    /// Configured nominal size
    pub const fn size_value(&self) -> usize {
        self.size
    }

    /// Configured limit policy
    pub const fn limit_value(&self) -> Limit {
        self.limit
    }

    /// Configured growth policy
    pub const fn grow_value(&self) -> Grow {
        self.grow
    }

    /// Real footprint of every block produced under this configuration
    ///
    /// With [`Limit::HaveAtLeastSizeBytes`] the nominal size is padded with
    /// the header and rounded up to the alignment; with
    /// [`Limit::NoMoreThanSizeBytes`] the nominal size is rounded down to
    /// the alignment and must still leave room for the header to be usable.
    pub const fn aligned_block_size(&self) -> usize {
        match self.limit {
            Limit::HaveAtLeastSizeBytes => align_up(self.size + HEADER_SIZE, self.alignment),
            Limit::NoMoreThanSizeBytes => align_down(self.size, self.alignment),
        }
    }
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self::new()
    }
}
