//! In-band block headers and block lists
//!
//! Every block produced by the toolkit begins with a [`BlockHeader`]: a
//! plain-data prefix recording the block's total footprint and linking it
//! into a singly linked list. Keeping the metadata in-band means a block is
//! self-describing, but it also means that returning a block to its provider
//! destroys the metadata. Every walk in this module therefore reads `next`
//! *before* releasing the node it came from.

use std::{mem, ptr::NonNull};

use crate::{Error, Result};

/// Bytes consumed by the header at the base of every block
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Plain-data prefix at the base of every block
///
/// For a block based at `b`, the payload spans `[b + HEADER_SIZE, b + size)`
/// and `b + size` is the first address past the block. Blocks in a list are
/// disjoint.
#[derive(Debug)]
#[repr(C)]
pub struct BlockHeader {
    /// Total footprint of the block in bytes, header included
    pub size: usize,

    /// Next block in the list, null at the tail
    pub next: *mut BlockHeader,
}

impl BlockHeader {
    /// Imprint a header on the first bytes of `base` and return it
    ///
    /// # Safety
    ///
    /// `base` must be valid for writes of `size` bytes, aligned for
    /// `BlockHeader`, and `size` must be at least [`HEADER_SIZE`].
    pub unsafe fn write(
        base: NonNull<u8>,
        size: usize,
        next: *mut BlockHeader,
    ) -> NonNull<BlockHeader> {
        debug_assert!(size >= HEADER_SIZE, "Block cannot fit its own header");
        debug_assert_eq!(
            base.as_ptr() as usize % mem::align_of::<BlockHeader>(),
            0,
            "Block base is not aligned for a header"
        );

        let header = base.cast::<BlockHeader>();
        unsafe { header.as_ptr().write(BlockHeader { size, next }) };
        header
    }

    /// First usable payload byte of the block starting at `header`
    ///
    /// # Safety
    ///
    /// `header` must point at a live block created by [`BlockHeader::write`].
    pub unsafe fn payload(header: NonNull<BlockHeader>) -> NonNull<u8> {
        // This is safe because a block is always at least HEADER_SIZE bytes,
        // so the payload start is in bounds (one-past-the-end at worst).
        unsafe { NonNull::new_unchecked(header.as_ptr().cast::<u8>().add(HEADER_SIZE)) }
    }
}

/// Walk a block list from `head`, returning each block through `release`
///
/// The walk stops at null or at `sentinel`, whichever comes first. The first
/// `release` failure terminates the walk with [`Error::ReleaseFailed`];
/// blocks already handed back stay handed back, because the very bytes that
/// linked the list are part of the memory being returned.
///
/// # Safety
///
/// `head` must be null or point at a live, well-formed block list, and the
/// caller must not touch any released node afterwards. `release` receives
/// each block's base pointer exactly once.
pub unsafe fn release_list<F>(
    head: *mut BlockHeader,
    mut release: F,
    sentinel: *mut BlockHeader,
) -> Result<()>
where
    F: FnMut(NonNull<u8>) -> Result<()>,
{
    let mut node = head;
    while !node.is_null() && node != sentinel {
        // Read the link first: after `release` the header bytes are gone.
        let next = unsafe { (*node).next };

        // This is safe because a non-null list node is a live block base.
        let base = unsafe { NonNull::new_unchecked(node.cast::<u8>()) };
        release(base).map_err(|_| Error::ReleaseFailed)?;

        node = next;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-built block list inside one owned buffer
    ///
    /// Lays out back-to-back blocks of the given payload sizes and links
    /// them in order, so list-walk behavior can be tested without a real
    /// provider behind the blocks.
    struct TestList {
        // u64 storage keeps every block base aligned for a header.
        buffer: Vec<u64>,
        bases: Vec<usize>,
    }

    impl TestList {
        fn from_payload_sizes(payload_sizes: &[usize]) -> Self {
            let sizes: Vec<usize> = payload_sizes.iter().map(|s| s + HEADER_SIZE).collect();
            assert!(sizes.iter().all(|s| s % mem::align_of::<BlockHeader>() == 0));
            let total: usize = sizes.iter().sum();
            let mut buffer = vec![0u64; total / mem::size_of::<u64>()];
            let start = buffer.as_mut_ptr().cast::<u8>();

            let mut bases = Vec::with_capacity(sizes.len());
            let mut offset = 0;
            for (i, &size) in sizes.iter().enumerate() {
                bases.push(offset);
                let base = NonNull::new(unsafe { start.add(offset) }).unwrap();
                let next = if i + 1 < sizes.len() {
                    unsafe { start.add(offset + size) }.cast()
                } else {
                    std::ptr::null_mut()
                };
                unsafe { BlockHeader::write(base, size, next) };
                offset += size;
            }

            Self { buffer, bases }
        }

        fn header(&self, index: usize) -> *mut BlockHeader {
            let offset = self.bases[index];
            unsafe { self.buffer.as_ptr().cast::<u8>().add(offset) }
                .cast_mut()
                .cast()
        }
    }

    #[test]
    fn written_header_is_readable() {
        let mut buffer = vec![0u64; 8];
        let base = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();

        let header = unsafe { BlockHeader::write(base, 64, std::ptr::null_mut()) };
        let header = unsafe { header.as_ref() };
        assert_eq!(header.size, 64);
        assert!(header.next.is_null());
    }

    #[test]
    fn payload_starts_right_after_the_header() {
        let mut buffer = vec![0u64; 8];
        let base = NonNull::new(buffer.as_mut_ptr().cast::<u8>()).unwrap();

        let header = unsafe { BlockHeader::write(base, 64, std::ptr::null_mut()) };
        let payload = unsafe { BlockHeader::payload(header) };
        assert_eq!(
            payload.as_ptr() as usize - base.as_ptr() as usize,
            HEADER_SIZE
        );
    }

    #[test]
    fn release_list_visits_every_block_in_order() {
        let list = TestList::from_payload_sizes(&[32, 48, 16]);

        let mut visited = Vec::new();
        unsafe {
            release_list(
                list.header(0),
                |base| {
                    visited.push(base.as_ptr() as usize);
                    Ok(())
                },
                std::ptr::null_mut(),
            )
            .unwrap();
        }

        let expected: Vec<usize> = (0..3).map(|i| list.header(i) as usize).collect();
        assert_eq!(visited, expected);
    }

    #[test]
    fn release_list_stops_at_the_sentinel() {
        let list = TestList::from_payload_sizes(&[8, 8, 8, 8]);

        let mut visited = 0;
        unsafe {
            release_list(
                list.header(0),
                |_| {
                    visited += 1;
                    Ok(())
                },
                list.header(2),
            )
            .unwrap();
        }
        assert_eq!(visited, 2);
    }

    #[test]
    fn release_list_of_nothing_is_fine() {
        let mut visited = 0;
        unsafe {
            release_list(
                std::ptr::null_mut(),
                |_| {
                    visited += 1;
                    Ok(())
                },
                std::ptr::null_mut(),
            )
            .unwrap();
        }
        assert_eq!(visited, 0);
    }

    #[test]
    fn first_failure_terminates_the_walk() {
        let list = TestList::from_payload_sizes(&[8, 8, 8]);

        let mut visited = 0;
        let result = unsafe {
            release_list(
                list.header(0),
                |_| {
                    visited += 1;
                    if visited == 2 {
                        Err(Error::Internal)
                    } else {
                        Ok(())
                    }
                },
                std::ptr::null_mut(),
            )
        };

        assert_eq!(result, Err(Error::ReleaseFailed));
        assert_eq!(visited, 2);
    }
}
