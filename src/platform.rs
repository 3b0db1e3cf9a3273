//! Platform memory primitives
//!
//! This module is the only place where the toolkit talks to the operating
//! system: whole-page spans come from anonymous `mmap` and go back through
//! `munmap`, and aligned byte buffers come from the C heap via
//! `posix_memalign`/`free`. Everything above it deals in the crate's own
//! [`Error`] vocabulary; platform error codes are deliberately not leaked.
//!
//! Only Unix-like targets are supported, as with the other `mmap`-based
//! allocators this crate descends from.

#![cfg(unix)]

use std::{mem, ptr::NonNull, sync::OnceLock};

use crate::{Error, Provider, Result};

/// Size of one OS page in bytes
///
/// Queried once from the kernel and cached for the lifetime of the process.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    // sysconf(_SC_PAGESIZE) cannot fail on any supported target.
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// Map `count` fresh pages of zeroed, readable and writable memory
///
/// The returned base is page-aligned. A zero `count` is rejected with
/// [`Error::InvalidInput`]; a refusal from the kernel surfaces as the opaque
/// [`Error::Internal`].
pub fn fetch_pages(count: u16) -> Result<NonNull<u8>> {
    if count == 0 {
        return Err(Error::InvalidInput);
    }

    let length = count as usize * page_size();
    // This is safe because we map fresh anonymous memory with no address
    // hint: no existing mapping can be clobbered.
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            length,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(Error::Internal);
    }
    NonNull::new(base.cast::<u8>()).ok_or(Error::Internal)
}

/// Unmap `count` pages previously mapped by [`fetch_pages`]
///
/// # Safety
///
/// `base` must come from a [`fetch_pages`] call that requested exactly
/// `count` pages, and the span must not have been returned before. The pages
/// are gone once this call starts, even if it reports an error.
pub unsafe fn return_pages(base: NonNull<u8>, count: u16) -> Result<()> {
    let length = count as usize * page_size();
    let rc = unsafe { libc::munmap(base.as_ptr().cast::<libc::c_void>(), length) };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Internal)
    }
}

/// Byte provider backed by the C heap
///
/// `Heap` serves aligned buffers through `posix_memalign` and takes them
/// back through `free`, which conveniently shares the [`Provider`] contract
/// of reclaiming by base pointer alone. It is the default backing store of a
/// [`Bump`](crate::Bump) arena whose blocks are smaller than a page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Heap {
    /// Alignment of every buffer handed out, in bytes
    alignment: usize,
}

impl Heap {
    /// Build a heap provider whose buffers have (at least) this alignment
    ///
    /// The alignment must be a power of two; it is floored at pointer size,
    /// the strictest thing `posix_memalign` insists on.
    pub fn new(alignment: usize) -> Self {
        assert!(
            alignment.is_power_of_two(),
            "Alignment must be a power of 2"
        );
        Self {
            alignment: alignment.max(mem::size_of::<*const u8>()),
        }
    }

    /// Alignment of the buffers this provider hands out
    pub const fn alignment(&self) -> usize {
        self.alignment
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(mem::size_of::<*const u8>())
    }
}

impl Provider for Heap {
    fn provide(&self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::InvalidInput);
        }

        let mut base: *mut libc::c_void = std::ptr::null_mut();
        // This is safe because `base` is a valid out-pointer and the
        // alignment was validated at construction.
        let rc = unsafe { libc::posix_memalign(&mut base, self.alignment, size) };
        if rc != 0 {
            return Err(Error::Internal);
        }
        NonNull::new(base.cast::<u8>()).ok_or(Error::Internal)
    }

    unsafe fn reclaim(&self, base: NonNull<u8>) -> Result<()> {
        unsafe { libc::free(base.as_ptr().cast::<libc::c_void>()) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_nonzero_power_of_two() {
        assert!(page_size().is_power_of_two());
    }

    #[test]
    fn fetched_pages_are_page_aligned_and_writable() {
        let base = fetch_pages(2).unwrap();
        assert_eq!(base.as_ptr() as usize % page_size(), 0);

        // Touch both pages to make sure the mapping is usable.
        unsafe {
            base.as_ptr().write(0xAB);
            base.as_ptr().add(2 * page_size() - 1).write(0xCD);
            return_pages(base, 2).unwrap();
        }
    }

    #[test]
    fn zero_pages_are_refused() {
        assert_eq!(fetch_pages(0), Err(Error::InvalidInput));
    }

    #[test]
    fn heap_buffers_honor_alignment() {
        for shift in 3..10 {
            let alignment = 1 << shift;
            let heap = Heap::new(alignment);
            let base = heap.provide(alignment * 3).unwrap();
            assert_eq!(base.as_ptr() as usize % alignment, 0);
            unsafe { heap.reclaim(base).unwrap() };
        }
    }

    #[test]
    fn heap_floors_alignment_at_pointer_size() {
        assert_eq!(Heap::new(1).alignment(), mem::size_of::<*const u8>());
    }

    #[test]
    #[should_panic]
    fn heap_rejects_non_power_of_two_alignment() {
        Heap::new(24);
    }

    #[test]
    fn heap_rejects_empty_requests() {
        assert_eq!(Heap::default().provide(0), Err(Error::InvalidInput));
    }
}
