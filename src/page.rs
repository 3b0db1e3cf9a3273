//! Page-granular allocator with a lock-free span registry
//!
//! [`PageAllocator`] hands out spans of whole OS pages and takes them back
//! given nothing but their base pointer. The trick that makes the release
//! side work is a **registry**: a page-backed table of packed
//! [`Span`](crate::registry::Span) words recording every span that was
//! handed out, searchable by base address.
//!
//! The registry is itself allocated from the platform, one
//! [`REGISTRY_PAGES`]-page chunk at a time. Its control word (the
//! [`RegistryHeader`]) lives in a single 16-byte atomic cell and is only
//! mutated by double-word compare-and-exchange, which is what makes the
//! allocator safe to share across threads without a lock:
//!
//! - Reserving a slot for a new span is a CAS that bumps `next_slot`; the
//!   winner owns the slot outright and publishes the span into it with a
//!   release store afterwards.
//! - When the active registry fills up (or none exists yet), a fresh one is
//!   installed by CAS, with `next_registry` chaining back to the full one.
//!   Losing that race is cheap: the loser unmaps its candidate pages and
//!   retries against the winner.
//!
//! Slots are never compacted: releasing a span tombstones its slot to zero
//! but the slot is not reused. A long-running process therefore pays for
//! every span it ever allocated when the release search walks the registry
//! chain. That is a known trade-off inherited from the grow-only design.

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use portable_atomic::AtomicU128;

use crate::{
    platform,
    registry::{RegistryHeader, Span, State, MAX_SLOTS},
    Error, Provider, Result,
};

/// Number of pages backing one registry
pub(crate) const REGISTRY_PAGES: usize = 1;

/// Bytes of one span slot
const SLOT_BYTES: usize = std::mem::size_of::<u64>();

/// Index of the first slot usable for spans
///
/// The first 16 bytes of a registry's pages are reserved for an in-band copy
/// of its header, written when the registry is superseded.
pub(crate) const HEADER_SLOTS: usize = std::mem::size_of::<u128>() / SLOT_BYTES;

// The in-band header copy must cover a whole number of slots.
const _: () = assert!(std::mem::size_of::<u128>() % SLOT_BYTES == 0);

/// Total number of slots in one registry, in-band header included
///
/// Clamped to what the header's 12-bit `next_slot` field can count, which
/// matters on targets with large pages.
pub(crate) fn slot_capacity() -> usize {
    (REGISTRY_PAGES * platform::page_size() / SLOT_BYTES).min(MAX_SLOTS)
}

/// Reference to the span slot at `index` within the registry based at `base`
///
/// # Safety
///
/// `base` must be the live span set of a registry owned by the allocator the
/// returned lifetime is borrowed from, and `index` must be below the slot
/// capacity.
unsafe fn slot_cell<'a>(base: usize, index: usize) -> &'a AtomicU64 {
    debug_assert!(index < slot_capacity());
    unsafe { &*(base as *const AtomicU64).add(index) }
}

/// Reference to the in-band header cell of the registry based at `base`
///
/// # Safety
///
/// `base` must be the live, page-aligned span set of a registry owned by the
/// allocator the returned lifetime is borrowed from.
unsafe fn header_cell<'a>(base: usize) -> &'a AtomicU128 {
    debug_assert_eq!(base % std::mem::align_of::<AtomicU128>(), 0);
    unsafe { &*(base as *const AtomicU128) }
}

/// Thread-safe allocator of whole-page spans
///
/// Allocations are multiples of the OS page size and come straight from the
/// platform; what this type adds is the registry that lets [`release`]
/// recover a span's page count from its base pointer, so callers never carry
/// sizes around. All operations are safe to call from any number of threads
/// concurrently.
///
/// Dropping the allocator unmaps the registry chain itself. Spans still
/// outstanding at that point are leaked, never double-freed.
///
/// [`release`]: PageAllocator::release
#[derive(Debug, Default)]
pub struct PageAllocator {
    /// Header of the currently active registry, CAS-swapped as a unit
    registry: AtomicU128,
}

impl PageAllocator {
    /// Create an allocator with no registry installed yet
    ///
    /// The first allocation installs the first registry lazily.
    pub const fn new() -> Self {
        Self {
            registry: AtomicU128::new(0),
        }
    }

    /// Granularity of this allocator, i.e. the OS page size
    pub fn block_size(&self) -> usize {
        platform::page_size()
    }

    /// Allocate a span of `count` contiguous pages
    ///
    /// `count` must be in `1..65536`, the range a span's 16-bit page count
    /// can record; anything else is [`Error::InvalidInput`]. The returned
    /// base is page-aligned and the memory is zeroed, readable and writable.
    ///
    /// If the span cannot be recorded in the registry, the pages are
    /// returned to the OS before the error propagates, so a failed
    /// allocation leaks nothing.
    pub fn allocate(&self, count: usize) -> Result<NonNull<u8>> {
        if count == 0 || count >= 1 << 16 {
            return Err(Error::InvalidInput);
        }

        let base = platform::fetch_pages(count as u16)?;
        let span = Span {
            address: base.as_ptr() as usize,
            count: count as u16,
        };

        if let Err(err) = self.register_span(span) {
            // This is safe because the span was just fetched and has not
            // been published anywhere.
            unsafe { platform::return_pages(base, span.count)? };
            return Err(err);
        }

        Ok(base)
    }

    /// Release a span previously returned by [`allocate`](Self::allocate)
    ///
    /// The span's page count is recovered from the registry; a pointer that
    /// is null, was never allocated here, or was already released fails with
    /// [`Error::InvalidInput`]. Each successfully allocated span can be
    /// released exactly once, even under concurrent duplicate attempts:
    /// claiming the registry slot is a CAS and only the winner unmaps.
    ///
    /// # Safety
    ///
    /// The memory at `p` must no longer be accessed once this call starts.
    /// Passing arbitrary pointers is memory-safe (they are rejected), but
    /// releasing a live span while another thread still uses its pages is
    /// not.
    pub unsafe fn release(&self, p: *mut u8) -> Result<()> {
        if p.is_null() {
            return Err(Error::InvalidInput);
        }

        let mut header = RegistryHeader::unpack(self.registry.load(Ordering::Acquire));
        if header.state == State::Inactive {
            return Err(Error::InvalidInput);
        }

        loop {
            // Scan the committed slots of this registry. A reserved slot
            // whose span has not been published yet still reads zero; that
            // is fine, because a caller cannot release a pointer it has not
            // been handed.
            for index in HEADER_SLOTS..header.next_slot as usize {
                // This is safe because `header` describes a live registry of
                // this allocator and `index` is below its slot count.
                let cell = unsafe { slot_cell(header.self_address, index) };
                let bits = cell.load(Ordering::Acquire);
                if bits == 0 {
                    continue;
                }
                let span = Span::unpack(bits);
                if span.address != p as usize {
                    continue;
                }

                // Claim the slot: winning the exchange makes us solely
                // responsible for unmapping the span. Losing it means a
                // concurrent release got here first; keep scanning so a
                // genuine duplicate falls through to InvalidInput.
                if cell
                    .compare_exchange(bits, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // This is safe because the span was recorded by
                    // `allocate` with exactly this base and count, and the
                    // slot claim above guarantees we are the only releaser.
                    return unsafe {
                        platform::return_pages(NonNull::new_unchecked(p), span.count)
                    };
                }
            }

            if header.next_registry == 0 {
                return Err(Error::InvalidInput);
            }

            // Chained registries are always Full and their in-band header
            // was published before the chain pointer became reachable.
            let cell = unsafe { header_cell(header.next_registry) };
            header = RegistryHeader::unpack(cell.load(Ordering::Acquire));
            debug_assert_eq!(header.state, State::Full);
        }
    }

    /// Record a span in the registry, installing registries as needed
    fn register_span(&self, span: Span) -> Result<()> {
        loop {
            let current = RegistryHeader::unpack(self.registry.load(Ordering::Acquire));

            match current.state {
                // No usable slot: splice in a fresh registry, then retry
                // against whichever registry ends up installed.
                State::Inactive | State::Full => {
                    self.install_registry(current)?;
                    continue;
                }
                State::Empty | State::Partial => {}
            }

            let mut next = current;
            next.next_slot += 1;
            next.state = if next.next_slot as usize == slot_capacity() {
                State::Full
            } else {
                State::Partial
            };

            if self
                .registry
                .compare_exchange_weak(
                    current.pack(),
                    next.pack(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // The successful exchange reserved slot `current.next_slot`
                // exclusively for us; publish the span into it. The release
                // store pairs with the acquire loads of the release search.
                let cell =
                    unsafe { slot_cell(current.self_address, current.next_slot as usize) };
                cell.store(span.pack(), Ordering::Release);
                return Ok(());
            }
        }
    }

    /// Try to install a fresh registry in place of `current`
    ///
    /// Failing the install CAS is not an error: it means another thread
    /// installed a registry first, and the caller's retry loop will observe
    /// the winner.
    fn install_registry(&self, current: RegistryHeader) -> Result<()> {
        let base = platform::fetch_pages(REGISTRY_PAGES as u16)?;

        if current.state == State::Full {
            // Publish the final header of the registry we are superseding
            // into its own first slots, before the CAS makes it reachable
            // through a `next_registry` pointer. Concurrent installers all
            // write the same Full header value, so this race is benign.
            let cell = unsafe { header_cell(current.self_address) };
            cell.store(current.pack(), Ordering::Release);
        }

        let next = RegistryHeader {
            self_address: base.as_ptr() as usize,
            next_slot: HEADER_SLOTS as u16,
            next_registry: if current.state == State::Inactive {
                0
            } else {
                current.self_address
            },
            state: State::Empty,
        };

        if self
            .registry
            .compare_exchange(
                current.pack(),
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Some other thread won the install race; our candidate pages
            // were never published, so hand them straight back.
            unsafe { platform::return_pages(base, REGISTRY_PAGES as u16)? };
        }

        Ok(())
    }
}

impl Provider for PageAllocator {
    fn provide(&self, size: usize) -> Result<NonNull<u8>> {
        let count = size.div_ceil(platform::page_size());
        self.allocate(count)
    }

    unsafe fn reclaim(&self, base: NonNull<u8>) -> Result<()> {
        unsafe { self.release(base.as_ptr()) }
    }
}

impl Drop for PageAllocator {
    fn drop(&mut self) {
        let mut header = RegistryHeader::unpack(self.registry.load(Ordering::Acquire));
        if header.state == State::Inactive {
            return;
        }

        loop {
            let next = header.next_registry;

            // The in-band metadata of `next` lives in its own pages, which
            // are untouched by unmapping the current registry.
            let base = header.self_address as *mut u8;
            if let Some(base) = NonNull::new(base) {
                if unsafe { platform::return_pages(base, REGISTRY_PAGES as u16) }.is_err() {
                    log::warn!("leaking registry pages at {base:p}");
                }
            }

            if next == 0 {
                return;
            }
            header = RegistryHeader::unpack(unsafe { header_cell(next) }.load(Ordering::Acquire));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_release_round_trips() {
        let allocator = PageAllocator::new();

        let p = allocator.allocate(1).unwrap();
        assert_eq!(p.as_ptr() as usize % allocator.block_size(), 0);

        // The span must be usable memory.
        unsafe {
            p.as_ptr().write(42);
            assert_eq!(p.as_ptr().read(), 42);
            allocator.release(p.as_ptr()).unwrap();
        }
    }

    #[test]
    fn double_release_is_rejected() {
        let allocator = PageAllocator::new();
        let p = allocator.allocate(1).unwrap();

        unsafe {
            allocator.release(p.as_ptr()).unwrap();
            assert_eq!(allocator.release(p.as_ptr()), Err(Error::InvalidInput));
        }
    }

    #[test]
    fn out_of_range_counts_are_rejected() {
        let allocator = PageAllocator::new();
        assert_eq!(allocator.allocate(0), Err(Error::InvalidInput));
        assert_eq!(allocator.allocate(1 << 16), Err(Error::InvalidInput));
    }

    #[test]
    fn multi_page_spans_are_released_in_full() {
        let allocator = PageAllocator::new();
        let pages = 7;
        let p = allocator.allocate(pages).unwrap();

        // Touch the first and last page of the span.
        unsafe {
            p.as_ptr().write(1);
            p.as_ptr()
                .add(pages * allocator.block_size() - 1)
                .write(2);
            allocator.release(p.as_ptr()).unwrap();
        }
    }

    #[test]
    fn null_and_unknown_pointers_are_rejected() {
        let allocator = PageAllocator::new();
        assert_eq!(
            unsafe { allocator.release(std::ptr::null_mut()) },
            Err(Error::InvalidInput)
        );

        let p = allocator.allocate(2).unwrap();
        // An address inside the span is not the span's base.
        let inner = unsafe { p.as_ptr().add(allocator.block_size()) };
        assert_eq!(
            unsafe { allocator.release(inner) },
            Err(Error::InvalidInput)
        );
        unsafe { allocator.release(p.as_ptr()).unwrap() };
    }

    #[test]
    fn release_on_an_empty_allocator_is_rejected() {
        let allocator = PageAllocator::new();
        let bogus = 0x1000 as *mut u8;
        assert_eq!(unsafe { allocator.release(bogus) }, Err(Error::InvalidInput));
    }

    #[test]
    fn registry_growth_chains_and_stays_searchable() {
        let allocator = PageAllocator::new();

        // Overflow the first registry so a second one gets chained in, then
        // make sure spans recorded in the full, superseded registry can
        // still be found by the release search.
        let spans_per_registry = slot_capacity() - HEADER_SLOTS;
        let total = spans_per_registry + spans_per_registry / 2;

        let mut pointers = Vec::with_capacity(total);
        for _ in 0..total {
            pointers.push(allocator.allocate(1).unwrap());
        }

        // Release in allocation order: the early spans live at the far end
        // of the registry chain.
        for p in &pointers {
            unsafe { allocator.release(p.as_ptr()).unwrap() };
        }

        // Every slot is now a tombstone.
        for p in &pointers {
            assert_eq!(
                unsafe { allocator.release(p.as_ptr()) },
                Err(Error::InvalidInput)
            );
        }
    }

    #[test]
    fn provider_rounds_byte_sizes_up_to_pages() {
        let allocator = PageAllocator::new();

        let p = allocator.provide(10).unwrap();
        unsafe { allocator.reclaim(p).unwrap() };

        let size = 3 * allocator.block_size() + 1;
        let p = allocator.provide(size).unwrap();
        unsafe {
            // The fourth page must be part of the mapping.
            p.as_ptr().add(size - 1).write(9);
            allocator.reclaim(p).unwrap();
        }
    }

    #[test]
    fn provider_rejects_empty_requests() {
        let allocator = PageAllocator::new();
        assert_eq!(allocator.provide(0), Err(Error::InvalidInput));
    }
}
