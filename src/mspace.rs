//! Segregated free-list allocator instance backing an alloc space.
//!
//! The space owns the address range and decides how much of it may be
//! committed; the mspace only carves chunks out of whatever the morecore
//! callback grants. All calls must be serialized by the owning space's
//! lock - the mspace itself carries no synchronization.
//!
//! Chunk layout: one header word (`size | IN_USE`) directly before the
//! payload, sizes multiples of the object alignment. Free chunks keep an
//! intrusive next pointer in their first payload word and live in exact-size
//! small bins or log-spaced large bins. The tail of the committed region
//! ("top") is untagged and grows or shrinks only through morecore.

use crate::utils::*;

const WORD: usize = core::mem::size_of::<usize>();

/// Boundary-tag overhead of every allocation.
pub const CHUNK_OVERHEAD: usize = WORD;

/// Smallest chunk we ever carve: header + free-list link, rounded so every
/// chunk size is a multiple of the payload alignment.
pub const MIN_CHUNK_SIZE: usize = 4 * WORD;

const CHUNK_ALIGN: usize = crate::OBJECT_ALIGNMENT;
const IN_USE: usize = 0x1;
const FLAG_MASK: usize = CHUNK_ALIGN - 1;

const NUM_SMALL_BINS: usize = 64;
const NUM_LARGE_BINS: usize = 16;
const NUM_BINS: usize = NUM_SMALL_BINS + NUM_LARGE_BINS;
const SMALL_BIN_LIMIT: usize = NUM_SMALL_BINS * CHUNK_ALIGN;

/// Preferred growth step when the top region runs dry.
const GROWTH_GRANULARITY: usize = 64 * 1024;

/// Grants (`delta > 0`) or returns (`delta < 0`) committed address space at
/// the end of the region; yields the previous committed end, or `None` when
/// the request cannot be honored.
pub type MoreCore<'a> = &'a mut dyn FnMut(isize) -> Option<Address>;

pub struct Mspace {
    base: Address,
    // start of the untagged top region; chunks occupy [base, top)
    top: Address,
    // committed bytes: [base, base + footprint)
    footprint: usize,
    // ceiling morecore requests must stay under
    footprint_limit: usize,
    // free-list heads, indexed by size class
    bins: [Address; NUM_BINS],
}

#[inline]
fn bin_index(size: usize) -> usize {
    debug_assert!(size >= MIN_CHUNK_SIZE && size % CHUNK_ALIGN == 0);
    if size < SMALL_BIN_LIMIT {
        size / CHUNK_ALIGN
    } else {
        let log = (usize::BITS - 1 - size.leading_zeros()) as usize;
        NUM_SMALL_BINS + (log - SMALL_BIN_LIMIT.trailing_zeros() as usize).min(NUM_LARGE_BINS - 1)
    }
}

impl Mspace {
    /// Start managing chunks at `base` with `starting_size` bytes already
    /// committed by the owner. `base` must stay valid and committed for the
    /// lifetime of the mspace.
    pub fn create(base: Address, starting_size: usize) -> Mspace {
        debug_assert!(base.is_aligned(CHUNK_ALIGN));
        Mspace {
            base,
            top: base,
            footprint: starting_size,
            footprint_limit: starting_size,
            bins: [Address::null(); NUM_BINS],
        }
    }

    #[inline]
    fn commit_end(&self) -> Address {
        self.base.offset(self.footprint)
    }

    pub fn footprint(&self) -> usize {
        self.footprint
    }

    pub fn footprint_limit(&self) -> usize {
        self.footprint_limit
    }

    pub fn set_footprint_limit(&mut self, limit: usize) {
        self.footprint_limit = limit;
    }

    #[inline]
    unsafe fn header(chunk: Address) -> usize {
        chunk.to_ptr::<usize>().read()
    }

    #[inline]
    unsafe fn set_header(chunk: Address, value: usize) {
        chunk.to_mut_ptr::<usize>().write(value)
    }

    #[inline]
    unsafe fn next_free(chunk: Address) -> Address {
        Address::from(chunk.offset(WORD).to_ptr::<usize>().read())
    }

    #[inline]
    unsafe fn set_next_free(chunk: Address, next: Address) {
        chunk.offset(WORD).to_mut_ptr::<usize>().write(next.to_usize())
    }

    #[inline]
    fn size_of_header(header: usize) -> usize {
        header & !FLAG_MASK
    }

    #[inline]
    fn chunk_size_for(bytes: usize) -> usize {
        round_up(bytes + CHUNK_OVERHEAD, CHUNK_ALIGN).max(MIN_CHUNK_SIZE)
    }

    /// Allocate `bytes`, asking `morecore` for more committed space if the
    /// bins and the top region cannot satisfy the request under the current
    /// footprint limit. Returns null on failure, never panics.
    pub fn malloc(&mut self, bytes: usize, morecore: MoreCore<'_>) -> Address {
        let size = Self::chunk_size_for(bytes);

        if let Some(chunk) = self.take_from_bins(size) {
            return self.place(chunk, size);
        }

        let available = self.commit_end().offset_from(self.top);
        if available < size {
            let need = size - available;
            let page = os::page_size();
            let mut delta = round_up(need.max(GROWTH_GRANULARITY), page);
            if self.footprint + delta > self.footprint_limit {
                delta = round_up(need, page);
                if self.footprint + delta > self.footprint_limit {
                    return Address::null();
                }
            }
            if morecore(delta as isize).is_none() {
                return Address::null();
            }
            self.footprint += delta;
        }

        let chunk = self.top;
        self.top = self.top.offset(size);
        unsafe {
            Self::set_header(chunk, size | IN_USE);
        }
        chunk.offset(CHUNK_OVERHEAD)
    }

    /// Unlink the first free chunk that can hold `size` bytes, searching the
    /// matching size class first. Small bins hold a single exact size, so
    /// only large bins ever scan.
    fn take_from_bins(&mut self, size: usize) -> Option<Address> {
        for bin in bin_index(size)..NUM_BINS {
            let mut prev = Address::null();
            let mut cur = self.bins[bin];
            while cur.is_non_null() {
                let cur_size = unsafe { Self::size_of_header(Self::header(cur)) };
                if cur_size >= size {
                    unsafe {
                        let next = Self::next_free(cur);
                        if prev.is_null() {
                            self.bins[bin] = next;
                        } else {
                            Self::set_next_free(prev, next);
                        }
                    }
                    return Some(cur);
                }
                prev = cur;
                cur = unsafe { Self::next_free(cur) };
            }
        }
        None
    }

    /// Mark `chunk` in use for `size` bytes, splitting off any tail big
    /// enough to stand on its own.
    fn place(&mut self, chunk: Address, size: usize) -> Address {
        let chunk_size = unsafe { Self::size_of_header(Self::header(chunk)) };
        debug_assert!(chunk_size >= size);
        let remainder = chunk_size - size;
        if remainder >= MIN_CHUNK_SIZE {
            let tail = chunk.offset(size);
            unsafe {
                Self::set_header(tail, remainder);
                Self::set_header(chunk, size | IN_USE);
            }
            self.push_bin(tail, remainder);
        } else {
            unsafe {
                Self::set_header(chunk, chunk_size | IN_USE);
            }
        }
        chunk.offset(CHUNK_OVERHEAD)
    }

    fn push_bin(&mut self, chunk: Address, size: usize) {
        let bin = bin_index(size);
        unsafe {
            Self::set_next_free(chunk, self.bins[bin]);
        }
        self.bins[bin] = chunk;
    }

    /// Allocator bookkeeping size of a live allocation, without the header.
    pub fn usable_size(&self, ptr: Address) -> usize {
        debug_assert!(ptr > self.base && ptr < self.top);
        let header = unsafe { Self::header(ptr.sub(CHUNK_OVERHEAD)) };
        debug_assert!(header & IN_USE != 0, "usable_size of a free chunk");
        Self::size_of_header(header) - CHUNK_OVERHEAD
    }

    pub fn free(&mut self, ptr: Address) {
        if ptr.is_null() {
            return;
        }
        let chunk = ptr.sub(CHUNK_OVERHEAD);
        let header = unsafe { Self::header(chunk) };
        debug_assert!(header & IN_USE != 0, "double free of {}", ptr);
        let size = Self::size_of_header(header);
        if chunk.offset(size) == self.top {
            // rejoin the top region so the space can be trimmed
            self.top = chunk;
            return;
        }
        unsafe {
            Self::set_header(chunk, size);
        }
        self.push_bin(chunk, size);
    }

    /// Free a whole batch. Exists so the owner pays for its lock once.
    pub fn bulk_free(&mut self, ptrs: &[Address]) {
        for &ptr in ptrs {
            self.free(ptr);
        }
    }

    /// Return whole unused pages from the top region through `morecore`.
    /// Keeps `pad` bytes of slack and at least one committed page. Returns
    /// the number of bytes released.
    pub fn trim(&mut self, pad: usize, morecore: MoreCore<'_>) -> usize {
        let available = self.commit_end().offset_from(self.top);
        if available <= pad {
            return 0;
        }
        let page = os::page_size();
        let excess = round_down(available - pad, page).min(self.footprint.saturating_sub(page));
        if excess == 0 {
            return 0;
        }
        if morecore(-(excess as isize)).is_none() {
            return 0;
        }
        self.footprint -= excess;
        if self.footprint_limit > self.footprint {
            self.footprint_limit = self.footprint;
        }
        log::debug!("trimmed {} from mspace top", formatted_size(excess));
        excess
    }

    /// Visit every chunk in address order: `callback(start, end, used)`
    /// with `used == 0` for free chunks and for the trailing top region.
    pub fn inspect_all(&self, callback: &mut dyn FnMut(Address, Address, usize)) {
        let mut chunk = self.base;
        while chunk < self.top {
            let header = unsafe { Self::header(chunk) };
            let size = Self::size_of_header(header);
            assert!(
                size >= MIN_CHUNK_SIZE && size % CHUNK_ALIGN == 0,
                "corrupt chunk header at {}",
                chunk
            );
            let used = if header & IN_USE != 0 { size } else { 0 };
            callback(chunk, chunk.offset(size), used);
            chunk = chunk.offset(size);
        }
        let commit_end = self.commit_end();
        if self.top < commit_end {
            callback(self.top, commit_end, 0);
        }
    }
}
