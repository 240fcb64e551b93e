//! One-bit-per-object-word liveness index over a space's address range.
//!
//! A set bit at address `a` means `a` is (or was, at the last mark) the
//! start of a live object header. Alloc spaces own two instances, "live"
//! and "mark", exchanged wholesale by pointer swap between GC phases.
//!
//! Bit reads and writes are individually atomic (relaxed), but concurrent
//! reader/writer coherence across a whole mark or sweep is the collector's
//! pause discipline, not something this type locks for.

use crate::mem_map::{MemMap, PROT_READ, PROT_WRITE};
use crate::utils::*;
use crate::OBJECT_ALIGNMENT;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const BITS_PER_WORD: usize = core::mem::size_of::<usize>() * 8;

pub struct SpaceBitmap {
    name: String,
    // backing storage for the bit words
    mem_map: MemMap,
    word_count: usize,
    heap_begin: Address,
    // exclusive upper bound of the covered range; shrunk once at zygote
    // split time, hence atomic rather than plain
    heap_limit: AtomicUsize,
}

impl SpaceBitmap {
    #[inline]
    fn offset_to_index(offset: usize) -> usize {
        offset / OBJECT_ALIGNMENT / BITS_PER_WORD
    }

    #[inline]
    fn index_to_offset(index: usize) -> usize {
        index * OBJECT_ALIGNMENT * BITS_PER_WORD
    }

    #[inline]
    fn offset_bit_index(offset: usize) -> usize {
        (offset / OBJECT_ALIGNMENT) % BITS_PER_WORD
    }

    #[inline]
    fn offset_to_mask(offset: usize) -> usize {
        1 << Self::offset_bit_index(offset)
    }

    /// Bytes of bit storage needed to cover `capacity` heap bytes.
    pub fn compute_size(capacity: usize) -> usize {
        let bytes_per_word = OBJECT_ALIGNMENT * BITS_PER_WORD;
        (round_up(capacity, bytes_per_word) / bytes_per_word) * core::mem::size_of::<usize>()
    }

    pub fn new(name: &str, heap_begin: Address, heap_capacity: usize) -> io::Result<SpaceBitmap> {
        let storage_size = Self::compute_size(heap_capacity);
        let mem_map = MemMap::map_anonymous(name, Address::null(), storage_size, PROT_READ | PROT_WRITE)?;
        Ok(SpaceBitmap {
            name: name.to_owned(),
            mem_map,
            word_count: storage_size / core::mem::size_of::<usize>(),
            heap_begin,
            heap_limit: AtomicUsize::new(heap_begin.to_usize() + heap_capacity),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn heap_begin(&self) -> Address {
        self.heap_begin
    }

    pub fn heap_limit(&self) -> Address {
        Address::from(self.heap_limit.load(Ordering::Relaxed))
    }

    /// Shrink (or grow, within storage) the covered range. Used when a heap
    /// is frozen at zygote split time and its bitmap must stop covering the
    /// tail handed to the sibling space.
    pub fn set_heap_limit(&self, limit: Address) {
        debug_assert!(limit >= self.heap_begin);
        debug_assert!(Self::offset_to_index(limit.offset_from(self.heap_begin)) <= self.word_count);
        self.heap_limit.store(limit.to_usize(), Ordering::Relaxed);
    }

    pub fn has_address(&self, addr: Address) -> bool {
        self.heap_begin <= addr && addr < self.heap_limit()
    }

    #[inline]
    fn word(&self, index: usize) -> &AtomicUsize {
        debug_assert!(index < self.word_count);
        unsafe { &*self.mem_map.begin().to_ptr::<AtomicUsize>().add(index) }
    }

    #[inline]
    fn modify(&self, addr: Address, set_bit: bool) -> bool {
        debug_assert!(addr >= self.heap_begin, "address {} below bitmap base", addr);
        debug_assert!(addr.is_aligned(OBJECT_ALIGNMENT));
        let offset = addr.offset_from(self.heap_begin);
        let index = Self::offset_to_index(offset);
        let mask = Self::offset_to_mask(offset);
        assert!(
            index < self.word_count,
            "address {} out of bounds of bitmap '{}'",
            addr,
            self.name
        );
        let old_word = if set_bit {
            self.word(index).fetch_or(mask, Ordering::Relaxed)
        } else {
            self.word(index).fetch_and(!mask, Ordering::Relaxed)
        };
        (old_word & mask) != 0
    }

    /// Set the bit for `addr`; returns whether it was already set.
    #[inline]
    pub fn set(&self, addr: Address) -> bool {
        self.modify(addr, true)
    }

    /// Clear the bit for `addr`; returns whether it was set.
    #[inline]
    pub fn clear(&self, addr: Address) -> bool {
        if addr.is_null() {
            return false;
        }
        self.modify(addr, false)
    }

    #[inline]
    pub fn test(&self, addr: Address) -> bool {
        if addr.is_null() {
            return false;
        }
        let offset = addr.offset_from(self.heap_begin);
        let index = Self::offset_to_index(offset);
        if index >= self.word_count {
            return false;
        }
        (self.word(index).load(Ordering::Relaxed) & Self::offset_to_mask(offset)) != 0
    }

    /// Zero every bit and hand the storage pages back to the OS.
    pub fn clear_all(&self) {
        for i in 0..self.word_count {
            self.word(i).store(0, Ordering::Relaxed);
        }
        self.mem_map.madvise_dontneed(self.mem_map.begin(), self.mem_map.size());
    }

    /// Invoke `visitor` for every set bit in `[visit_begin, visit_end)`,
    /// in ascending address order, skipping over zero words.
    pub fn visit_marked_range(
        &self,
        visit_begin: Address,
        visit_end: Address,
        mut visitor: impl FnMut(Address),
    ) {
        if visit_end <= visit_begin {
            return;
        }
        debug_assert!(visit_begin >= self.heap_begin);
        let offset_start = visit_begin.offset_from(self.heap_begin);
        // inclusive offset of the last candidate bit
        let offset_last = visit_end.offset_from(self.heap_begin) - 1;
        let index_start = Self::offset_to_index(offset_start);
        let index_last = Self::offset_to_index(offset_last);

        for index in index_start..=index_last.min(self.word_count.saturating_sub(1)) {
            let mut word = self.word(index).load(Ordering::Relaxed);
            if word == 0 {
                continue;
            }
            if index == index_start {
                word &= !((1usize << Self::offset_bit_index(offset_start)) - 1);
            }
            if index == index_last {
                let last_bit = Self::offset_bit_index(offset_last);
                if last_bit + 1 < BITS_PER_WORD {
                    word &= (1usize << (last_bit + 1)) - 1;
                }
            }
            let base = self.heap_begin.offset(Self::index_to_offset(index));
            while word != 0 {
                let shift = word.trailing_zeros() as usize;
                visitor(base.offset(shift * OBJECT_ALIGNMENT));
                word &= word - 1;
            }
        }
    }

    /// Walk `[sweep_begin, sweep_end)` and report, in address-ordered
    /// batches, every address set in `live` but not in `mark` - the garbage
    /// the collector must free after a mark phase. Both bitmaps must share
    /// a heap base.
    pub fn sweep_walk(
        live: &SpaceBitmap,
        mark: &SpaceBitmap,
        sweep_begin: Address,
        sweep_end: Address,
        callback: &mut dyn FnMut(&[Address]),
    ) {
        assert_eq!(live.heap_begin, mark.heap_begin);
        if sweep_end <= sweep_begin {
            return;
        }
        const BUFFER_CAP: usize = 256;
        let start = Self::offset_to_index(sweep_begin.offset_from(live.heap_begin));
        let end = Self::offset_to_index(sweep_end.offset_from(live.heap_begin) - 1);
        let mut buffer: Vec<Address> = Vec::with_capacity(BUFFER_CAP);

        for index in start..=end.min(live.word_count.saturating_sub(1)) {
            let mut garbage = live.word(index).load(Ordering::Relaxed)
                & !mark.word(index).load(Ordering::Relaxed);
            if garbage == 0 {
                continue;
            }
            let base = live.heap_begin.offset(Self::index_to_offset(index));
            while garbage != 0 {
                let shift = garbage.trailing_zeros() as usize;
                buffer.push(base.offset(shift * OBJECT_ALIGNMENT));
                garbage &= garbage - 1;
            }
            if buffer.len() >= BUFFER_CAP {
                callback(&buffer);
                buffer.clear();
            }
        }
        if !buffer.is_empty() {
            callback(&buffer);
        }
    }
}
