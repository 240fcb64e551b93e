//! The growable allocation space: the working heap of the runtime.
//!
//! Allocation, free, growth and trim all serialize on one exclusive lock
//! per space. Bitmap handles are exchanged by pointer swap and their bit
//! content is only coherent under the collector's stop-the-world pause;
//! this type never locks for bitmap access.

use crate::accounting::space_bitmap::SpaceBitmap;
use crate::mem_map::{MemMap, PROT_NONE, PROT_READ, PROT_WRITE};
use crate::mspace::{Mspace, CHUNK_OVERHEAD};
use crate::spaces::{GcRetentionPolicy, Space, SpaceError};
use crate::utils::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Ergonomic ceiling on the usable capacity. Starts bounded below the
/// reservation (the zygote keeps the apparent heap small) and can be lifted
/// exactly once; the transition is one-way by construction.
enum GrowthLimit {
    Bounded(usize),
    Unbounded,
}

impl GrowthLimit {
    fn value(&self, full_capacity: usize) -> usize {
        match self {
            GrowthLimit::Bounded(limit) => *limit,
            GrowthLimit::Unbounded => full_capacity,
        }
    }
}

/// State only ever touched under the space lock.
struct AllocInner {
    mspace: Mspace,
    growth_limit: GrowthLimit,
}

struct BitmapPair {
    live: Arc<SpaceBitmap>,
    mark: Arc<SpaceBitmap>,
}

pub struct AllocSpace {
    name: String,
    mem_map: MemMap,
    begin: Address,
    // current end of the committed region; moved only by more_core
    end: AtomicUsize,
    // end of the physical reservation; shrinks once at zygote split time
    limit: AtomicUsize,
    policy: AtomicU8,
    inner: Mutex<AllocInner>,
    bitmaps: Mutex<BitmapPair>,
}

impl AllocSpace {
    /// Reserve `capacity` bytes at (ideally) `requested_begin` and set up an
    /// mspace over the range, with `initial_size` as the first footprint
    /// ceiling and `growth_limit` as the ergonomic capacity. The requested
    /// base is a hint; callers needing the real address must re-query
    /// `begin()`.
    pub fn create(
        name: &str,
        initial_size: usize,
        growth_limit: usize,
        capacity: usize,
        requested_begin: Address,
    ) -> Result<AllocSpace, SpaceError> {
        let starting_size = os::page_size();
        let initial_size = initial_size.max(starting_size);
        if initial_size > growth_limit || growth_limit > capacity {
            return Err(SpaceError::InvalidSizes {
                initial_size,
                growth_limit,
                capacity,
            });
        }
        let growth_limit = round_up(growth_limit, os::page_size());
        let capacity = round_up(capacity, os::page_size());

        let mem_map =
            MemMap::map_anonymous(name, requested_begin, capacity, PROT_READ | PROT_WRITE)
                .map_err(SpaceError::Reservation)?;
        let space = Self::from_mem_map(
            name.to_owned(),
            mem_map,
            starting_size,
            initial_size,
            growth_limit,
        )?;
        log::info!(
            "created alloc space '{}' at {} ({} reserved, growth limit {})",
            name,
            space.begin,
            formatted_size(capacity),
            formatted_size(growth_limit)
        );
        Ok(space)
    }

    fn from_mem_map(
        name: String,
        mem_map: MemMap,
        starting_size: usize,
        initial_size: usize,
        growth_limit: usize,
    ) -> Result<AllocSpace, SpaceError> {
        let begin = mem_map.begin();
        let capacity = mem_map.size();
        let live = SpaceBitmap::new(&format!("{} live-bitmap", name), begin, capacity)
            .map_err(SpaceError::Reservation)?;
        let mark = SpaceBitmap::new(&format!("{} mark-bitmap", name), begin, capacity)
            .map_err(SpaceError::Reservation)?;

        let mut mspace = Mspace::create(begin, starting_size);
        mspace.set_footprint_limit(initial_size);
        log::debug!(
            "initialized mspace for '{}' with {} committed",
            name,
            formatted_size(starting_size)
        );

        Ok(AllocSpace {
            name,
            begin,
            end: AtomicUsize::new(begin.to_usize() + starting_size),
            limit: AtomicUsize::new(begin.to_usize() + capacity),
            policy: AtomicU8::new(GcRetentionPolicy::AlwaysCollect as u8),
            inner: Mutex::new(AllocInner {
                mspace,
                growth_limit: GrowthLimit::Bounded(growth_limit),
            }),
            bitmaps: Mutex::new(BitmapPair {
                live: Arc::new(live),
                mark: Arc::new(mark),
            }),
            mem_map,
        })
    }

    fn reservation_end(&self) -> Address {
        Address::from(self.limit.load(Ordering::Relaxed))
    }

    /// Allocate `num_bytes`, letting the mspace commit more of the
    /// reservation up to the growth limit. Null on failure; the caller is
    /// expected to collect and retry, never to abort.
    pub fn alloc_with_growth(&self, num_bytes: usize) -> Address {
        if self.is_zygote_space() {
            // frozen at split time; only its sibling serves allocation
            return Address::null();
        }
        let result;
        {
            let mut inner = self.inner.lock();
            let max_allowed = inner.growth_limit.value(self.non_growth_limit_capacity());
            inner.mspace.set_footprint_limit(max_allowed);
            result = inner
                .mspace
                .malloc(num_bytes, &mut |delta| self.more_core(delta));
            // pin the limit back down so growth stays an explicit decision
            let footprint = inner.mspace.footprint();
            inner.mspace.set_footprint_limit(footprint);
        }
        if result.is_non_null() {
            unsafe {
                core::ptr::write_bytes(result.to_mut_ptr::<u8>(), 0, num_bytes);
            }
        }
        result
    }

    /// Allocate without raising the footprint ceiling; the mspace may only
    /// use what is already within the limit in effect.
    pub fn alloc_without_growth(&self, num_bytes: usize) -> Address {
        if self.is_zygote_space() {
            return Address::null();
        }
        let result = {
            let mut inner = self.inner.lock();
            inner
                .mspace
                .malloc(num_bytes, &mut |delta| self.more_core(delta))
        };
        if result.is_non_null() {
            unsafe {
                core::ptr::write_bytes(result.to_mut_ptr::<u8>(), 0, num_bytes);
            }
        }
        result
    }

    /// The allocator's bookkeeping size for a live allocation, chunk
    /// overhead included. Used by the collector for freed-byte accounting.
    pub fn allocation_size(&self, ptr: Address) -> usize {
        let inner = self.inner.lock();
        inner.mspace.usable_size(ptr) + CHUNK_OVERHEAD
    }

    /// Release one allocation; returns the bytes handed back.
    pub fn free(&self, ptr: Address) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let mut inner = self.inner.lock();
        let freed = inner.mspace.usable_size(ptr) + CHUNK_OVERHEAD;
        inner.mspace.free(ptr);
        freed
    }

    /// Release a batch under a single critical section; materially cheaper
    /// than per-object locking when sweeping.
    pub fn free_list(&self, ptrs: &[Address]) -> usize {
        let mut inner = self.inner.lock();
        let mut freed = 0;
        for &ptr in ptrs {
            if ptr.is_non_null() {
                freed += inner.mspace.usable_size(ptr) + CHUNK_OVERHEAD;
            }
        }
        inner.mspace.bulk_free(ptrs);
        freed
    }

    /// Growth callback: the sole channel through which `end` moves. Commits
    /// (`increment > 0`) or decommits pages at the current end, sbrk-style,
    /// returning the previous end. The footprint-limit protocol keeps
    /// requests within bounds, so overrunning the reservation is a
    /// bookkeeping bug and trips the assertion; release builds get the
    /// `None` sentinel.
    pub(crate) fn more_core(&self, increment: isize) -> Option<Address> {
        let orig_end = self.end();
        if increment > 0 {
            let increment = increment as usize;
            let new_end = orig_end.offset(increment);
            if new_end > self.reservation_end() {
                debug_assert!(
                    false,
                    "morecore past the reservation of '{}': {} > {}",
                    self.name,
                    new_end,
                    self.reservation_end()
                );
                return None;
            }
            log::debug!("MoreCore {} for '{}'", formatted_size(increment), self.name);
            self.mem_map.protect(orig_end, increment, PROT_READ | PROT_WRITE);
            self.end.store(new_end.to_usize(), Ordering::Relaxed);
        } else if increment < 0 {
            let decrement = increment.unsigned_abs();
            debug_assert!(decrement <= orig_end.offset_from(self.begin));
            let new_end = orig_end.sub(decrement);
            log::debug!("LessCore {} for '{}'", formatted_size(decrement), self.name);
            self.mem_map.madvise_dontneed(new_end, decrement);
            self.mem_map.protect(new_end, decrement, PROT_NONE);
            self.end.store(new_end.to_usize(), Ordering::Relaxed);
        }
        Some(orig_end)
    }

    /// Ceiling currently offered to the allocator's own footprint tracking.
    pub fn footprint_limit(&self) -> usize {
        self.inner.lock().mspace.footprint_limit()
    }

    /// Adjust the allocator-visible ceiling. The heap controller raises this
    /// after a failed allocation + collection cycle; it is clamped to the
    /// growth limit and never below what is already committed.
    pub fn set_footprint_limit(&self, limit: usize) {
        let mut inner = self.inner.lock();
        let growth_limit = inner.growth_limit.value(self.non_growth_limit_capacity());
        let mut limit = limit;
        if limit > growth_limit {
            log::warn!(
                "footprint limit {} of '{}' clamped to growth limit {}",
                limit,
                self.name,
                growth_limit
            );
            limit = growth_limit;
        }
        let limit = limit.max(inner.mspace.footprint());
        inner.mspace.set_footprint_limit(limit);
    }

    /// Lift the fork-time growth limit, letting the space use the whole
    /// reservation. One-way; calling it again is a no-op.
    pub fn clear_growth_limit(&self) {
        self.inner.lock().growth_limit = GrowthLimit::Unbounded;
    }

    /// Hand unused whole pages back to the OS: the top of the committed
    /// region retreats through the growth callback and free-chunk interiors
    /// are madvised away. Advisory; returns the bytes released.
    pub fn trim(&self) -> usize {
        let mut inner = self.inner.lock();
        let AllocInner { mspace, .. } = &mut *inner;
        let mut reclaimed = mspace.trim(0, &mut |delta| self.more_core(delta));

        let map = &self.mem_map;
        mspace.inspect_all(&mut |start, end, used| {
            if used != 0 {
                return;
            }
            // the first words of a free chunk hold its header and link
            let start = start.offset(2 * CHUNK_OVERHEAD).align_page();
            let end = end.align_page_down();
            if end > start {
                let length = end.offset_from(start);
                map.madvise_dontneed(start, length);
                reclaimed += length;
            }
        });
        reclaimed
    }

    /// Visit every allocator chunk, used or free, in address order.
    pub fn walk(&self, callback: &mut dyn FnMut(Address, Address, usize)) {
        let inner = self.inner.lock();
        inner.mspace.inspect_all(callback);
    }

    /// Exchange the live and mark bitmap roles. O(1) pointer swap, no bit is
    /// touched. The collector must hold its global pause across this call.
    pub fn swap_bitmaps(&self) {
        let bitmaps = &mut *self.bitmaps.lock();
        std::mem::swap(&mut bitmaps.live, &mut bitmaps.mark);
    }

    /// Split this space at its current end for a zygote fork. `self` keeps
    /// the used prefix, becomes full-collect-only and stops serving
    /// allocation; the returned sibling owns the unused tail of the
    /// reservation with fresh bitmaps and an always-collect policy.
    ///
    /// The caller must hold whatever global pause keeps mutators out;
    /// `&mut self` demands exclusivity at compile time and the lock probe
    /// catches a racing allocator in foreign-thread scenarios.
    pub fn create_zygote_space(&mut self) -> Result<AllocSpace, SpaceError> {
        assert!(
            self.inner.try_lock().is_some(),
            "allocation in flight during zygote split of '{}'",
            self.name
        );
        let end = self.end();
        assert!(end.is_page_aligned());
        let size = end.offset_from(self.begin);
        let full_capacity = self.mem_map.size();
        let starting_size = os::page_size();
        assert!(
            full_capacity - size >= starting_size,
            "no unused reservation left in '{}' to hand to a sibling",
            self.name
        );

        let sibling_growth = {
            let mut inner = self.inner.lock();
            let old_growth = inner.growth_limit.value(full_capacity);
            debug_assert!(old_growth >= size);
            // freeze the prefix: growth pinned at its current end
            inner.growth_limit = GrowthLimit::Bounded(size);
            let footprint = inner.mspace.footprint();
            inner.mspace.set_footprint_limit(footprint);
            old_growth - size
        };

        let tail_name = format!("{} post-zygote", self.name);
        let tail_map = self.mem_map.split_at(size, &tail_name);
        self.limit.store(end.to_usize(), Ordering::Relaxed);
        self.set_gc_retention_policy(GcRetentionPolicy::FullCollect);

        {
            let bitmaps = self.bitmaps.lock();
            bitmaps.live.set_heap_limit(end);
            bitmaps.mark.set_heap_limit(end);
        }

        log::info!(
            "zygote split of '{}' at {}: {} retained, {} handed to sibling",
            self.name,
            end,
            formatted_size(size),
            formatted_size(tail_map.size())
        );

        let tail_capacity = tail_map.size();
        let sibling_growth = sibling_growth.clamp(starting_size, tail_capacity);
        Self::from_mem_map(
            tail_name,
            tail_map,
            starting_size,
            starting_size,
            sibling_growth,
        )
    }
}

impl Space for AllocSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin(&self) -> Address {
        self.begin
    }

    fn end(&self) -> Address {
        Address::from(self.end.load(Ordering::Relaxed))
    }

    fn capacity(&self) -> usize {
        let inner = self.inner.lock();
        inner.growth_limit.value(self.non_growth_limit_capacity())
    }

    fn non_growth_limit_capacity(&self) -> usize {
        self.mem_map.size()
    }

    fn gc_retention_policy(&self) -> GcRetentionPolicy {
        GcRetentionPolicy::from_raw(self.policy.load(Ordering::Relaxed))
    }

    fn set_gc_retention_policy(&self, policy: GcRetentionPolicy) {
        self.policy.store(policy as u8, Ordering::Relaxed);
    }

    fn is_alloc_space(&self) -> bool {
        self.gc_retention_policy() != GcRetentionPolicy::NeverCollect
    }

    fn is_image_space(&self) -> bool {
        false
    }

    fn is_zygote_space(&self) -> bool {
        self.gc_retention_policy() == GcRetentionPolicy::FullCollect
    }

    fn live_bitmap(&self) -> Arc<SpaceBitmap> {
        self.bitmaps.lock().live.clone()
    }

    fn mark_bitmap(&self) -> Arc<SpaceBitmap> {
        self.bitmaps.lock().mark.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_space(name: &str) -> AllocSpace {
        AllocSpace::create(name, 4096, 1 << 20, 1 << 24, Address::null()).unwrap()
    }

    #[test]
    fn test_bounds_and_contains() {
        let space = small_space("bounds");
        let begin = space.begin();
        let end = space.end();

        assert!(begin < end);
        assert!(space.contains(begin));
        assert!(space.contains(end.sub(1)));
        assert!(!space.contains(end));
        assert_eq!(space.size(), end.offset_from(begin));
        for probe in &[begin, begin.offset(8), end.sub(8), end, end.offset(64)] {
            assert_eq!(
                space.contains(*probe),
                begin <= *probe && *probe < end,
                "contains({}) disagrees with bounds",
                probe
            );
        }
    }

    #[test]
    fn test_capacity_reports_growth_limit() {
        let space = small_space("capacity");
        assert_eq!(space.capacity(), 1 << 20);
        assert_eq!(space.non_growth_limit_capacity(), 1 << 24);

        space.clear_growth_limit();
        assert_eq!(space.capacity(), space.non_growth_limit_capacity());
        // clearing twice changes nothing
        space.clear_growth_limit();
        assert_eq!(space.capacity(), space.non_growth_limit_capacity());
    }

    #[test]
    fn test_alloc_zeroes_and_accounts() {
        let space = small_space("alloc");
        let p = space.alloc_with_growth(100);
        assert!(p.is_non_null());
        assert!(space.contains(p));
        assert!(space.allocation_size(p) >= 100);
        unsafe {
            let bytes = core::slice::from_raw_parts(p.to_ptr::<u8>(), 100);
            assert!(bytes.iter().all(|&b| b == 0));
        }
        let freed = space.free(p);
        assert_eq!(freed, space_free_size(&space, 100));
    }

    // what free should report for a fresh allocation of `n`
    fn space_free_size(space: &AllocSpace, n: usize) -> usize {
        let p = space.alloc_with_growth(n);
        let size = space.allocation_size(p);
        space.free(p);
        size
    }

    #[test]
    fn test_free_list_batches() {
        let space = small_space("free list");
        let ptrs: Vec<Address> = (0..32)
            .map(|_| space.alloc_with_growth(64))
            .collect();
        assert!(ptrs.iter().all(|p| p.is_non_null()));
        let freed = space.free_list(&ptrs);
        assert!(freed >= 32 * 64);
    }

    #[test]
    fn test_without_growth_respects_current_limit() {
        let page = os::page_size();
        let space = AllocSpace::create("no growth", page, 1 << 20, 1 << 24, Address::null()).unwrap();
        let end_before = space.end();

        // larger than the initial footprint allows
        assert!(space.alloc_without_growth(2 * page).is_null());
        assert_eq!(space.end(), end_before);

        // fits in the already-committed page
        assert!(space.alloc_without_growth(512).is_non_null());
        assert_eq!(space.end(), end_before);

        // growth path succeeds where the non-growth path refused
        assert!(space.alloc_with_growth(2 * page).is_non_null());
        let growth_end = space.begin().offset(space.capacity());
        assert!(space.end() <= growth_end);
    }

    #[test]
    fn test_growth_limit_scenario() {
        let space = small_space("growth scenario");
        let mut held = Vec::new();
        for _ in 0..64 {
            let p = space.alloc_with_growth(4096);
            assert!(p.is_non_null());
            held.push(p);
        }
        assert!(space.size() > 4096, "growth never happened");

        // an MB-scale request on top of what is held must trip the limit
        assert!(space.alloc_with_growth(1 << 20).is_null());
        // the failure may not have moved the end past the limit
        assert!(space.end() <= space.begin().offset(space.capacity()));
        // a request that still fits under the limit succeeds
        assert!(space.alloc_with_growth(700 * 1024).is_non_null());
    }

    #[test]
    fn test_footprint_limit_is_clamped() {
        let space = small_space("footprint");
        space.set_footprint_limit(1 << 23);
        // growth limit is 1 MiB, the requested 8 MiB must not survive
        assert_eq!(space.footprint_limit(), space.capacity());

        space.set_footprint_limit(0);
        // never below the committed footprint
        assert!(space.footprint_limit() >= space.size());
    }

    #[test]
    fn test_swap_bitmaps_is_role_reassignment() {
        let space = small_space("swap");
        let live = space.live_bitmap();
        let mark = space.mark_bitmap();
        assert!(!Arc::ptr_eq(&live, &mark));

        let addr = space.begin().offset(64);
        live.set(addr);

        space.swap_bitmaps();
        assert!(Arc::ptr_eq(&space.mark_bitmap(), &live));
        assert!(Arc::ptr_eq(&space.live_bitmap(), &mark));
        // the swap moved no bits
        assert!(space.mark_bitmap().test(addr));
        assert!(!space.live_bitmap().test(addr));
    }

    #[test]
    fn test_walk_sees_allocations() {
        let space = small_space("walk");
        let a = space.alloc_with_growth(40);
        let b = space.alloc_with_growth(400);
        let mut used_chunks = Vec::new();
        space.walk(&mut |start, end, used| {
            if used > 0 {
                used_chunks.push((start, end));
            }
        });
        for ptr in [a, b] {
            assert!(
                used_chunks.iter().any(|&(s, e)| s < ptr && ptr < e),
                "chunk walk missed allocation {}",
                ptr
            );
        }
    }

    #[test]
    fn test_trim_retreats_end() {
        let space = small_space("trim");
        let p = space.alloc_with_growth(256 * 1024);
        assert!(p.is_non_null());
        let grown_end = space.end();
        space.free(p);

        let reclaimed = space.trim();
        assert!(reclaimed > 0);
        assert!(space.end() < grown_end);
    }

    #[test]
    fn test_zygote_split() {
        let mut space = small_space("zygote");
        let obj = space.alloc_with_growth(128);
        assert!(obj.is_non_null());

        let reservation = Region::new(
            space.begin(),
            space.begin().offset(space.non_growth_limit_capacity()),
        );
        let end_before = space.end();
        let sibling = space.create_zygote_space().unwrap();

        // the two halves partition the original reservation
        assert_eq!(space.end(), end_before);
        assert_eq!(sibling.begin(), space.end());
        assert_eq!(
            sibling
                .begin()
                .offset(sibling.non_growth_limit_capacity()),
            reservation.end
        );
        let zygote = Region::new(space.begin(), space.end());
        let tail = Region::new(sibling.begin(), reservation.end);
        assert!(zygote.disjunct(&tail));

        // frozen prefix: zygote policy, no further allocation
        assert!(space.is_zygote_space());
        assert_eq!(space.gc_retention_policy(), GcRetentionPolicy::FullCollect);
        assert!(space.alloc_with_growth(64).is_null());
        assert_eq!(space.capacity(), space.size());
        assert_eq!(space.live_bitmap().heap_limit(), space.end());

        // the sibling serves post-fork allocation
        assert!(!sibling.is_zygote_space());
        assert_eq!(
            sibling.gc_retention_policy(),
            GcRetentionPolicy::AlwaysCollect
        );
        let p = sibling.alloc_with_growth(64);
        assert!(p.is_non_null());
        assert!(sibling.contains(p));
        assert!(!space.contains(p));
        assert!(space.contains(obj));
        assert!(!sibling.contains(obj));

        // freeing into the frozen prefix still works (full collections do)
        assert!(space.free(obj) > 0);
    }

    #[test]
    fn test_concurrent_alloc_free() {
        let space = Arc::new(small_space("threads"));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let space = space.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let p = space.alloc_with_growth(16 + (i % 64) * 8);
                    assert!(p.is_non_null());
                    assert!(space.contains(p));
                    space.free(p);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
