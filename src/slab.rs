use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};

use log::{debug, warn};

use crate::internal::probe;
use crate::options::{option_is_enabled, SlabOption};
use crate::os;
use crate::stats::Stats;
use crate::types::*;

/* -----------------------------------------------------------
  A slab instance owns one contiguous virtual range of
  `max_pages` 4kb pages and hands out fixed-size slots from it.
  Every page tracks its slots in 16 cacheline-spread atomic
  sub-bitmaps and carries a combined drain-lock/refcount word;
  allocation is a hash-seeded scan with one CAS per probed
  word, deallocation is pointer arithmetic plus an atomic bit
  clear. Pages past `phys_pages` are kept drain-locked and
  come online (or go back to the OS) through the single-flight
  expand/shrink protocol below.
----------------------------------------------------------- */

pub struct Slab {
    base: NonNull<u8>,
    obj_size: usize,
    slot_count: usize,
    virt_pages: usize,
    pages: Box<[PageMeta]>,
    phys_pages: AtomicUsize,
    allocated: AtomicUsize,
    coord: AtomicU32,
    stats: Stats,
}

// All shared mutation goes through the atomic words above; the object
// memory itself is owned by whoever claimed the slot.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    /// Create an instance for objects of `obj_size` bytes backed by at most
    /// `max_pages` pages. The whole virtual range is reserved up front;
    /// only page 0 starts out as an allocation target.
    pub fn new(obj_size: usize, max_pages: usize) -> Result<Slab, SlabError> {
        if obj_size < MIN_OBJ_SIZE || obj_size > MAX_OBJ_SIZE {
            return Err(SlabError::BadObjectSize(obj_size));
        }
        if max_pages == 0 {
            return Err(SlabError::BadPageBudget);
        }
        let range = max_pages
            .checked_mul(PAGE_SIZE)
            .ok_or(SlabError::PageBudgetOverflow(max_pages))?;

        let stats = Stats::default();
        let base = NonNull::new(os::reserve(range, &stats)).ok_or(SlabError::ReserveFailed)?;

        let slot_count = PAGE_SIZE / obj_size;
        let pages: Vec<PageMeta> = (0..max_pages)
            .map(|index| PageMeta::new(slot_count, index == 0))
            .collect();

        Ok(Slab {
            base,
            obj_size,
            slot_count,
            virt_pages: max_pages,
            pages: pages.into_boxed_slice(),
            phys_pages: AtomicUsize::new(1),
            allocated: AtomicUsize::new(0),
            coord: AtomicU32::new(0),
            stats,
        })
    }

    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    /// Real slots per page: `4096 / obj_size`.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn virt_pages(&self) -> usize {
        self.virt_pages
    }

    /// Start of the reserved range. Every pointer handed out lies in
    /// `[base, base + virt_pages * 4096)`.
    pub fn base(&self) -> *const u8 {
        self.base.as_ptr()
    }

    pub fn stats(&self) -> SlabStats {
        SlabStats {
            phys_pages: self.phys_pages.load(Ordering::SeqCst),
            allocated_slots: self.allocated.load(Ordering::SeqCst),
        }
    }

    /* -----------------------------------------------------------
      Allocation. Lock-free: a lost CAS moves the scan to the
      next sub-bitmap instead of retrying in place, so every
      iteration either claims a slot or inspects a new word.
    ----------------------------------------------------------- */

    /// Claim a free slot. `None` means every live page is full and the
    /// instance cannot grow further; that is back-pressure, not an error.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        loop {
            if let Some(p) = self.try_alloc() {
                return Some(p);
            }
            if self.phys_pages.load(Ordering::SeqCst) >= self.virt_pages {
                return None;
            }
            // A completed scan found nothing: bring another page online
            // and rescan. No occupancy check here; the failed scan is the
            // starvation signal.
            self.expand();
        }
    }

    fn try_alloc(&self) -> Option<NonNull<u8>> {
        let phys = self.phys_pages.load(Ordering::SeqCst);
        let page_start = probe() as usize % phys;

        for i in 0..phys {
            let page = (page_start + i) % phys;
            let meta = &self.pages[page];
            if !meta.refs.try_ref() {
                continue; // drain-locked
            }

            let sub_start = probe() as usize % SUBMAP_COUNT;
            for j in 0..SUBMAP_COUNT {
                let sub = (sub_start + j) % SUBMAP_COUNT;
                let word = meta.map[sub].load();
                if word == FULL_WORD {
                    continue;
                }
                let bit = (!word).trailing_zeros() as usize;
                if bit >= SUBMAP_BITS {
                    continue;
                }
                if !meta.map[sub].try_claim(word, bit) {
                    // Lost the word to a racing allocator; probe the next
                    // sub-bitmap rather than this one again.
                    continue;
                }

                // The page reference taken above now stands for this
                // outstanding slot; the matching `free` drops it.
                let slot = bit * SUBMAP_COUNT + sub;
                self.allocated.fetch_add(1, Ordering::SeqCst);
                self.maybe_expand();
                let offset = page * PAGE_SIZE + slot * self.obj_size;
                return Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) });
            }

            meta.refs.unref(); // page exhausted
        }
        None
    }

    /* -----------------------------------------------------------
      Deallocation. Wait-free: a fixed number of atomic RMWs,
      no loops. Foreign and malformed pointers are rejected by
      range and alignment checks.
    ----------------------------------------------------------- */

    /// Release a slot previously returned by [`alloc`](Slab::alloc).
    ///
    /// # Safety
    ///
    /// `ptr` must be null, a live pointer obtained from this instance, or
    /// a pointer outside the instance's range (which is ignored). Passing
    /// a pointer into the range that is not an outstanding allocation
    /// corrupts the slot accounting.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        if addr < base || addr >= base + (self.virt_pages << PAGE_SHIFT) {
            warn!("free of foreign pointer {:p} ignored", ptr);
            return;
        }
        let diff = addr - base;
        let page = diff >> PAGE_SHIFT;
        let offset = diff & (PAGE_SIZE - 1);
        if offset % self.obj_size != 0 {
            warn!("free of misaligned pointer {:p} ignored", ptr);
            return;
        }
        let slot = offset / self.obj_size;
        if slot >= self.slot_count {
            warn!("free of out-of-range pointer {:p} ignored", ptr);
            return;
        }

        self.pages[page].map[slot % SUBMAP_COUNT].release(slot / SUBMAP_COUNT);
        self.allocated.fetch_sub(1, Ordering::SeqCst);
        self.pages[page].refs.unref();
        self.maybe_shrink();
    }

    /* -----------------------------------------------------------
      Adaptive expansion and shrinkage. Both are single-flight
      through `coord`; losers abort instantly. Expansion
      publishes a born-drain-locked page with a plain unlock.
      Shrinkage drain-locks the last page and releases its
      backing once the reference count reads zero.
    ----------------------------------------------------------- */

    fn maybe_expand(&self) {
        let used = self.allocated.load(Ordering::SeqCst);
        let cap = self.phys_pages.load(Ordering::SeqCst) * self.slot_count;
        // Half-full: bring the next page online before allocation scans
        // start running long. Stays clear of the 1/8 shrink threshold.
        if used < cap / 2 {
            return;
        }
        self.expand();
    }

    fn expand(&self) {
        if self
            .coord
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let phys = self.phys_pages.load(Ordering::SeqCst);
        if phys < self.virt_pages {
            let page = self.phys_pages.fetch_add(1, Ordering::SeqCst);
            self.pages[page].refs.unlock_drain();
            self.stats.expansions.increase(1);
            if option_is_enabled(SlabOption::Verbose) {
                debug!("page {} published, {} live", page, page + 1);
            }
        }
        self.coord.store(0, Ordering::SeqCst);
    }

    fn maybe_shrink(&self) {
        let used = self.allocated.load(Ordering::SeqCst);
        let cap = self.phys_pages.load(Ordering::SeqCst) * self.slot_count;
        if used > cap / 8 {
            return;
        }
        if self
            .coord
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let phys = self.phys_pages.load(Ordering::SeqCst);
        // Page 0 is never reclaimed.
        if phys > 1 {
            let last = phys - 1;
            let meta = &self.pages[last];
            meta.refs.lock_drain();
            // In-flight allocators either observe the lock and back out or
            // have already completed and appear in the reference count.
            fence(Ordering::SeqCst);
            if PageRef::is_reclaimable(meta.refs.load()) {
                let addr = unsafe { self.base.as_ptr().add(last << PAGE_SHIFT) };
                if option_is_enabled(SlabOption::PageReset) {
                    os::reset(addr, PAGE_SIZE, &self.stats);
                }
                self.phys_pages.fetch_sub(1, Ordering::SeqCst);
                self.stats.reclaims.increase(1);
                if option_is_enabled(SlabOption::Verbose) {
                    debug!("page {} reclaimed, {} live", last, last);
                }
            } else if option_is_enabled(SlabOption::DrainUnlock) {
                // Drain failed; put the page back in rotation rather than
                // stranding it until a later drain happens to succeed.
                meta.refs.unlock_drain();
            }
        }
        self.coord.store(0, Ordering::SeqCst);
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        let outstanding = self.allocated.load(Ordering::SeqCst);
        if outstanding != 0 {
            warn!("slab dropped with {} outstanding allocations", outstanding);
        }
        os::release(
            self.base.as_ptr(),
            self.virt_pages << PAGE_SHIFT,
            &self.stats,
        );
        if option_is_enabled(SlabOption::ShowStats) {
            self.stats.print();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    // Set bits across all bitmaps minus the fixed sentinel count.
    fn bitmap_weight(slab: &Slab) -> usize {
        let sentinels = SLOTS_PER_PAGE_MAX - slab.slot_count;
        slab.pages
            .iter()
            .map(|page| {
                let set: u32 = page.map.iter().map(|w| w.load().count_ones()).sum();
                set as usize - sentinels
            })
            .sum()
    }

    #[test]
    fn rejects_bad_construction_args() {
        assert!(Slab::new(4, 1).is_err());
        assert!(Slab::new(8192, 1).is_err());
        assert!(Slab::new(64, 0).is_err());
        assert!(Slab::new(64, usize::MAX).is_err());
    }

    #[test]
    fn derived_constants() {
        let slab = Slab::new(16, 4).unwrap();
        assert_eq!(slab.obj_size(), 16);
        assert_eq!(slab.slot_count(), 256);
        assert_eq!(slab.virt_pages(), 4);
        assert_eq!(slab.stats().phys_pages, 1);

        let slab = Slab::new(24, 1).unwrap();
        assert_eq!(slab.slot_count(), 170);
    }

    #[test]
    fn alloc_free_roundtrip() {
        let slab = Slab::new(64, 2).unwrap();
        let p = slab.alloc().expect("fresh slab must allocate");
        let diff = p.as_ptr() as usize - slab.base() as usize;
        assert_eq!((diff & (PAGE_SIZE - 1)) % 64, 0);
        assert!(diff < 2 * PAGE_SIZE);
        assert_eq!(slab.stats().allocated_slots, 1);
        unsafe { slab.free(p.as_ptr()) };
        assert_eq!(slab.stats().allocated_slots, 0);
        assert_eq!(bitmap_weight(&slab), 0);
    }

    #[test]
    fn counter_matches_bitmap_weight() {
        let slab = Slab::new(32, 2).unwrap();
        let ptrs: Vec<_> = (0..100).map(|_| slab.alloc().unwrap()).collect();
        assert_eq!(bitmap_weight(&slab), 100);
        assert_eq!(slab.stats().allocated_slots, 100);
        for p in &ptrs[..50] {
            unsafe { slab.free(p.as_ptr()) };
        }
        assert_eq!(bitmap_weight(&slab), 50);
        assert_eq!(slab.stats().allocated_slots, 50);
        for p in &ptrs[50..] {
            unsafe { slab.free(p.as_ptr()) };
        }
        assert_eq!(bitmap_weight(&slab), 0);
    }

    #[test]
    fn page_refs_count_outstanding_slots() {
        let slab = Slab::new(512, 1).unwrap();
        let a = slab.alloc().unwrap();
        let b = slab.alloc().unwrap();
        let c = slab.alloc().unwrap();
        assert_eq!(slab.pages[0].refs.load(), 3);
        unsafe {
            slab.free(b.as_ptr());
            slab.free(a.as_ptr());
        }
        assert_eq!(slab.pages[0].refs.load(), 1);
        unsafe { slab.free(c.as_ptr()) };
        assert_eq!(slab.pages[0].refs.load(), 0);
    }

    #[test]
    fn drain_locked_page_is_skipped() {
        let slab = Slab::new(256, 1).unwrap();
        slab.pages[0].refs.lock_drain();
        assert!(slab.alloc().is_none());
        slab.pages[0].refs.unlock_drain();
        assert!(slab.alloc().is_some());
    }

    #[test]
    fn half_full_page_triggers_publication() {
        let slab = Slab::new(16, 2).unwrap();
        let mut ptrs = Vec::new();
        for _ in 0..127 {
            ptrs.push(slab.alloc().unwrap());
        }
        assert_eq!(slab.stats().phys_pages, 1);
        ptrs.push(slab.alloc().unwrap()); // 128th: used == cap/2
        assert_eq!(slab.stats().phys_pages, 2);
        for p in ptrs {
            unsafe { slab.free(p.as_ptr()) };
        }
    }

    #[test]
    fn idle_instance_shrinks_to_one_page() {
        let slab = Slab::new(16, 2).unwrap();
        let mut ptrs = Vec::new();
        for _ in 0..200 {
            ptrs.push(slab.alloc().unwrap());
        }
        assert_eq!(slab.stats().phys_pages, 2);
        // Highest addresses first so the tail page drains before the
        // occupancy threshold lets shrinkage run.
        ptrs.sort_by(|a, b| b.cmp(a));
        for p in ptrs {
            unsafe { slab.free(p.as_ptr()) };
        }
        let stats = slab.stats();
        assert_eq!(stats.allocated_slots, 0);
        assert_eq!(stats.phys_pages, 1);
        // The reclaimed page is parked drain-locked with a clean bitmap.
        assert!(PageRef::is_reclaimable(slab.pages[1].refs.load()));
        assert_eq!(bitmap_weight(&slab), 0);
    }

    #[test]
    fn reclaimed_page_comes_back() {
        let slab = Slab::new(16, 2).unwrap();
        let mut ptrs = Vec::new();
        for _ in 0..200 {
            ptrs.push(slab.alloc().unwrap());
        }
        ptrs.sort_by(|a, b| b.cmp(a));
        for p in ptrs.drain(..) {
            unsafe { slab.free(p.as_ptr()) };
        }
        assert_eq!(slab.stats().phys_pages, 1);
        // Refill: expansion republishes index 1 and writes re-fault.
        for _ in 0..300 {
            ptrs.push(slab.alloc().unwrap());
        }
        assert_eq!(slab.stats().phys_pages, 2);
        for p in ptrs.iter() {
            unsafe { p.as_ptr().write(0x5A) };
        }
        for p in ptrs {
            unsafe { slab.free(p.as_ptr()) };
        }
        assert_eq!(slab.stats().allocated_slots, 0);
    }

    #[test]
    fn concurrent_pairs_leave_no_residue() {
        let slab = Arc::new(Slab::new(16, 2).unwrap());
        let mut handles = Vec::new();
        for t in 0..8u64 {
            let slab = Arc::clone(&slab);
            handles.push(thread::spawn(move || {
                for i in 0..1000u64 {
                    let p = slab.alloc().expect("capacity covers all threads");
                    let tag = (t << 32) | i;
                    unsafe {
                        (p.as_ptr() as *mut u64).write(tag);
                        assert_eq!((p.as_ptr() as *mut u64).read(), tag);
                        slab.free(p.as_ptr());
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(slab.stats().allocated_slots, 0);
        assert_eq!(bitmap_weight(&slab), 0);
        for page in slab.pages.iter() {
            assert_eq!(page.refs.load() & !DRAIN_BIT, 0);
        }
    }

    #[test]
    fn concurrent_hold_and_release_is_duplicate_free() {
        let slab = Arc::new(Slab::new(8, 2).unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let slab = Arc::clone(&slab);
            handles.push(thread::spawn(move || {
                let mut held = Vec::new();
                for _ in 0..100 {
                    if let Some(p) = slab.alloc() {
                        held.push(p.as_ptr() as usize);
                    }
                }
                let mut sorted = held.clone();
                sorted.sort();
                sorted.dedup();
                assert_eq!(sorted.len(), held.len());
                for p in held {
                    unsafe { slab.free(p as *mut u8) };
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(slab.stats().allocated_slots, 0);
    }
}
