#[cfg(not(windows))]
use libc::{madvise, mmap, munmap, MADV_DONTNEED, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
#[cfg(windows)]
use winapi::um::{
    errhandlingapi::GetLastError,
    memoryapi::{VirtualAlloc, VirtualFree},
    sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
    winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEM_RESET, PAGE_READWRITE},
};

use core::ptr::null_mut;

use log::warn;
use once_cell::sync::Lazy;

use crate::stats::Stats;

// OS (small) page size, queried once
static OS_PAGE_SIZE: Lazy<usize> = Lazy::new(query_page_size);

pub fn page_size() -> usize {
    *OS_PAGE_SIZE
}

#[cfg(not(windows))]
fn query_page_size() -> usize {
    let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if result > 0 {
        result as usize
    } else {
        4096
    }
}

#[cfg(windows)]
fn query_page_size() -> usize {
    let mut si: SYSTEM_INFO = Default::default();
    unsafe { GetSystemInfo(&mut si) };
    if si.dwPageSize > 0 {
        si.dwPageSize as usize
    } else {
        4096
    }
}

fn align_up(size: usize, align: usize) -> usize {
    let mut x = (size / align) * align;
    if x < size {
        x += align;
    }
    if x < size {
        return 0;
    }
    x
}

fn align_down(size: usize, align: usize) -> usize {
    (size / align) * align
}

// OS page align within a given area, pages inside the area only. An empty
// aligned area is reported as `(null, 0)`.
fn page_align_area_conservative(addr: *mut u8, size: usize) -> (*mut u8, usize) {
    debug_assert!(!addr.is_null() && size > 0);
    let start = align_up(addr as usize, page_size());
    let end = align_down(addr as usize + size, page_size());
    if end <= start {
        return (null_mut(), 0);
    }
    debug_assert!(end - start <= size);
    (start as *mut u8, end - start)
}

/* -----------------------------------------------------------
  Primitive reservation and release of anonymous memory.
  The returned range is committed read-write; the OS backs it
  lazily on first touch.
----------------------------------------------------------- */

pub fn reserve(size: usize, stats: &Stats) -> *mut u8 {
    debug_assert!(size > 0);
    let p = raw_reserve(size);
    stats.mmap_calls.increase(1);
    if !p.is_null() {
        stats.reserved.increase(size as i64);
        stats.committed.increase(size as i64);
    }
    p
}

#[cfg(not(windows))]
fn raw_reserve(size: usize) -> *mut u8 {
    let p = unsafe {
        mmap(
            null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == MAP_FAILED {
        warn!("mmap failed: {}, size {}", errno::errno(), size);
        return null_mut();
    }
    p as *mut u8
}

#[cfg(windows)]
fn raw_reserve(size: usize) -> *mut u8 {
    let p = unsafe { VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };
    if p.is_null() {
        warn!("VirtualAlloc failed: {}, size {}", unsafe { GetLastError() }, size);
    }
    p as *mut u8
}

pub fn release(addr: *mut u8, size: usize, stats: &Stats) -> bool {
    if addr.is_null() || size == 0 {
        return true;
    }
    let ok = raw_release(addr, size);
    stats.committed.decrease(size as i64);
    stats.reserved.decrease(size as i64);
    ok
}

#[cfg(not(windows))]
fn raw_release(addr: *mut u8, size: usize) -> bool {
    if unsafe { munmap(addr as _, size) } == -1 {
        warn!("munmap failed: {}, addr {:p}, size {}", errno::errno(), addr, size);
        return false;
    }
    true
}

#[cfg(windows)]
fn raw_release(addr: *mut u8, size: usize) -> bool {
    if unsafe { VirtualFree(addr as _, 0, MEM_RELEASE) } == 0 {
        warn!(
            "VirtualFree failed: {}, addr {:p}, size {}",
            unsafe { GetLastError() },
            addr,
            size
        );
        return false;
    }
    true
}

/* -----------------------------------------------------------
  Advisory reset: signal that the address range is no longer
  in use but may be again later. Releases the physical pages
  while keeping the virtual mapping; the next write re-faults
  a zero page. Aligned to a conservative area inside the range.
----------------------------------------------------------- */

pub fn reset(addr: *mut u8, size: usize, stats: &Stats) -> bool {
    let (start, csize) = page_align_area_conservative(addr, size);
    if csize == 0 {
        return true;
    }
    stats.reset.increase(csize as i64);
    raw_reset(start, csize)
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
fn raw_reset(start: *mut u8, csize: usize) -> bool {
    use core::sync::atomic::{AtomicI32, Ordering};
    // if MADV_FREE is not supported, fall back to MADV_DONTNEED from then on
    static ADVICE: AtomicI32 = AtomicI32::new(libc::MADV_FREE);
    let advice = ADVICE.load(Ordering::Relaxed);
    let mut err = unsafe { madvise(start as _, csize, advice) };
    if err != 0 && errno::errno().0 == libc::EINVAL && advice == libc::MADV_FREE {
        ADVICE.store(MADV_DONTNEED, Ordering::Relaxed);
        err = unsafe { madvise(start as _, csize, MADV_DONTNEED) };
    }
    if err != 0 {
        warn!(
            "madvise reset error: start: {:p}, csize: {:08x}, errno: {}",
            start,
            csize,
            errno::errno().0
        );
    }
    err == 0
}

#[cfg(all(
    not(windows),
    not(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))
))]
fn raw_reset(start: *mut u8, csize: usize) -> bool {
    let err = unsafe { madvise(start as _, csize, MADV_DONTNEED) };
    if err != 0 {
        warn!(
            "madvise reset error: start: {:p}, csize: {:08x}, errno: {}",
            start,
            csize,
            errno::errno().0
        );
    }
    err == 0
}

#[cfg(windows)]
fn raw_reset(start: *mut u8, csize: usize) -> bool {
    let p = unsafe { VirtualAlloc(start as _, csize, MEM_RESET, PAGE_READWRITE) } as *mut u8;
    if p != start {
        warn!(
            "VirtualAlloc MEM_RESET failed: {}, start {:p}, csize {:08x}",
            unsafe { GetLastError() },
            start,
            csize
        );
        return false;
    }
    true
}
