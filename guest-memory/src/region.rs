use std::fs;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, warn};

use crate::page_table::{K_NUMBER_OF_PAGES, PAGE_SHIFT, PAGE_SIZE};

/// Size of one guest address space: 2^20 pages * 4 KiB = 4 GiB.
pub const REGION_SIZE: usize = (K_NUMBER_OF_PAGES as usize) * PAGE_SIZE;

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("failed to read /proc/self/maps: {0}")]
    MapsUnreadable(#[source] io::Error),
    #[error("no 4 GiB-aligned candidate address was free after {attempts} attempts")]
    NoCandidateFound { attempts: u32 },
    #[error("mmap/mprotect failed: {0}")]
    Os(#[source] io::Error),
}

/// Monotonic source of 4 GiB-aligned candidate addresses, owned by the
/// emulator root object (Design Notes: "do not make them ambient
/// globals"). One instance is shared by every `NativeRegion::reserve` call
/// in a process.
pub struct RegionIdAllocator {
    next: AtomicU64,
}

impl RegionIdAllocator {
    /// Starts at 2 so that candidate `1 << 32` (a small, commonly-occupied
    /// address on Linux) is never tried, matching the original's
    /// `nextMemoryId = 2` starting point.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(2),
        }
    }

    fn next_candidate(&self) -> *mut libc::c_void {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        (id << 32) as *mut libc::c_void
    }
}

impl Default for RegionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses `/proc/self/maps` and checks whether any existing mapping
/// overlaps `[addr, addr+len)`, using line-oriented parsing rather than a
/// hand-rolled character scanner.
fn address_range_in_use(addr: usize, len: usize) -> Result<bool, RegionError> {
    let maps = fs::read_to_string("/proc/self/maps").map_err(RegionError::MapsUnreadable)?;
    let end = addr + len;

    for line in maps.lines() {
        let Some((range, _rest)) = line.split_once(' ') else {
            continue;
        };
        let Some((start_str, end_str)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(map_end)) = (
            u64::from_str_radix(start_str, 16),
            u64::from_str_radix(end_str, 16),
        ) else {
            continue;
        };
        let (start, map_end) = (start as usize, map_end as usize);

        if start >= addr && start < end {
            return Ok(true);
        }
        if map_end > addr && map_end <= end {
            return Ok(true);
        }
        if start < addr && map_end > end {
            return Ok(true);
        }
    }
    Ok(false)
}

/// A reserved, contiguous 4 GiB host virtual region for one guest process.
///
/// Guest addresses translate to host addresses by simple addition
/// (`host = base + guest32`), which is the whole point of reserving a
/// single contiguous block: it turns every guest memory access in
/// translated code into a constant-time displacement off one fixed base
/// register (rationale).
pub struct NativeRegion {
    base: *mut u8,
}

// Safety: `base` only ever refers to memory we mmap'd and own exclusively
// for the process lifetime; all mutation goes through `mprotect`, which is
// safe to call from any thread.
unsafe impl Send for NativeRegion {}
unsafe impl Sync for NativeRegion {}

impl NativeRegion {
    const MAX_ATTEMPTS: u32 = 4096;

    pub fn reserve(ids: &RegionIdAllocator) -> Result<Self, RegionError> {
        for attempt in 0..Self::MAX_ATTEMPTS {
            let candidate = ids.next_candidate();

            match address_range_in_use(candidate as usize, REGION_SIZE) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "could not probe /proc/self/maps, retrying");
                    continue;
                }
            }

            let mapped = unsafe {
                libc::mmap(
                    candidate,
                    REGION_SIZE,
                    libc::PROT_NONE,
                    libc::MAP_FIXED | libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                    -1,
                    0,
                )
            };

            if mapped == libc::MAP_FAILED {
                continue;
            }
            if mapped != candidate {
                // Kernel picked a different address than we asked for with
                // MAP_FIXED, which should not happen, but don't trust it.
                unsafe { libc::munmap(mapped, REGION_SIZE) };
                continue;
            }

            debug!(base = ?candidate, attempt, "reserved 4 GiB guest region");
            return Ok(Self {
                base: candidate as *mut u8,
            });
        }

        Err(RegionError::NoCandidateFound {
            attempts: Self::MAX_ATTEMPTS,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Translates a guest address into the host address backing it. Callers
    /// are responsible for having committed and permitted the page first;
    /// this is pure pointer arithmetic, not a bounds or permission check.
    pub fn guest_to_host(&self, guest_addr: u32) -> *mut u8 {
        unsafe { self.base.add(guest_addr as usize) }
    }

    fn page_range(&self, page: u32, count: u32) -> (*mut libc::c_void, usize) {
        let offset = (page as usize) << PAGE_SHIFT;
        let len = (count as usize) << PAGE_SHIFT;
        (unsafe { self.base.add(offset) } as *mut libc::c_void, len)
    }

    pub fn mprotect_pages(&self, page: u32, count: u32, prot: i32) -> Result<(), RegionError> {
        let (addr, len) = self.page_range(page, count);
        let ret = unsafe { libc::mprotect(addr, len, prot) };
        if ret != 0 {
            return Err(RegionError::Os(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Upgrades to READ|WRITE and zeroes the backing ("Allocate
    /// pages": the page is briefly made writable to zero-initialise it
    /// before being downgraded to the guest's requested permissions).
    pub fn commit_and_zero(&self, page: u32, count: u32) -> Result<(), RegionError> {
        self.mprotect_pages(page, count, libc::PROT_READ | libc::PROT_WRITE)?;
        let (addr, len) = self.page_range(page, count);
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len) };
        Ok(())
    }
}

impl Drop for NativeRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, REGION_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserves_distinct_regions() {
        let ids = RegionIdAllocator::new();
        let a = NativeRegion::reserve(&ids).expect("reserve a");
        let b = NativeRegion::reserve(&ids).expect("reserve b");
        assert_ne!(a.base() as usize, b.base() as usize);
        // Lower 32 bits of the base are zero: guest addresses are base|guest32.
        assert_eq!(a.base() as usize & 0xFFFF_FFFF, 0);
    }

    #[test]
    fn commit_then_protect_round_trips() {
        let ids = RegionIdAllocator::new();
        let region = NativeRegion::reserve(&ids).expect("reserve");
        region.commit_and_zero(16, 1).expect("commit");
        let ptr = region.guest_to_host(16 << PAGE_SHIFT);
        unsafe {
            assert_eq!(*ptr, 0);
            *ptr = 0x42;
            assert_eq!(*ptr, 0x42);
        }
        region
            .mprotect_pages(16, 1, libc::PROT_READ)
            .expect("downgrade to read-only");
    }
}
