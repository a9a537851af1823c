use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::flags::{GuestFlags, NativeFlags};
use crate::page_table::{PageTable, PAGE_SHIFT};
use crate::region::{NativeRegion, RegionError, RegionIdAllocator};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error("pages [{start}, {end}) are already allocated")]
    AlreadyAllocated { start: u32, end: u32 },
    #[error("page {page} is permanently dynamic and cannot be made read-only")]
    PermanentlyDynamic { page: u32 },
}

/// Result of recording a write to a page that was code-read-only. Mirrors
/// the strike-counter rationale in this design: cheaply distinguish a page
/// patched once at startup from one that is constantly rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeWriteOutcome {
    /// The page may be write-protected again after retranslation.
    StillTrackable,
    /// The strike counter saturated; this page is now permanently dynamic
    /// and will never be write-protected again.
    BecamePermanentlyDynamic,
}

/// Owns one guest process's entire emulated address space: the reserved
/// native region, the per-page flag table, and the allocation lock
/// (`pageMutex` in this design). Lifetime is one guest process.
///
/// This type deliberately does *not* own the recursive
/// `executableMemoryMutex` — that lock also serialises the translation
/// cache's chunk maps, which live in the `bt-chunk` crate, a layer above
/// this one. Callers that mutate `CODEPAGE_READONLY` state
/// (i.e. the translator and the fault handler) are expected to be holding
/// that lock already; see `bt-chunk::TranslationCache`.
pub struct GuestMemory {
    id: u64,
    region: NativeRegion,
    page_table: Mutex<PageTable>,
}

impl GuestMemory {
    pub fn new(region_ids: &RegionIdAllocator, memory_id: u64) -> Result<Self, MemoryError> {
        let region = NativeRegion::reserve(region_ids)?;
        Ok(Self {
            id: memory_id,
            region,
            page_table: Mutex::new(PageTable::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn region(&self) -> &NativeRegion {
        &self.region
    }

    pub fn host_addr(&self, guest_addr: u32) -> *mut u8 {
        self.region.guest_to_host(guest_addr)
    }

    /// Recomputes and applies the host protection implied by a page's
    /// current `guest_flags`/`native_flags`. This is the single point of
    /// truth the Design Notes call for: nothing else is allowed to call
    /// `mprotect` directly on a page once it is allocated.
    fn sync_protection(&self, page: u32, entry_guest: GuestFlags, entry_native: NativeFlags) -> Result<(), MemoryError> {
        let mut prot = 0;
        if entry_guest.intersects(GuestFlags::READ | GuestFlags::EXEC) {
            prot |= libc::PROT_READ;
        }
        if entry_guest.contains(GuestFlags::WRITE) && !entry_native.contains(NativeFlags::CODEPAGE_READONLY) {
            prot |= libc::PROT_WRITE;
        }
        if entry_guest.contains(GuestFlags::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        self.region.mprotect_pages(page, 1, prot)?;
        Ok(())
    }

    /// "Allocate pages".
    pub fn alloc_pages(&self, start_page: u32, count: u32, guest_flags: GuestFlags) -> Result<(), MemoryError> {
        let mut table = self.page_table.lock();

        for i in 0..count {
            if table.get(start_page + i).guest_flags.contains(GuestFlags::ALLOCATED) {
                return Err(MemoryError::AlreadyAllocated {
                    start: start_page,
                    end: start_page + count,
                });
            }
        }

        // Zero-initialise with the region briefly RW, then downgrade to what
        // the guest actually asked for.
        self.region.commit_and_zero(start_page, count)?;

        for i in 0..count {
            let page = start_page + i;
            let entry = table.get_mut(page);
            entry.guest_flags = guest_flags | GuestFlags::ALLOCATED;
            entry.native_flags = NativeFlags::COMMITTED;
            let (gf, nf) = (entry.guest_flags, entry.native_flags);
            self.sync_protection(page, gf, nf)?;
        }

        debug!(start_page, count, ?guest_flags, "allocated guest pages");
        Ok(())
    }

    /// "Free pages". `on_codepage_cleared` is invoked once per
    /// page that was `CODEPAGE_READONLY`, *before* the flag is cleared here,
    /// so the translation cache (a layer above this crate) can retire the
    /// chunks that reference it first.
    pub fn free_pages(&self, start_page: u32, count: u32, mut on_codepage_cleared: impl FnMut(u32)) -> Result<(), MemoryError> {
        let mut table = self.page_table.lock();

        for i in 0..count {
            let page = start_page + i;
            if table.get(page).native_flags.contains(NativeFlags::CODEPAGE_READONLY) {
                on_codepage_cleared(page);
                table.get_mut(page).native_flags.remove(NativeFlags::CODEPAGE_READONLY);
            }
            if table.get(page).native_flags.contains(NativeFlags::COMMITTED) {
                self.region.mprotect_pages(page, 1, libc::PROT_NONE)?;
            }
            table.reset(page);
        }

        debug!(start_page, count, "freed guest pages");
        Ok(())
    }

    /// "Promote code page". Called immediately before a chunk
    /// referencing `page` goes live.
    pub fn make_code_page_read_only(&self, page: u32) -> Result<bool, MemoryError> {
        let mut table = self.page_table.lock();
        let entry = *table.get(page);

        if entry.native_flags.contains(NativeFlags::CODEPAGE_READONLY) {
            return Ok(false);
        }
        if entry.is_dynamic() {
            return Err(MemoryError::PermanentlyDynamic { page });
        }

        let entry_mut = table.get_mut(page);
        entry_mut.native_flags.insert(NativeFlags::CODEPAGE_READONLY);
        let (gf, nf) = (entry_mut.guest_flags, entry_mut.native_flags);
        self.sync_protection(page, gf, nf)?;
        trace!(page, "promoted code page to read-only");
        Ok(true)
    }

    /// "Demote code page". Returns whether the flag had been set.
    pub fn clear_code_page_read_only(&self, page: u32) -> Result<bool, MemoryError> {
        let mut table = self.page_table.lock();
        let entry = *table.get(page);

        if !entry.native_flags.contains(NativeFlags::CODEPAGE_READONLY) {
            return Ok(false);
        }

        let entry_mut = table.get_mut(page);
        entry_mut.native_flags.remove(NativeFlags::CODEPAGE_READONLY);
        let (gf, nf) = (entry_mut.guest_flags, entry_mut.native_flags);
        self.sync_protection(page, gf, nf)?;
        Ok(true)
    }

    /// Records a guest write into a page that was code-read-only: clears
    /// the flag, restores W permission, and bumps the strike counter. This
    /// is the single place `dynamicStrikes` is incremented.
    pub fn record_code_page_write(&self, page: u32) -> Result<CodeWriteOutcome, MemoryError> {
        self.clear_code_page_read_only(page)?;

        let mut table = self.page_table.lock();
        let entry = table.get_mut(page);
        entry.dynamic_strikes = entry.dynamic_strikes.saturating_add(1);
        if entry.is_dynamic() {
            debug!(page, "page declared permanently dynamic");
            Ok(CodeWriteOutcome::BecamePermanentlyDynamic)
        } else {
            Ok(CodeWriteOutcome::StillTrackable)
        }
    }

    pub fn dynamic_strikes(&self, page: u32) -> u8 {
        self.page_table.lock().get(page).dynamic_strikes
    }

    pub fn is_code_read_only(&self, page: u32) -> bool {
        self.page_table
            .lock()
            .get(page)
            .native_flags
            .contains(NativeFlags::CODEPAGE_READONLY)
    }

    pub fn guest_flags(&self, page: u32) -> GuestFlags {
        self.page_table.lock().get(page).guest_flags
    }

    pub fn is_valid_read_address(&self, guest_addr: u32) -> bool {
        self.guest_flags(guest_addr >> PAGE_SHIFT).contains(GuestFlags::READ)
    }

    pub fn is_valid_write_address(&self, guest_addr: u32) -> bool {
        self.guest_flags(guest_addr >> PAGE_SHIFT).contains(GuestFlags::WRITE)
    }

    /// "Dynamic-stack growth": allocate every page between the
    /// fault and the current bottom of the window, growing downward.
    pub fn grow_stack(&self, fault_page: u32, current_bottom: u32) -> Result<u32, MemoryError> {
        if fault_page >= current_bottom {
            return Ok(current_bottom);
        }
        let count = current_bottom - fault_page;
        self.alloc_pages(fault_page, count, GuestFlags::READ | GuestFlags::WRITE)?;
        debug!(fault_page, new_bottom = fault_page, "grew guest stack");
        Ok(fault_page)
    }
}

/// Allocator for `GuestMemory::id`, owned by the emulator root object so
/// the counter is never an ambient global (Design Notes).
pub struct MemoryIdAllocator {
    next: AtomicU64,
}

impl MemoryIdAllocator {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemoryIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionIdAllocator;

    fn new_memory() -> GuestMemory {
        GuestMemory::new(&RegionIdAllocator::new(), 1).expect("create guest memory")
    }

    #[test]
    fn alloc_then_free_round_trips_flags() {
        let mem = new_memory();
        mem.alloc_pages(0x10, 4, GuestFlags::READ | GuestFlags::WRITE).unwrap();
        assert!(mem.guest_flags(0x10).contains(GuestFlags::ALLOCATED));

        let mut cleared = Vec::new();
        mem.free_pages(0x10, 4, |p| cleared.push(p)).unwrap();
        assert!(cleared.is_empty());
        assert!(mem.guest_flags(0x10).is_empty());
    }

    #[test]
    fn double_alloc_without_free_is_rejected() {
        let mem = new_memory();
        mem.alloc_pages(0x10, 1, GuestFlags::READ).unwrap();
        assert!(mem.alloc_pages(0x10, 1, GuestFlags::READ).is_err());
    }

    #[test]
    fn promote_is_idempotent() {
        let mem = new_memory();
        mem.alloc_pages(1, 1, GuestFlags::READ | GuestFlags::WRITE | GuestFlags::EXEC)
            .unwrap();
        assert!(mem.make_code_page_read_only(1).unwrap());
        assert!(!mem.make_code_page_read_only(1).unwrap());
        assert!(mem.is_code_read_only(1));
    }

    #[test]
    fn demote_unset_page_is_noop() {
        let mem = new_memory();
        mem.alloc_pages(1, 1, GuestFlags::READ).unwrap();
        assert!(!mem.clear_code_page_read_only(1).unwrap());
    }

    #[test]
    fn strikes_saturate_to_permanently_dynamic() {
        let mem = new_memory();
        mem.alloc_pages(1, 1, GuestFlags::READ | GuestFlags::WRITE | GuestFlags::EXEC)
            .unwrap();
        for _ in 0..crate::flags::MAX_DYNAMIC_STRIKES {
            mem.make_code_page_read_only(1).unwrap();
            let outcome = mem.record_code_page_write(1).unwrap();
            if mem.dynamic_strikes(1) >= crate::flags::MAX_DYNAMIC_STRIKES {
                assert_eq!(outcome, CodeWriteOutcome::BecamePermanentlyDynamic);
            }
        }
        assert!(mem.make_code_page_read_only(1).is_err());
    }

    #[test]
    fn stack_grows_down_to_fault() {
        let mem = new_memory();
        mem.alloc_pages(0x1FF, 1, GuestFlags::READ | GuestFlags::WRITE).unwrap();
        let new_bottom = mem.grow_stack(0x100, 0x1FF).unwrap();
        assert_eq!(new_bottom, 0x100);
        for page in 0x100..=0x1FF {
            assert!(mem.guest_flags(page).contains(GuestFlags::ALLOCATED));
        }
    }
}
