use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

/// Byte value retired chunks are filled with. Decoded as a two-byte `INT
/// 0xCD` by a real x86 decoder, but since the entire buffer is filled with
/// it the second byte is also `0xCD`, so any offset a stale branch lands on
/// traps.
pub const RETIRED_SENTINEL: u8 = 0xCD;

/// Marks a single live chunk-exit site whose target isn't a host address
/// baked into this chunk's bytes: either a cross-chunk direct branch that
/// hadn't been translated yet at commit time, or a register-indirect branch
/// (item 2, "large-address-space jump"/"page-jump"/"offset-jump").
/// The byte at `host_offset` is this sentinel; the fault handler reads it,
/// classifies the exit, and either relinks (direct) or decodes the live
/// register value (indirect) to find where to resume.
pub const LIVE_EXIT_SENTINEL: u8 = 0xCE;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("failed to allocate {len} bytes of executable host memory: {0}", len = .1)]
    Alloc(#[source] io::Error, usize),
    #[error("no room left in chunk buffer for {needed} bytes at offset {offset}")]
    BufferFull { offset: usize, needed: usize },
    #[error("replacement encoding ({new_len} bytes) does not fit the slot reserved for guest eip {eip:#x} ({old_len} bytes)")]
    SlotTooSmall { eip: u32, old_len: u8, new_len: u8 },
}

/// One guest instruction's position inside a chunk's host buffer. Because
/// this workspace targets an x86-on-x86_64 host, translation is
/// copy-through: a guest instruction's host
/// encoding is almost always byte-identical to its guest encoding, so
/// `host_len` nearly always equals the guest instruction's decoded length.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSlot {
    pub guest_eip: u32,
    pub host_offset: u16,
    pub host_len: u8,
    /// Set once this slot's bytes were overwritten with [`LIVE_EXIT_SENTINEL`]
    /// rather than a real instruction encoding (cross-chunk or indirect
    /// branch, items 2-3).
    pub is_exit_site: bool,
}

/// A cross-chunk direct branch recorded at translation time, resolved (or
/// re-resolved) whenever a chunk commits that might be its target.
#[derive(Debug, Clone, Copy)]
pub struct PendingLink {
    pub host_offset: u16,
    pub target_eip: u32,
}

/// One contiguous translation unit: an owned, page-aligned, executable host
/// buffer plus the bidirectional guest-eip/host-offset map requires.
/// Immutable once committed except for per-instruction retranslation
/// (`dynamic_aware` chunks) and whole-chunk retirement.
pub struct CodeChunk {
    buffer: *mut u8,
    capacity: usize,
    guest_start: u32,
    guest_end: u32,
    /// Sorted by both `guest_eip` and `host_offset` (copy-through
    /// translation never reorders instructions). A plain field would force
    /// every mutator to go through `Arc::get_mut`, but chunks are shared
    /// via `Arc` the moment they're published, so patching (retranslation,
    /// linking) needs interior mutability too.
    slots: Mutex<Vec<ChunkSlot>>,
    pending_links: Vec<PendingLink>,
    dynamic_aware: AtomicBool,
    retired: AtomicBool,
}

// Safety: `buffer` is an mmap'd region we own exclusively for the chunk's
// lifetime. All writers hold `TranslationCache`'s `executableMemoryMutex`
// (dbt_sync::ReentrantLock) before mutating chunk bytes; reads from
// translated code racing a writer are the documented racer case and are
// safe by the sentinel-retirement argument.
unsafe impl Send for CodeChunk {}
unsafe impl Sync for CodeChunk {}

impl CodeChunk {
    /// Allocates a fresh executable buffer of `capacity` bytes. The buffer
    /// is `RWX`: a real deployment would toggle W off once committed and
    /// back on only while holding `executableMemoryMutex` for a patch, but
    /// sandboxing the guest from the host is explicitly out of scope, so
    /// this workspace keeps it simple and notes the simplification in
    /// DESIGN.md.
    pub fn allocate(
        guest_start: u32,
        guest_end: u32,
        slots: Vec<ChunkSlot>,
        pending_links: Vec<PendingLink>,
        bytes: &[u8],
    ) -> Result<Self, ChunkError> {
        let capacity = bytes.len();
        let buffer = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if buffer == libc::MAP_FAILED {
            return Err(ChunkError::Alloc(io::Error::last_os_error(), capacity));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), buffer as *mut u8, capacity);
        }

        Ok(Self {
            buffer: buffer as *mut u8,
            capacity,
            guest_start,
            guest_end,
            slots: Mutex::new(slots),
            pending_links,
            dynamic_aware: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        })
    }

    pub fn guest_range(&self) -> std::ops::Range<u32> {
        self.guest_start..self.guest_end
    }

    pub fn contains_guest_eip(&self, eip: u32) -> bool {
        self.guest_range().contains(&eip)
    }

    pub fn host_start(&self) -> usize {
        self.buffer as usize
    }

    pub fn host_end(&self) -> usize {
        self.buffer as usize + self.capacity
    }

    pub fn contains_host_addr(&self, addr: usize) -> bool {
        addr >= self.host_start() && addr < self.host_end()
    }

    pub fn host_entry(&self) -> *const u8 {
        self.buffer
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn is_dynamic_aware(&self) -> bool {
        self.dynamic_aware.load(Ordering::Acquire)
    }

    pub fn mark_dynamic_aware(&self) {
        self.dynamic_aware.store(true, Ordering::Release);
    }

    pub fn pending_links(&self) -> &[PendingLink] {
        &self.pending_links
    }

    /// Host address for a guest eip this chunk covers, or `None` if `eip`
    /// isn't the start of a translated instruction slot.
    pub fn host_addr_for_eip(&self, eip: u32) -> Option<usize> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.guest_eip == eip)
            .map(|s| self.host_start() + s.host_offset as usize)
    }

    /// Reverse lookup used by fault recovery: which guest instruction does
    /// `host_addr` belong to? `host_addr` need not be the exact start of a
    /// slot (a fault can land mid-instruction); this returns the slot
    /// covering it.
    pub fn guest_eip_for_host_addr(&self, host_addr: usize) -> Option<u32> {
        self.slot_for_host_addr(host_addr).map(|s| s.guest_eip)
    }

    pub fn slot_for_host_addr(&self, host_addr: usize) -> Option<ChunkSlot> {
        if !self.contains_host_addr(host_addr) {
            return None;
        }
        let offset = (host_addr - self.host_start()) as u16;
        self.slots
            .lock()
            .iter()
            .find(|s| offset >= s.host_offset && (offset as u32) < s.host_offset as u32 + s.host_len as u32)
            .copied()
    }

    /// Overwrites the slot for `eip` with `bytes`, used both for per-
    /// instruction retranslation (`dynamic_aware` chunks) and for linking a
    /// pending cross-chunk branch once its target exists. `bytes.len()`
    /// must not exceed the slot's reserved length.
    pub fn patch_slot(&self, eip: u32, bytes: &[u8]) -> Result<(), ChunkError> {
        let mut slots = self.slots.lock();
        let slot = slots
            .iter_mut()
            .find(|s| s.guest_eip == eip)
            .expect("patch_slot called for an eip outside this chunk");
        if bytes.len() > slot.host_len as usize {
            return Err(ChunkError::SlotTooSmall {
                eip,
                old_len: slot.host_len,
                new_len: bytes.len() as u8,
            });
        }
        unsafe {
            let dst = self.buffer.add(slot.host_offset as usize);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            // Pad any leftover reserved bytes with single-byte NOPs so a
            // decoder walking the buffer doesn't trip over stale tail bytes.
            if bytes.len() < slot.host_len as usize {
                std::ptr::write_bytes(dst.add(bytes.len()), 0x90, slot.host_len as usize - bytes.len());
            }
        }
        slot.is_exit_site = false;
        Ok(())
    }

    /// Rewrites the slot for `eip` in place to the live-exit sentinel,
    /// leaving the rest of the chunk untouched (items 2-3).
    pub fn patch_slot_to_exit_sentinel(&self, eip: u32) {
        let mut slots = self.slots.lock();
        let slot = slots
            .iter_mut()
            .find(|s| s.guest_eip == eip)
            .expect("patch_slot_to_exit_sentinel called for an eip outside this chunk");
        unsafe {
            let dst = self.buffer.add(slot.host_offset as usize);
            std::ptr::write_bytes(dst, LIVE_EXIT_SENTINEL, slot.host_len as usize);
        }
        slot.is_exit_site = true;
    }

    /// Whole-chunk retirement: fills the buffer
    /// with the sentinel illegal byte so any thread still executing inside
    /// it traps instead of running stale code.
    pub fn retire(&self) {
        unsafe {
            std::ptr::write_bytes(self.buffer, RETIRED_SENTINEL, self.capacity);
        }
        self.retired.store(true, Ordering::Release);
    }
}

impl Drop for CodeChunk {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.buffer as *mut libc::c_void, self.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk() -> CodeChunk {
        let bytes = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]; // mov eax,42; ret
        let slots = vec![
            ChunkSlot { guest_eip: 0x1000, host_offset: 0, host_len: 5, is_exit_site: false },
            ChunkSlot { guest_eip: 0x1005, host_offset: 5, host_len: 1, is_exit_site: false },
        ];
        CodeChunk::allocate(0x1000, 0x1006, slots, Vec::new(), &bytes).unwrap()
    }

    #[test]
    fn host_addr_round_trips_to_guest_eip() {
        let chunk = sample_chunk();
        let host = chunk.host_addr_for_eip(0x1005).unwrap();
        assert_eq!(chunk.guest_eip_for_host_addr(host), Some(0x1005));
        assert_eq!(chunk.guest_eip_for_host_addr(host + 1), None);
    }

    #[test]
    fn retirement_fills_sentinel_and_marks_retired() {
        let chunk = sample_chunk();
        assert!(!chunk.is_retired());
        chunk.retire();
        assert!(chunk.is_retired());
        let bytes = unsafe { std::slice::from_raw_parts(chunk.host_entry(), 6) };
        assert!(bytes.iter().all(|&b| b == RETIRED_SENTINEL));
    }

    #[test]
    fn patch_slot_rejects_oversized_replacement() {
        let chunk = sample_chunk();
        let err = chunk.patch_slot(0x1005, &[0x90, 0x90]).unwrap_err();
        assert!(matches!(err, ChunkError::SlotTooSmall { .. }));
    }

    #[test]
    fn exit_sentinel_patch_is_observable() {
        let chunk = sample_chunk();
        chunk.patch_slot_to_exit_sentinel(0x1005);
        let slot = chunk.slot_for_host_addr(chunk.host_addr_for_eip(0x1005).unwrap()).unwrap();
        assert!(slot.is_exit_site);
    }
}
