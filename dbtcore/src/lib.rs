//! Wires the guest address-space manager (`guest-memory`), the decoder
//! (`x86-decode`), the translation cache (`bt-chunk`), and the execution
//! loop (`bt-exec`) into a runnable emulator core.
//!
//! This crate owns the process-wide counters the design notes list
//! as "global mutable state" (`nextMemoryId`, `platformThreadCount`,
//! `dynamicCodeExceptionCount`) and insists must not become ambient
//! globals: here they live on [`Runtime`], one instance per emulator
//! process, rather than as `static` items anywhere in the workspace.

use std::sync::atomic::{AtomicU64, Ordering};

use guest_memory::{GuestMemory, MemoryIdAllocator, RegionIdAllocator};

pub mod demo_sink;
pub mod image;

/// Root object for one emulator process. Owns the monotonic id allocators
/// `guest-memory` needs to hand out distinct 4 GiB regions and memory-object
/// ids, plus the two remaining counters named above
/// (`platformThreadCount`, `dynamicCodeExceptionCount`). A real multi-guest-
/// process embedder would hold one `Runtime` for the whole emulator and one
/// `GuestProcess` (bt_exec::GuestProcess) per emulated process.
pub struct Runtime {
    region_ids: RegionIdAllocator,
    memory_ids: MemoryIdAllocator,
    platform_thread_count: AtomicU64,
    dynamic_code_exception_count: AtomicU64,
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            region_ids: RegionIdAllocator::new(),
            memory_ids: MemoryIdAllocator::new(),
            platform_thread_count: AtomicU64::new(0),
            dynamic_code_exception_count: AtomicU64::new(0),
        }
    }

    /// Reserves a fresh 4 GiB guest address space.
    pub fn new_guest_memory(&self) -> Result<GuestMemory, guest_memory::MemoryError> {
        GuestMemory::new(&self.region_ids, self.memory_ids.next())
    }

    /// Records that another host thread has joined the emulator as a guest
    /// thread driver ("Scheduling model": one OS thread per guest
    /// thread in the multi-threaded build). Returns the new total.
    pub fn note_thread_started(&self) -> u64 {
        self.platform_thread_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn note_thread_stopped(&self) -> u64 {
        self.platform_thread_count.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn platform_thread_count(&self) -> u64 {
        self.platform_thread_count.load(Ordering::Relaxed)
    }

    /// Bumped whenever a code page's strike counter saturates and it is
    /// declared permanently dynamic (rationale). Callers are
    /// expected to check `guest_memory::CodeWriteOutcome` from
    /// `bt_chunk::TranslationCache::clear_host_code_for_writing` and report
    /// here; this crate doesn't do it automatically because `bt-chunk` has
    /// no dependency on `dbtcore` (the counter is ambient-state bookkeeping
    /// for operators, not part of the recovery algorithm itself).
    pub fn note_dynamic_code_exception(&self) -> u64 {
        self.dynamic_code_exception_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn dynamic_code_exception_count(&self) -> u64 {
        self.dynamic_code_exception_count.load(Ordering::Relaxed)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_memory_ids_and_regions() {
        let runtime = Runtime::new();
        let a = runtime.new_guest_memory().unwrap();
        let b = runtime.new_guest_memory().unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.region().base() as usize, b.region().base() as usize);
    }

    #[test]
    fn thread_count_tracks_start_and_stop() {
        let runtime = Runtime::new();
        assert_eq!(runtime.note_thread_started(), 1);
        assert_eq!(runtime.note_thread_started(), 2);
        assert_eq!(runtime.note_thread_stopped(), 1);
        assert_eq!(runtime.platform_thread_count(), 1);
    }

    #[test]
    fn dynamic_code_exception_counter_increments() {
        let runtime = Runtime::new();
        assert_eq!(runtime.note_dynamic_code_exception(), 1);
        assert_eq!(runtime.dynamic_code_exception_count(), 1);
    }
}
