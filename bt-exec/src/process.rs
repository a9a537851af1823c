use std::sync::Arc;

use guest_memory::GuestMemory;
use parking_lot::Mutex;

use bt_chunk::TranslationCache;

use crate::cpu::CpuState;

/// One guest process's address space plus the translation cache built on
/// top of it ("Guest memory object": per guest memory object, two
/// associative structures are required). Bundled together because a guest
/// process may hold two of these during an `execve`-like transition: the
/// outgoing one becomes `previous_memory`.
pub struct GuestProcess {
    pub memory: GuestMemory,
    pub cache: TranslationCache,

    /// The memory space a just-completed `execve`-style transition is
    /// replacing, kept alive only until the new code's first step succeeds
    /// (execution-loop pseudocode: "drop previousMemory if refcount=1").
    /// Building the actual transition is guest-syscall territory (out of
    /// scope); this crate only implements the execution loop's half of the
    /// handshake, exposed here for that syscall layer to drive.
    previous_memory: Mutex<Option<Arc<GuestMemory>>>,
}

impl GuestProcess {
    pub fn new(memory: GuestMemory) -> Self {
        Self {
            memory,
            cache: TranslationCache::new(),
            previous_memory: Mutex::new(None),
        }
    }

    pub fn set_previous_memory(&self, previous: Arc<GuestMemory>) {
        *self.previous_memory.lock() = Some(previous);
    }

    /// Execution-loop pseudocode: "drop previousMemory if refcount=1; clear exitToLoop".
    /// Rust's `Arc` makes the refcount branch in the original pseudocode
    /// unconditional: whether or not another `Arc` clone is outstanding
    /// elsewhere, dropping this crate's reference is exactly "decrement the
    /// refcount, freeing if it hits zero" — there's no manual-refcount case
    /// to special-case the way the original's intrusive refcounting needed
    /// (see DESIGN.md).
    pub fn drop_previous_memory(&self) {
        self.previous_memory.lock().take();
    }
}

/// The portion of the guest stack's reserved-but-uncommitted window that
/// dynamic-stack growth tracks per thread: a fixed reserved
/// bottom the window may never grow past, and the current committed bottom,
/// which moves down as faults grow it.
pub struct StackWindow {
    reserved_bottom_page: u32,
    committed_bottom_page: std::sync::atomic::AtomicU32,
}

impl StackWindow {
    pub fn new(reserved_bottom_page: u32, initial_committed_bottom_page: u32) -> Self {
        Self {
            reserved_bottom_page,
            committed_bottom_page: std::sync::atomic::AtomicU32::new(initial_committed_bottom_page),
        }
    }

    pub fn contains_uncommitted(&self, page: u32) -> bool {
        page >= self.reserved_bottom_page && page < self.committed_bottom_page.load(std::sync::atomic::Ordering::Acquire)
    }

    /// "Dynamic-stack growth": commits every page between
    /// `fault_page` and the current bottom, widening the window.
    pub fn grow(&self, memory: &GuestMemory, fault_page: u32) -> Result<(), guest_memory::MemoryError> {
        let current_bottom = self.committed_bottom_page.load(std::sync::atomic::Ordering::Acquire);
        let new_bottom = memory.grow_stack(fault_page, current_bottom)?;
        self.committed_bottom_page.store(new_bottom, std::sync::atomic::Ordering::Release);
        Ok(())
    }
}

/// One guest thread: its CPU state and its stack's growth window. Owns
/// neither the memory space nor the translation cache, both shared with
/// every other thread in the same guest process ("Scheduling
/// model": each guest thread maps to one `GuestThread` driven by one
/// `crate::exec_loop::ExecutionLoop`).
pub struct GuestThread {
    pub cpu: CpuState,
    pub stack: StackWindow,
}

impl GuestThread {
    pub fn new(stack: StackWindow) -> Self {
        Self { cpu: CpuState::new(), stack }
    }
}
