use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

use x86_decode::Reg;

use crate::resume_point::ResumePoint;

/// EFLAGS bits this workspace's interpreter and translator care about.
/// Far from the full x86 flag set, but enough to drive `handleStringOp`'s
/// direction (`DF`) and the divide/overflow scenarios the FPU-trap path lifts.
pub const FLAG_DF: u32 = 1 << 10;
pub const FLAG_OF: u32 = 1 << 11;

/// Per-guest-thread CPU state.
///
/// Registers and `eip` are `Cell`s rather than plain fields: the fault
/// handler mutates them from what is, control-flow-wise, still "inside"
/// whatever function last touched them (a signal can land between any two
/// instructions), so every access goes through a type that makes interior
/// mutation explicit instead of requiring `&mut self` everywhere. The three
/// latches are `AtomicBool` because `terminating` specifically is set from
/// *another* thread (`terminateOtherThread`, driven by the execution loop).
pub struct CpuState {
    regs: [Cell<u32>; 8],
    pub cs_address: Cell<u32>,
    pub es_address: Cell<u32>,
    pub eflags: Cell<u32>,
    pub eip: Cell<u32>,

    in_exception: AtomicBool,
    exit_to_loop: AtomicBool,
    terminating: AtomicBool,

    pub resume: ResumePoint,
}

impl CpuState {
    pub fn new() -> Self {
        Self {
            regs: Default::default(),
            cs_address: Cell::new(0),
            es_address: Cell::new(0),
            eflags: Cell::new(0),
            eip: Cell::new(0),
            in_exception: AtomicBool::new(false),
            exit_to_loop: AtomicBool::new(false),
            terminating: AtomicBool::new(false),
            resume: ResumePoint::new(),
        }
    }

    pub fn reg(&self, r: Reg) -> u32 {
        self.regs[r.index()].get()
    }

    pub fn set_reg(&self, r: Reg, value: u32) {
        self.regs[r.index()].set(value);
    }

    /// Raw pointer to the first of the 8 `Cell<u32>` registers, in
    /// `Reg::ALL` order with a 4-byte stride (`Cell<u32>` and `u32` share a
    /// representation). `resume_point::enter_chunk` uses this to load
    /// `eax`/`ecx`/`edx`/`ebx` into the real host registers immediately
    /// before jumping into a copy-through-translated chunk, and `fault.rs`
    /// uses it to read them back out of the trapping `ucontext_t`: those
    /// four are the only ones copy-through code (`MovRegImm32`/
    /// `ArithRegImm32`) is allowed to reference. `esp`/`ebp`/`esi`/`edi`
    /// stay host-owned between traps — every guest instruction that touches
    /// them (`push`/`pop`/`ret`/`call`/`rep movs`/`stos`) is always routed
    /// to `interpret.rs` instead, so this crate's `Cell`s are their only
    /// writer and real hardware's values for them are never read back (see
    /// DESIGN.md).
    pub(crate) fn gpr_base_ptr(&self) -> *mut u32 {
        self.regs.as_ptr() as *mut u32
    }

    /// Guest eip combined with the current code-segment base ("Guest eip").
    pub fn guest_eip_address(&self) -> u32 {
        self.cs_address.get().wrapping_add(self.eip.get())
    }

    pub fn direction(&self) -> i32 {
        if self.eflags.get() & FLAG_DF != 0 {
            -1
        } else {
            1
        }
    }

    pub fn is_in_exception(&self) -> bool {
        self.in_exception.load(Ordering::Acquire)
    }

    pub fn set_in_exception(&self, value: bool) {
        self.in_exception.store(value, Ordering::Release);
    }

    pub fn is_exit_to_loop(&self) -> bool {
        self.exit_to_loop.load(Ordering::Acquire)
    }

    pub fn set_exit_to_loop(&self, value: bool) {
        self.exit_to_loop.store(value, Ordering::Release);
    }

    /// Observed by the victim thread at its next fault-recovery or
    /// chunk-boundary exit.
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    /// Called from another thread by `terminate_other_thread`, and by the
    /// owning thread itself via `terminate_current_thread`.
    pub fn set_terminating(&self, value: bool) {
        self.terminating.store(value, Ordering::Release);
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: every field is either an atomic or a `Cell` of a `Copy` type, and
// callers are expected to synchronise cross-thread access per the
// concurrency model's suspension rules (only the three latches and
// `ResumePoint::jump` are ever touched from a thread other than the one the
// `CpuState` belongs to).
unsafe impl Sync for CpuState {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_eip_address_adds_segment_base() {
        let cpu = CpuState::new();
        cpu.cs_address.set(0x8000_0000);
        cpu.eip.set(0x1000);
        assert_eq!(cpu.guest_eip_address(), 0x8000_1000);
    }

    #[test]
    fn direction_flag_selects_step() {
        let cpu = CpuState::new();
        assert_eq!(cpu.direction(), 1);
        cpu.eflags.set(FLAG_DF);
        assert_eq!(cpu.direction(), -1);
    }

    #[test]
    fn terminating_latch_is_observable_cross_thread() {
        use std::sync::Arc;
        let cpu = Arc::new(CpuState::new());
        let other = Arc::clone(&cpu);
        std::thread::spawn(move || other.set_terminating(true))
            .join()
            .unwrap();
        assert!(cpu.is_terminating());
    }
}
