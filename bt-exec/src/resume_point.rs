//! Safe-ish wrapper over the `sigsetjmp`/`siglongjmp` shim in `ffi/resume_point.c`.

use std::ptr::NonNull;

extern "C" {
    fn dbt_resume_point_new() -> *mut RawResumePoint;
    fn dbt_resume_point_free(p: *mut RawResumePoint);
    fn dbt_resume_point_set(p: *mut RawResumePoint) -> i32;
    fn dbt_resume_point_jump(p: *mut RawResumePoint, reason: i32) -> !;
    fn dbt_enter_chunk(target: *mut libc::c_void, regs: *mut u32);
}

#[repr(C)]
struct RawResumePoint {
    _opaque: [u8; 0],
}

/// Why control unwound to the [`ResumePoint`] anchor, mirroring the three
/// cases `run()` loop checks after `setjmp`: the guest thread
/// is terminating, it's exiting back to the start-thread loop (an `execve`-
/// style memory swap), or it ran a guest exception handler that
/// itself faulted while `inException` was already set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindReason {
    Terminating,
    ExitToLoop,
    InException,
}

impl UnwindReason {
    fn to_code(self) -> i32 {
        match self {
            UnwindReason::Terminating => 1,
            UnwindReason::ExitToLoop => 2,
            UnwindReason::InException => 3,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(UnwindReason::Terminating),
            2 => Some(UnwindReason::ExitToLoop),
            3 => Some(UnwindReason::InException),
            _ => None,
        }
    }
}

/// One guest thread's "fastjump anchor": the point the fault
/// handler jumps back to when a fault can't be resolved by simply fixing up
/// registers and resuming translated code in place.
///
/// Must live at a stable address for as long as any signal might jump to it,
/// so it boxes its C-owned buffer rather than embedding it inline (a `mem`
/// move of a live `sigjmp_buf` is undefined behavior).
pub struct ResumePoint {
    raw: NonNull<RawResumePoint>,
}

// Safety: the only mutation is through `sigsetjmp`/`siglongjmp`, both
// re-entrant and safe to call from a signal handler; the thread that owns a
// `ResumePoint` is the only one that ever calls into it.
unsafe impl Send for ResumePoint {}

impl ResumePoint {
    pub fn new() -> Self {
        let raw = unsafe { dbt_resume_point_new() };
        Self {
            raw: NonNull::new(raw).expect("calloc for resume point failed"),
        }
    }

    /// Marks this point as the current jump target and calls `body`. If
    /// `body` runs to completion, returns `Ok(())`. If a signal handler
    /// later calls [`jump`](ResumePoint::jump) on this same point (from
    /// this thread), control resumes here instead, and this returns
    /// `Err(reason)`.
    ///
    /// # Safety
    /// `body` must not unwind past this call via a Rust panic while a
    /// `sigjmp_buf` set by a previous call is still the active target —
    /// ordinary recursion (one call after another returns) is fine.
    pub fn mark_and_run(&self, body: impl FnOnce()) -> Result<(), UnwindReason> {
        let code = unsafe { dbt_resume_point_set(self.raw.as_ptr()) };
        if code == 0 {
            body();
            Ok(())
        } else {
            Err(UnwindReason::from_code(code).expect("unrecognised resume code"))
        }
    }

    /// Jumps back to the most recent live [`mark_and_run`] call on this
    /// point. Only ever called from this thread's own fault handler frame.
    /// Never returns.
    pub fn jump(&self, reason: UnwindReason) -> ! {
        unsafe { dbt_resume_point_jump(self.raw.as_ptr(), reason.to_code()) }
    }

    pub fn as_raw(&self) -> usize {
        self.raw.as_ptr() as usize
    }
}

impl Default for ResumePoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ResumePoint {
    fn drop(&mut self) {
        unsafe { dbt_resume_point_free(self.raw.as_ptr()) }
    }
}

/// Transfers control to translated code at `host_entry`. Per the execution
/// loop's contract, control transfer into the host buffer is direct (treat
/// chunk entry as a host-callable function). This call only returns if `host_entry` itself
/// somehow returned normally, which every chunk this workspace emits never
/// does (every chunk ends in a trapping sentinel) — if it ever does, that is
/// an invariant violation serious enough to warrant a panic one level up
/// rather than silently falling through.
///
/// `regs` must point at a guest thread's `CpuState::gpr_base_ptr()`: its
/// first four 32-bit slots (`eax`/`ecx`/`edx`/`ebx`) are loaded into the
/// real host registers immediately before the jump, the only register
/// bridge copy-through translated code gets (see `CpuState::gpr_base_ptr`).
///
/// # Safety
/// `host_entry` must point at the start of a live, executable code chunk.
/// `regs` must be valid for reads for at least 4 `u32`s for the duration of
/// this call.
pub unsafe fn enter_chunk(host_entry: *const u8, regs: *mut u32) {
    dbt_enter_chunk(host_entry as *mut libc::c_void, regs);
}
