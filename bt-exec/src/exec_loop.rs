//! The execution loop: `while (true) { ... }` driving one guest thread
//! through translated code, fault recovery, and chunk lookup — `setjmp`
//! the anchor, jump into the current chunk, and on return (via `longjmp`
//! from the signal handler) look at why before deciding whether to keep
//! looping.

use tracing::error;

use bt_chunk::HostMappedGuestBytes;

use crate::fault::ActiveFaultGuard;
use crate::process::{GuestProcess, GuestThread};
use crate::resume_point::{enter_chunk, UnwindReason};
use crate::sink::GuestFaultSink;

/// Drives `thread` until `CpuState::is_terminating` is observed (either set
/// by this thread itself via [`terminate_current_thread`] or by another
/// thread via [`terminate_other_thread`]).
pub struct ExecutionLoop;

impl ExecutionLoop {
    /// Binds `(process, thread, sink)` to this host thread
    /// for the duration of the loop so the fault handler installed by
    /// [`crate::fault::install_handlers`] can find them.
    pub fn run(process: &GuestProcess, thread: &GuestThread, sink: &dyn GuestFaultSink) {
        crate::fault::install_handlers();
        // Safety: `process`, `thread`, and `sink` all outlive this call —
        // they're borrowed for its entire body, and the guard is dropped
        // before `run` returns.
        let _guard = unsafe { ActiveFaultGuard::enter(process, thread, sink) };

        while !thread.cpu.is_terminating() {
            let outcome = thread.cpu.resume.mark_and_run(|| {
                let host_entry = Self::resolve_current_chunk(process, thread, sink);
                // Never returns: every chunk ends in a trap that either
                // resumes in place (handled entirely inside the signal
                // handler) or longjmps back to `mark_and_run`'s anchor.
                unsafe { enter_chunk(host_entry as *const u8, thread.cpu.gpr_base_ptr()) }
            });

            match outcome {
                Ok(()) => unreachable!("enter_chunk must not return normally"),
                Err(UnwindReason::Terminating) => break,
                Err(UnwindReason::ExitToLoop) => {
                    process.drop_previous_memory();
                    thread.cpu.set_exit_to_loop(false);
                }
                Err(UnwindReason::InException) => {
                    thread.cpu.set_in_exception(false);
                }
            }
        }
    }

    fn resolve_current_chunk(process: &GuestProcess, thread: &GuestThread, sink: &dyn GuestFaultSink) -> usize {
        let guest_eip = thread.cpu.guest_eip_address();
        if let Some(host) = process.cache.host_address_for(guest_eip) {
            return host;
        }
        crate::fault::ensure_readable_code(process, guest_eip, sink, false);
        let region = process.memory.region();
        let src = HostMappedGuestBytes::new(region);
        match process.cache.translate_and_install(&process.memory, &src, guest_eip) {
            Ok(host) => host,
            Err(e) => {
                error!(guest_eip, error = %e, "failed to translate the guest thread's entry chunk");
                std::process::abort();
            }
        }
    }
}

/// `terminateCurrentThread`: called by the thread itself,
/// typically from inside a `GuestFaultSink` implementation that decided the
/// guest process is exiting. Never returns.
pub fn terminate_current_thread(thread: &GuestThread) -> ! {
    thread.cpu.set_terminating(true);
    thread.cpu.resume.jump(UnwindReason::Terminating);
}

/// `terminateOtherThread`: sets the flag, then sends
/// [`crate::fault::UNWIND_SIGNAL`] to force the victim out of translated
/// code even if it isn't about to fault on its own (e.g. a tight loop with
/// no memory access). `native_tid` is the victim's `pthread_self()` value,
/// captured when that thread's [`ExecutionLoop::run`] started.
pub fn terminate_other_thread(thread: &GuestThread, native_tid: libc::pthread_t) {
    thread.cpu.set_terminating(true);
    unsafe {
        libc::pthread_kill(native_tid, crate::fault::UNWIND_SIGNAL);
    }
}
