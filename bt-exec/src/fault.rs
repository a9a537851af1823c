//! Fault dispatch: the host signal handler, driven by
//! `(hostIp, faultingHostAddress, isRead)`. Installed once per process — for
//! the single-threaded guest build that's the only host thread there'll ever
//! be; for the multi-threaded build every host thread ends up here too,
//! since `sigaction` handlers are process-wide but each thread's
//! [`crate::resume_point::ResumePoint`] and [`ActiveFaultGuard`] context are
//! thread-local.
//!
//! Uses `sigaltstack` + `sigaction` with `SA_SIGINFO` for registration.

use std::cell::Cell;
use std::mem::MaybeUninit;

use bt_chunk::{HostMappedGuestBytes, LIVE_EXIT_SENTINEL, RETIRED_SENTINEL};
use guest_memory::{CodeWriteOutcome, GuestFlags};
use tracing::{debug, error, trace};
use x86_decode::{Decoder, Opcode};

use crate::interpret::interpret_exit_site;
use crate::process::{GuestProcess, GuestThread};
use crate::resume_point::UnwindReason;
use crate::sink::GuestFaultSink;

/// The live thread-local binding the signal handler reads to recover
/// everything it needs. A raw pointer, not a reference, because its
/// pointee's lifetime is "as long as `ActiveFault::enter` holds the guard",
/// which outlives any single call into translated code but not the thread
/// itself — exactly the shape a thread-local can express and a borrow
/// checker can't.
#[derive(Clone, Copy)]
struct ActiveFaultPtr {
    process: *const GuestProcess,
    thread: *const GuestThread,
    sink: *const (dyn GuestFaultSink + 'static),
}

thread_local! {
    static ACTIVE: Cell<Option<ActiveFaultPtr>> = const { Cell::new(None) };
}

/// RAII guard binding `(process, thread, sink)` to this thread for the
/// duration of the translated-code region the fault handler might fire
/// during. Constructed once per [`crate::exec_loop::ExecutionLoop::run`]
/// call.
pub struct ActiveFaultGuard {
    previous: Option<ActiveFaultPtr>,
}

impl ActiveFaultGuard {
    /// # Safety
    /// `process`, `thread`, and `sink` must outlive this guard.
    pub unsafe fn enter(process: &GuestProcess, thread: &GuestThread, sink: &dyn GuestFaultSink) -> Self {
        let sink: *const (dyn GuestFaultSink + 'static) = std::mem::transmute(sink as *const dyn GuestFaultSink);
        let previous = ACTIVE.with(|cell| {
            cell.replace(Some(ActiveFaultPtr { process, thread, sink }))
        });
        Self { previous }
    }
}

impl Drop for ActiveFaultGuard {
    fn drop(&mut self) {
        ACTIVE.with(|cell| cell.set(self.previous.take()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuExceptionKind {
    Divide,
    DivideOverflow,
    Fpu(u32),
}

/// Installs the fault handler for `SIGSEGV` and `SIGILL` (items 1 and 3
/// both run through this single entry point — see the module doc for why)
/// and for `SIGFPE` (item "FPU traps"). Idempotent: safe to
/// call once per process; later calls are no-ops.
pub fn install_handlers() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| unsafe {
        ensure_sigaltstack();
        install_one(libc::SIGSEGV, handle_signal as usize);
        install_one(libc::SIGILL, handle_signal as usize);
        install_one(libc::SIGFPE, handle_signal as usize);
        install_one(UNWIND_SIGNAL, handle_unwind_signal as usize);
    });
}

unsafe fn ensure_sigaltstack() {
    let mut stack: libc::stack_t = MaybeUninit::zeroed().assume_init();
    if libc::sigaltstack(std::ptr::null(), &mut stack) == -1 {
        return;
    }
    if stack.ss_flags & libc::SS_DISABLE == 0 {
        return;
    }
    const ALT_STACK_SIZE: usize = 256 * 1024;
    let buf = Box::leak(vec![0u8; ALT_STACK_SIZE].into_boxed_slice());
    let new_stack = libc::stack_t {
        ss_sp: buf.as_mut_ptr() as *mut libc::c_void,
        ss_flags: 0,
        ss_size: ALT_STACK_SIZE,
    };
    libc::sigaltstack(&new_stack, std::ptr::null_mut());
}

unsafe fn install_one(signum: i32, handler: usize) {
    let mut action: libc::sigaction = MaybeUninit::zeroed().assume_init();
    action.sa_sigaction = handler;
    // SA_NODEFER: fault recovery can itself fault ("a recursive
    // mutex is required because fault handlers re-enter code-cache
    // mutation while already holding it"; the same re-entrancy applies at
    // the signal-delivery level when, e.g., growing the stack touches a
    // page that itself needs another round of fault handling).
    action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_ONSTACK;
    libc::sigemptyset(&mut action.sa_mask);
    if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
        error!(signum, error = %std::io::Error::last_os_error(), "sigaction failed");
        std::process::abort();
    }
}

extern "C" fn handle_signal(signum: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    let Some(active) = ACTIVE.with(|c| c.get()) else {
        error!(signum, "fault delivered with no active guest thread bound to this host thread");
        std::process::abort();
    };
    // Safety: the pointers in `active` are kept alive by `ActiveFaultGuard`
    // for exactly the dynamic extent a signal can fire during.
    let process = unsafe { &*active.process };
    let thread = unsafe { &*active.thread };
    let sink = unsafe { &*active.sink };

    if signum == libc::SIGFPE {
        let si_code = unsafe { (*info).si_code };
        let kind = match si_code {
            libc::FPE_INTDIV => CpuExceptionKind::Divide,
            libc::FPE_INTOVF => CpuExceptionKind::DivideOverflow,
            other => CpuExceptionKind::Fpu(other as u32),
        };
        deliver_cpu_exception(process, thread, sink, kind);
    }

    let ucontext = context as *mut libc::ucontext_t;
    let host_ip = unsafe { (*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] } as usize;
    let fault_addr = unsafe { (*info).si_addr() } as usize;
    let is_write = unsafe { (*ucontext).uc_mcontext.gregs[libc::REG_ERR as usize] & 0x2 != 0 };

    // Copy-through translated code runs on the real `eax`/`ecx`/`edx`/`ebx`
    // (loaded in by `resume_point::enter_chunk`'s asm, see `CpuState::
    // gpr_base_ptr`), so whatever it last wrote only exists in this trap's
    // `ucontext_t` until we pull it into `CpuState` here — before any
    // dispatch logic (e.g. `handle_code_patch`'s string-op rewind) looks at
    // `thread.cpu.reg(..)` expecting the live value.
    sync_gprs_from_ucontext(thread, ucontext);

    match dispatch(process, thread, sink, host_ip, fault_addr, is_write, signum) {
        Dispatch::Resume(new_rip) => {
            // The opposite direction: `dispatch` may have retranslated and
            // may resume execution at `new_rip` inside more copy-through
            // code expecting `CpuState`'s current values in real registers.
            // Returning from this handler resumes the *same* interrupted
            // hardware context (just retargeted), so these have to land in
            // `ucontext_t`, not merely in `CpuState`.
            sync_gprs_to_ucontext(thread, ucontext);
            unsafe { (*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] = new_rip as i64 };
        }
        Dispatch::RetryFaultingInstruction => {}
        Dispatch::Fatal(msg) => {
            error!(host_ip, fault_addr, is_write, "{msg}");
            std::process::abort();
        }
    }
}

/// The four registers `resume_point::enter_chunk` bridges to real hardware,
/// read out of a trap's `ucontext_t` into `CpuState` (see
/// `CpuState::gpr_base_ptr`).
fn sync_gprs_from_ucontext(thread: &GuestThread, ucontext: *mut libc::ucontext_t) {
    let gregs = unsafe { (*ucontext).uc_mcontext.gregs };
    thread.cpu.set_reg(x86_decode::Reg::Eax, gregs[libc::REG_RAX as usize] as u32);
    thread.cpu.set_reg(x86_decode::Reg::Ecx, gregs[libc::REG_RCX as usize] as u32);
    thread.cpu.set_reg(x86_decode::Reg::Edx, gregs[libc::REG_RDX as usize] as u32);
    thread.cpu.set_reg(x86_decode::Reg::Ebx, gregs[libc::REG_RBX as usize] as u32);
}

fn sync_gprs_to_ucontext(thread: &GuestThread, ucontext: *mut libc::ucontext_t) {
    unsafe {
        (*ucontext).uc_mcontext.gregs[libc::REG_RAX as usize] = thread.cpu.reg(x86_decode::Reg::Eax) as i64;
        (*ucontext).uc_mcontext.gregs[libc::REG_RCX as usize] = thread.cpu.reg(x86_decode::Reg::Ecx) as i64;
        (*ucontext).uc_mcontext.gregs[libc::REG_RDX as usize] = thread.cpu.reg(x86_decode::Reg::Edx) as i64;
        (*ucontext).uc_mcontext.gregs[libc::REG_RBX as usize] = thread.cpu.reg(x86_decode::Reg::Ebx) as i64;
    }
}

/// The signal used purely to interrupt a thread stuck running translated
/// code so it can observe `CpuState::is_terminating` (`terminateOtherThread`:
/// setting the flag alone doesn't help a thread that's mid-chunk and won't
/// fault again any time soon).
pub const UNWIND_SIGNAL: libc::c_int = libc::SIGUSR1;

extern "C" fn handle_unwind_signal(_signum: libc::c_int, _info: *mut libc::siginfo_t, _context: *mut libc::c_void) {
    let Some(active) = ACTIVE.with(|c| c.get()) else { return };
    let thread = unsafe { &*active.thread };
    if thread.cpu.is_terminating() {
        thread.cpu.resume.jump(UnwindReason::Terminating);
    }
}

enum Dispatch {
    Resume(usize),
    RetryFaultingInstruction,
    Fatal(&'static str),
}

fn dispatch(
    process: &GuestProcess,
    thread: &GuestThread,
    sink: &dyn GuestFaultSink,
    host_ip: usize,
    fault_addr: usize,
    is_write: bool,
    signum: libc::c_int,
) -> Dispatch {
    // Read the byte(s) at the faulting instruction regardless of which
    // signal delivered us here: a `0xCD`/`0xCE` pattern means "stale or
    // unresolved chunk site", independent of whether the host happened to
    // raise #UD or #GP for it (item 3's check is on the byte,
    // not the signal number).
    if let Some(guest_eip) = process.cache.guest_eip_for_host_addr(host_ip) {
        let byte = unsafe { *(host_ip as *const u8) };
        if byte == LIVE_EXIT_SENTINEL {
            return handle_unresolved_exit_site(process, thread, sink, guest_eip);
        }
        if byte == RETIRED_SENTINEL || process.cache.is_retired_host_addr(host_ip) {
            return handle_stale_chunk(process, thread, sink, guest_eip);
        }
    }

    if signum != libc::SIGSEGV {
        // SIGFPE is intercepted above before `dispatch` is ever called; a
        // SIGILL reaching here decoded to neither sentinel byte.
        return Dispatch::Fatal("illegal-instruction trap at an address with no recognised sentinel");
    }

    let region = process.memory.region();
    let region_start = region.base() as usize;
    let region_end = region_start + guest_memory::REGION_SIZE;
    if fault_addr < region_start || fault_addr >= region_end {
        return Dispatch::Fatal("SIGSEGV outside the guest region and not on a recognised sentinel");
    }
    let guest_addr = (fault_addr - region_start) as u32;
    let fault_page = guest_addr >> guest_memory::PAGE_SHIFT;

    if thread.stack.contains_uncommitted(fault_page) {
        debug!(fault_page, "growing guest stack");
        if let Err(e) = thread.stack.grow(&process.memory, fault_page) {
            return fatal_memory_error(e);
        }
        return Dispatch::RetryFaultingInstruction;
    }

    let Some(owning_eip) = process.cache.guest_eip_for_host_addr(host_ip) else {
        // No live chunk covers `host_ip` at all: this host thread isn't
        // executing translated code, which should be impossible for a
        // guest-region fault reached through this handler.
        return Dispatch::Fatal("guest-region fault with no owning chunk for the faulting host ip");
    };

    let page_is_code_readonly = process.memory.is_code_read_only(fault_page);
    if page_is_code_readonly && is_write {
        return handle_code_patch(process, thread, sink, owning_eip, guest_addr);
    }

    thread.cpu.eip.set(owning_eip.wrapping_sub(thread.cpu.cs_address.get()));
    let was_read = !is_write;
    if is_mapped_at_all(&process.memory, guest_addr) {
        sink.seg_access(guest_addr, was_read, is_write, true);
    } else {
        sink.seg_mapper(guest_addr, was_read, is_write, true);
    }
}

fn is_mapped_at_all(memory: &guest_memory::GuestMemory, guest_addr: u32) -> bool {
    memory.guest_flags(guest_addr >> guest_memory::PAGE_SHIFT).contains(GuestFlags::ALLOCATED)
}

/// Guards every path that is about to hand a guest address to the
/// translator: the decoder trusts its `GuestByteSource` to be readable
/// (`bt_chunk::HostMappedGuestBytes`'s doc comment: "an out-of-range read
/// would itself be a guest code fault, handled one layer up ... before
/// translation is ever invoked"). Without this check, jumping to an
/// unmapped or non-executable guest address would fault *inside* the
/// translator's raw memory read, which runs with no `sigsetjmp` anchor of
/// its own when reached recursively from the fault handler (item 3 is only
/// reachable because this check ran first). Diverges via
/// `sink` if `eip` isn't executable; otherwise returns normally.
pub(crate) fn ensure_readable_code(process: &GuestProcess, eip: u32, sink: &dyn GuestFaultSink, from_handler: bool) {
    let flags = process.memory.guest_flags(eip >> guest_memory::PAGE_SHIFT);
    if flags.contains(GuestFlags::EXEC) {
        return;
    }
    if flags.contains(GuestFlags::ALLOCATED) {
        sink.seg_access(eip, true, false, from_handler);
    } else {
        sink.seg_mapper(eip, true, false, from_handler);
    }
}

fn fatal_memory_error(e: guest_memory::MemoryError) -> Dispatch {
    error!(error = %e, "host OS rejected an mprotect/mmap call mid-fault-recovery");
    Dispatch::Fatal("host OS rejected mprotect/mmap")
}

/// item 2 + the indirect/cross-chunk-branch half of item 3:
/// the slot at `guest_eip` was left as a live-exit sentinel, either because
/// it's one of the instructions this workspace always interprets
/// (`push`/`pop`/`ret`/`call`/`rep movs`/`stos`/register-indirect jump) or
/// because it's a cross-chunk direct branch whose target wasn't resolved
/// at commit time.
fn handle_unresolved_exit_site(process: &GuestProcess, thread: &GuestThread, sink: &dyn GuestFaultSink, guest_eip: u32) -> Dispatch {
    let region = process.memory.region();
    let src = HostMappedGuestBytes::new(region);
    let op = Decoder::new().decode(&src, guest_eip);

    let next_guest_eip = match op.opcode {
        Opcode::PushReg { .. }
        | Opcode::PopReg { .. }
        | Opcode::Ret
        | Opcode::CallRel32 { .. }
        | Opcode::JmpIndirectReg { .. }
        | Opcode::RepMovsD { .. }
        | Opcode::RepStosD { .. }
        | Opcode::MovAbsMem8Imm8 { .. } => {
            thread.cpu.eip.set(guest_eip.wrapping_sub(thread.cpu.cs_address.get()));
            interpret_exit_site(&thread.cpu, &process.memory, &process.cache).0
        }
        _ => match op.branch_target() {
            Some(target) => target as u32,
            None => return Dispatch::Fatal("exit-site slot decoded to a non-branching, non-interpretable opcode"),
        },
    };

    thread.cpu.eip.set(next_guest_eip.wrapping_sub(thread.cpu.cs_address.get()));
    resolve_and_resume(process, sink, next_guest_eip)
}

/// item 3, `0xCD` byte: the chunk this thread was about to run
/// was retired by another thread between this thread reading its entry
/// host address and resuming here (the S4 "retired chunk race" scenario).
fn handle_stale_chunk(process: &GuestProcess, thread: &GuestThread, sink: &dyn GuestFaultSink, guest_eip: u32) -> Dispatch {
    trace!(guest_eip, "resuming into a retired chunk, relocating");
    resolve_and_resume(process, sink, guest_eip)
}

/// item 1, "code patch" path: a write landed on a
/// `CODEPAGE_READONLY` page. Rewinds a string op if one was mid-flight,
/// retires every chunk overlapping the page, drops the read-only
/// protection, and resumes at the same guest eip (retranslated on demand).
fn handle_code_patch(process: &GuestProcess, thread: &GuestThread, sink: &dyn GuestFaultSink, owning_eip: u32, fault_addr: u32) -> Dispatch {
    let region = process.memory.region();
    let src = HostMappedGuestBytes::new(region);
    let op = Decoder::new().decode(&src, owning_eip);

    if op.is_string_op() {
        let mut esi = thread.cpu.reg(x86_decode::Reg::Esi);
        let mut edi = thread.cpu.reg(x86_decode::Reg::Edi);
        // Exactly which iteration was in flight when the write landed isn't
        // tracked anywhere (this crate doesn't keep the string op's
        // original `ecx`), so this rewinds by one element rather than the
        // true count; see DESIGN.md.
        bt_chunk::Translator::rewind_string_op(&op, 1, &mut esi, &mut edi);
        thread.cpu.set_reg(x86_decode::Reg::Esi, esi);
        thread.cpu.set_reg(x86_decode::Reg::Edi, edi);
    }

    let page = fault_addr >> guest_memory::PAGE_SHIFT;
    match process.cache.clear_host_code_for_writing(&process.memory, page, 1) {
        Ok(CodeWriteOutcome::BecamePermanentlyDynamic) => {
            debug!(page, "page declared permanently dynamic during code patch");
        }
        Ok(CodeWriteOutcome::StillTrackable) => {}
        Err(e) => {
            error!(error = %e, "clearHostCodeForWriting failed during code-patch recovery");
            return Dispatch::Fatal("clearHostCodeForWriting failed");
        }
    }

    thread.cpu.eip.set(owning_eip.wrapping_sub(thread.cpu.cs_address.get()));
    resolve_and_resume(process, sink, owning_eip)
}

fn resolve_and_resume(process: &GuestProcess, sink: &dyn GuestFaultSink, guest_eip: u32) -> Dispatch {
    if let Some(host) = process.cache.host_address_for(guest_eip) {
        return Dispatch::Resume(host);
    }
    ensure_readable_code(process, guest_eip, sink, true);
    let region = process.memory.region();
    let src = HostMappedGuestBytes::new(region);
    match process.cache.translate_and_install(&process.memory, &src, guest_eip) {
        Ok(host) => Dispatch::Resume(host),
        Err(e) => {
            error!(guest_eip, error = %e, "failed to translate code during fault recovery");
            Dispatch::Fatal("translation failed during fault recovery")
        }
    }
}

/// "FPU traps": lifted to a guest `DIVIDE` exception (integer
/// divide/overflow) or an FPU exception, routed through the same
/// `GuestFaultSink` seam as page faults; the current chunk is left intact.
pub fn deliver_cpu_exception(process: &GuestProcess, thread: &GuestThread, sink: &dyn GuestFaultSink, kind: CpuExceptionKind) -> ! {
    let _ = (process, kind);
    thread.cpu.set_in_exception(true);
    sink.seg_access(thread.cpu.guest_eip_address(), true, false, true)
}
