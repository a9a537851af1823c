//! End-to-end scenarios, each driving a real guest program through
//! translation, the execution loop, and fault recovery rather than calling
//! any one crate's internals directly. Mirrors the literal scenario
//! walkthroughs: a self-patch that changes what a chunk returns, the same
//! patch repeated until the page is declared permanently dynamic, a
//! register-driven branch to a second page, and forcing a thread out of
//! a tight native loop that never faults on its own.

use std::sync::mpsc;
use std::time::Duration;

use bt_exec::{terminate_other_thread, ExecutionLoop, GuestProcess, GuestThread, StackWindow};
use dbtcore::demo_sink::DemoSink;
use guest_memory::GuestFlags;

fn new_process() -> GuestProcess {
    let runtime = dbtcore::Runtime::new();
    let memory = runtime.new_guest_memory().expect("reserve guest region");
    GuestProcess::new(memory)
}

fn new_thread_with_stack() -> GuestThread {
    let stack = StackWindow::new(0x1FF0, 0x2000);
    GuestThread::new(stack)
}

fn setup_stack(process: &GuestProcess) -> u32 {
    process
        .memory
        .alloc_pages(0x2000, 1, GuestFlags::READ | GuestFlags::WRITE)
        .expect("commit stack page");
    (0x2000 << guest_memory::PAGE_SHIFT) + guest_memory::PAGE_SIZE as u32 - 4
}

fn write_bytes(process: &GuestProcess, addr: u32, bytes: &[u8]) {
    for (i, b) in bytes.iter().enumerate() {
        unsafe { *process.memory.host_addr(addr + i as u32) = *b };
    }
}

/// A chunk containing a direct-addressed byte store patches its own
/// immediate operand before falling through to it, so the value the guest
/// program returns in `eax` reflects the patched byte rather than the one
/// originally translated.
#[test]
fn s1_self_patch_changes_returned_value() {
    let process = new_process();
    process
        .memory
        .alloc_pages(0x10, 1, GuestFlags::READ | GuestFlags::WRITE | GuestFlags::EXEC)
        .unwrap();
    let page_base = 0x10 << guest_memory::PAGE_SHIFT;

    // mov byte ptr [page_base+8], 0x2B ; mov eax, 0x2A ; ret
    // The store targets the low byte of the `mov eax` immediate that
    // follows it, turning `mov eax, 0x2A` into `mov eax, 0x2B` by the time
    // it's (re)translated.
    let mov_imm_addr = page_base + 7 + 1;
    let mut code = vec![0xC6, 0x05];
    code.extend_from_slice(&mov_imm_addr.to_le_bytes());
    code.push(0x2B);
    code.extend_from_slice(&[0xB8, 0x2A, 0x00, 0x00, 0x00]); // mov eax, 0x2A
    code.push(0xC3); // ret
    write_bytes(&process, page_base, &code);

    let stack_top = setup_stack(&process);
    let thread = new_thread_with_stack();
    thread.cpu.eip.set(page_base);
    thread.cpu.set_reg(x86_decode::Reg::Esp, stack_top);
    let sink = DemoSink::new(&thread);

    ExecutionLoop::run(&process, &thread, &sink);

    assert_eq!(thread.cpu.reg(x86_decode::Reg::Eax), 0x2B);
    assert_eq!(process.memory.dynamic_strikes(0x10), 1);
    // Retranslation re-promotes the page once the strike count is still
    // under guest_memory::MAX_DYNAMIC_STRIKES.
    assert!(process.memory.is_code_read_only(0x10));
}

/// The same self-patch repeated until the page's strike counter saturates
/// at `guest_memory::MAX_DYNAMIC_STRIKES`, at which point the page is
/// declared permanently dynamic and stops being write-protected.
#[test]
fn s3_repeated_self_patch_declares_page_permanently_dynamic() {
    let process = new_process();
    process
        .memory
        .alloc_pages(0x10, 1, GuestFlags::READ | GuestFlags::WRITE | GuestFlags::EXEC)
        .unwrap();
    let page_base = 0x10 << guest_memory::PAGE_SHIFT;
    let stack_top = setup_stack(&process);

    // A harmless store target well away from the instructions themselves:
    // only the act of writing into the page matters, not what's there.
    let patch_target = page_base + 0xF00;

    for i in 0..(guest_memory::MAX_DYNAMIC_STRIKES as u32 + 1) {
        let mut code = vec![0xC6, 0x05];
        code.extend_from_slice(&patch_target.to_le_bytes());
        code.push(i as u8);
        code.extend_from_slice(&[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]);
        write_bytes(&process, page_base, &code);

        let thread = new_thread_with_stack();
        thread.cpu.eip.set(page_base);
        thread.cpu.set_reg(x86_decode::Reg::Esp, stack_top);
        let sink = DemoSink::new(&thread);
        ExecutionLoop::run(&process, &thread, &sink);

        assert_eq!(thread.cpu.reg(x86_decode::Reg::Eax), 0x2A);
    }

    assert_eq!(process.memory.dynamic_strikes(0x10), guest_memory::MAX_DYNAMIC_STRIKES);
    assert!(!process.memory.is_code_read_only(0x10));
    // Further translations of this page must not try (and fail) to
    // re-promote it.
    assert!(process.cache.host_address_for(page_base).is_some());
}

/// A register-indirect jump resolves through whatever `eax` holds at the
/// time, landing in a second page translated on demand.
#[test]
fn s5_register_indirect_jump_follows_live_register() {
    let process = new_process();
    process
        .memory
        .alloc_pages(0x10, 1, GuestFlags::READ | GuestFlags::WRITE | GuestFlags::EXEC)
        .unwrap();
    process
        .memory
        .alloc_pages(0x20, 1, GuestFlags::READ | GuestFlags::WRITE | GuestFlags::EXEC)
        .unwrap();
    let jump_page = 0x10 << guest_memory::PAGE_SHIFT;
    let target_page = 0x20 << guest_memory::PAGE_SHIFT;

    write_bytes(&process, jump_page, &[0xFF, 0xE0]); // jmp eax
    write_bytes(&process, target_page, &[0xB8, 0x07, 0x00, 0x00, 0x00, 0xC3]); // mov eax, 7 ; ret

    let stack_top = setup_stack(&process);
    let thread = new_thread_with_stack();
    thread.cpu.eip.set(jump_page);
    thread.cpu.set_reg(x86_decode::Reg::Esp, stack_top);
    thread.cpu.set_reg(x86_decode::Reg::Eax, target_page);
    let sink = DemoSink::new(&thread);

    ExecutionLoop::run(&process, &thread, &sink);

    assert_eq!(thread.cpu.reg(x86_decode::Reg::Eax), 7);
    assert!(process.cache.host_address_for(target_page).is_some());
    let fault = sink.last_fault.get().expect("ret with an unmapped target faults");
    assert!(fault.is_mapper);
}

/// A guest thread spinning in a tight, never-faulting native loop (`jmp $`,
/// copy-through with no trap at all) is still interruptible from another
/// thread via `terminate_other_thread`'s `SIGUSR1`.
#[test]
fn s6_terminate_other_thread_breaks_a_tight_loop() {
    let process = new_process();
    process
        .memory
        .alloc_pages(0x10, 1, GuestFlags::READ | GuestFlags::WRITE | GuestFlags::EXEC)
        .unwrap();
    let loop_page = 0x10 << guest_memory::PAGE_SHIFT;
    write_bytes(&process, loop_page, &[0xEB, 0xFE]); // jmp $

    let stack_top = setup_stack(&process);
    let thread = new_thread_with_stack();
    thread.cpu.eip.set(loop_page);
    thread.cpu.set_reg(x86_decode::Reg::Esp, stack_top);
    let sink = DemoSink::new(&thread);

    let (tid_tx, tid_rx) = mpsc::channel();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            tid_tx.send(unsafe { libc::pthread_self() }).unwrap();
            ExecutionLoop::run(&process, &thread, &sink);
        });

        let native_tid = tid_rx.recv().expect("worker thread reports its tid");
        std::thread::sleep(Duration::from_millis(100));
        terminate_other_thread(&thread, native_tid);
    });

    assert!(thread.cpu.is_terminating());
}
