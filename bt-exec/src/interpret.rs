//! Interprets the handful of opcodes the translator never copies through
//! (`translator.rs`'s `leaves_chunk`): `push`/`pop`/`ret`/`call rel32`, the
//! `rep movs/stos` string family, the direct-addressed byte store, and the
//! register-indirect jump sentinel site. These either touch the host `%rsp`
//! with an implicit 64-bit operand size that has no 32-bit encoding at all,
//! need a register read the translator can't bake into a host displacement
//! (the indirect jump), or write guest memory in a way that has to stay
//! visible to the code-patch path (the store and the string family).
//! leave the exact mechanism open ("or (preferred)
//! structure the translated code to trampoline through a small host-side
//! dispatcher"); this module is that dispatcher, invoked from the fault
//! handler when it reads one of these instructions' exit-site trap.

use guest_memory::GuestMemory;
use x86_decode::{DecodedOp, Decoder, Opcode};

use bt_chunk::TranslationCache;

use crate::cpu::CpuState;

/// Where guest execution should continue after interpreting one exit-site
/// instruction, as an absolute guest address (segment base already
/// applied, matching `DecodedOp::address`/`branch_target`) rather than an
/// offset relative to `cpu.cs_address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextEip(pub u32);

struct HostSrc<'a>(&'a GuestMemory);
impl<'a> x86_decode::GuestByteSource for HostSrc<'a> {
    fn fetch_u8(&self, addr: u32) -> u8 {
        unsafe { *self.0.host_addr(addr) }
    }
}

fn read_u32(memory: &GuestMemory, addr: u32) -> u32 {
    unsafe { (memory.host_addr(addr) as *const u32).read_unaligned() }
}

/// Interpreted exit-site instructions never go through a real host `mov`,
/// so a self-modifying write they perform (`MovAbsMem8Imm8`, in principle
/// `rep stos/movs` too) would never raise the `mprotect`-driven SIGSEGV
/// `fault.rs`'s code-patch path depends on: the write just succeeds or
/// fails against a page this interpreter reads protection bits for
/// directly. Checking here and routing through the same
/// `clear_host_code_for_writing` the fault handler uses keeps both paths
/// agreeing on what "a guest write landed on live translated code" means.
fn guard_code_write(cache: &TranslationCache, memory: &GuestMemory, addr: u32) {
    let page = addr >> guest_memory::PAGE_SHIFT;
    if !memory.is_code_read_only(page) {
        return;
    }
    if let Err(e) = cache.clear_host_code_for_writing(memory, page, 1) {
        tracing::error!(page, error = %e, "clearHostCodeForWriting failed during interpreted self-modifying write");
    }
}

fn write_u32(cache: &TranslationCache, memory: &GuestMemory, addr: u32, value: u32) {
    guard_code_write(cache, memory, addr);
    unsafe { (memory.host_addr(addr) as *mut u32).write_unaligned(value) }
}

fn write_u8(cache: &TranslationCache, memory: &GuestMemory, addr: u32, value: u8) {
    guard_code_write(cache, memory, addr);
    unsafe { *memory.host_addr(addr) = value }
}

/// Decodes and interprets the guest instruction at `cpu.eip`, mutating
/// `cpu` and `memory` as the real instruction would, and returns the guest
/// eip execution should resume at. Panics (an internal invariant failure,
/// "Decode failure ... internal invariant broken") if the
/// instruction at this address isn't one of the opcodes this module
/// understands — the translator only ever marks those as exit sites.
pub fn interpret_exit_site(cpu: &CpuState, memory: &GuestMemory, cache: &TranslationCache) -> NextEip {
    let address = cpu.guest_eip_address();
    let op = Decoder::new().decode(&HostSrc(memory), address);

    match op.opcode {
        Opcode::PushReg { reg } => {
            let esp = cpu.reg(x86_decode::Reg::Esp).wrapping_sub(4);
            write_u32(cache, memory, esp, cpu.reg(reg));
            cpu.set_reg(x86_decode::Reg::Esp, esp);
            NextEip(op.address + op.length as u32)
        }
        Opcode::PopReg { reg } => {
            let esp = cpu.reg(x86_decode::Reg::Esp);
            let value = read_u32(memory, esp);
            cpu.set_reg(reg, value);
            cpu.set_reg(x86_decode::Reg::Esp, esp.wrapping_add(4));
            NextEip(op.address + op.length as u32)
        }
        Opcode::Ret => {
            let esp = cpu.reg(x86_decode::Reg::Esp);
            let target = read_u32(memory, esp);
            cpu.set_reg(x86_decode::Reg::Esp, esp.wrapping_add(4));
            NextEip(target)
        }
        Opcode::CallRel32 { rel } => {
            let return_eip = op.address + op.length as u32;
            let esp = cpu.reg(x86_decode::Reg::Esp).wrapping_sub(4);
            write_u32(cache, memory, esp, cpu.cs_address.get().wrapping_add(return_eip));
            cpu.set_reg(x86_decode::Reg::Esp, esp);
            let target = (return_eip as i64 + rel as i64) as u32;
            NextEip(target)
        }
        Opcode::JmpIndirectReg { reg } => NextEip(cpu.reg(reg)),
        Opcode::RepMovsD { .. } | Opcode::RepStosD { .. } => {
            interpret_string_op(cpu, memory, cache, &op);
            NextEip(op.address + op.length as u32)
        }
        Opcode::MovAbsMem8Imm8 { addr, imm } => {
            write_u8(cache, memory, addr, imm);
            NextEip(op.address + op.length as u32)
        }
        other => panic!(
            "interpret_exit_site: {:?} at {:#x} is not an exit-site opcode",
            other, address
        ),
    }
}

fn interpret_string_op(cpu: &CpuState, memory: &GuestMemory, cache: &TranslationCache, op: &DecodedOp) {
    let count = cpu.reg(x86_decode::Reg::Ecx);
    let step = cpu.direction() * 4;
    let mut esi = cpu.reg(x86_decode::Reg::Esi);
    let mut edi = cpu.reg(x86_decode::Reg::Edi) + cpu.es_address.get();

    for _ in 0..count {
        match op.opcode {
            Opcode::RepMovsD { .. } => {
                let value = read_u32(memory, esi);
                write_u32(cache, memory, edi, value);
                esi = (esi as i64 + step as i64) as u32;
            }
            Opcode::RepStosD { .. } => {
                write_u32(cache, memory, edi, cpu.reg(x86_decode::Reg::Eax));
            }
            _ => unreachable!(),
        }
        edi = (edi as i64 + step as i64) as u32;
    }

    cpu.set_reg(x86_decode::Reg::Esi, esi);
    cpu.set_reg(x86_decode::Reg::Edi, edi.wrapping_sub(cpu.es_address.get()));
    cpu.set_reg(x86_decode::Reg::Ecx, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use guest_memory::{GuestFlags, MemoryIdAllocator, RegionIdAllocator};

    fn new_memory() -> GuestMemory {
        GuestMemory::new(&RegionIdAllocator::new(), MemoryIdAllocator::new().next()).unwrap()
    }

    #[test]
    fn push_then_pop_round_trips() {
        let memory = new_memory();
        memory
            .alloc_pages(0x10, 2, GuestFlags::READ | GuestFlags::WRITE | GuestFlags::EXEC)
            .unwrap();
        let code_base = 0x10 << 12;
        let stack_top = 0x11 << 12;

        // push eax ; pop ecx
        unsafe {
            *memory.host_addr(code_base) = 0x50;
            *memory.host_addr(code_base + 1) = 0x59;
        }

        let cpu = CpuState::new();
        cpu.eip.set(code_base);
        cpu.set_reg(x86_decode::Reg::Esp, stack_top);
        cpu.set_reg(x86_decode::Reg::Eax, 0xDEAD_BEEF);

        let cache = TranslationCache::new();
        let next = interpret_exit_site(&cpu, &memory, &cache);
        assert_eq!(next.0, code_base + 1);
        assert_eq!(cpu.reg(x86_decode::Reg::Esp), stack_top - 4);

        cpu.eip.set(next.0);
        let next = interpret_exit_site(&cpu, &memory, &cache);
        assert_eq!(next.0, code_base + 2);
        assert_eq!(cpu.reg(x86_decode::Reg::Ecx), 0xDEAD_BEEF);
        assert_eq!(cpu.reg(x86_decode::Reg::Esp), stack_top);
    }

    #[test]
    fn call_then_ret_round_trips_eip() {
        let memory = new_memory();
        memory
            .alloc_pages(0x10, 2, GuestFlags::READ | GuestFlags::WRITE | GuestFlags::EXEC)
            .unwrap();
        let code_base = 0x10 << 12;
        let stack_top = 0x11 << 12;

        // call +0 (targets the byte right after itself)
        unsafe {
            *memory.host_addr(code_base) = 0xE8;
            for i in 0..4 {
                *memory.host_addr(code_base + 1 + i) = 0;
            }
        }

        let cpu = CpuState::new();
        cpu.eip.set(code_base);
        cpu.set_reg(x86_decode::Reg::Esp, stack_top);

        let cache = TranslationCache::new();
        let next = interpret_exit_site(&cpu, &memory, &cache);
        assert_eq!(next.0, code_base + 5);
        assert_eq!(cpu.reg(x86_decode::Reg::Esp), stack_top - 4);

        // Simulate a `ret` at the call target: esp points at the pushed
        // return address.
        unsafe { *memory.host_addr(code_base + 5) = 0xC3 };
        cpu.eip.set(code_base + 5);
        let next = interpret_exit_site(&cpu, &memory, &cache);
        assert_eq!(next.0, code_base + 5);
        assert_eq!(cpu.reg(x86_decode::Reg::Esp), stack_top);
    }

    #[test]
    fn rep_stosd_fills_forward() {
        let memory = new_memory();
        memory
            .alloc_pages(0x10, 2, GuestFlags::READ | GuestFlags::WRITE | GuestFlags::EXEC)
            .unwrap();
        let code_base = 0x10 << 12;
        let dest = 0x11 << 12;

        unsafe {
            *memory.host_addr(code_base) = 0xF3;
            *memory.host_addr(code_base + 1) = 0xAB;
        }

        let cpu = CpuState::new();
        cpu.eip.set(code_base);
        cpu.set_reg(x86_decode::Reg::Edi, dest);
        cpu.set_reg(x86_decode::Reg::Eax, 0x1234_5678);
        cpu.set_reg(x86_decode::Reg::Ecx, 3);

        let cache = TranslationCache::new();
        interpret_exit_site(&cpu, &memory, &cache);

        assert_eq!(cpu.reg(x86_decode::Reg::Ecx), 0);
        assert_eq!(cpu.reg(x86_decode::Reg::Edi), dest + 12);
        for i in 0..3u32 {
            assert_eq!(read_u32(&memory, dest + i * 4), 0x1234_5678);
        }
    }

    #[test]
    fn direct_store_retires_chunk_covering_target_page() {
        let memory = new_memory();
        memory
            .alloc_pages(0x10, 1, GuestFlags::READ | GuestFlags::WRITE | GuestFlags::EXEC)
            .unwrap();
        let page_base = 0x10 << 12;

        // mov eax, 42 ; ret, followed by a direct byte store patching the
        // immediate's low byte to turn it into `mov eax, 43`.
        unsafe {
            *memory.host_addr(page_base) = 0xB8;
            *memory.host_addr(page_base + 1) = 0x2A;
            *memory.host_addr(page_base + 2) = 0x00;
            *memory.host_addr(page_base + 3) = 0x00;
            *memory.host_addr(page_base + 4) = 0x00;
            *memory.host_addr(page_base + 5) = 0xC3;
        }

        let cache = TranslationCache::new();
        struct Src<'a>(&'a GuestMemory);
        impl<'a> x86_decode::GuestByteSource for Src<'a> {
            fn fetch_u8(&self, addr: u32) -> u8 {
                unsafe { *self.0.host_addr(addr) }
            }
        }
        cache.translate_and_install(&memory, &Src(&memory), page_base).unwrap();
        assert!(memory.is_code_read_only(0x10));
        assert_eq!(cache.live_chunk_count(), 1);

        let cpu = CpuState::new();
        cpu.eip.set(page_base + 6);
        unsafe {
            *memory.host_addr(page_base + 6) = 0xC6;
            *memory.host_addr(page_base + 7) = 0x05;
            (memory.host_addr(page_base + 8) as *mut u32).write_unaligned(page_base + 1);
            *memory.host_addr(page_base + 12) = 0x2B;
        }

        interpret_exit_site(&cpu, &memory, &cache);

        assert_eq!(unsafe { *memory.host_addr(page_base + 1) }, 0x2B);
        assert_eq!(cache.live_chunk_count(), 0);
        assert!(!memory.is_code_read_only(0x10));
    }
}
