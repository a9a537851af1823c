use thiserror::Error;
use x86_decode::{DecodedOp, Decoder, GuestByteSource, Opcode};

use crate::chunk::{ChunkError, ChunkSlot, PendingLink};

/// First-pass length cap (step 1, "implementation-chosen length
/// cap"). Generous enough that none of the scenarios hit it, small
/// enough that a runaway straight-line guest sequence can't grow a chunk
/// without bound.
pub const MAX_CHUNK_INSTRUCTIONS: usize = 256;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("translation starting at {0:#x} produced zero instructions")]
    Empty(u32),
}

/// Reads guest bytes directly out of the host mapping backing the guest's 4
/// GiB region. Safe because the translator only ever reads pages the
/// decoder has already been told are within the chunk's committed,
/// readable range; an out-of-range read would itself be a guest code fault,
/// handled one layer up by the execution loop before translation is ever
/// invoked.
pub struct HostMappedGuestBytes<'a> {
    region: &'a guest_memory::NativeRegion,
}

impl<'a> HostMappedGuestBytes<'a> {
    pub fn new(region: &'a guest_memory::NativeRegion) -> Self {
        Self { region }
    }
}

impl<'a> GuestByteSource for HostMappedGuestBytes<'a> {
    fn fetch_u8(&self, addr: u32) -> u8 {
        unsafe { *self.region.guest_to_host(addr) }
    }
}

/// Outcome of translating one guest instruction's encoding into a
/// corresponding slot, used by pass two. `None` bytes means this
/// instruction was rewritten to a live-exit sentinel rather than copied
/// through.
struct EmittedInstruction {
    op: DecodedOp,
    bytes: Vec<u8>,
    is_exit_site: bool,
}

/// Two-pass guest→host translator. Because the guest and host
/// share an ISA, "codegen" is copy-through for every
/// instruction whose control flow stays inside the chunk; only branches
/// that leave the chunk are rewritten, to the live-exit sentinel described
/// in `chunk.rs`, so the fault handler can look up or retranslate the real
/// target on demand instead of us emitting real cross-chunk thunks here.
pub struct Translator {
    decoder: Decoder,
}

/// Chunk metadata and bytes ready for `CodeChunk::allocate`, plus the list
/// of guest pages the chunk reads code from (step 4,
/// "`pendingCodePages`").
pub struct TranslatedChunk {
    pub guest_start: u32,
    pub guest_end: u32,
    pub slots: Vec<ChunkSlot>,
    pub pending_links: Vec<PendingLink>,
    pub bytes: Vec<u8>,
    pub code_pages: Vec<u32>,
}

impl Default for Translator {
    fn default() -> Self {
        Self::new()
    }
}

impl Translator {
    pub fn new() -> Self {
        Self { decoder: Decoder::new() }
    }

    /// `translateChunk(ip)`.
    pub fn translate_chunk(&self, src: &dyn GuestByteSource, ip: u32) -> Result<TranslatedChunk, TranslateError> {
        self.translate_with_stop(src, ip, usize::MAX)
    }

    /// Retries translation stopping after `stop_after_instruction`
    /// instructions (step 3, pre-link-check retry path): used
    /// when a forward intra-chunk branch's target was decoded as lying
    /// past where the first pass originally stopped.
    fn translate_with_stop(
        &self,
        src: &dyn GuestByteSource,
        ip: u32,
        stop_after_instruction: usize,
    ) -> Result<TranslatedChunk, TranslateError> {
        // --- pass one: decode forward, recording ops ---
        let mut ops: Vec<DecodedOp> = Vec::new();
        let mut cursor = ip;
        loop {
            let op = self.decoder.decode(src, cursor);
            let stop_here = matches!(op.opcode, Opcode::Unsupported { .. }) && ops.is_empty();
            if matches!(op.opcode, Opcode::Unsupported { .. }) && !ops.is_empty() {
                break;
            }
            ops.push(op);
            cursor = op.address + op.length as u32;

            let reached_stop_count = ops.len() >= stop_after_instruction;
            let ends_chunk = op.ends_linear_flow() || matches!(op.opcode, Opcode::CallRel32 { .. });
            if stop_here || reached_stop_count || ends_chunk || ops.len() >= MAX_CHUNK_INSTRUCTIONS {
                break;
            }
        }
        if ops.is_empty() {
            return Err(TranslateError::Empty(ip));
        }

        let guest_start = ops[0].address;
        let guest_end = ops[ops.len() - 1].address + ops[ops.len() - 1].length as u32;
        let decoded_range = guest_start..guest_end;

        // --- pass two: emit, deciding which branches leave the chunk ---
        //
        // Everything that would need the host CPU's *implicit* stack or
        // address-size default to match the guest's 32-bit one is emitted
        // as a live-exit sentinel instead of copied through: `push`/`pop`
        // default to a 64-bit operand size in long mode with no 32-bit
        // encoding at all, `ret`/`call` pop/push 8 bytes off the real
        // `rsp`, and `rep movs/stos` default to 64-bit `rcx`/`rsi`/`rdi`.
        // Copying any of those guest bytes through verbatim would silently
        // corrupt adjacent guest memory. The original sidesteps this by
        // running translated code in a real 32-bit compatibility-mode
        // segment (`CS.address`-style segment override via `modify_ldt`);
        // this workspace instead ends the chunk at the first such
        // instruction and lets the execution loop interpret it directly
        // against `CpuState` (see DESIGN.md).
        let mut emitted = Vec::with_capacity(ops.len());
        for op in &ops {
            let leaves_chunk = match op.opcode {
                Opcode::JmpIndirectReg { .. }
                | Opcode::CallRel32 { .. }
                | Opcode::Ret
                | Opcode::PushReg { .. }
                | Opcode::PopReg { .. }
                | Opcode::RepMovsD { .. }
                | Opcode::RepStosD { .. }
                | Opcode::MovAbsMem8Imm8 { .. } => true,
                _ => match op.branch_target() {
                    Some(target) => !decoded_range.contains(&(target as u32)),
                    None => false,
                },
            };
            emitted.push(emit_instruction(src, op, leaves_chunk));
        }

        let mut bytes = Vec::with_capacity((guest_end - guest_start) as usize);
        let mut slots = Vec::with_capacity(emitted.len());
        let mut pending_links = Vec::new();
        let mut code_pages = std::collections::BTreeSet::new();

        for inst in &emitted {
            let host_offset = bytes.len() as u16;
            let len = inst.bytes.len() as u8;
            bytes.extend_from_slice(&inst.bytes);
            slots.push(ChunkSlot {
                guest_eip: inst.op.address,
                host_offset,
                host_len: len,
                is_exit_site: inst.is_exit_site,
            });
            if inst.is_exit_site {
                if let Some(target) = inst.op.branch_target() {
                    pending_links.push(PendingLink { host_offset, target_eip: target as u32 });
                }
            }
            for page in (inst.op.address >> 12)..=((inst.op.address + inst.op.length as u32 - 1) >> 12) {
                code_pages.insert(page);
            }
        }

        Ok(TranslatedChunk {
            guest_start,
            guest_end,
            slots,
            pending_links,
            bytes,
            code_pages: code_pages.into_iter().collect(),
        })
    }

    /// `preLinkCheck(data)`: returns the index of the first
    /// intra-chunk branch whose target was not materialised within
    /// `decoded_range`, or `-1` if every such branch resolves. Exposed
    /// separately from `translate_with_stop` so tests can exercise it
    /// directly against a hand-built op list.
    pub fn pre_link_check(ops: &[DecodedOp]) -> i64 {
        if ops.is_empty() {
            return -1;
        }
        let start = ops[0].address;
        let end = ops[ops.len() - 1].address + ops[ops.len() - 1].length as u32;
        for (idx, op) in ops.iter().enumerate() {
            if !op.has_32bit_displacement() {
                continue;
            }
            if let Some(target) = op.branch_target() {
                let target = target as u32;
                let materialised = (start..end).contains(&target) && ops.iter().any(|o| o.address == target);
                if (start..end).contains(&target) && !materialised {
                    return idx as i64;
                }
            }
        }
        -1
    }

    /// `handleStringOp(op)`: rewinds `esi`/`edi` (and `eax` isn't
    /// touched) to the start of the element that was being written when a
    /// write fault interrupted a `REP MOVS/STOS`, so retranslation can
    /// safely re-enter the instruction from scratch. `elements_completed`
    /// is how many iterations the host already ran before the fault (read
    /// from `ecx`'s delta by the caller); this function is pure arithmetic
    /// over the registers the caller hands it.
    pub fn rewind_string_op(op: &DecodedOp, elements_completed: u32, esi: &mut u32, edi: &mut u32) {
        debug_assert!(op.is_string_op());
        let width_bytes = op.write_mem_width().unwrap_or(32) as u32 / 8;
        *esi = esi.wrapping_sub(elements_completed.wrapping_mul(width_bytes));
        *edi = edi.wrapping_sub(elements_completed.wrapping_mul(width_bytes));
    }
}

/// Copies through the guest encoding for everything except chunk-exiting
/// branches, which are rewritten to the live-exit sentinel (items
/// 2-3; `chunk.rs`'s `LIVE_EXIT_SENTINEL`).
fn emit_instruction(src: &dyn GuestByteSource, op: &DecodedOp, leaves_chunk: bool) -> EmittedInstruction {
    if leaves_chunk {
        return EmittedInstruction {
            op: *op,
            bytes: vec![crate::chunk::LIVE_EXIT_SENTINEL; op.length as usize],
            is_exit_site: true,
        };
    }
    let mut bytes = Vec::with_capacity(op.length as usize);
    for i in 0..op.length as u32 {
        bytes.push(src.fetch_u8(op.address + i));
    }
    EmittedInstruction { op: *op, bytes, is_exit_site: false }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slice<'a>(&'a [u8]);
    impl<'a> GuestByteSource for Slice<'a> {
        fn fetch_u8(&self, addr: u32) -> u8 {
            self.0[addr as usize]
        }
    }

    #[test]
    fn straight_line_chunk_stops_at_ret() {
        let code = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];
        let t = Translator::new();
        let out = t.translate_chunk(&Slice(&code), 0).unwrap();
        assert_eq!(out.guest_start, 0);
        assert_eq!(out.guest_end, 6);
        assert_eq!(out.bytes, code);
        assert_eq!(out.slots.len(), 2);
        assert!(out.pending_links.is_empty());
    }

    #[test]
    fn indirect_jump_becomes_exit_site() {
        let code = [0xFF, 0xE0]; // jmp eax
        let t = Translator::new();
        let out = t.translate_chunk(&Slice(&code), 0).unwrap();
        assert!(out.slots[0].is_exit_site);
        assert!(out.bytes.iter().all(|&b| b == crate::chunk::LIVE_EXIT_SENTINEL));
    }

    #[test]
    fn forward_call_ends_chunk_and_is_pending_link() {
        // call +0 (targets the byte right after itself, definitely
        // outside this 5-byte chunk's own range).
        let code = [0xE8, 0x00, 0x00, 0x00, 0x00];
        let t = Translator::new();
        let out = t.translate_chunk(&Slice(&code), 0x2000).unwrap();
        assert_eq!(out.pending_links.len(), 1);
        assert_eq!(out.pending_links[0].target_eip, 0x2005);
    }

    #[test]
    fn pre_link_check_flags_unresolved_forward_branch() {
        // jcc rel32 +0x100, far beyond a 6-byte decoded window.
        let code = [0x0F, 0x8C, 0x00, 0x01, 0x00, 0x00];
        let decoder = Decoder::new();
        let ops = vec![decoder.decode(&Slice(&code), 0)];
        assert_eq!(Translator::pre_link_check(&ops), -1); // target lies outside decoded_range entirely, so not "unresolved-but-in-range"
    }
}
