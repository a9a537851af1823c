use crate::op::{ArithOp, DecodedOp, Opcode};
use crate::reg::Reg;

/// Whatever backs the guest address space, seen one byte at a time. Kept as
/// a trait so the decoder can be unit-tested against a plain byte slice
/// without depending on `guest-memory`.
pub trait GuestByteSource {
    fn fetch_u8(&self, addr: u32) -> u8;
}

impl GuestByteSource for [u8] {
    fn fetch_u8(&self, addr: u32) -> u8 {
        self[addr as usize]
    }
}

/// Stateless with respect to guest memory: every call re-reads
/// from `src` starting at `eip`. The original's `DecodedBlock` thread-local
/// scratch buffer exists to amortise allocation across calls in a tight
/// interpreter loop; this decoder sidesteps the need for it by returning a
/// small `Copy` struct instead; there is nothing to "consume before the next
/// call" because nothing is borrowed.
#[derive(Default)]
pub struct Decoder;

struct Cursor<'a> {
    src: &'a dyn GuestByteSource,
    start: u32,
    pos: u32,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a dyn GuestByteSource, eip: u32) -> Self {
        Self { src, start: eip, pos: eip }
    }

    fn u8(&mut self) -> u8 {
        let b = self.src.fetch_u8(self.pos);
        self.pos += 1;
        b
    }

    fn i8(&mut self) -> i8 {
        self.u8() as i8
    }

    fn u32_le(&mut self) -> u32 {
        let mut v = 0u32;
        for i in 0..4 {
            v |= (self.u8() as u32) << (8 * i);
        }
        v
    }

    fn i32_le(&mut self) -> i32 {
        self.u32_le() as i32
    }

    fn len(&self) -> u8 {
        (self.pos - self.start) as u8
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self
    }

    /// Decodes one instruction starting at `eip`. Never fails: an
    /// unrecognised byte sequence decodes to `Opcode::Unsupported` with a
    /// length of 1, so callers always make forward progress.
    pub fn decode(&self, src: &dyn GuestByteSource, eip: u32) -> DecodedOp {
        let mut cur = Cursor::new(src, eip);
        let first = cur.u8();

        let opcode = match first {
            0xB8..=0xBF => Opcode::MovRegImm32 {
                reg: Reg::from_bits(first - 0xB8),
            },
            0x50..=0x57 => Opcode::PushReg {
                reg: Reg::from_bits(first - 0x50),
            },
            0x58..=0x5F => Opcode::PopReg {
                reg: Reg::from_bits(first - 0x58),
            },
            0x81 => {
                let modrm = cur.u8();
                if modrm >> 6 == 0b11 {
                    let op = ArithOp::from_digit((modrm >> 3) & 0b111);
                    let reg = Reg::from_bits(modrm);
                    let _imm = cur.u32_le();
                    Opcode::ArithRegImm32 { reg, op }
                } else {
                    Opcode::Unsupported { first_byte: first }
                }
            }
            0x83 => {
                let modrm = cur.u8();
                if modrm >> 6 == 0b11 {
                    let op = ArithOp::from_digit((modrm >> 3) & 0b111);
                    let reg = Reg::from_bits(modrm);
                    let _imm = cur.i8();
                    Opcode::ArithRegImm32 { reg, op }
                } else {
                    Opcode::Unsupported { first_byte: first }
                }
            }
            0xEB => Opcode::JmpRel8 { rel: cur.i8() },
            0xE9 => Opcode::JmpRel32 { rel: cur.i32_le() },
            0xE8 => Opcode::CallRel32 { rel: cur.i32_le() },
            0xC3 => Opcode::Ret,
            0x70..=0x7F => Opcode::JccRel8 {
                condition: first - 0x70,
                rel: cur.i8(),
            },
            0x0F => {
                let second = cur.u8();
                match second {
                    0x80..=0x8F => Opcode::JccRel32 {
                        condition: second - 0x80,
                        rel: cur.i32_le(),
                    },
                    _ => Opcode::Unsupported { first_byte: first },
                }
            }
            0xFF => {
                let modrm = cur.u8();
                if modrm >> 6 == 0b11 && (modrm >> 3) & 0b111 == 4 {
                    Opcode::JmpIndirectReg { reg: Reg::from_bits(modrm) }
                } else {
                    Opcode::Unsupported { first_byte: first }
                }
            }
            0xF3 => {
                // REP prefix; the string opcode follows.
                let second = cur.u8();
                match second {
                    0xA5 => Opcode::RepMovsD { has_rep_prefix: true },
                    0xAB => Opcode::RepStosD { has_rep_prefix: true },
                    _ => Opcode::Unsupported { first_byte: first },
                }
            }
            0xA5 => Opcode::RepMovsD { has_rep_prefix: false },
            0xAB => Opcode::RepStosD { has_rep_prefix: false },
            0xC6 => {
                let modrm = cur.u8();
                if modrm == 0x05 {
                    let addr = cur.u32_le();
                    let imm = cur.u8();
                    Opcode::MovAbsMem8Imm8 { addr, imm }
                } else {
                    Opcode::Unsupported { first_byte: first }
                }
            }
            _ => Opcode::Unsupported { first_byte: first },
        };

        DecodedOp {
            opcode,
            address: eip,
            length: cur.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_mov_eax_imm32_then_ret() {
        let code = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];
        let decoder = Decoder::new();
        let mov = decoder.decode(&code[..], 0);
        assert_eq!(mov.length, 5);
        assert_eq!(mov.opcode, Opcode::MovRegImm32 { reg: Reg::Eax });

        let ret = decoder.decode(&code[..], 5);
        assert_eq!(ret.length, 1);
        assert_eq!(ret.opcode, Opcode::Ret);
        assert!(ret.ends_linear_flow());
    }

    #[test]
    fn decodes_register_indirect_jump() {
        let code = [0xFF, 0xE0]; // jmp eax
        let op = Decoder::new().decode(&code[..], 0);
        assert_eq!(op.opcode, Opcode::JmpIndirectReg { reg: Reg::Eax });
        assert_eq!(op.length, 2);
        assert!(op.ends_linear_flow());
    }

    #[test]
    fn decodes_rep_stosd_as_string_op() {
        let code = [0xF3, 0xAB];
        let op = Decoder::new().decode(&code[..], 0);
        assert!(op.is_string_op());
        assert_eq!(op.write_mem_width(), Some(32));
        assert_eq!(op.length, 2);
    }

    #[test]
    fn branch_target_accounts_for_instruction_length() {
        let code = [0xEB, 0x02]; // jmp +2 from end of this 2-byte instruction
        let op = Decoder::new().decode(&code[..], 0x1000);
        assert_eq!(op.branch_target(), Some(0x1000 + 2 + 2));
    }

    #[test]
    fn decodes_direct_addressed_byte_store() {
        let code = [0xC6, 0x05, 0x01, 0x10, 0x00, 0x00, 0x2B];
        let op = Decoder::new().decode(&code[..], 0);
        assert_eq!(op.opcode, Opcode::MovAbsMem8Imm8 { addr: 0x1001, imm: 0x2B });
        assert_eq!(op.length, 7);
        assert_eq!(op.write_mem_width(), Some(8));
    }

    #[test]
    fn unknown_byte_is_unsupported_with_length_one() {
        let code = [0xD6]; // SALC, deliberately unhandled
        let op = Decoder::new().decode(&code[..], 0);
        assert_eq!(op.opcode, Opcode::Unsupported { first_byte: 0xD6 });
        assert_eq!(op.length, 1);
    }
}
