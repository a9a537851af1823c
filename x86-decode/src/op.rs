use crate::reg::Reg;

/// The `/digit` extension of the `80/81 /digit ib/id` arithmetic group that
/// this decoder understands. Only `Cmp` and `Add` are exercised by the
/// scenarios in this design, but the group is cheap to decode in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl ArithOp {
    pub fn from_digit(digit: u8) -> ArithOp {
        match digit & 0b111 {
            0 => ArithOp::Add,
            1 => ArithOp::Or,
            2 => ArithOp::Adc,
            3 => ArithOp::Sbb,
            4 => ArithOp::And,
            5 => ArithOp::Sub,
            6 => ArithOp::Xor,
            _ => ArithOp::Cmp,
        }
    }
}

/// A curated subset of the x86 ISA: enough to drive the translator's
/// two-pass/pre-link/patch machinery and every end-to-end scenario this
/// workspace is exercised against. Growing coverage is a matter of adding
/// match arms in `decoder.rs`, not restructuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    MovRegImm32 { reg: Reg },
    PushReg { reg: Reg },
    PopReg { reg: Reg },
    ArithRegImm32 { reg: Reg, op: ArithOp },
    JmpRel8 { rel: i8 },
    JmpRel32 { rel: i32 },
    JccRel8 { condition: u8, rel: i8 },
    JccRel32 { condition: u8, rel: i32 },
    CallRel32 { rel: i32 },
    Ret,
    /// `FF /4` — register-indirect jump. The translator never emits a real
    /// indirect branch for this; it ends the chunk in a trapping sentinel
    /// instead.
    JmpIndirectReg { reg: Reg },
    RepMovsD { has_rep_prefix: bool },
    RepStosD { has_rep_prefix: bool },
    /// `C6 /0 ib` with a direct (`mod=00, rm=101`) memory operand — `mov
    /// byte ptr [disp32], imm8`. The only memory-writing store this decoder
    /// recognises that isn't a string op; exists so self-modifying code
    /// (S1) can be expressed as a guest instruction instead of
    /// only as an out-of-band host write.
    MovAbsMem8Imm8 { addr: u32, imm: u8 },
    /// A byte sequence this decoder doesn't recognise. The translator
    /// treats this the same way the original treated an unhandled opcode:
    /// it ends the first pass there (step 1, "implementation-
    /// chosen length cap").
    Unsupported { first_byte: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedOp {
    pub opcode: Opcode,
    /// Guest address this instruction started at.
    pub address: u32,
    /// Length in bytes, including any prefixes.
    pub length: u8,
}

impl DecodedOp {
    /// `isStringOp`.
    pub fn is_string_op(&self) -> bool {
        matches!(self.opcode, Opcode::RepMovsD { .. } | Opcode::RepStosD { .. })
    }

    /// `writeMemWidth`: bit width of the memory write this
    /// instruction performs, if any. Only the string-op family in this
    /// decoder's subset writes memory.
    pub fn write_mem_width(&self) -> Option<u8> {
        match self.opcode {
            Opcode::RepMovsD { .. } | Opcode::RepStosD { .. } => Some(32),
            Opcode::MovAbsMem8Imm8 { .. } => Some(8),
            _ => None,
        }
    }

    /// An unconditional branch or return out of the current control flow:
    /// the translator's first pass stops here (step 1).
    pub fn ends_linear_flow(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::JmpRel8 { .. }
                | Opcode::JmpRel32 { .. }
                | Opcode::JmpIndirectReg { .. }
                | Opcode::Ret
        )
    }

    /// Intra-chunk or cross-chunk branch target, if this instruction is a
    /// relative branch whose displacement is known at decode time.
    pub fn branch_target(&self) -> Option<i64> {
        let rel: i64 = match self.opcode {
            Opcode::JmpRel8 { rel } => rel as i64,
            Opcode::JmpRel32 { rel } => rel as i64,
            Opcode::JccRel8 { rel, .. } => rel as i64,
            Opcode::JccRel32 { rel, .. } => rel as i64,
            Opcode::CallRel32 { rel } => rel as i64,
            _ => return None,
        };
        Some(self.address as i64 + self.length as i64 + rel)
    }

    /// Whether this branch's displacement was encoded with a 32-bit
    /// operand (relevant to the translator's pre-link check, step 3: only
    /// 32-bit intra-chunk displacements need a resolvable target at commit
    /// time, since 8-bit ones can't reach outside a chunk anyway in
    /// practice but are still checked for completeness).
    pub fn has_32bit_displacement(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::JmpRel32 { .. } | Opcode::JccRel32 { .. } | Opcode::CallRel32 { .. }
        )
    }
}
