//! The instruction decoder: stateless with respect to guest memory, it reads
//! bytes from a guest address one at a time and produces a structured op
//! description. Consumed read-only by the translator.

mod decoder;
mod op;
mod reg;

pub use decoder::{Decoder, GuestByteSource};
pub use op::{ArithOp, DecodedOp, Opcode};
pub use reg::Reg;
