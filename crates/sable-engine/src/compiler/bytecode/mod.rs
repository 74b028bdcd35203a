//! Bytecode definitions and tooling: opcode set, binary program format,
//! and disassembler.

pub mod disasm;
pub mod encoder;
pub mod opcode;

pub use disasm::disassemble;
pub use encoder::{decode_program, encode_program, DecodeError};
pub use opcode::Opcode;
