//! The VM instruction set.
//!
//! Instructions are byte-aligned: a one-byte opcode followed by its
//! operands. Register operands are one byte, stack offsets and static ids
//! two bytes little-endian, code addresses four bytes little-endian and
//! always absolute. `LOAD_STRING` and `LOAD_TYPE` carry variable-length
//! payloads prefixed with their lengths.

/// One-byte operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    // Constants
    LoadI32 = 0x01,
    LoadI64 = 0x02,
    LoadF32 = 0x03,
    LoadF64 = 0x04,
    LoadBool = 0x05,
    LoadNull = 0x06,
    LoadString = 0x07,
    LoadFunc = 0x08,
    LoadType = 0x09,
    LoadU32 = 0x0A,
    LoadU64 = 0x0B,

    // Stack and registers
    Push = 0x10,
    Pop = 0x11,
    PopN = 0x12,
    Mov = 0x13,
    Rsrv = 0x14,
    LoadOffset = 0x15,
    StoreOffset = 0x16,
    LoadRef = 0x17,
    LoadDeref = 0x18,

    // Static memory
    LoadStatic = 0x20,
    StoreStatic = 0x21,

    // Object members and arrays
    LoadMem = 0x28,
    StoreMem = 0x29,
    LoadMemHash = 0x2A,
    StoreMemHash = 0x2B,
    LoadArrayIdx = 0x2C,
    StoreArrayIdx = 0x2D,

    // Arithmetic and logic
    Add = 0x30,
    Sub = 0x31,
    Mul = 0x32,
    Div = 0x33,
    Mod = 0x34,
    Neg = 0x35,
    Not = 0x36,

    // Comparison and branching
    Cmp = 0x40,
    Cmpz = 0x41,
    Jmp = 0x42,
    Je = 0x43,
    Jne = 0x44,
    Jg = 0x45,
    Jge = 0x46,

    // Objects
    New = 0x50,
    NewArray = 0x51,
    Cast = 0x52,

    // Calls
    Call = 0x60,
    Ret = 0x61,

    // Exceptions
    BeginTry = 0x68,
    EndTry = 0x69,
    Throw = 0x6A,

    // Module interface
    Export = 0x70,
    /// Length-prefixed comment payload; skipped by the interpreter.
    Rem = 0x71,
    Halt = 0x7F,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        Some(match byte {
            0x01 => Opcode::LoadI32,
            0x02 => Opcode::LoadI64,
            0x03 => Opcode::LoadF32,
            0x04 => Opcode::LoadF64,
            0x05 => Opcode::LoadBool,
            0x06 => Opcode::LoadNull,
            0x07 => Opcode::LoadString,
            0x08 => Opcode::LoadFunc,
            0x09 => Opcode::LoadType,
            0x0A => Opcode::LoadU32,
            0x0B => Opcode::LoadU64,
            0x10 => Opcode::Push,
            0x11 => Opcode::Pop,
            0x12 => Opcode::PopN,
            0x13 => Opcode::Mov,
            0x14 => Opcode::Rsrv,
            0x15 => Opcode::LoadOffset,
            0x16 => Opcode::StoreOffset,
            0x17 => Opcode::LoadRef,
            0x18 => Opcode::LoadDeref,
            0x20 => Opcode::LoadStatic,
            0x21 => Opcode::StoreStatic,
            0x28 => Opcode::LoadMem,
            0x29 => Opcode::StoreMem,
            0x2A => Opcode::LoadMemHash,
            0x2B => Opcode::StoreMemHash,
            0x2C => Opcode::LoadArrayIdx,
            0x2D => Opcode::StoreArrayIdx,
            0x30 => Opcode::Add,
            0x31 => Opcode::Sub,
            0x32 => Opcode::Mul,
            0x33 => Opcode::Div,
            0x34 => Opcode::Mod,
            0x35 => Opcode::Neg,
            0x36 => Opcode::Not,
            0x40 => Opcode::Cmp,
            0x41 => Opcode::Cmpz,
            0x42 => Opcode::Jmp,
            0x43 => Opcode::Je,
            0x44 => Opcode::Jne,
            0x45 => Opcode::Jg,
            0x46 => Opcode::Jge,
            0x50 => Opcode::New,
            0x51 => Opcode::NewArray,
            0x52 => Opcode::Cast,
            0x60 => Opcode::Call,
            0x61 => Opcode::Ret,
            0x68 => Opcode::BeginTry,
            0x69 => Opcode::EndTry,
            0x6A => Opcode::Throw,
            0x70 => Opcode::Export,
            0x71 => Opcode::Rem,
            0x7F => Opcode::Halt,
            _ => return None,
        })
    }

    /// Size of the fixed operands that follow the opcode byte. Returns
    /// `None` for variable-length instructions (`LoadString`, `LoadType`,
    /// `Rem`), whose payload size is read from the stream.
    pub fn operand_size(&self) -> Option<usize> {
        Some(match self {
            Opcode::LoadI32 => 5,  // reg + i32
            Opcode::LoadI64 => 9,  // reg + i64
            Opcode::LoadU32 => 5,  // reg + u32
            Opcode::LoadU64 => 9,  // reg + u64
            Opcode::LoadF32 => 5,  // reg + f32
            Opcode::LoadF64 => 9,  // reg + f64
            Opcode::LoadBool => 2, // reg + bool
            Opcode::LoadNull => 1, // reg
            Opcode::LoadString | Opcode::LoadType | Opcode::Rem => return None,
            Opcode::LoadFunc => 7, // reg + addr + nargs + flags
            Opcode::Push => 1,
            Opcode::Pop => 1,
            Opcode::PopN => 2,  // count u16
            Opcode::Mov => 2,   // dst + src
            Opcode::Rsrv => 2,  // count u16
            Opcode::LoadOffset | Opcode::StoreOffset => 3, // reg + offset u16
            Opcode::LoadRef => 3,                          // reg + offset u16
            Opcode::LoadDeref => 2,                        // dst + src
            Opcode::LoadStatic | Opcode::StoreStatic => 3, // reg + id u16
            Opcode::LoadMem | Opcode::StoreMem => 3,       // dst/src + obj + idx
            Opcode::LoadMemHash | Opcode::StoreMemHash => 6, // dst/src + obj + hash u32
            Opcode::LoadArrayIdx | Opcode::StoreArrayIdx => 3, // dst/src + obj + idx reg
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => 3,
            Opcode::Neg | Opcode::Not => 2,
            Opcode::Cmp => 2,
            Opcode::Cmpz => 1,
            Opcode::Jmp | Opcode::Je | Opcode::Jne | Opcode::Jg | Opcode::Jge => 4, // addr u32
            Opcode::New => 2,      // dst + type reg
            Opcode::NewArray => 3, // dst + count u16
            Opcode::Cast => 3,     // dst + src + tag
            Opcode::Call => 2,     // reg + nargs
            Opcode::Ret => 0,
            Opcode::BeginTry => 4, // catch addr u32
            Opcode::EndTry => 0,
            Opcode::Throw => 1,
            Opcode::Export => 5, // reg + hash u32
            Opcode::Halt => 0,
        })
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::LoadI32 => "LOAD_I32",
            Opcode::LoadI64 => "LOAD_I64",
            Opcode::LoadU32 => "LOAD_U32",
            Opcode::LoadU64 => "LOAD_U64",
            Opcode::LoadF32 => "LOAD_F32",
            Opcode::LoadF64 => "LOAD_F64",
            Opcode::LoadBool => "LOAD_BOOL",
            Opcode::LoadNull => "LOAD_NULL",
            Opcode::LoadString => "LOAD_STRING",
            Opcode::LoadFunc => "LOAD_FUNC",
            Opcode::LoadType => "LOAD_TYPE",
            Opcode::Push => "PUSH",
            Opcode::Pop => "POP",
            Opcode::PopN => "POP_N",
            Opcode::Mov => "MOV",
            Opcode::Rsrv => "RSRV",
            Opcode::LoadOffset => "LOAD_OFFSET",
            Opcode::StoreOffset => "STORE_OFFSET",
            Opcode::LoadRef => "LOAD_REF",
            Opcode::LoadDeref => "LOAD_DEREF",
            Opcode::LoadStatic => "LOAD_STATIC",
            Opcode::StoreStatic => "STORE_STATIC",
            Opcode::LoadMem => "LOAD_MEM",
            Opcode::StoreMem => "STORE_MEM",
            Opcode::LoadMemHash => "LOAD_MEM_HASH",
            Opcode::StoreMemHash => "STORE_MEM_HASH",
            Opcode::LoadArrayIdx => "LOAD_ARRAY_IDX",
            Opcode::StoreArrayIdx => "STORE_ARRAY_IDX",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Mod => "MOD",
            Opcode::Neg => "NEG",
            Opcode::Not => "NOT",
            Opcode::Cmp => "CMP",
            Opcode::Cmpz => "CMPZ",
            Opcode::Jmp => "JMP",
            Opcode::Je => "JE",
            Opcode::Jne => "JNE",
            Opcode::Jg => "JG",
            Opcode::Jge => "JGE",
            Opcode::New => "NEW",
            Opcode::NewArray => "NEW_ARRAY",
            Opcode::Cast => "CAST",
            Opcode::Call => "CALL",
            Opcode::Ret => "RET",
            Opcode::BeginTry => "BEGIN_TRY",
            Opcode::EndTry => "END_TRY",
            Opcode::Throw => "THROW",
            Opcode::Export => "EXPORT",
            Opcode::Rem => "REM",
            Opcode::Halt => "HALT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_opcodes() {
        // Every defined opcode must decode back to itself.
        for byte in 0u8..=0x7F {
            if let Some(op) = Opcode::from_u8(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(Opcode::from_u8(Opcode::Halt as u8), Some(Opcode::Halt));
        assert_eq!(Opcode::from_u8(0xFF), None);
    }

    #[test]
    fn test_operand_sizes() {
        assert_eq!(Opcode::LoadI32.operand_size(), Some(5));
        assert_eq!(Opcode::Jmp.operand_size(), Some(4));
        assert_eq!(Opcode::Ret.operand_size(), Some(0));
        assert_eq!(Opcode::LoadString.operand_size(), None);
        assert_eq!(Opcode::Rem.operand_size(), None);
    }
}
