//! Binary program format.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! "SBBC"            magic
//! u16               format version
//! u16               statics count
//! u16               binding count
//!   per binding:    u16 name length, name bytes, u16 static id
//! u32               code length
//! bytes             code
//! u32               crc32 of code
//! ```

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::compiler::Program;

pub const MAGIC: &[u8; 4] = b"SBBC";
pub const FORMAT_VERSION: u16 = 1;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("Not a Sable bytecode file (bad magic)")]
    BadMagic,

    #[error("Unsupported bytecode format version {version}")]
    UnsupportedVersion { version: u16 },

    #[error("Truncated bytecode file")]
    Truncated,

    #[error("Code checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// Serialize a compiled program to its file representation.
pub fn encode_program(program: &Program) -> Vec<u8> {
    let mut out = Vec::with_capacity(program.bytecode.len() + 64);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&program.statics_count.to_le_bytes());

    // Bindings are sorted by name so output is deterministic.
    let mut bindings: Vec<(&String, &u16)> = program.bindings.iter().collect();
    bindings.sort_by_key(|(name, _)| name.as_str());
    out.extend_from_slice(&(bindings.len() as u16).to_le_bytes());
    for (name, id) in bindings {
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&id.to_le_bytes());
    }

    out.extend_from_slice(&(program.bytecode.len() as u32).to_le_bytes());
    out.extend_from_slice(&program.bytecode);
    out.extend_from_slice(&crc32fast::hash(&program.bytecode).to_le_bytes());
    out
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.pos + n > self.bytes.len() {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Parse and verify a program file.
pub fn decode_program(bytes: &[u8]) -> Result<Program, DecodeError> {
    let mut r = Reader { bytes, pos: 0 };

    if r.take(4)? != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = r.u16()?;
    if version != FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion { version });
    }

    let statics_count = r.u16()?;
    let binding_count = r.u16()?;
    let mut bindings = FxHashMap::default();
    for _ in 0..binding_count {
        let name_len = r.u16()? as usize;
        let name = String::from_utf8_lossy(r.take(name_len)?).into_owned();
        let id = r.u16()?;
        bindings.insert(name, id);
    }

    let code_len = r.u32()? as usize;
    let bytecode = r.take(code_len)?.to_vec();
    let expected = r.u32()?;
    let actual = crc32fast::hash(&bytecode);
    if expected != actual {
        return Err(DecodeError::ChecksumMismatch { expected, actual });
    }

    Ok(Program {
        bytecode,
        statics_count,
        bindings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::bytecode::Opcode;

    fn sample_program() -> Program {
        let mut bindings = FxHashMap::default();
        bindings.insert("PI".to_string(), 0);
        bindings.insert("log".to_string(), 1);
        Program {
            bytecode: vec![Opcode::LoadNull as u8, 0, Opcode::Halt as u8],
            statics_count: 2,
            bindings,
        }
    }

    #[test]
    fn test_roundtrip() {
        let program = sample_program();
        let bytes = encode_program(&program);
        let decoded = decode_program(&bytes).unwrap();
        assert_eq!(decoded.bytecode, program.bytecode);
        assert_eq!(decoded.statics_count, 2);
        assert_eq!(decoded.bindings.get("PI"), Some(&0));
        assert_eq!(decoded.bindings.get("log"), Some(&1));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = encode_program(&sample_program());
        bytes[0] = b'X';
        assert_eq!(decode_program(&bytes), Err(DecodeError::BadMagic));
    }

    #[test]
    fn test_corrupted_code_fails_checksum() {
        let bytes = encode_program(&sample_program());
        let code_start = bytes.len() - 3 - 4;
        let mut corrupted = bytes.clone();
        corrupted[code_start] = Opcode::Halt as u8;
        assert!(matches!(
            decode_program(&corrupted),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_file() {
        let bytes = encode_program(&sample_program());
        assert_eq!(
            decode_program(&bytes[..bytes.len() - 2]),
            Err(DecodeError::Truncated)
        );
    }
}
