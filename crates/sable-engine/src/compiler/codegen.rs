//! Backend byte emitter.
//!
//! Flattens a `BytecodeChunk` tree into the final code buffer in two
//! phases. The emit phase writes every instruction, records the absolute
//! position of each `LabelMarker`, and leaves a four-byte placeholder at
//! every site that refers to a label (jumps, function loads, try setup).
//! The bake phase patches each placeholder with the resolved absolute
//! address. An unresolved label at bake time is a lowering bug, not a user
//! error, and panics.

use rustc_hash::FxHashMap;

use crate::compiler::bytecode::Opcode;
use crate::compiler::ir::{
    ArithOp, Buildable, BytecodeChunk, JumpMode, LabelId, StorageDirection, StorageTarget,
};

#[derive(Debug)]
struct Fixup {
    label: LabelId,
    /// Absolute byte position of the u32 placeholder.
    position: usize,
}

#[derive(Debug, Default)]
pub struct CodeGenerator {
    code: Vec<u8>,
    labels: FxHashMap<LabelId, u32>,
    fixups: Vec<Fixup>,
}

impl CodeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten `chunk` and resolve all labels, returning the final code.
    pub fn generate(mut self, chunk: &BytecodeChunk) -> Vec<u8> {
        self.emit_chunk(chunk);
        self.bake()
    }

    fn emit_chunk(&mut self, chunk: &BytecodeChunk) {
        for buildable in &chunk.buildables {
            self.emit(buildable);
        }
    }

    fn op(&mut self, opcode: Opcode) {
        self.code.push(opcode as u8);
    }

    fn u8(&mut self, value: u8) {
        self.code.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a u32 placeholder to be patched with `label`'s address.
    fn label_ref(&mut self, label: LabelId) {
        self.fixups.push(Fixup {
            label,
            position: self.code.len(),
        });
        self.u32(0);
    }

    fn emit(&mut self, buildable: &Buildable) {
        match buildable {
            Buildable::Chunk(chunk) => self.emit_chunk(chunk),

            Buildable::LabelMarker(label) => {
                let position = self.code.len() as u32;
                let previous = self.labels.insert(*label, position);
                debug_assert!(previous.is_none(), "label {:?} marked twice", label);
            }

            Buildable::Jump { mode, label } => {
                let opcode = match mode {
                    JumpMode::Always => Opcode::Jmp,
                    JumpMode::Equal => Opcode::Je,
                    JumpMode::NotEqual => Opcode::Jne,
                    JumpMode::Greater => Opcode::Jg,
                    JumpMode::GreaterEqual => Opcode::Jge,
                };
                self.op(opcode);
                self.label_ref(*label);
            }

            Buildable::Comparison { lhs, rhs } => {
                self.op(Opcode::Cmp);
                self.u8(*lhs);
                self.u8(*rhs);
            }

            Buildable::CompareZero { reg } => {
                self.op(Opcode::Cmpz);
                self.u8(*reg);
            }

            Buildable::FunctionCall { reg, nargs } => {
                self.op(Opcode::Call);
                self.u8(*reg);
                self.u8(*nargs);
            }

            Buildable::Return => self.op(Opcode::Ret),

            Buildable::PushReg { reg } => {
                self.op(Opcode::Push);
                self.u8(*reg);
            }

            Buildable::PopReg { reg } => {
                self.op(Opcode::Pop);
                self.u8(*reg);
            }

            Buildable::PopN { count } => {
                self.op(Opcode::PopN);
                self.u16(*count);
            }

            Buildable::ReserveLocals { count } => {
                self.op(Opcode::Rsrv);
                self.u16(*count);
            }

            Buildable::LoadRef { reg, offset } => {
                self.op(Opcode::LoadRef);
                self.u8(*reg);
                self.u16(*offset);
            }

            Buildable::LoadDeref { dst, src } => {
                self.op(Opcode::LoadDeref);
                self.u8(*dst);
                self.u8(*src);
            }

            Buildable::ConstI32 { reg, value } => {
                self.op(Opcode::LoadI32);
                self.u8(*reg);
                self.code.extend_from_slice(&value.to_le_bytes());
            }

            Buildable::ConstI64 { reg, value } => {
                self.op(Opcode::LoadI64);
                self.u8(*reg);
                self.code.extend_from_slice(&value.to_le_bytes());
            }

            Buildable::ConstU32 { reg, value } => {
                self.op(Opcode::LoadU32);
                self.u8(*reg);
                self.u32(*value);
            }

            Buildable::ConstU64 { reg, value } => {
                self.op(Opcode::LoadU64);
                self.u8(*reg);
                self.code.extend_from_slice(&value.to_le_bytes());
            }

            Buildable::ConstF32 { reg, value } => {
                self.op(Opcode::LoadF32);
                self.u8(*reg);
                self.code.extend_from_slice(&value.to_le_bytes());
            }

            Buildable::ConstF64 { reg, value } => {
                self.op(Opcode::LoadF64);
                self.u8(*reg);
                self.code.extend_from_slice(&value.to_le_bytes());
            }

            Buildable::ConstBool { reg, value } => {
                self.op(Opcode::LoadBool);
                self.u8(*reg);
                self.u8(*value as u8);
            }

            Buildable::ConstNull { reg } => {
                self.op(Opcode::LoadNull);
                self.u8(*reg);
            }

            Buildable::ConstString { reg, value } => {
                self.op(Opcode::LoadString);
                self.u8(*reg);
                self.u32(value.len() as u32);
                self.code.extend_from_slice(value.as_bytes());
            }

            Buildable::Function {
                reg,
                label,
                nargs,
                flags,
            } => {
                self.op(Opcode::LoadFunc);
                self.u8(*reg);
                self.label_ref(*label);
                self.u8(*nargs);
                self.u8(*flags);
            }

            Buildable::TypeObject { reg, name, members } => {
                self.op(Opcode::LoadType);
                self.u8(*reg);
                self.u16(name.len() as u16);
                self.code.extend_from_slice(name.as_bytes());
                self.u16(members.len() as u16);
                for member in members {
                    self.u16(member.len() as u16);
                    self.code.extend_from_slice(member.as_bytes());
                }
            }

            Buildable::Storage(storage) => {
                let load = storage.direction == StorageDirection::Load;
                match storage.target {
                    StorageTarget::LocalOffset { offset } => {
                        self.op(if load {
                            Opcode::LoadOffset
                        } else {
                            Opcode::StoreOffset
                        });
                        self.u8(storage.reg);
                        self.u16(offset);
                    }
                    StorageTarget::Static { id } => {
                        self.op(if load {
                            Opcode::LoadStatic
                        } else {
                            Opcode::StoreStatic
                        });
                        self.u8(storage.reg);
                        self.u16(id);
                    }
                    StorageTarget::MemberIndex { object, index } => {
                        self.op(if load { Opcode::LoadMem } else { Opcode::StoreMem });
                        self.u8(storage.reg);
                        self.u8(object);
                        self.u8(index);
                    }
                    StorageTarget::MemberHash { object, hash } => {
                        self.op(if load {
                            Opcode::LoadMemHash
                        } else {
                            Opcode::StoreMemHash
                        });
                        self.u8(storage.reg);
                        self.u8(object);
                        self.u32(hash);
                    }
                    StorageTarget::ArrayIndex { object, index } => {
                        self.op(if load {
                            Opcode::LoadArrayIdx
                        } else {
                            Opcode::StoreArrayIdx
                        });
                        self.u8(storage.reg);
                        self.u8(object);
                        self.u8(index);
                    }
                }
            }

            Buildable::Arith { op, dst, lhs, rhs } => {
                let opcode = match op {
                    ArithOp::Add => Opcode::Add,
                    ArithOp::Sub => Opcode::Sub,
                    ArithOp::Mul => Opcode::Mul,
                    ArithOp::Div => Opcode::Div,
                    ArithOp::Mod => Opcode::Mod,
                };
                self.op(opcode);
                self.u8(*dst);
                self.u8(*lhs);
                self.u8(*rhs);
            }

            Buildable::Neg { dst, src } => {
                self.op(Opcode::Neg);
                self.u8(*dst);
                self.u8(*src);
            }

            Buildable::Not { dst, src } => {
                self.op(Opcode::Not);
                self.u8(*dst);
                self.u8(*src);
            }

            Buildable::Cast { dst, src, tag } => {
                self.op(Opcode::Cast);
                self.u8(*dst);
                self.u8(*src);
                self.u8(*tag);
            }

            Buildable::New { dst, type_reg } => {
                self.op(Opcode::New);
                self.u8(*dst);
                self.u8(*type_reg);
            }

            Buildable::NewArray { dst, count } => {
                self.op(Opcode::NewArray);
                self.u8(*dst);
                self.u16(*count);
            }

            Buildable::BeginTry { label } => {
                self.op(Opcode::BeginTry);
                self.label_ref(*label);
            }

            Buildable::EndTry => self.op(Opcode::EndTry),

            Buildable::Throw { reg } => {
                self.op(Opcode::Throw);
                self.u8(*reg);
            }

            Buildable::Mov { dst, src } => {
                self.op(Opcode::Mov);
                self.u8(*dst);
                self.u8(*src);
            }

            Buildable::Export { reg, hash } => {
                self.op(Opcode::Export);
                self.u8(*reg);
                self.u32(*hash);
            }

            Buildable::Comment(text) => {
                self.op(Opcode::Rem);
                self.u32(text.len() as u32);
                self.code.extend_from_slice(text.as_bytes());
            }

            Buildable::Halt => self.op(Opcode::Halt),
        }
    }

    /// Patch every label reference with its resolved absolute address.
    fn bake(mut self) -> Vec<u8> {
        for fixup in &self.fixups {
            let address = *self
                .labels
                .get(&fixup.label)
                .unwrap_or_else(|| panic!("unresolved label {:?} at bake time", fixup.label));
            self.code[fixup.position..fixup.position + 4]
                .copy_from_slice(&address.to_le_bytes());
        }
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::bytecode::disassemble;

    #[test]
    fn test_forward_jump_is_patched() {
        let mut chunk = BytecodeChunk::new();
        let mut label_counter = 0u32;
        let end = LabelId(label_counter);
        label_counter += 1;
        let _ = label_counter;

        chunk.push(Buildable::Jump {
            mode: JumpMode::Always,
            label: end,
        });
        chunk.push(Buildable::ConstI32 { reg: 0, value: 1 });
        chunk.push(Buildable::LabelMarker(end));
        chunk.push(Buildable::Halt);

        let code = CodeGenerator::new().generate(&chunk);
        // JMP (5 bytes) + LOAD_I32 (6 bytes) puts the label at offset 11.
        let target = u32::from_le_bytes([code[1], code[2], code[3], code[4]]);
        assert_eq!(target, 11);
        assert_eq!(code[11], Opcode::Halt as u8);
    }

    #[test]
    fn test_backward_jump_is_patched() {
        let mut chunk = BytecodeChunk::new();
        let top = LabelId(0);
        chunk.push(Buildable::LabelMarker(top));
        chunk.push(Buildable::ConstI32 { reg: 1, value: 7 });
        chunk.push(Buildable::Jump {
            mode: JumpMode::NotEqual,
            label: top,
        });

        let code = CodeGenerator::new().generate(&chunk);
        let target = u32::from_le_bytes([code[7], code[8], code[9], code[10]]);
        assert_eq!(target, 0);
    }

    #[test]
    fn test_function_address_resolves_into_nested_chunk() {
        // Mirrors the function-literal protocol: jump over the body, mark
        // its entry, then load the function value with the entry address.
        let skip = LabelId(0);
        let entry = LabelId(1);

        let mut body = BytecodeChunk::new();
        body.push(Buildable::ConstI32 { reg: 0, value: 42 });
        body.push(Buildable::Return);

        let mut chunk = BytecodeChunk::new();
        chunk.push(Buildable::Jump {
            mode: JumpMode::Always,
            label: skip,
        });
        chunk.push(Buildable::LabelMarker(entry));
        chunk.push(Buildable::Chunk(body));
        chunk.push(Buildable::LabelMarker(skip));
        chunk.push(Buildable::Function {
            reg: 1,
            label: entry,
            nargs: 0,
            flags: 0,
        });
        chunk.push(Buildable::Halt);

        let code = CodeGenerator::new().generate(&chunk);
        let lines = disassemble(&code);
        // The body starts right after the 5-byte jump.
        assert!(lines.iter().any(|l| l.contains("LOAD_FUNC r1, @000005")));
        // And the jump skips past the 7-byte body (6 + 1).
        assert!(lines[0].contains("JMP @000012"));
    }

    #[test]
    #[should_panic(expected = "unresolved label")]
    fn test_unresolved_label_panics() {
        let mut chunk = BytecodeChunk::new();
        chunk.push(Buildable::Jump {
            mode: JumpMode::Always,
            label: LabelId(99),
        });
        CodeGenerator::new().generate(&chunk);
    }

    #[test]
    fn test_comments_become_rem_payloads() {
        let mut chunk = BytecodeChunk::new();
        chunk.push(Buildable::Comment("let x = 1".into()));
        chunk.push(Buildable::Halt);
        let code = CodeGenerator::new().generate(&chunk);

        assert_eq!(code[0], Opcode::Rem as u8);
        let len = u32::from_le_bytes([code[1], code[2], code[3], code[4]]) as usize;
        assert_eq!(&code[5..5 + len], b"let x = 1");
        assert_eq!(code[5 + len], Opcode::Halt as u8);
    }

    #[test]
    fn test_wide_type_object_member_count() {
        // Member counts above a single byte must survive encoding.
        let members: Vec<String> = (0..300).map(|i| format!("f{}", i)).collect();
        let mut chunk = BytecodeChunk::new();
        chunk.push(Buildable::TypeObject {
            reg: 1,
            name: "Big".into(),
            members,
        });
        chunk.push(Buildable::Halt);

        let code = CodeGenerator::new().generate(&chunk);
        // opcode, reg, name_len:u16, "Big", then the member count.
        let count = u16::from_le_bytes([code[7], code[8]]);
        assert_eq!(count, 300);

        let lines = disassemble(&code);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("LOAD_TYPE r1, Big"));
        assert!(lines[0].contains("f299"));
        assert!(lines[1].ends_with("HALT"));
    }
}
