//! Bytecode disassembler.
//!
//! Produces one line per instruction with its absolute offset. Used by the
//! CLI `disasm` command and by tests asserting on emitted code shape.

use crate::compiler::bytecode::Opcode;

fn u16_at(code: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([code[pos], code[pos + 1]])
}

fn u32_at(code: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([code[pos], code[pos + 1], code[pos + 2], code[pos + 3]])
}

fn i32_at(code: &[u8], pos: usize) -> i32 {
    i32::from_le_bytes([code[pos], code[pos + 1], code[pos + 2], code[pos + 3]])
}

fn i64_at(code: &[u8], pos: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&code[pos..pos + 8]);
    i64::from_le_bytes(b)
}

fn f32_at(code: &[u8], pos: usize) -> f32 {
    f32::from_le_bytes([code[pos], code[pos + 1], code[pos + 2], code[pos + 3]])
}

fn f64_at(code: &[u8], pos: usize) -> f64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&code[pos..pos + 8]);
    f64::from_le_bytes(b)
}

/// Disassemble a code buffer into display lines.
pub fn disassemble(code: &[u8]) -> Vec<String> {
    let mut lines = Vec::new();
    let mut pos = 0usize;

    while pos < code.len() {
        let at = pos;
        let Some(op) = Opcode::from_u8(code[pos]) else {
            lines.push(format!("{:06}: .byte {:#04x}", at, code[pos]));
            pos += 1;
            continue;
        };
        pos += 1;

        let text = match op {
            Opcode::LoadI32 => {
                let s = format!("r{}, {}", code[pos], i32_at(code, pos + 1));
                pos += 5;
                s
            }
            Opcode::LoadI64 => {
                let s = format!("r{}, {}", code[pos], i64_at(code, pos + 1));
                pos += 9;
                s
            }
            Opcode::LoadU32 => {
                let s = format!("r{}, {}", code[pos], u32_at(code, pos + 1));
                pos += 5;
                s
            }
            Opcode::LoadU64 => {
                let s = format!("r{}, {}", code[pos], i64_at(code, pos + 1) as u64);
                pos += 9;
                s
            }
            Opcode::LoadF32 => {
                let s = format!("r{}, {}", code[pos], f32_at(code, pos + 1));
                pos += 5;
                s
            }
            Opcode::LoadF64 => {
                let s = format!("r{}, {}", code[pos], f64_at(code, pos + 1));
                pos += 9;
                s
            }
            Opcode::LoadBool => {
                let s = format!("r{}, {}", code[pos], code[pos + 1] != 0);
                pos += 2;
                s
            }
            Opcode::LoadNull | Opcode::Push | Opcode::Pop | Opcode::Cmpz | Opcode::Throw => {
                let s = format!("r{}", code[pos]);
                pos += 1;
                s
            }
            Opcode::LoadString => {
                let reg = code[pos];
                let len = u32_at(code, pos + 1) as usize;
                let bytes = &code[pos + 5..pos + 5 + len];
                let s = format!("r{}, {:?}", reg, String::from_utf8_lossy(bytes));
                pos += 5 + len;
                s
            }
            Opcode::LoadFunc => {
                let s = format!(
                    "r{}, @{:06}, nargs={}, flags={:#04x}",
                    code[pos],
                    u32_at(code, pos + 1),
                    code[pos + 5],
                    code[pos + 6]
                );
                pos += 7;
                s
            }
            Opcode::LoadType => {
                let reg = code[pos];
                let name_len = u16_at(code, pos + 1) as usize;
                let name = String::from_utf8_lossy(&code[pos + 3..pos + 3 + name_len]).into_owned();
                pos += 3 + name_len;
                let count = u16_at(code, pos) as usize;
                pos += 2;
                let mut members = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = u16_at(code, pos) as usize;
                    members.push(String::from_utf8_lossy(&code[pos + 2..pos + 2 + len]).into_owned());
                    pos += 2 + len;
                }
                format!("r{}, {} {{{}}}", reg, name, members.join(", "))
            }
            Opcode::PopN | Opcode::Rsrv | Opcode::NewArray => {
                // NewArray also has a leading register operand.
                if op == Opcode::NewArray {
                    let s = format!("r{}, {}", code[pos], u16_at(code, pos + 1));
                    pos += 3;
                    s
                } else {
                    let s = format!("{}", u16_at(code, pos));
                    pos += 2;
                    s
                }
            }
            Opcode::Mov | Opcode::LoadDeref | Opcode::Neg | Opcode::Not | Opcode::Cmp => {
                let s = format!("r{}, r{}", code[pos], code[pos + 1]);
                pos += 2;
                s
            }
            Opcode::LoadOffset | Opcode::StoreOffset | Opcode::LoadRef => {
                let s = format!("r{}, [{}]", code[pos], u16_at(code, pos + 1));
                pos += 3;
                s
            }
            Opcode::LoadStatic | Opcode::StoreStatic => {
                let s = format!("r{}, s{}", code[pos], u16_at(code, pos + 1));
                pos += 3;
                s
            }
            Opcode::LoadMem | Opcode::StoreMem => {
                let s = format!("r{}, r{}, #{}", code[pos], code[pos + 1], code[pos + 2]);
                pos += 3;
                s
            }
            Opcode::LoadMemHash | Opcode::StoreMemHash => {
                let s = format!(
                    "r{}, r{}, {:#010x}",
                    code[pos],
                    code[pos + 1],
                    u32_at(code, pos + 2)
                );
                pos += 6;
                s
            }
            Opcode::LoadArrayIdx | Opcode::StoreArrayIdx => {
                let s = format!("r{}, r{}, r{}", code[pos], code[pos + 1], code[pos + 2]);
                pos += 3;
                s
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                let s = format!("r{}, r{}, r{}", code[pos], code[pos + 1], code[pos + 2]);
                pos += 3;
                s
            }
            Opcode::Jmp | Opcode::Je | Opcode::Jne | Opcode::Jg | Opcode::Jge | Opcode::BeginTry => {
                let s = format!("@{:06}", u32_at(code, pos));
                pos += 4;
                s
            }
            Opcode::New => {
                let s = format!("r{}, r{}", code[pos], code[pos + 1]);
                pos += 2;
                s
            }
            Opcode::Cast => {
                let s = format!("r{}, r{}, tag={}", code[pos], code[pos + 1], code[pos + 2]);
                pos += 3;
                s
            }
            Opcode::Call => {
                let s = format!("r{}, nargs={}", code[pos], code[pos + 1]);
                pos += 2;
                s
            }
            Opcode::Export => {
                let s = format!("r{}, {:#010x}", code[pos], u32_at(code, pos + 1));
                pos += 5;
                s
            }
            Opcode::Rem => {
                let len = u32_at(code, pos) as usize;
                let bytes = &code[pos + 4..pos + 4 + len];
                let s = format!("{:?}", String::from_utf8_lossy(bytes));
                pos += 4 + len;
                s
            }
            Opcode::Ret | Opcode::EndTry | Opcode::Halt => String::new(),
        };

        if text.is_empty() {
            lines.push(format!("{:06}: {}", at, op.mnemonic()));
        } else {
            lines.push(format!("{:06}: {} {}", at, op.mnemonic(), text));
        }
    }

    lines
}
