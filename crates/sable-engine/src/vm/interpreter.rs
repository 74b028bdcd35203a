//! The register interpreter.
//!
//! Eight general registers, a value stack, and a frame list. Register 0 is
//! the expression-result and return register; all others are callee-saved
//! and restored on return. A call frame starts at the first argument slot:
//! arguments occupy offsets `0..nargs`, a frame marker sits at `nargs`, and
//! locals begin at `nargs + 1`. `RET` truncates the stack back to the frame
//! base, so call sites never clean up arguments.
//!
//! Two failure channels exist and never mix. Script-level errors (division
//! by zero, bad casts, wrong argument counts, user `throw`) become values
//! unwound to the nearest try frame, or `VmError::UncaughtException` when
//! none exists. Violated VM invariants (corrupt bytecode, dangling
//! handles, stack underflow) are bugs in the compiler or VM and panic.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::compiler::bytecode::Opcode;
use crate::compiler::Program;
use crate::name_hash;
use crate::vm::gc;
use crate::vm::heap::{Heap, HeapHandle, HeapObject, ObjectMember};
use crate::vm::value::{FrameInfo, FunctionValue, Value};

pub const NUM_REGISTERS: usize = 8;

/// Allocations between collection attempts.
const GC_ALLOC_INTERVAL: usize = 1024;

/// Comparison-flag value meaning "not comparable / not equal".
const CMP_UNORDERED: i8 = i8::MAX;

/// Member name the VM reserves for an object's invoke target. Calling an
/// object value calls this member with the object appended as the last
/// argument.
pub const INVOKE_MEMBER: &str = "$invoke";

/// Member name the VM reserves for a type object's base link. Storing to
/// it sets the heap-level proto pointer instead of an ordinary member.
pub const PROTO_MEMBER: &str = "$proto";

/// Runtime type tags carried by `CAST`.
pub mod cast_tag {
    pub const ANY: u8 = 0;
    pub const INT: u8 = 1;
    pub const UINT: u8 = 2;
    pub const FLOAT: u8 = 3;
    pub const BOOL: u8 = 4;
    pub const STRING: u8 = 5;
    /// Reference casts are identity at runtime; the analyzer did the check.
    pub const OBJECT: u8 = 6;
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("Uncaught exception: {0}")]
    UncaughtException(String),
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    return_addr: usize,
    caller_base: usize,
    saved: [Value; NUM_REGISTERS],
}

#[derive(Debug, Clone, Copy)]
struct TryFrame {
    catch_addr: usize,
    stack_len: usize,
    frame_depth: usize,
}

pub struct Vm {
    registers: [Value; NUM_REGISTERS],
    stack: Vec<Value>,
    frames: Vec<Frame>,
    try_frames: Vec<TryFrame>,
    frame_base: usize,
    pub statics: Vec<Value>,
    pub heap: Heap,
    /// Values published with `EXPORT`, keyed by name hash.
    pub exports: FxHashMap<u32, Value>,
    code: Vec<u8>,
    ip: usize,
    cmp: i8,
}

impl Vm {
    pub fn new(program: &Program) -> Self {
        Self {
            registers: [Value::None; NUM_REGISTERS],
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            try_frames: Vec::new(),
            frame_base: 0,
            statics: vec![Value::None; program.statics_count as usize],
            heap: Heap::new(),
            exports: FxHashMap::default(),
            code: program.bytecode.clone(),
            ip: 0,
            cmp: 0,
        }
    }

    pub fn register(&self, index: usize) -> Value {
        self.registers[index]
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Look up an exported value by name.
    pub fn export_named(&self, name: &str) -> Option<Value> {
        self.exports.get(&name_hash(name)).copied()
    }

    /// Execute from the start of the code. Returns the value left in
    /// register 0 when execution halts.
    pub fn run(&mut self) -> Result<Value, VmError> {
        // The top level runs in a frame of its own so locals address
        // uniformly: zero arguments, marker at offset 0, locals from 1.
        let sentinel = self.code.len();
        self.frames.push(Frame {
            return_addr: sentinel,
            caller_base: 0,
            saved: self.registers,
        });
        self.stack.push(Value::StackFrame(FrameInfo {
            return_addr: sentinel as u32,
            caller_base: 0,
        }));
        self.frame_base = 0;
        self.ip = 0;

        while self.ip < self.code.len() {
            self.step()?;
            if self.heap.allocations_since_gc >= GC_ALLOC_INTERVAL {
                self.collect_garbage();
            }
        }

        Ok(self.registers[0])
    }

    pub fn collect_garbage(&mut self) -> usize {
        gc::collect(
            &mut self.heap,
            self.registers
                .iter()
                .chain(self.stack.iter())
                .chain(self.statics.iter())
                .chain(self.exports.values()),
        )
    }

    // --- fetch helpers; running past the end is corrupt bytecode ---

    fn fetch_u8(&mut self) -> u8 {
        let b = self.code[self.ip];
        self.ip += 1;
        b
    }

    fn fetch_u16(&mut self) -> u16 {
        let v = u16::from_le_bytes([self.code[self.ip], self.code[self.ip + 1]]);
        self.ip += 2;
        v
    }

    fn fetch_u32(&mut self) -> u32 {
        let v = u32::from_le_bytes([
            self.code[self.ip],
            self.code[self.ip + 1],
            self.code[self.ip + 2],
            self.code[self.ip + 3],
        ]);
        self.ip += 4;
        v
    }

    fn fetch_i64(&mut self) -> i64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.code[self.ip..self.ip + 8]);
        self.ip += 8;
        i64::from_le_bytes(b)
    }

    fn fetch_f64(&mut self) -> f64 {
        f64::from_bits(self.fetch_i64() as u64)
    }

    fn fetch_bytes(&mut self, len: usize) -> Vec<u8> {
        let bytes = self.code[self.ip..self.ip + len].to_vec();
        self.ip += len;
        bytes
    }

    fn step(&mut self) -> Result<(), VmError> {
        let opcode = Opcode::from_u8(self.code[self.ip])
            .unwrap_or_else(|| panic!("corrupt bytecode: unknown opcode at {}", self.ip));
        self.ip += 1;

        match opcode {
            Opcode::LoadI32 => {
                let reg = self.fetch_u8() as usize;
                let value = self.fetch_u32() as i32;
                self.registers[reg] = Value::I32(value);
            }
            Opcode::LoadI64 => {
                let reg = self.fetch_u8() as usize;
                let value = self.fetch_i64();
                self.registers[reg] = Value::I64(value);
            }
            Opcode::LoadU32 => {
                let reg = self.fetch_u8() as usize;
                let value = self.fetch_u32();
                self.registers[reg] = Value::U32(value);
            }
            Opcode::LoadU64 => {
                let reg = self.fetch_u8() as usize;
                let value = self.fetch_i64() as u64;
                self.registers[reg] = Value::U64(value);
            }
            Opcode::LoadF32 => {
                let reg = self.fetch_u8() as usize;
                let value = f32::from_bits(self.fetch_u32());
                self.registers[reg] = Value::F32(value);
            }
            Opcode::LoadF64 => {
                let reg = self.fetch_u8() as usize;
                let value = self.fetch_f64();
                self.registers[reg] = Value::F64(value);
            }
            Opcode::LoadBool => {
                let reg = self.fetch_u8() as usize;
                let value = self.fetch_u8() != 0;
                self.registers[reg] = Value::Bool(value);
            }
            Opcode::LoadNull => {
                let reg = self.fetch_u8() as usize;
                self.registers[reg] = Value::None;
            }
            Opcode::LoadString => {
                let reg = self.fetch_u8() as usize;
                let len = self.fetch_u32() as usize;
                let bytes = self.fetch_bytes(len);
                let text = String::from_utf8_lossy(&bytes).into_owned();
                let handle = self.heap.alloc_str(text);
                self.registers[reg] = Value::HeapPtr(handle);
            }
            Opcode::LoadFunc => {
                let reg = self.fetch_u8() as usize;
                let addr = self.fetch_u32();
                let nargs = self.fetch_u8();
                let flags = self.fetch_u8();
                self.registers[reg] = Value::FuncAddr(FunctionValue { addr, nargs, flags });
            }
            Opcode::LoadType => {
                let reg = self.fetch_u8() as usize;
                let name_len = self.fetch_u16() as usize;
                let name = String::from_utf8_lossy(&self.fetch_bytes(name_len)).into_owned();
                let count = self.fetch_u16() as usize;
                let mut members = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = self.fetch_u16() as usize;
                    let member =
                        String::from_utf8_lossy(&self.fetch_bytes(len)).into_owned();
                    members.push(ObjectMember {
                        hash: name_hash(&member),
                        name: member,
                        value: Value::None,
                    });
                }
                let handle = self.heap.alloc(HeapObject::Object {
                    type_name: name,
                    members,
                    proto: None,
                });
                self.registers[reg] = Value::HeapPtr(handle);
            }

            Opcode::Push => {
                let reg = self.fetch_u8() as usize;
                self.stack.push(self.registers[reg]);
            }
            Opcode::Pop => {
                let reg = self.fetch_u8() as usize;
                self.registers[reg] = self.stack.pop().expect("stack underflow on POP");
            }
            Opcode::PopN => {
                let count = self.fetch_u16() as usize;
                assert!(count <= self.stack.len(), "stack underflow on POP_N");
                self.stack.truncate(self.stack.len() - count);
            }
            Opcode::Mov => {
                let dst = self.fetch_u8() as usize;
                let src = self.fetch_u8() as usize;
                self.registers[dst] = self.registers[src];
            }
            Opcode::Rsrv => {
                let count = self.fetch_u16() as usize;
                self.stack.resize(self.stack.len() + count, Value::None);
            }
            Opcode::LoadOffset => {
                let reg = self.fetch_u8() as usize;
                let offset = self.fetch_u16() as usize;
                self.registers[reg] = self.stack[self.frame_base + offset];
            }
            Opcode::StoreOffset => {
                let reg = self.fetch_u8() as usize;
                let offset = self.fetch_u16() as usize;
                self.stack[self.frame_base + offset] = self.registers[reg];
            }
            Opcode::LoadRef => {
                let reg = self.fetch_u8() as usize;
                let offset = self.fetch_u16() as usize;
                self.registers[reg] = Value::ValueRef(self.frame_base + offset);
            }
            Opcode::LoadDeref => {
                let dst = self.fetch_u8() as usize;
                let src = self.fetch_u8() as usize;
                match self.registers[src] {
                    Value::ValueRef(slot) => {
                        let value = self.stack[slot];
                        // References point at plain values, never at other
                        // references.
                        if let Value::ValueRef(_) = value {
                            panic!(
                                "reference at stack slot {} aliases another reference",
                                slot
                            );
                        }
                        self.registers[dst] = value;
                    }
                    other => panic!("LOAD_DEREF on non-reference value {}", other.type_name()),
                }
            }

            Opcode::LoadStatic => {
                let reg = self.fetch_u8() as usize;
                let id = self.fetch_u16() as usize;
                self.registers[reg] = self.statics[id];
            }
            Opcode::StoreStatic => {
                let reg = self.fetch_u8() as usize;
                let id = self.fetch_u16() as usize;
                self.statics[id] = self.registers[reg];
            }

            Opcode::LoadMem => {
                let dst = self.fetch_u8() as usize;
                let obj = self.fetch_u8() as usize;
                let index = self.fetch_u8() as usize;
                let value = self.member_by_index(self.registers[obj], index);
                match value {
                    Some(value) => self.registers[dst] = value,
                    None => return self.throw_message("member access on invalid object"),
                }
            }
            Opcode::StoreMem => {
                let src = self.fetch_u8() as usize;
                let obj = self.fetch_u8() as usize;
                let index = self.fetch_u8() as usize;
                let value = self.registers[src];
                let Some(handle) = self.registers[obj].as_heap() else {
                    return self.throw_message("member store on non-object value");
                };
                let stored = self
                    .heap
                    .get_mut(handle)
                    .map(|o| o.set_member_by_index(index, value))
                    .unwrap_or(false);
                if !stored {
                    return self.throw_message("member store on invalid object");
                }
            }
            Opcode::LoadMemHash => {
                let dst = self.fetch_u8() as usize;
                let obj = self.fetch_u8() as usize;
                let hash = self.fetch_u32();
                match self.member_by_hash(self.registers[obj], hash) {
                    Some(value) => self.registers[dst] = value,
                    None => return self.throw_message("no such member"),
                }
            }
            Opcode::StoreMemHash => {
                let src = self.fetch_u8() as usize;
                let obj = self.fetch_u8() as usize;
                let hash = self.fetch_u32();
                let value = self.registers[src];
                let Some(handle) = self.registers[obj].as_heap() else {
                    return self.throw_message("member store on non-object value");
                };
                if hash == name_hash(PROTO_MEMBER) {
                    let proto = value.as_heap();
                    if let Some(HeapObject::Object { proto: slot, .. }) =
                        self.heap.get_mut(handle)
                    {
                        *slot = proto;
                    }
                } else {
                    let name = self.member_name_for_hash(handle, hash);
                    if let Some(object) = self.heap.get_mut(handle) {
                        object.set_member(hash, &name, value);
                    }
                }
            }
            Opcode::LoadArrayIdx => {
                let dst = self.fetch_u8() as usize;
                let obj = self.fetch_u8() as usize;
                let idx = self.fetch_u8() as usize;
                let key = self.registers[idx];
                let element = self.registers[obj]
                    .as_heap()
                    .and_then(|h| self.indexed_load(h, key));
                match element {
                    Some(value) => self.registers[dst] = value,
                    None => return self.throw_message("index out of bounds"),
                }
            }
            Opcode::StoreArrayIdx => {
                let src = self.fetch_u8() as usize;
                let obj = self.fetch_u8() as usize;
                let idx = self.fetch_u8() as usize;
                let value = self.registers[src];
                let key = self.registers[idx];
                let Some(handle) = self.registers[obj].as_heap() else {
                    return self.throw_message("indexed store on non-indexable value");
                };
                if !self.indexed_store(handle, key, value) {
                    return self.throw_message("index out of bounds");
                }
            }

            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                let dst = self.fetch_u8() as usize;
                let lhs = self.fetch_u8() as usize;
                let rhs = self.fetch_u8() as usize;
                // A thrown script error must leave r0 holding the exception,
                // so only write the destination on success.
                if let Some(result) =
                    self.arith(opcode, self.registers[lhs], self.registers[rhs])?
                {
                    self.registers[dst] = result;
                }
            }
            Opcode::Neg => {
                let dst = self.fetch_u8() as usize;
                let src = self.fetch_u8() as usize;
                self.registers[dst] = match self.registers[src] {
                    Value::I32(v) => Value::I32(v.wrapping_neg()),
                    Value::I64(v) => Value::I64(v.wrapping_neg()),
                    Value::F32(v) => Value::F32(-v),
                    Value::F64(v) => Value::F64(-v),
                    other => {
                        return self.throw_message(&format!(
                            "cannot negate a {} value",
                            other.type_name()
                        ))
                    }
                };
            }
            Opcode::Not => {
                let dst = self.fetch_u8() as usize;
                let src = self.fetch_u8() as usize;
                self.registers[dst] = Value::Bool(!self.registers[src].is_truthy());
            }

            Opcode::Cmp => {
                let lhs = self.fetch_u8() as usize;
                let rhs = self.fetch_u8() as usize;
                self.cmp = self.compare(self.registers[lhs], self.registers[rhs]);
            }
            Opcode::Cmpz => {
                let reg = self.fetch_u8() as usize;
                self.cmp = if self.registers[reg].is_truthy() { 1 } else { 0 };
            }
            Opcode::Jmp => {
                let addr = self.fetch_u32() as usize;
                self.ip = addr;
            }
            Opcode::Je => {
                let addr = self.fetch_u32() as usize;
                if self.cmp == 0 {
                    self.ip = addr;
                }
            }
            Opcode::Jne => {
                let addr = self.fetch_u32() as usize;
                if self.cmp != 0 {
                    self.ip = addr;
                }
            }
            Opcode::Jg => {
                let addr = self.fetch_u32() as usize;
                if self.cmp > 0 && self.cmp != CMP_UNORDERED {
                    self.ip = addr;
                }
            }
            Opcode::Jge => {
                let addr = self.fetch_u32() as usize;
                if self.cmp >= 0 && self.cmp != CMP_UNORDERED {
                    self.ip = addr;
                }
            }

            Opcode::New => {
                let dst = self.fetch_u8() as usize;
                let type_reg = self.fetch_u8() as usize;
                let Some(type_handle) = self.registers[type_reg].as_heap() else {
                    return self.throw_message("new on a non-type value");
                };
                let handle = self.instantiate(type_handle);
                match handle {
                    Some(handle) => self.registers[dst] = Value::HeapPtr(handle),
                    None => return self.throw_message("new on a non-type value"),
                }
            }
            Opcode::NewArray => {
                let dst = self.fetch_u8() as usize;
                let count = self.fetch_u16() as usize;
                let handle = self.heap.alloc(HeapObject::Array {
                    elements: vec![Value::None; count],
                });
                self.registers[dst] = Value::HeapPtr(handle);
            }
            Opcode::Cast => {
                let dst = self.fetch_u8() as usize;
                let src = self.fetch_u8() as usize;
                let tag = self.fetch_u8();
                if let Some(result) = self.cast(self.registers[src], tag)? {
                    self.registers[dst] = result;
                }
            }

            Opcode::Call => {
                let reg = self.fetch_u8() as usize;
                let nargs = self.fetch_u8();
                self.call(self.registers[reg], nargs)?;
            }
            Opcode::Ret => {
                let frame = self.frames.pop().expect("RET without a frame");
                self.stack.truncate(self.frame_base);
                // r0 carries the return value through.
                for i in 1..NUM_REGISTERS {
                    self.registers[i] = frame.saved[i];
                }
                self.frame_base = frame.caller_base;
                self.ip = frame.return_addr;
            }

            Opcode::BeginTry => {
                let catch_addr = self.fetch_u32() as usize;
                self.try_frames.push(TryFrame {
                    catch_addr,
                    stack_len: self.stack.len(),
                    frame_depth: self.frames.len(),
                });
            }
            Opcode::EndTry => {
                self.try_frames.pop().expect("END_TRY without BEGIN_TRY");
            }
            Opcode::Throw => {
                let reg = self.fetch_u8() as usize;
                return self.throw(self.registers[reg]);
            }

            Opcode::Export => {
                let reg = self.fetch_u8() as usize;
                let hash = self.fetch_u32();
                self.exports.insert(hash, self.registers[reg]);
            }
            Opcode::Rem => {
                let len = self.fetch_u32() as usize;
                self.ip += len;
            }
            Opcode::Halt => {
                self.ip = self.code.len();
            }
        }

        Ok(())
    }

    // --- calls ---

    fn call(&mut self, callee: Value, nargs: u8) -> Result<(), VmError> {
        match callee {
            Value::FuncAddr(func) => self.enter(func, nargs),
            Value::HeapPtr(handle) => {
                // Calling an object calls its invoke member with the object
                // itself appended as the implicit self argument.
                let invoke = self.heap.member(handle, name_hash(INVOKE_MEMBER));
                match invoke {
                    Some(Value::FuncAddr(func)) => {
                        self.stack.push(callee);
                        self.enter(func, nargs + 1)
                    }
                    _ => self.throw_message("value is not callable"),
                }
            }
            Value::NativeFunc(func) => {
                let nargs = nargs as usize;
                assert!(nargs <= self.stack.len(), "stack underflow on native call");
                let base = self.stack.len() - nargs;
                let args: Vec<Value> = self.stack[base..].to_vec();
                self.stack.truncate(base);
                match func(self, &args) {
                    Ok(value) => {
                        self.registers[0] = value;
                        Ok(())
                    }
                    Err(thrown) => self.throw(thrown),
                }
            }
            other => {
                self.throw_message(&format!("a {} value is not callable", other.type_name()))
            }
        }
    }

    fn enter(&mut self, func: FunctionValue, nargs: u8) -> Result<(), VmError> {
        if func.nargs != nargs {
            // Drop the pushed arguments before unwinding.
            let pushed = (nargs as usize).min(self.stack.len());
            self.stack.truncate(self.stack.len() - pushed);
            return self.throw_message(&format!(
                "wrong number of arguments: expected {}, got {}",
                func.nargs, nargs
            ));
        }
        let new_base = self.stack.len() - nargs as usize;
        self.frames.push(Frame {
            return_addr: self.ip,
            caller_base: self.frame_base,
            saved: self.registers,
        });
        self.stack.push(Value::StackFrame(FrameInfo {
            return_addr: self.ip as u32,
            caller_base: self.frame_base as u32,
        }));
        self.frame_base = new_base;
        self.ip = func.addr as usize;
        Ok(())
    }

    // --- exceptions ---

    fn throw(&mut self, value: Value) -> Result<(), VmError> {
        match self.try_frames.pop() {
            Some(frame) => {
                // Unwind any call frames entered after the try was set up,
                // restoring the registers of the function that owns it.
                if self.frames.len() > frame.frame_depth {
                    let unwound = self.frames[frame.frame_depth];
                    for i in 1..NUM_REGISTERS {
                        self.registers[i] = unwound.saved[i];
                    }
                    self.frame_base = unwound.caller_base;
                    self.frames.truncate(frame.frame_depth);
                }
                self.stack.truncate(frame.stack_len);
                self.registers[0] = value;
                self.ip = frame.catch_addr;
                Ok(())
            }
            None => Err(VmError::UncaughtException(self.display_value(value))),
        }
    }

    fn throw_message(&mut self, message: &str) -> Result<(), VmError> {
        let handle = self.heap.alloc_str(message);
        self.throw(Value::HeapPtr(handle))
    }

    // --- operations ---

    /// Returns `Ok(None)` when the operation threw a script error; the
    /// caller must not touch the destination register in that case.
    fn arith(&mut self, op: Opcode, a: Value, b: Value) -> Result<Option<Value>, VmError> {
        // String concatenation: ADD with at least one string operand.
        if op == Opcode::Add {
            if self.str_content(a).is_some() || self.str_content(b).is_some() {
                let text = format!("{}{}", self.display_value(a), self.display_value(b));
                let handle = self.heap.alloc_str(text);
                return Ok(Some(Value::HeapPtr(handle)));
            }
        }

        if a.is_float() || b.is_float() {
            let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
                self.throw_message(&format!(
                    "unsupported operand types {} and {}",
                    a.type_name(),
                    b.type_name()
                ))?;
                return Ok(None);
            };
            return Ok(Some(Value::F64(match op {
                Opcode::Add => x + y,
                Opcode::Sub => x - y,
                Opcode::Mul => x * y,
                Opcode::Div => x / y,
                Opcode::Mod => x % y,
                _ => unreachable!(),
            })));
        }

        let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) else {
            self.throw_message(&format!(
                "unsupported operand types {} and {}",
                a.type_name(),
                b.type_name()
            ))?;
            return Ok(None);
        };

        if matches!(op, Opcode::Div | Opcode::Mod) && y == 0 {
            self.throw_message("division by zero")?;
            return Ok(None);
        }

        let result = match op {
            Opcode::Add => x.wrapping_add(y),
            Opcode::Sub => x.wrapping_sub(y),
            Opcode::Mul => x.wrapping_mul(y),
            Opcode::Div => x.wrapping_div(y),
            Opcode::Mod => x.wrapping_rem(y),
            _ => unreachable!(),
        };

        // Stay in the 32-bit representation when both inputs fit it.
        if let (Value::I32(_), Value::I32(_)) = (a, b) {
            if let Ok(narrow) = i32::try_from(result) {
                return Ok(Some(Value::I32(narrow)));
            }
        }
        Ok(Some(Value::I64(result)))
    }

    fn compare(&self, a: Value, b: Value) -> i8 {
        if let (Some(x), Some(y)) = (self.str_content(a), self.str_content(b)) {
            return match x.cmp(y) {
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            };
        }
        if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
            // NaN compares unequal to everything, itself included.
            if x.is_nan() || y.is_nan() {
                return CMP_UNORDERED;
            }
            if x < y {
                return -1;
            }
            if x > y {
                return 1;
            }
            return 0;
        }
        match (a, b) {
            (Value::None, Value::None) => 0,
            (Value::HeapPtr(x), Value::HeapPtr(y)) if x == y => 0,
            (Value::Bool(x), Value::Bool(y)) if x == y => 0,
            (Value::FuncAddr(x), Value::FuncAddr(y)) if x == y => 0,
            _ => CMP_UNORDERED,
        }
    }

    /// Returns `Ok(None)` when the cast threw a script error.
    fn cast(&mut self, value: Value, tag: u8) -> Result<Option<Value>, VmError> {
        let result = match tag {
            cast_tag::ANY | cast_tag::OBJECT => Some(value),
            cast_tag::INT => value
                .as_i64()
                .or_else(|| value.as_f64().map(|f| f as i64))
                .map(Value::I64),
            cast_tag::UINT => value
                .as_f64()
                .map(|f| Value::U64(f as u64)),
            cast_tag::FLOAT => value.as_f64().map(Value::F64),
            cast_tag::BOOL => Some(Value::Bool(value.is_truthy())),
            cast_tag::STRING => {
                let text = self.display_value(value);
                let handle = self.heap.alloc_str(text);
                Some(Value::HeapPtr(handle))
            }
            _ => panic!("corrupt bytecode: unknown cast tag {}", tag),
        };
        match result {
            Some(value) => Ok(Some(value)),
            None => {
                self.throw_message(&format!("cannot cast {} value", value.type_name()))?;
                Ok(None)
            }
        }
    }

    /// Clone a type object into a fresh instance: own members first, then
    /// non-shadowed ancestor members, with the proto link pointing back at
    /// the type object.
    fn instantiate(&mut self, type_handle: crate::vm::heap::HeapHandle) -> Option<crate::vm::heap::HeapHandle> {
        let mut members: Vec<ObjectMember> = Vec::new();
        let mut type_name = String::new();
        let mut current = Some(type_handle);
        let mut depth = 0;

        while let Some(handle) = current {
            let HeapObject::Object {
                type_name: name,
                members: own,
                proto,
            } = self.heap.get(handle)?
            else {
                return None;
            };
            if depth == 0 {
                type_name = name.clone();
            }
            for member in own {
                if !members.iter().any(|m| m.hash == member.hash) {
                    members.push(member.clone());
                }
            }
            current = *proto;
            depth += 1;
            if depth > 32 {
                break;
            }
        }

        Some(self.heap.alloc(HeapObject::Object {
            type_name,
            members,
            proto: Some(type_handle),
        }))
    }

    // --- member and element access helpers ---

    /// Element read through index syntax. Arrays, slices and buffers take
    /// an integer index; maps take any key, matched by value (strings by
    /// content).
    fn indexed_load(&self, handle: HeapHandle, key: Value) -> Option<Value> {
        let index = |key: Value| key.as_i64().and_then(|i| usize::try_from(i).ok());
        match self.heap.get(handle)? {
            HeapObject::Array { elements } => elements.get(index(key)?).copied(),
            HeapObject::Slice { array, start, len } => {
                let i = index(key)?;
                if i >= *len {
                    return None;
                }
                match self.heap.get(*array)? {
                    HeapObject::Array { elements } => elements.get(*start + i).copied(),
                    _ => None,
                }
            }
            HeapObject::Buffer { bytes } => bytes.get(index(key)?).map(|b| Value::U8(*b)),
            HeapObject::Map { entries } => entries
                .iter()
                .find(|(k, _)| self.compare(*k, key) == 0)
                .map(|(_, v)| *v),
            _ => None,
        }
    }

    /// Element write through index syntax. Map stores insert when the key
    /// is absent; everything else is bounds-checked.
    fn indexed_store(&mut self, handle: HeapHandle, key: Value, value: Value) -> bool {
        enum Slot {
            Element(HeapHandle, usize),
            Byte(usize),
            MapEntry(Option<usize>),
        }
        let index = |key: Value| key.as_i64().and_then(|i| usize::try_from(i).ok());
        let slot = match self.heap.get(handle) {
            Some(HeapObject::Array { elements }) => index(key)
                .filter(|i| *i < elements.len())
                .map(|i| Slot::Element(handle, i)),
            Some(HeapObject::Slice { array, start, len }) => index(key)
                .filter(|i| *i < *len)
                .map(|i| Slot::Element(*array, *start + i)),
            Some(HeapObject::Buffer { bytes }) => index(key)
                .filter(|i| *i < bytes.len())
                .map(Slot::Byte),
            Some(HeapObject::Map { entries }) => Some(Slot::MapEntry(
                entries.iter().position(|(k, _)| self.compare(*k, key) == 0),
            )),
            _ => None,
        };
        match slot {
            Some(Slot::Element(target, i)) => match self.heap.get_mut(target) {
                Some(HeapObject::Array { elements }) => {
                    elements[i] = value;
                    true
                }
                _ => false,
            },
            Some(Slot::Byte(i)) => {
                match (self.heap.get_mut(handle), value.as_i64()) {
                    (Some(HeapObject::Buffer { bytes }), Some(v)) => {
                        bytes[i] = v as u8;
                        true
                    }
                    _ => false,
                }
            }
            Some(Slot::MapEntry(position)) => match self.heap.get_mut(handle) {
                Some(HeapObject::Map { entries }) => {
                    match position {
                        Some(i) => entries[i].1 = value,
                        None => entries.push((key, value)),
                    }
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    fn member_by_index(&self, value: Value, index: usize) -> Option<Value> {
        let handle = value.as_heap()?;
        self.heap.get(handle)?.member_by_index(index).copied()
    }

    fn member_by_hash(&self, value: Value, hash: u32) -> Option<Value> {
        let handle = value.as_heap()?;
        // Built-in containers expose a synthetic length member.
        let length = |n: usize| (hash == name_hash("length")).then(|| Value::I64(n as i64));
        match self.heap.get(handle)? {
            HeapObject::Array { elements } => length(elements.len()),
            HeapObject::Str(text) => length(text.chars().count()),
            HeapObject::Slice { len, .. } => length(*len),
            HeapObject::Buffer { bytes } => length(bytes.len()),
            HeapObject::Map { entries } => length(entries.len()),
            HeapObject::Object { .. } => self.heap.member(handle, hash),
            HeapObject::UserData(_) => None,
        }
    }

    fn member_name_for_hash(&self, handle: crate::vm::heap::HeapHandle, hash: u32) -> String {
        // Recover the declared name from the proto chain so dynamically
        // added members keep readable names for debugging.
        let mut current = Some(handle);
        for _ in 0..32 {
            let Some(HeapObject::Object { members, proto, .. }) =
                current.and_then(|h| self.heap.get(h))
            else {
                break;
            };
            if let Some(member) = members.iter().find(|m| m.hash == hash) {
                return member.name.clone();
            }
            current = *proto;
        }
        format!("#{:08x}", hash)
    }

    fn str_content(&self, value: Value) -> Option<&str> {
        match self.heap.get(value.as_heap()?) {
            Some(HeapObject::Str(text)) => Some(text),
            _ => None,
        }
    }

    /// Human-readable rendering used for exceptions and string conversion.
    pub fn display_value(&self, value: Value) -> String {
        match value {
            Value::HeapPtr(handle) => match self.heap.get(handle) {
                Some(HeapObject::Str(text)) => text.clone(),
                Some(HeapObject::Array { elements }) => format!("<array[{}]>", elements.len()),
                Some(HeapObject::Slice { len, .. }) => format!("<slice[{}]>", len),
                Some(HeapObject::Buffer { bytes }) => format!("<buffer[{}]>", bytes.len()),
                Some(HeapObject::Map { entries }) => format!("<map[{}]>", entries.len()),
                Some(HeapObject::Object { type_name, .. }) => format!("<{}>", type_name),
                Some(HeapObject::UserData(data)) => format!("<{}>", data.type_name()),
                None => "<invalid object>".to_string(),
            },
            other => other.to_string(),
        }
    }
}
