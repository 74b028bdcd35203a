//! Buildable intermediate representation.
//!
//! Lowering produces a tree of `Buildable`s instead of raw bytes: control
//! flow refers to `LabelId`s, and nested function bodies are whole
//! `BytecodeChunk`s inside their parent. The backend flattens the tree,
//! resolves every label to an absolute address, and patches the jump sites
//! in a final bake step. Nothing in this module knows byte offsets.

/// Symbolic code position, resolved by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub u32);

/// Conditional modes for [`Buildable::Jump`]; conditions read the VM's
/// comparison flag set by `Comparison`/`CompareZero`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpMode {
    Always,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
}

/// Arithmetic operations that map one-to-one onto opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageDirection {
    Load,
    Store,
}

/// Addressing mode for a load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTarget {
    /// Stack slot at a fixed offset from the frame base.
    LocalOffset { offset: u16 },
    /// Static-memory slot.
    Static { id: u16 },
    /// Object data member by flat index (same-class access).
    MemberIndex { object: u8, index: u8 },
    /// Object data member by name hash (base-class or dynamic access).
    MemberHash { object: u8, hash: u32 },
    /// Array element; `index` names the register holding the index.
    ArrayIndex { object: u8, index: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageOperation {
    pub direction: StorageDirection,
    /// Value register: destination for loads, source for stores.
    pub reg: u8,
    pub target: StorageTarget,
}

/// One node of the instruction tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Buildable {
    /// A nested code region (function body) flattened in place by the
    /// backend with its own label bookkeeping.
    Chunk(BytecodeChunk),
    /// Marks the current position as the target of `label`.
    LabelMarker(LabelId),
    Jump {
        mode: JumpMode,
        label: LabelId,
    },
    /// Sets the comparison flag from two registers.
    Comparison {
        lhs: u8,
        rhs: u8,
    },
    /// Sets the comparison flag from one register against zero/false.
    CompareZero {
        reg: u8,
    },
    FunctionCall {
        reg: u8,
        nargs: u8,
    },
    Return,
    PushReg {
        reg: u8,
    },
    PopReg {
        reg: u8,
    },
    PopN {
        count: u16,
    },
    ReserveLocals {
        count: u16,
    },
    LoadRef {
        reg: u8,
        offset: u16,
    },
    LoadDeref {
        dst: u8,
        src: u8,
    },
    ConstI32 {
        reg: u8,
        value: i32,
    },
    ConstI64 {
        reg: u8,
        value: i64,
    },
    ConstU32 {
        reg: u8,
        value: u32,
    },
    ConstU64 {
        reg: u8,
        value: u64,
    },
    ConstF32 {
        reg: u8,
        value: f32,
    },
    ConstF64 {
        reg: u8,
        value: f64,
    },
    ConstBool {
        reg: u8,
        value: bool,
    },
    ConstNull {
        reg: u8,
    },
    ConstString {
        reg: u8,
        value: String,
    },
    /// Function value whose code address is `label`, resolved at bake time.
    Function {
        reg: u8,
        label: LabelId,
        nargs: u8,
        flags: u8,
    },
    /// Runtime type object with named members, used by `New`.
    TypeObject {
        reg: u8,
        name: String,
        members: Vec<String>,
    },
    Storage(StorageOperation),
    Arith {
        op: ArithOp,
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    Neg {
        dst: u8,
        src: u8,
    },
    Not {
        dst: u8,
        src: u8,
    },
    Cast {
        dst: u8,
        src: u8,
        tag: u8,
    },
    New {
        dst: u8,
        type_reg: u8,
    },
    NewArray {
        dst: u8,
        count: u16,
    },
    BeginTry {
        label: LabelId,
    },
    EndTry,
    Throw {
        reg: u8,
    },
    Mov {
        dst: u8,
        src: u8,
    },
    Export {
        reg: u8,
        hash: u32,
    },
    /// Annotation carried into the byte stream as a `REM` instruction; the
    /// interpreter skips it.
    Comment(String),
    Halt,
}

/// An ordered list of buildables forming one code region.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BytecodeChunk {
    pub buildables: Vec<Buildable>,
}

impl BytecodeChunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, buildable: Buildable) {
        self.buildables.push(buildable);
    }

    pub fn extend(&mut self, other: BytecodeChunk) {
        self.buildables.extend(other.buildables);
    }

    /// Net stack effect of this chunk, in slots. Nested chunks are separate
    /// frames and contribute nothing; calls consume their pushed arguments.
    /// Statement-level code must come out at zero.
    pub fn stack_effect(&self) -> i32 {
        self.buildables.iter().map(stack_effect).sum()
    }
}

fn stack_effect(buildable: &Buildable) -> i32 {
    match buildable {
        Buildable::PushReg { .. } => 1,
        Buildable::PopReg { .. } => -1,
        Buildable::PopN { count } => -(*count as i32),
        Buildable::ReserveLocals { count } => *count as i32,
        // The callee's RET truncates the stack back past the arguments.
        Buildable::FunctionCall { nargs, .. } => -(*nargs as i32),
        _ => 0,
    }
}

/// Shared lowering state: label allocation and stack-depth accounting.
#[derive(Debug, Default)]
pub struct InstructionStream {
    label_counter: u32,
    stack_size: i32,
}

impl InstructionStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_label(&mut self) -> LabelId {
        let id = LabelId(self.label_counter);
        self.label_counter += 1;
        id
    }

    pub fn increment_stack(&mut self, by: i32) {
        self.stack_size += by;
    }

    pub fn decrement_stack(&mut self, by: i32) {
        self.stack_size -= by;
    }

    pub fn stack_size(&self) -> i32 {
        self.stack_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_unique() {
        let mut stream = InstructionStream::new();
        let a = stream.new_label();
        let b = stream.new_label();
        assert_ne!(a, b);
    }

    #[test]
    fn test_balanced_chunk_has_zero_effect() {
        let mut chunk = BytecodeChunk::new();
        chunk.push(Buildable::PushReg { reg: 1 });
        chunk.push(Buildable::PushReg { reg: 2 });
        chunk.push(Buildable::FunctionCall { reg: 0, nargs: 2 });
        assert_eq!(chunk.stack_effect(), 0);
    }

    #[test]
    fn test_nested_chunk_is_a_separate_frame() {
        let mut inner = BytecodeChunk::new();
        inner.push(Buildable::ReserveLocals { count: 3 });
        inner.push(Buildable::Return);

        let mut outer = BytecodeChunk::new();
        outer.push(Buildable::Chunk(inner));
        assert_eq!(outer.stack_effect(), 0);
    }

    #[test]
    fn test_unbalanced_chunk_detected() {
        let mut chunk = BytecodeChunk::new();
        chunk.push(Buildable::PushReg { reg: 1 });
        assert_eq!(chunk.stack_effect(), 1);
    }
}
