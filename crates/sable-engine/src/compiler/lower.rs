//! AST-to-IR lowering.
//!
//! Walks the optimized AST and emits [`Buildable`] instructions, consulting
//! the analysis side tables for every name, type, and member access; nothing
//! is resolved here. The module body becomes a zero-argument frame ending in
//! `Halt`, every function literal becomes a skipped-over nested chunk plus a
//! function constant, and closures become `$closure` objects holding their
//! captured values and the code under the reserved invoke member.
//!
//! Register discipline: temporaries live in registers 1..8, handed out by a
//! free list. Calls leave their result in register 0 and preserve all
//! others, so a value that must survive a call is simply kept in its
//! temporary register.

use crate::compiler::analyzer::{Analysis, FunctionInfo, MemberStrategy};
use crate::compiler::error::ErrorMessage;
use crate::compiler::ir::{
    ArithOp, Buildable, BytecodeChunk, InstructionStream, JumpMode, LabelId, StorageDirection,
    StorageOperation, StorageTarget,
};
use crate::compiler::scope::Binding;
use crate::compiler::symbol::{Primitive, SymbolType, SymbolTypeRef};
use crate::compiler::unit::CompilationUnit;
use crate::name_hash;
use crate::parser::ast::*;
use crate::parser::token::Span;
use crate::vm::interpreter::{cast_tag, INVOKE_MEMBER, NUM_REGISTERS, PROTO_MEMBER};
use crate::vm::value::FunctionValue;

/// Type name given to closure environment objects.
const CLOSURE_TYPE: &str = "$closure";

/// Member name constructors are looked up under.
const INIT_MEMBER: &str = "init";

/// Lower an analyzed module to a single IR chunk.
pub fn lower(module: &Module, analysis: &Analysis, unit: &mut CompilationUnit) -> BytecodeChunk {
    let mut lowering = Lowering {
        analysis,
        unit,
        stream: InstructionStream::new(),
        free: (1..NUM_REGISTERS as u8).rev().collect(),
        frames: vec![FnFrame {
            nargs: 0,
            loops: Vec::new(),
        }],
    };

    let mut chunk = BytecodeChunk::new();
    lowering.reserve_locals(analysis.module_locals, &mut chunk);
    for stmt in &module.statements {
        lowering.lower_stmt(stmt, &mut chunk);
    }
    chunk.push(Buildable::Halt);

    // Every push in the module frame was consumed by a call; only the
    // reserved locals remain.
    lowering.stream.decrement_stack(analysis.module_locals as i32);
    debug_assert_eq!(lowering.stream.stack_size(), 0);
    chunk
}

fn load(reg: u8, target: StorageTarget) -> Buildable {
    Buildable::Storage(StorageOperation {
        direction: StorageDirection::Load,
        reg,
        target,
    })
}

fn store(reg: u8, target: StorageTarget) -> Buildable {
    Buildable::Storage(StorageOperation {
        direction: StorageDirection::Store,
        reg,
        target,
    })
}

/// Jump targets for `break` and `continue` inside one loop.
struct LoopFrame {
    break_label: LabelId,
    continue_label: LabelId,
}

/// Per-function lowering state. The bottom entry is the module frame.
struct FnFrame {
    /// Argument count of the frame, fixing where locals start.
    nargs: u16,
    loops: Vec<LoopFrame>,
}

struct Lowering<'a> {
    analysis: &'a Analysis,
    unit: &'a mut CompilationUnit,
    stream: InstructionStream,
    /// Free temporary registers. Register 0 is never handed out; it is the
    /// call-result register and gets clobbered by every call.
    free: Vec<u8>,
    frames: Vec<FnFrame>,
}

impl<'a> Lowering<'a> {
    // --- registers ---

    fn alloc(&mut self) -> u8 {
        match self.free.pop() {
            Some(reg) => reg,
            None => {
                self.unit.errors.add_fatal(
                    ErrorMessage::InternalError {
                        detail: "expression needs more temporaries than the register file holds"
                            .into(),
                    },
                    Span::synthetic(),
                );
                1
            }
        }
    }

    fn release(&mut self, reg: u8) {
        if !self.free.contains(&reg) {
            self.free.push(reg);
        }
    }

    // --- stack accounting ---
    //
    // Every instruction that moves the value stack goes through one of
    // these, keeping the stream's depth counter in step with emission.

    fn push_reg(&mut self, reg: u8, out: &mut BytecodeChunk) {
        out.push(Buildable::PushReg { reg });
        self.stream.increment_stack(1);
    }

    fn emit_call(&mut self, reg: u8, nargs: u8, out: &mut BytecodeChunk) {
        out.push(Buildable::FunctionCall { reg, nargs });
        self.stream.decrement_stack(nargs as i32);
    }

    fn reserve_locals(&mut self, count: u16, out: &mut BytecodeChunk) {
        out.push(Buildable::ReserveLocals { count });
        self.stream.increment_stack(count as i32);
    }

    // --- frame addressing ---

    fn frame(&self) -> &FnFrame {
        self.frames.last().expect("function frame")
    }

    fn frame_mut(&mut self) -> &mut FnFrame {
        self.frames.last_mut().expect("function frame")
    }

    fn at_module_level(&self) -> bool {
        self.frames.len() == 1
    }

    /// Frame offset of local slot `index`: past the arguments and the frame
    /// marker.
    fn local_offset(&self, index: u16) -> u16 {
        self.frame().nargs + 1 + index
    }

    /// Load the implicit self argument, which sits in the last argument
    /// slot of the frame.
    fn load_self(&mut self, dst: u8, out: &mut BytecodeChunk) {
        let nargs = self.frame().nargs;
        if nargs == 0 {
            self.unit.errors.add_fatal(
                ErrorMessage::InternalError {
                    detail: "self reference in a frame without a self argument".into(),
                },
                Span::synthetic(),
            );
            out.push(Buildable::ConstNull { reg: dst });
            return;
        }
        out.push(load(dst, StorageTarget::LocalOffset { offset: nargs - 1 }));
    }

    fn load_binding(&mut self, binding: &Binding, dst: u8, out: &mut BytecodeChunk) {
        match binding {
            Binding::Param { index } => {
                out.push(load(dst, StorageTarget::LocalOffset { offset: *index }));
            }
            Binding::Local { index } => {
                let offset = self.local_offset(*index);
                out.push(load(dst, StorageTarget::LocalOffset { offset }));
            }
            Binding::Static { id } => {
                out.push(load(dst, StorageTarget::Static { id: *id }));
            }
            Binding::SelfMember { name } => {
                let hash = name_hash(name);
                let receiver = self.alloc();
                self.load_self(receiver, out);
                out.push(load(
                    dst,
                    StorageTarget::MemberHash {
                        object: receiver,
                        hash,
                    },
                ));
                self.release(receiver);
            }
        }
    }

    fn store_binding(&mut self, binding: &Binding, src: u8, out: &mut BytecodeChunk) {
        match binding {
            Binding::Param { index } => {
                out.push(store(src, StorageTarget::LocalOffset { offset: *index }));
            }
            Binding::Local { index } => {
                let offset = self.local_offset(*index);
                out.push(store(src, StorageTarget::LocalOffset { offset }));
            }
            Binding::Static { id } => {
                out.push(store(src, StorageTarget::Static { id: *id }));
            }
            Binding::SelfMember { name } => {
                let hash = name_hash(name);
                let receiver = self.alloc();
                self.load_self(receiver, out);
                out.push(store(
                    src,
                    StorageTarget::MemberHash {
                        object: receiver,
                        hash,
                    },
                ));
                self.release(receiver);
            }
        }
    }

    fn binding_of(&mut self, id: NodeId, span: Span) -> Option<Binding> {
        match self.analysis.bindings.get(&id) {
            Some(binding) => Some(binding.clone()),
            None => {
                self.unit.errors.add_fatal(
                    ErrorMessage::InternalError {
                        detail: "name survived analysis without a binding".into(),
                    },
                    span,
                );
                None
            }
        }
    }

    fn expr_type(&self, id: NodeId) -> Option<SymbolTypeRef> {
        self.analysis
            .expr_types
            .get(&id)
            .map(|ty| SymbolType::unalias(ty))
    }

    // --- statements ---

    fn lower_stmt(&mut self, stmt: &Stmt, out: &mut BytecodeChunk) {
        match stmt {
            Stmt::Let(s) => self.lower_let(s, out),
            Stmt::Function(decl) => self.lower_function_decl(decl, out),
            Stmt::Class(decl) => self.lower_class_decl(decl, out),
            Stmt::Return(s) => {
                match &s.value {
                    Some(value) => {
                        let reg = self.lower_expr(value, out);
                        out.push(Buildable::Mov { dst: 0, src: reg });
                        self.release(reg);
                    }
                    None => out.push(Buildable::ConstNull { reg: 0 }),
                }
                if self.at_module_level() {
                    out.push(Buildable::Halt);
                } else {
                    out.push(Buildable::Return);
                }
            }
            Stmt::If(s) => self.lower_if(s, out),
            Stmt::While(s) => self.lower_while(s, out),
            Stmt::For(s) => self.lower_for(s, out),
            Stmt::Break { .. } => {
                if let Some(label) = self.frame().loops.last().map(|l| l.break_label) {
                    out.push(Buildable::Jump {
                        mode: JumpMode::Always,
                        label,
                    });
                }
            }
            Stmt::Continue { .. } => {
                if let Some(label) = self.frame().loops.last().map(|l| l.continue_label) {
                    out.push(Buildable::Jump {
                        mode: JumpMode::Always,
                        label,
                    });
                }
            }
            Stmt::Try(s) => self.lower_try(s, out),
            Stmt::Throw(s) => {
                let reg = self.lower_expr(&s.value, out);
                out.push(Buildable::Throw { reg });
                self.release(reg);
            }
            // Yields inside generators were rewritten during analysis; a
            // leftover was already reported there.
            Stmt::Yield(_) => {}
            Stmt::Expr(s) => {
                // The value of a top-level expression statement is the
                // observable result of the run, so it lands in register 0.
                let reg = self.lower_expr(&s.expr, out);
                out.push(Buildable::Mov { dst: 0, src: reg });
                self.release(reg);
            }
            Stmt::Block(b) => {
                for inner in &b.statements {
                    self.lower_stmt(inner, out);
                }
            }
        }
    }

    fn lower_let(&mut self, s: &LetStmt, out: &mut BytecodeChunk) {
        let Some(binding) = self.binding_of(s.id, s.span) else {
            return;
        };
        let value = match &s.value {
            Some(value) => self.lower_expr(value, out),
            None => {
                let reg = self.alloc();
                out.push(Buildable::ConstNull { reg });
                reg
            }
        };
        self.store_binding(&binding, value, out);
        self.release(value);
    }

    fn lower_function_decl(&mut self, decl: &FunctionDecl, out: &mut BytecodeChunk) {
        let Some(binding) = self.binding_of(decl.id, decl.span) else {
            return;
        };
        let value = self.lower_function_value(&decl.func, out);
        self.store_binding(&binding, value, out);
        if self.at_module_level() {
            out.push(Buildable::Export {
                reg: value,
                hash: name_hash(&decl.name),
            });
        }
        self.release(value);
    }

    /// A class declaration builds its runtime type object: member slots in
    /// declaration order, the base type object linked through the proto
    /// member, methods and field defaults filled in, and the result stored
    /// in the class's static slot.
    fn lower_class_decl(&mut self, decl: &ClassDecl, out: &mut BytecodeChunk) {
        let Some(info) = self.analysis.classes.get(&decl.id).cloned() else {
            // Analysis already rejected a class below module scope.
            return;
        };

        let ty = self.alloc();
        out.push(Buildable::TypeObject {
            reg: ty,
            name: info.name.clone(),
            members: info.member_names.clone(),
        });

        if let Some(base) = info.base_static {
            let base_reg = self.alloc();
            out.push(load(base_reg, StorageTarget::Static { id: base }));
            out.push(store(
                base_reg,
                StorageTarget::MemberHash {
                    object: ty,
                    hash: name_hash(PROTO_MEMBER),
                },
            ));
            self.release(base_reg);
        }

        for member in &decl.members {
            let value = if let Some(method) = &member.method {
                self.lower_function_value(method, out)
            } else if let Some(default) = &member.default {
                self.lower_expr(default, out)
            } else {
                continue;
            };
            out.push(store(
                value,
                StorageTarget::MemberHash {
                    object: ty,
                    hash: name_hash(&member.name),
                },
            ));
            self.release(value);
        }

        out.push(store(ty, StorageTarget::Static { id: info.static_id }));
        if self.at_module_level() {
            out.push(Buildable::Export {
                reg: ty,
                hash: name_hash(&info.name),
            });
        }
        self.release(ty);
    }

    fn lower_if(&mut self, s: &IfStmt, out: &mut BytecodeChunk) {
        let skip = self.stream.new_label();
        let cond = self.lower_expr(&s.cond, out);
        out.push(Buildable::CompareZero { reg: cond });
        self.release(cond);
        out.push(Buildable::Jump {
            mode: JumpMode::Equal,
            label: skip,
        });

        for stmt in &s.then_block.statements {
            self.lower_stmt(stmt, out);
        }

        match &s.else_branch {
            Some(branch) => {
                let end = self.stream.new_label();
                out.push(Buildable::Jump {
                    mode: JumpMode::Always,
                    label: end,
                });
                out.push(Buildable::LabelMarker(skip));
                self.lower_stmt(branch, out);
                out.push(Buildable::LabelMarker(end));
            }
            None => out.push(Buildable::LabelMarker(skip)),
        }
    }

    fn lower_while(&mut self, s: &WhileStmt, out: &mut BytecodeChunk) {
        let top = self.stream.new_label();
        let end = self.stream.new_label();

        out.push(Buildable::LabelMarker(top));
        let cond = self.lower_expr(&s.cond, out);
        out.push(Buildable::CompareZero { reg: cond });
        self.release(cond);
        out.push(Buildable::Jump {
            mode: JumpMode::Equal,
            label: end,
        });

        self.frame_mut().loops.push(LoopFrame {
            break_label: end,
            continue_label: top,
        });
        for stmt in &s.body.statements {
            self.lower_stmt(stmt, out);
        }
        self.frame_mut().loops.pop();

        out.push(Buildable::Jump {
            mode: JumpMode::Always,
            label: top,
        });
        out.push(Buildable::LabelMarker(end));
    }

    fn lower_for(&mut self, s: &ForStmt, out: &mut BytecodeChunk) {
        if let Some(init) = &s.init {
            self.lower_stmt(init, out);
        }

        let top = self.stream.new_label();
        let step = self.stream.new_label();
        let end = self.stream.new_label();

        out.push(Buildable::LabelMarker(top));
        if let Some(cond) = &s.cond {
            let reg = self.lower_expr(cond, out);
            out.push(Buildable::CompareZero { reg });
            self.release(reg);
            out.push(Buildable::Jump {
                mode: JumpMode::Equal,
                label: end,
            });
        }

        // `continue` re-enters at the step expression, not the condition.
        self.frame_mut().loops.push(LoopFrame {
            break_label: end,
            continue_label: step,
        });
        for stmt in &s.body.statements {
            self.lower_stmt(stmt, out);
        }
        self.frame_mut().loops.pop();

        out.push(Buildable::LabelMarker(step));
        if let Some(step_expr) = &s.step {
            let reg = self.lower_expr(step_expr, out);
            self.release(reg);
        }
        out.push(Buildable::Jump {
            mode: JumpMode::Always,
            label: top,
        });
        out.push(Buildable::LabelMarker(end));
    }

    fn lower_try(&mut self, s: &TryStmt, out: &mut BytecodeChunk) {
        let catch = self.stream.new_label();
        let end = self.stream.new_label();

        out.push(Buildable::BeginTry { label: catch });
        for stmt in &s.body.statements {
            self.lower_stmt(stmt, out);
        }
        out.push(Buildable::EndTry);
        out.push(Buildable::Jump {
            mode: JumpMode::Always,
            label: end,
        });

        // The unwinder delivers the thrown value in register 0.
        out.push(Buildable::LabelMarker(catch));
        if let Some(binding) = self.binding_of(s.catch_id, s.span) {
            self.store_binding(&binding, 0, out);
        }
        for stmt in &s.catch_block.statements {
            self.lower_stmt(stmt, out);
        }
        out.push(Buildable::LabelMarker(end));
    }

    // --- expressions ---

    /// Lower an expression; the result register is owned by the caller and
    /// must be released.
    fn lower_expr(&mut self, expr: &Expr, out: &mut BytecodeChunk) -> u8 {
        match expr {
            Expr::IntLiteral { value, .. } => {
                let reg = self.alloc();
                match i32::try_from(*value) {
                    Ok(narrow) => out.push(Buildable::ConstI32 { reg, value: narrow }),
                    Err(_) => out.push(Buildable::ConstI64 { reg, value: *value }),
                }
                reg
            }
            Expr::FloatLiteral { value, .. } => {
                let reg = self.alloc();
                out.push(Buildable::ConstF64 { reg, value: *value });
                reg
            }
            Expr::StringLiteral { value, .. } => {
                let reg = self.alloc();
                out.push(Buildable::ConstString {
                    reg,
                    value: value.clone(),
                });
                reg
            }
            Expr::BoolLiteral { value, .. } => {
                let reg = self.alloc();
                out.push(Buildable::ConstBool { reg, value: *value });
                reg
            }
            Expr::NullLiteral { .. } => {
                let reg = self.alloc();
                out.push(Buildable::ConstNull { reg });
                reg
            }
            Expr::Ident(e) => {
                let reg = self.alloc();
                if let Some(binding) = self.binding_of(e.id, e.span) {
                    self.load_binding(&binding, reg, out);
                }
                reg
            }
            Expr::Unary(e) => {
                let src = self.lower_expr(&e.operand, out);
                self.release(src);
                let dst = self.alloc();
                match e.op {
                    UnaryOp::Neg => out.push(Buildable::Neg { dst, src }),
                    UnaryOp::Not => out.push(Buildable::Not { dst, src }),
                }
                dst
            }
            Expr::Binary(e) => self.lower_binary(e, out),
            Expr::Assign(e) => self.lower_assign(e, out),
            Expr::Call(e) => self.lower_call(e, out),
            Expr::Member(e) => {
                let object = self.lower_expr(&e.object, out);
                self.release(object);
                let dst = self.alloc();
                self.load_member(object, e, dst, out);
                dst
            }
            Expr::Index(e) => {
                let object = self.lower_expr(&e.object, out);
                let index = self.lower_expr(&e.index, out);
                self.release(object);
                self.release(index);
                let dst = self.alloc();
                out.push(load(dst, StorageTarget::ArrayIndex { object, index }));
                dst
            }
            Expr::Function(e) => self.lower_function_value(e, out),
            Expr::New(e) => self.lower_new(e, out),
            Expr::Cast(e) => {
                let src = self.lower_expr(&e.expr, out);
                self.release(src);
                let dst = self.alloc();
                let tag = self
                    .expr_type(e.id)
                    .map(|ty| cast_tag_for(&ty))
                    .unwrap_or(cast_tag::ANY);
                out.push(Buildable::Cast { dst, src, tag });
                dst
            }
            Expr::ArrayLiteral(e) => {
                let dst = self.alloc();
                out.push(Buildable::NewArray {
                    dst,
                    count: e.elements.len() as u16,
                });
                for (i, element) in e.elements.iter().enumerate() {
                    let value = self.lower_expr(element, out);
                    let index = self.alloc();
                    out.push(Buildable::ConstI32 {
                        reg: index,
                        value: i as i32,
                    });
                    out.push(store(
                        value,
                        StorageTarget::ArrayIndex { object: dst, index },
                    ));
                    self.release(index);
                    self.release(value);
                }
                dst
            }
        }
    }

    fn lower_binary(&mut self, e: &BinaryExpr, out: &mut BytecodeChunk) -> u8 {
        if e.op.is_logical() {
            return self.lower_logical(e, out);
        }
        if e.op.is_comparison() {
            return self.lower_comparison(e, out);
        }

        let lhs = self.lower_expr(&e.lhs, out);
        let rhs = self.lower_expr(&e.rhs, out);
        self.release(lhs);
        self.release(rhs);
        let dst = self.alloc();
        let op = match e.op {
            BinaryOp::Add => ArithOp::Add,
            BinaryOp::Sub => ArithOp::Sub,
            BinaryOp::Mul => ArithOp::Mul,
            BinaryOp::Div => ArithOp::Div,
            BinaryOp::Mod => ArithOp::Mod,
            _ => unreachable!("logical and comparison ops handled above"),
        };
        out.push(Buildable::Arith { op, dst, lhs, rhs });
        dst
    }

    /// Comparisons produce a bool value: set the flag, assume true, and
    /// jump past the false assignment when the condition holds. Less-than
    /// forms swap their operands to reuse the greater-than jump modes.
    fn lower_comparison(&mut self, e: &BinaryExpr, out: &mut BytecodeChunk) -> u8 {
        let lhs = self.lower_expr(&e.lhs, out);
        let rhs = self.lower_expr(&e.rhs, out);
        let (a, b, mode) = match e.op {
            BinaryOp::Equal => (lhs, rhs, JumpMode::Equal),
            BinaryOp::NotEqual => (lhs, rhs, JumpMode::NotEqual),
            BinaryOp::Greater => (lhs, rhs, JumpMode::Greater),
            BinaryOp::GreaterEqual => (lhs, rhs, JumpMode::GreaterEqual),
            BinaryOp::Less => (rhs, lhs, JumpMode::Greater),
            BinaryOp::LessEqual => (rhs, lhs, JumpMode::GreaterEqual),
            _ => unreachable!("only comparison ops reach here"),
        };
        out.push(Buildable::Comparison { lhs: a, rhs: b });
        self.release(lhs);
        self.release(rhs);

        let dst = self.alloc();
        let done = self.stream.new_label();
        out.push(Buildable::ConstBool { reg: dst, value: true });
        out.push(Buildable::Jump { mode, label: done });
        out.push(Buildable::ConstBool {
            reg: dst,
            value: false,
        });
        out.push(Buildable::LabelMarker(done));
        dst
    }

    /// Short-circuit `&&` and `||`. Either operand settling the result
    /// jumps straight to the early-value assignment.
    fn lower_logical(&mut self, e: &BinaryExpr, out: &mut BytecodeChunk) -> u8 {
        let (early_mode, early_value) = match e.op {
            BinaryOp::And => (JumpMode::Equal, false),
            BinaryOp::Or => (JumpMode::NotEqual, true),
            _ => unreachable!("only logical ops reach here"),
        };
        let short = self.stream.new_label();
        let done = self.stream.new_label();

        let lhs = self.lower_expr(&e.lhs, out);
        out.push(Buildable::CompareZero { reg: lhs });
        self.release(lhs);
        out.push(Buildable::Jump {
            mode: early_mode,
            label: short,
        });

        let rhs = self.lower_expr(&e.rhs, out);
        out.push(Buildable::CompareZero { reg: rhs });
        self.release(rhs);
        out.push(Buildable::Jump {
            mode: early_mode,
            label: short,
        });

        let dst = self.alloc();
        out.push(Buildable::ConstBool {
            reg: dst,
            value: !early_value,
        });
        out.push(Buildable::Jump {
            mode: JumpMode::Always,
            label: done,
        });
        out.push(Buildable::LabelMarker(short));
        out.push(Buildable::ConstBool {
            reg: dst,
            value: early_value,
        });
        out.push(Buildable::LabelMarker(done));
        dst
    }

    fn lower_assign(&mut self, e: &AssignExpr, out: &mut BytecodeChunk) -> u8 {
        let value = self.lower_expr(&e.value, out);
        match e.target.as_ref() {
            Expr::Ident(target) => {
                if let Some(binding) = self.binding_of(target.id, target.span) {
                    self.store_binding(&binding, value, out);
                }
            }
            Expr::Member(target) => {
                let object = self.lower_expr(&target.object, out);
                let storage = match self.member_strategy(target) {
                    MemberStrategy::Direct { index } => StorageTarget::MemberIndex { object, index },
                    MemberStrategy::Hashed { hash } => StorageTarget::MemberHash { object, hash },
                };
                out.push(store(value, storage));
                self.release(object);
            }
            Expr::Index(target) => {
                let object = self.lower_expr(&target.object, out);
                let index = self.lower_expr(&target.index, out);
                out.push(store(value, StorageTarget::ArrayIndex { object, index }));
                self.release(index);
                self.release(object);
            }
            // The parser rejected every other target shape.
            _ => {}
        }
        value
    }

    fn member_strategy(&self, e: &MemberExpr) -> MemberStrategy {
        self.analysis
            .member_access
            .get(&e.id)
            .copied()
            .unwrap_or(MemberStrategy::Hashed {
                hash: name_hash(&e.member),
            })
    }

    fn load_member(&mut self, object: u8, e: &MemberExpr, dst: u8, out: &mut BytecodeChunk) {
        let target = match self.member_strategy(e) {
            MemberStrategy::Direct { index } => StorageTarget::MemberIndex { object, index },
            MemberStrategy::Hashed { hash } => StorageTarget::MemberHash { object, hash },
        };
        out.push(load(dst, target));
    }

    /// True when a call through this member expression must pass the object
    /// as the implicit self argument: the receiver has a known class type
    /// and the member is a callable. Calls through `any` receivers take the
    /// plain path and rely on the VM's object-invoke protocol instead.
    fn is_method_call(&self, e: &MemberExpr) -> bool {
        let receiver_is_object = matches!(
            self.expr_type(e.object.id()).as_deref(),
            Some(SymbolType::Object { .. })
        );
        let member_is_callable = matches!(
            self.expr_type(e.id).as_deref(),
            Some(SymbolType::Function { .. })
        );
        receiver_is_object && member_is_callable
    }

    fn lower_call(&mut self, e: &CallExpr, out: &mut BytecodeChunk) -> u8 {
        if let Expr::Member(member) = e.callee.as_ref() {
            if self.is_method_call(member) {
                return self.lower_method_call(e, member, out);
            }
        }

        let callee = self.lower_expr(&e.callee, out);
        for arg in &e.args {
            let reg = self.lower_expr(arg, out);
            self.push_reg(reg, out);
            self.release(reg);
        }
        self.emit_call(callee, e.args.len() as u8, out);
        self.release(callee);

        let dst = self.alloc();
        out.push(Buildable::Mov { dst, src: 0 });
        dst
    }

    /// Method calls evaluate the receiver once, load the function off it,
    /// and push the receiver as the trailing self argument.
    fn lower_method_call(
        &mut self,
        e: &CallExpr,
        member: &MemberExpr,
        out: &mut BytecodeChunk,
    ) -> u8 {
        let receiver = self.lower_expr(&member.object, out);
        let callee = self.alloc();
        self.load_member(receiver, member, callee, out);

        for arg in &e.args {
            let reg = self.lower_expr(arg, out);
            self.push_reg(reg, out);
            self.release(reg);
        }
        self.push_reg(receiver, out);
        self.emit_call(callee, e.args.len() as u8 + 1, out);
        self.release(callee);
        self.release(receiver);

        let dst = self.alloc();
        out.push(Buildable::Mov { dst, src: 0 });
        dst
    }

    /// Emit a function literal: jump over the nested body chunk, then
    /// materialize the function constant. Closures additionally build their
    /// environment object, copying each captured value out of the creating
    /// frame, and the environment is the expression's value.
    fn lower_function_value(&mut self, func: &FunctionExpr, out: &mut BytecodeChunk) -> u8 {
        let Some(info) = self.analysis.functions.get(&func.id).cloned() else {
            self.unit.errors.add_fatal(
                ErrorMessage::InternalError {
                    detail: "function literal survived analysis without a record".into(),
                },
                func.span,
            );
            return self.alloc();
        };

        let entry = self.stream.new_label();
        let end = self.stream.new_label();
        out.push(Buildable::Jump {
            mode: JumpMode::Always,
            label: end,
        });
        out.push(Buildable::LabelMarker(entry));
        out.push(Buildable::Chunk(self.lower_body(func, &info)));
        out.push(Buildable::LabelMarker(end));

        let flags = if info.is_closure || info.is_method {
            FunctionValue::FLAG_TAKES_SELF
        } else {
            0
        };
        let code = self.alloc();
        out.push(Buildable::Function {
            reg: code,
            label: entry,
            nargs: info.nargs,
            flags,
        });

        if !info.is_closure {
            return code;
        }

        let mut members: Vec<String> = info.captures.iter().map(|c| c.name.clone()).collect();
        members.push(INVOKE_MEMBER.to_string());
        let ty = self.alloc();
        out.push(Buildable::TypeObject {
            reg: ty,
            name: CLOSURE_TYPE.to_string(),
            members,
        });
        let env = self.alloc();
        out.push(Buildable::New { dst: env, type_reg: ty });
        self.release(ty);

        for capture in &info.captures {
            let value = self.alloc();
            self.load_binding(&capture.source, value, out);
            out.push(store(
                value,
                StorageTarget::MemberHash {
                    object: env,
                    hash: name_hash(&capture.name),
                },
            ));
            self.release(value);
        }
        out.push(store(
            code,
            StorageTarget::MemberHash {
                object: env,
                hash: name_hash(INVOKE_MEMBER),
            },
        ));
        self.release(code);
        env
    }

    /// Lower a function body into its own chunk. The body runs in a fresh
    /// frame with the whole register file to itself, so the temporary
    /// allocator is reset around it.
    fn lower_body(&mut self, func: &FunctionExpr, info: &FunctionInfo) -> BytecodeChunk {
        let mut body = BytecodeChunk::new();
        let entry_depth = self.stream.stack_size();
        self.reserve_locals(info.locals, &mut body);

        let outer_free =
            std::mem::replace(&mut self.free, (1..NUM_REGISTERS as u8).rev().collect());
        self.frames.push(FnFrame {
            nargs: info.nargs as u16,
            loops: Vec::new(),
        });

        for stmt in &func.body.statements {
            self.lower_stmt(stmt, &mut body);
        }

        self.frames.pop();
        self.free = outer_free;

        // A body that can fall off its end returns null implicitly.
        if !func.body.statements.last().map_or(false, Stmt::is_return) {
            body.push(Buildable::ConstNull { reg: 0 });
            body.push(Buildable::Return);
        }

        // RET truncates the frame, taking the locals with it. Statement
        // code must have consumed every push of its own.
        self.stream.decrement_stack(info.locals as i32);
        debug_assert_eq!(self.stream.stack_size(), entry_depth);
        debug_assert_eq!(body.stack_effect(), info.locals as i32);
        body
    }

    fn lower_new(&mut self, e: &NewExpr, out: &mut BytecodeChunk) -> u8 {
        if e.ty.name == "Array" {
            // The analyzer pinned the size argument to an integer literal.
            let count = match e.args.first() {
                Some(Expr::IntLiteral { value, .. }) => *value as u16,
                _ => 0,
            };
            let dst = self.alloc();
            out.push(Buildable::NewArray { dst, count });
            return dst;
        }

        let Some(static_id) = self.class_static(&e.ty.name) else {
            self.unit.errors.add_fatal(
                ErrorMessage::InternalError {
                    detail: format!("no type object for '{}'", e.ty.name),
                },
                e.span,
            );
            return self.alloc();
        };

        let ty = self.alloc();
        out.push(load(ty, StorageTarget::Static { id: static_id }));
        let instance = self.alloc();
        out.push(Buildable::New {
            dst: instance,
            type_reg: ty,
        });
        self.release(ty);

        let has_init = self
            .expr_type(e.id)
            .map_or(false, |t| t.find_member(INIT_MEMBER).is_some());
        if has_init {
            let init = self.alloc();
            out.push(load(
                init,
                StorageTarget::MemberHash {
                    object: instance,
                    hash: name_hash(INIT_MEMBER),
                },
            ));
            for arg in &e.args {
                let reg = self.lower_expr(arg, out);
                self.push_reg(reg, out);
                self.release(reg);
            }
            self.push_reg(instance, out);
            self.emit_call(init, e.args.len() as u8 + 1, out);
            self.release(init);
        }
        instance
    }

    /// Static slot holding a type object, by class name. Script classes are
    /// found through their analysis records, native classes through the
    /// unit's registration bindings.
    fn class_static(&self, name: &str) -> Option<u16> {
        self.analysis
            .classes
            .values()
            .find(|c| c.name == name)
            .map(|c| c.static_id)
            .or_else(|| self.unit.static_bindings.get(name).copied())
    }
}

fn cast_tag_for(ty: &SymbolTypeRef) -> u8 {
    match ty.as_ref() {
        SymbolType::Primitive(Primitive::Int) => cast_tag::INT,
        SymbolType::Primitive(Primitive::UInt) => cast_tag::UINT,
        SymbolType::Primitive(Primitive::Float) => cast_tag::FLOAT,
        SymbolType::Primitive(Primitive::Bool) => cast_tag::BOOL,
        SymbolType::Primitive(Primitive::String) => cast_tag::STRING,
        SymbolType::Object { .. } | SymbolType::GenericInstance { .. } => cast_tag::OBJECT,
        _ => cast_tag::ANY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::analyzer::{Analyzer, NativeDecls, NativeGlobal};
    use crate::compiler::codegen::CodeGenerator;
    use crate::compiler::{optimize, Program};
    use crate::parser::{parse_type_expression, Lexer, Parser};
    use crate::vm::{Value, Vm};

    fn lower_module(source: &str, natives: &NativeDecls) -> (BytecodeChunk, CompilationUnit) {
        let mut unit = CompilationUnit::new("test", source);
        let tokens = Lexer::new(source).tokenize(&mut unit);
        let mut module = Parser::new(tokens, &mut unit).parse_module();
        let analysis = Analyzer::new(&mut unit).analyze(&mut module, natives);
        assert!(!unit.errors.has_fatal_errors(), "{:?}", unit.errors);
        optimize::optimize(&mut module);
        let chunk = lower(&module, &analysis, &mut unit);
        assert!(!unit.errors.has_fatal_errors(), "{:?}", unit.errors);
        (chunk, unit)
    }

    fn compile(source: &str) -> Program {
        let (chunk, unit) = lower_module(source, &NativeDecls::default());
        Program {
            bytecode: CodeGenerator::new().generate(&chunk),
            statics_count: unit.statics_count(),
            bindings: unit.static_bindings.clone(),
        }
    }

    fn run(source: &str) -> Value {
        Vm::new(&compile(source)).run().unwrap()
    }

    #[test]
    fn test_locals_and_arithmetic() {
        assert_eq!(run("let x = 2; x + 3;"), Value::I32(5));
    }

    #[test]
    fn test_function_call() {
        let source = r#"
            function add(a: int, b: int): int {
                return a + b;
            }
            add(2, 3);
        "#;
        assert_eq!(run(source), Value::I32(5));
    }

    #[test]
    fn test_recursion_preserves_temporaries() {
        // fib(n - 1) must survive in a register across the second call.
        let source = r#"
            function fib(n: int): int {
                if (n < 2) { return n; }
                return fib(n - 1) + fib(n - 2);
            }
            fib(10);
        "#;
        assert_eq!(run(source), Value::I32(55));
    }

    #[test]
    fn test_closure_captures_value() {
        let source = r#"
            function make_adder(n: int) {
                return function(x: int) { return n + x; };
            }
            let add10 = make_adder(10);
            add10(5);
        "#;
        assert_eq!(run(source), Value::I32(15));
    }

    #[test]
    fn test_while_loop() {
        let source = r#"
            let i = 0;
            let total = 0;
            while (i < 5) {
                i = i + 1;
                total = total + i;
            }
            total;
        "#;
        assert_eq!(run(source), Value::I32(15));
    }

    #[test]
    fn test_for_with_break() {
        let source = r#"
            let total = 0;
            for (let i = 0; i < 10; i = i + 1) {
                if (i == 5) { break; }
                total = total + i;
            }
            total;
        "#;
        assert_eq!(run(source), Value::I32(10));
    }

    #[test]
    fn test_continue_reaches_step() {
        let source = r#"
            let total = 0;
            for (let i = 0; i < 5; i = i + 1) {
                if (i == 1) { continue; }
                if (i == 3) { continue; }
                total = total + i;
            }
            total;
        "#;
        assert_eq!(run(source), Value::I32(6));
    }

    #[test]
    fn test_logical_short_circuit() {
        // The right operand would divide by zero if evaluated.
        let source = r#"
            let x = 0;
            false && 1 / x == 1;
        "#;
        assert_eq!(run(source), Value::Bool(false));
    }

    #[test]
    fn test_if_else() {
        let source = r#"
            let x = 10;
            let r = 0;
            if (x > 5) { r = 1; } else { r = 2; }
            r;
        "#;
        assert_eq!(run(source), Value::I32(1));
    }

    #[test]
    fn test_class_fields_and_method() {
        let source = r#"
            class Point {
                x: float = 1.5;
                y: float = 2.5;
                sum(): float { return self.x + self.y; }
            }
            let p = new Point();
            p.sum();
        "#;
        assert_eq!(run(source), Value::F64(4.0));
    }

    #[test]
    fn test_method_mutates_field_through_self() {
        let source = r#"
            class Counter {
                count: int = 0;
                bump(): int {
                    count = count + 1;
                    return count;
                }
            }
            let c = new Counter();
            c.bump();
            c.bump();
        "#;
        assert_eq!(run(source), Value::I32(2));
    }

    #[test]
    fn test_inherited_member_through_proto() {
        let source = r#"
            class Entity {
                id: int = 7;
            }
            class Point extends Entity {
                x: int = 1;
                getId(): int { return self.id; }
            }
            let p = new Point();
            p.getId();
        "#;
        assert_eq!(run(source), Value::I32(7));
    }

    #[test]
    fn test_constructor_runs_on_new() {
        let source = r#"
            class Vec {
                x: int = 0;
                init(x: int) { self.x = x; }
            }
            let v = new Vec(42);
            v.x;
        "#;
        assert_eq!(run(source), Value::I32(42));
    }

    #[test]
    fn test_try_catch_division_by_zero() {
        let source = r#"
            let r = 0;
            let x = 0;
            try {
                let z = 1 / x;
                r = 1;
            } catch (e) {
                r = 2;
            }
            r;
        "#;
        assert_eq!(run(source), Value::I32(2));
    }

    #[test]
    fn test_thrown_value_reaches_catch_binding() {
        let source = r#"
            try {
                throw "bad";
            } catch (e) {
                e + "!";
            }
        "#;
        let program = compile(source);
        let mut vm = Vm::new(&program);
        let result = vm.run().unwrap();
        assert_eq!(vm.display_value(result), "bad!");
    }

    #[test]
    fn test_array_store_load_and_length() {
        let source = r#"
            let a = new Array<int>(3);
            a[0] = 7;
            a[0] + a.length;
        "#;
        assert_eq!(run(source), Value::I64(10));
    }

    #[test]
    fn test_array_literal() {
        let source = "let a = [4, 5, 6]; a[1];";
        assert_eq!(run(source), Value::I32(5));
    }

    #[test]
    fn test_cast_to_float() {
        let source = "let x = 3; x as float;";
        assert_eq!(run(source), Value::F64(3.0));
    }

    #[test]
    fn test_string_concatenation_result() {
        let program = compile(r#""n = " + 4;"#);
        let mut vm = Vm::new(&program);
        let result = vm.run().unwrap();
        assert_eq!(vm.display_value(result), "n = 4");
    }

    #[test]
    fn test_generator_drives_callback() {
        let source = r#"
            let acc = new Array<int>(1);
            acc[0] = 0;
            function range(n: int) {
                let i = 0;
                while (i < n) {
                    yield i;
                    i = i + 1;
                }
            }
            let gen = range(3);
            gen(function(v: int) { acc[0] = acc[0] + v; });
            acc[0];
        "#;
        assert_eq!(run(source), Value::I32(3));
    }

    #[test]
    fn test_top_level_declarations_are_exported() {
        let source = r#"
            function add(a: int, b: int): int { return a + b; }
            class Point { x: int = 0; }
            add(1, 2);
        "#;
        let program = compile(source);
        let mut vm = Vm::new(&program);
        vm.run().unwrap();
        assert!(matches!(vm.export_named("add"), Some(Value::FuncAddr(_))));
        assert!(matches!(vm.export_named("Point"), Some(Value::HeapPtr(_))));
    }

    #[test]
    fn test_explicit_return_emits_one_ret() {
        let source = r#"
            function add(a: int, b: int): int {
                return a + b;
            }
            add(2, 3);
        "#;
        let program = compile(source);
        let rets = crate::compiler::bytecode::disassemble(&program.bytecode)
            .iter()
            .filter(|line| line.ends_with("RET"))
            .count();
        assert_eq!(rets, 1);
    }

    #[test]
    fn test_module_chunk_is_stack_balanced() {
        let source = r#"
            class P {
                v: int = 1;
                get(): int { return self.v; }
            }
            function f(a: int): int { return a + 1; }
            let p = new P();
            f(p.get());
        "#;
        let (chunk, _) = lower_module(source, &NativeDecls::default());
        // Everything past the local reservation must balance out.
        assert_eq!(chunk.stack_effect(), 1);
    }

    #[test]
    fn test_native_global_call_through_static() {
        let source = "double(4);";
        let mut unit = CompilationUnit::new("test", source);
        let ty = parse_type_expression("Function<int, int>", &mut unit).unwrap();
        let natives = NativeDecls {
            classes: Vec::new(),
            globals: vec![NativeGlobal {
                name: "double".into(),
                ty,
            }],
        };
        let tokens = Lexer::new(source).tokenize(&mut unit);
        let mut module = Parser::new(tokens, &mut unit).parse_module();
        let analysis = Analyzer::new(&mut unit).analyze(&mut module, &natives);
        assert!(!unit.errors.has_fatal_errors(), "{:?}", unit.errors);
        optimize::optimize(&mut module);
        let chunk = lower(&module, &analysis, &mut unit);
        let program = Program {
            bytecode: CodeGenerator::new().generate(&chunk),
            statics_count: unit.statics_count(),
            bindings: unit.static_bindings.clone(),
        };

        fn double(_vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
            match args[0].as_i64() {
                Some(v) => Ok(Value::I64(v * 2)),
                None => Err(Value::None),
            }
        }

        let mut vm = Vm::new(&program);
        vm.statics[program.bindings["double"] as usize] = Value::NativeFunc(double);
        assert_eq!(vm.run().unwrap(), Value::I64(8));
    }

    #[test]
    fn test_class_with_many_fields() {
        // Member counts past 255 exercise the wide type-object encoding.
        let mut fields = String::new();
        for i in 0..300 {
            fields.push_str(&format!("f{}: int = 0; ", i));
        }
        let source = format!(
            "class Big {{ {} }} let b = new Big(); b.f0 = 7; b.f299 = 1; b.f0 + b.f299;",
            fields
        );
        assert_eq!(run(&source), Value::I32(8));
    }

    #[test]
    fn test_nan_comparisons_yield_false() {
        assert_eq!(run("let n = 0.0 / 0.0; n == n;"), Value::Bool(false));
        assert_eq!(run("let n = 0.0 / 0.0; n != n;"), Value::Bool(true));
        assert_eq!(run("let n = 0.0 / 0.0; n < 1.0;"), Value::Bool(false));
        assert_eq!(run("let n = 0.0 / 0.0; n >= 1.0;"), Value::Bool(false));
    }

    #[test]
    fn test_native_map_global_indexed_from_script() {
        let source = r#"config["lives"] = 3; config["lives"] + config["speed"];"#;
        let mut unit = CompilationUnit::new("test", source);
        let ty = parse_type_expression("Map<string, int>", &mut unit).unwrap();
        let natives = NativeDecls {
            classes: Vec::new(),
            globals: vec![NativeGlobal {
                name: "config".into(),
                ty,
            }],
        };
        let tokens = Lexer::new(source).tokenize(&mut unit);
        let mut module = Parser::new(tokens, &mut unit).parse_module();
        let analysis = Analyzer::new(&mut unit).analyze(&mut module, &natives);
        assert!(!unit.errors.has_fatal_errors(), "{:?}", unit.errors);
        optimize::optimize(&mut module);
        let chunk = lower(&module, &analysis, &mut unit);
        let program = Program {
            bytecode: CodeGenerator::new().generate(&chunk),
            statics_count: unit.statics_count(),
            bindings: unit.static_bindings.clone(),
        };

        let mut vm = Vm::new(&program);
        let key = vm.heap.alloc_str("speed");
        let map = vm.heap.alloc_map();
        vm.heap
            .get_mut(map)
            .unwrap()
            .map_set(Value::HeapPtr(key), Value::I32(4));
        vm.statics[program.bindings["config"] as usize] = Value::HeapPtr(map);
        assert_eq!(vm.run().unwrap(), Value::I32(7));
    }

    #[test]
    fn test_function_bodies_balance_their_stack() {
        // Calls inside bodies consume exactly the arguments they push; each
        // body chunk nets only its reserved locals.
        let source = r#"
            function helper(a: int, b: int): int { return a + b; }
            function outer(n: int): int {
                let x = helper(n, 1);
                return helper(x, x);
            }
            outer(3);
        "#;
        let (chunk, _) = lower_module(source, &NativeDecls::default());
        let mut bodies = 0;
        for buildable in &chunk.buildables {
            if let Buildable::Chunk(body) = buildable {
                let Some(Buildable::ReserveLocals { count }) = body.buildables.first() else {
                    panic!("body does not start with its local reservation");
                };
                assert_eq!(body.stack_effect(), *count as i32);
                bodies += 1;
            }
        }
        assert_eq!(bodies, 2);
        // No module locals are declared, so the module frame nets zero.
        assert_eq!(chunk.stack_effect(), 0);
    }
}
