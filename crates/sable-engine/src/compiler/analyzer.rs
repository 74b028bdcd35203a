//! Semantic analysis.
//!
//! The analyzer walks the AST once and produces an [`Analysis`]: side tables
//! keyed by `NodeId` that record every expression's type, every name's
//! runtime binding, the access strategy for every member expression, and a
//! summary per function and class. Lowering is driven entirely by these
//! tables; it never resolves a name itself.
//!
//! The module body is treated as a function with zero arguments, so
//! top-level `let`s are frame locals while hoisted `function` and `class`
//! declarations (and natively registered names) live in static memory.
//! Generator functions are desugared here, before the body is analyzed, into
//! a function that returns a closure taking the consumer callback.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::compiler::error::ErrorMessage;
use crate::compiler::scope::{Binding, Capture, Ident, ScopeKind, ScopeStack};
use crate::compiler::symbol::{Member, Primitive, SymbolType, SymbolTypeRef};
use crate::compiler::unit::CompilationUnit;
use crate::name_hash;
use crate::parser::ast::*;
use crate::parser::token::Span;

/// Synthesized parameter name for the consumer callback of a desugared
/// generator. `$` keeps it out of the way of ordinary identifiers.
const GENERATOR_CALLBACK: &str = "$yield";

/// How a member access reaches its slot at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStrategy {
    /// The member's index in the object's own slot list is known statically.
    Direct { index: u8 },
    /// Look the member up by name hash, walking the proto chain.
    Hashed { hash: u32 },
}

/// Per-function facts gathered during analysis, keyed by the
/// `FunctionExpr`'s node id.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    /// Argument count as the VM sees it, including the implicit trailing
    /// self argument of methods and closures.
    pub nargs: u8,
    /// Number of local slots the body needs.
    pub locals: u16,
    pub is_closure: bool,
    pub is_method: bool,
    /// Captured variables, with their bindings in the creating frame.
    pub captures: Vec<Capture>,
    pub return_ty: SymbolTypeRef,
}

/// Per-class facts gathered during hoisting, keyed by the `ClassDecl`'s
/// node id.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub static_id: u16,
    pub name: String,
    /// Member names in declaration order; instance slot layout follows this
    /// order, which is what makes [`MemberStrategy::Direct`] valid.
    pub member_names: Vec<String>,
    /// Static slot of the base class type object, if any.
    pub base_static: Option<u16>,
    pub ty: SymbolTypeRef,
}

/// Everything later passes need to know about the analyzed module.
#[derive(Debug, Default)]
pub struct Analysis {
    pub expr_types: FxHashMap<NodeId, SymbolTypeRef>,
    pub bindings: FxHashMap<NodeId, Binding>,
    pub member_access: FxHashMap<NodeId, MemberStrategy>,
    pub functions: FxHashMap<NodeId, FunctionInfo>,
    pub classes: FxHashMap<NodeId, ClassInfo>,
    /// Local slots used by top-level statements in the module frame.
    pub module_locals: u16,
}

/// A global registered by the host, visible to scripts as a static.
#[derive(Debug, Clone)]
pub struct NativeGlobal {
    pub name: String,
    pub ty: TypeExpr,
}

/// One field or method of a natively registered class.
#[derive(Debug, Clone)]
pub struct NativeMember {
    pub name: String,
    pub ty: TypeExpr,
    pub is_method: bool,
}

/// A class registered by the host. The member order here is the slot order
/// the host must use when it builds the type object.
#[derive(Debug, Clone)]
pub struct NativeClass {
    pub name: String,
    pub members: Vec<NativeMember>,
}

/// Declarations contributed by native registration, injected into the
/// module scope before hoisting.
#[derive(Debug, Clone, Default)]
pub struct NativeDecls {
    pub classes: Vec<NativeClass>,
    pub globals: Vec<NativeGlobal>,
}

/// Per-function analysis state. The bottom entry is the module frame.
#[derive(Debug, Default)]
struct FnCtx {
    declared_ret: Option<SymbolTypeRef>,
    inferred_ret: Option<SymbolTypeRef>,
    ret_conflict: bool,
    next_local: u16,
    is_method: bool,
    class_ty: Option<SymbolTypeRef>,
}

pub struct Analyzer<'a> {
    unit: &'a mut CompilationUnit,
    scopes: ScopeStack,
    /// Named types visible in type position: classes and native classes.
    types: FxHashMap<String, SymbolTypeRef>,
    /// Static slot per declared class, for `extends` links.
    class_statics: FxHashMap<String, u16>,
    analysis: Analysis,
    fn_stack: Vec<FnCtx>,
}

impl<'a> Analyzer<'a> {
    pub fn new(unit: &'a mut CompilationUnit) -> Self {
        Self {
            unit,
            scopes: ScopeStack::new(),
            types: FxHashMap::default(),
            class_statics: FxHashMap::default(),
            analysis: Analysis::default(),
            fn_stack: Vec::new(),
        }
    }

    /// Analyze a module in place (generator desugaring rewrites the tree)
    /// and return the side tables.
    pub fn analyze(mut self, module: &mut Module, natives: &NativeDecls) -> Analysis {
        self.scopes.push(ScopeKind::Function);
        self.fn_stack.push(FnCtx::default());

        self.declare_natives(natives);
        self.hoist(module);

        for stmt in &mut module.statements {
            self.analyze_stmt(stmt);
        }

        let ctx = self.fn_stack.pop().expect("module context");
        self.analysis.module_locals = ctx.next_local;
        self.scopes.pop();
        self.analysis
    }

    // --- declaration passes ---

    fn declare_natives(&mut self, natives: &NativeDecls) {
        // Register class names first so members and globals can refer to
        // them (including forward references between native classes).
        for class in &natives.classes {
            let stub: SymbolTypeRef = Arc::new(SymbolType::Object {
                name: class.name.clone(),
                members: Vec::new(),
                base: None,
            });
            self.types.insert(class.name.clone(), stub);
        }

        for class in &natives.classes {
            let members: Vec<Member> = class
                .members
                .iter()
                .map(|m| Member {
                    name: m.name.clone(),
                    ty: self.resolve_type(&m.ty),
                    default: None,
                })
                .collect();
            let ty: SymbolTypeRef = Arc::new(SymbolType::Object {
                name: class.name.clone(),
                members,
                base: None,
            });
            let id = self.unit.fresh_static_id();
            self.unit.static_bindings.insert(class.name.clone(), id);
            self.types.insert(class.name.clone(), ty);
            self.class_statics.insert(class.name.clone(), id);
            self.declare_module_static(&class.name, SymbolType::any(), id, Span::synthetic());
        }

        for global in &natives.globals {
            let ty = self.resolve_type(&global.ty);
            let id = self.unit.fresh_static_id();
            self.unit.static_bindings.insert(global.name.clone(), id);
            self.declare_module_static(&global.name, ty, id, Span::synthetic());
        }
    }

    /// Pre-declare top-level classes and functions so bodies can refer to
    /// them regardless of order. Classes go first: function signatures may
    /// name any class, while a class in a type position must itself be
    /// declared before it is used.
    fn hoist(&mut self, module: &Module) {
        for stmt in &module.statements {
            if let Stmt::Class(decl) = stmt {
                self.hoist_class(decl);
            }
        }
        for stmt in &module.statements {
            if let Stmt::Function(decl) = stmt {
                self.hoist_function(decl);
            }
        }
    }

    fn hoist_class(&mut self, decl: &ClassDecl) {
        let (base_ty, base_static) = match &decl.base {
            Some(base) => match self.types.get(&base.name).cloned() {
                Some(ty) if matches!(ty.as_ref(), SymbolType::Object { .. }) => {
                    (Some(ty), self.class_statics.get(&base.name).copied())
                }
                _ => {
                    self.unit.errors.add_fatal(
                        ErrorMessage::NotAType {
                            name: base.name.clone(),
                        },
                        base.span,
                    );
                    (None, None)
                }
            },
            None => (None, None),
        };

        let mut members = Vec::new();
        let mut member_names = Vec::new();
        for member in &decl.members {
            member_names.push(member.name.clone());
            let ty = if let Some(method) = &member.method {
                self.function_signature(method)
            } else {
                match &member.ty {
                    Some(t) => self.resolve_type(t),
                    None => SymbolType::any(),
                }
            };
            members.push(Member {
                name: member.name.clone(),
                ty,
                default: member.default.clone(),
            });
        }

        let ty: SymbolTypeRef = Arc::new(SymbolType::Object {
            name: decl.name.clone(),
            members,
            base: base_ty,
        });
        let static_id = self.unit.fresh_static_id();
        self.types.insert(decl.name.clone(), ty.clone());
        self.class_statics.insert(decl.name.clone(), static_id);
        self.analysis.classes.insert(
            decl.id,
            ClassInfo {
                static_id,
                name: decl.name.clone(),
                member_names,
                base_static,
                ty,
            },
        );
        self.analysis
            .bindings
            .insert(decl.id, Binding::Static { id: static_id });
        self.declare_module_static(&decl.name, SymbolType::any(), static_id, decl.span);
    }

    fn hoist_function(&mut self, decl: &FunctionDecl) {
        let ty = self.function_signature(&decl.func);
        let id = self.unit.fresh_static_id();
        self.analysis.bindings.insert(decl.id, Binding::Static { id });
        self.declare_module_static(&decl.name, ty, id, decl.span);
    }

    fn declare_module_static(&mut self, name: &str, ty: SymbolTypeRef, id: u16, span: Span) {
        let declared = self.scopes.declare(Ident {
            name: name.to_string(),
            ty,
            binding: Binding::Static { id },
            is_const: true,
            use_count: 0,
        });
        if !declared {
            self.unit.errors.add_fatal(
                ErrorMessage::AlreadyDeclared {
                    name: name.to_string(),
                },
                span,
            );
        }
    }

    /// Function type from annotations alone; unannotated positions are
    /// `any`. Used at hoist time, before the body is analyzed.
    fn function_signature(&mut self, func: &FunctionExpr) -> SymbolTypeRef {
        let params = func
            .params
            .iter()
            .map(|p| match &p.ty {
                Some(t) => self.resolve_type(t),
                None => SymbolType::any(),
            })
            .collect();
        let return_ty = match &func.return_ty {
            Some(t) => self.resolve_type(t),
            None => SymbolType::any(),
        };
        Arc::new(SymbolType::Function { return_ty, params })
    }

    // --- statements ---

    fn analyze_stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::Let(s) => self.analyze_let(s),
            Stmt::Function(decl) => {
                let ty = self.analyze_function(&mut decl.func, false, None);
                if !self.analysis.bindings.contains_key(&decl.id) {
                    // Nested declaration: the function value lives in a
                    // local of the enclosing frame. The name is declared
                    // after the body so it cannot capture itself.
                    let index = self.alloc_local();
                    let binding = Binding::Local { index };
                    let declared = self.scopes.declare(Ident {
                        name: decl.name.clone(),
                        ty,
                        binding: binding.clone(),
                        is_const: true,
                        use_count: 0,
                    });
                    if !declared {
                        self.unit.errors.add_fatal(
                            ErrorMessage::AlreadyDeclared {
                                name: decl.name.clone(),
                            },
                            decl.span,
                        );
                    }
                    self.analysis.bindings.insert(decl.id, binding);
                }
            }
            Stmt::Class(decl) => self.analyze_class(decl),
            Stmt::Return(s) => {
                let ty = match &mut s.value {
                    Some(value) => self.analyze_expr(value),
                    None => SymbolType::void(),
                };
                self.record_return(ty, s.span);
            }
            Stmt::If(s) => {
                self.analyze_expr(&mut s.cond);
                self.analyze_block(&mut s.then_block);
                if let Some(branch) = &mut s.else_branch {
                    self.analyze_stmt(branch);
                }
            }
            Stmt::While(s) => {
                self.analyze_expr(&mut s.cond);
                self.scopes.push(ScopeKind::Loop);
                self.analyze_block(&mut s.body);
                self.scopes.pop();
            }
            Stmt::For(s) => {
                self.scopes.push(ScopeKind::Loop);
                if let Some(init) = &mut s.init {
                    self.analyze_stmt(init);
                }
                if let Some(cond) = &mut s.cond {
                    self.analyze_expr(cond);
                }
                if let Some(step) = &mut s.step {
                    self.analyze_expr(step);
                }
                self.analyze_block(&mut s.body);
                self.scopes.pop();
            }
            Stmt::Break { span, .. } => {
                if !self.scopes.in_loop() {
                    self.unit.errors.add_fatal(ErrorMessage::IllegalBreak, *span);
                }
            }
            Stmt::Continue { span, .. } => {
                if !self.scopes.in_loop() {
                    self.unit
                        .errors
                        .add_fatal(ErrorMessage::IllegalContinue, *span);
                }
            }
            Stmt::Try(s) => {
                self.analyze_block(&mut s.body);
                let index = self.alloc_local();
                let binding = Binding::Local { index };
                self.analysis.bindings.insert(s.catch_id, binding.clone());
                self.scopes.push(ScopeKind::Normal);
                self.scopes.declare(Ident {
                    name: s.catch_name.clone(),
                    ty: SymbolType::any(),
                    binding,
                    is_const: false,
                    use_count: 0,
                });
                for inner in &mut s.catch_block.statements {
                    self.analyze_stmt(inner);
                }
                self.scopes.pop();
            }
            Stmt::Throw(s) => {
                self.analyze_expr(&mut s.value);
            }
            Stmt::Yield(s) => {
                // Yields inside generator bodies were rewritten during
                // desugaring; anything left is out of place.
                self.unit.errors.add_fatal(ErrorMessage::IllegalYield, s.span);
            }
            Stmt::Expr(s) => {
                self.analyze_expr(&mut s.expr);
            }
            Stmt::Block(b) => self.analyze_block(b),
        }
    }

    fn analyze_block(&mut self, block: &mut Block) {
        self.scopes.push(ScopeKind::Normal);
        for stmt in &mut block.statements {
            self.analyze_stmt(stmt);
        }
        self.scopes.pop();
    }

    fn analyze_let(&mut self, s: &mut LetStmt) {
        let annotated = s.ty.as_ref().map(|t| self.resolve_type(t));
        let value_ty = match &mut s.value {
            Some(value) => Some(self.analyze_expr(value)),
            None => None,
        };

        let ty = match (annotated, value_ty) {
            (Some(a), Some(v)) => {
                if !a.type_compatible(&v, false) {
                    self.unit.errors.add_fatal(
                        ErrorMessage::MismatchedTypes {
                            expected: a.name(),
                            got: v.name(),
                        },
                        s.span,
                    );
                }
                a
            }
            (Some(a), None) => a,
            (None, Some(v)) => {
                if v.is_null() || v.is_void() {
                    SymbolType::any()
                } else {
                    v
                }
            }
            (None, None) => SymbolType::any(),
        };

        let index = self.alloc_local();
        let binding = Binding::Local { index };
        let declared = self.scopes.declare(Ident {
            name: s.name.clone(),
            ty,
            binding: binding.clone(),
            is_const: s.is_const,
            use_count: 0,
        });
        if !declared {
            self.unit.errors.add_fatal(
                ErrorMessage::AlreadyDeclared {
                    name: s.name.clone(),
                },
                s.span,
            );
        }
        self.analysis.bindings.insert(s.id, binding);
    }

    fn analyze_class(&mut self, decl: &mut ClassDecl) {
        let Some(info) = self.analysis.classes.get(&decl.id).cloned() else {
            self.unit
                .errors
                .add_fatal(ErrorMessage::IllegalClassDeclaration, decl.span);
            return;
        };

        for member in &mut decl.members {
            if let Some(method) = &mut member.method {
                self.analyze_function(method, true, Some(info.ty.clone()));
            } else if let Some(default) = &mut member.default {
                let got = self.analyze_expr(default);
                if let Some((_, _, field)) = info.ty.find_member(&member.name) {
                    if !field.ty.type_compatible(&got, false) {
                        let expected = field.ty.name();
                        let span = default.span();
                        self.unit.errors.add_fatal(
                            ErrorMessage::MismatchedTypes {
                                expected,
                                got: got.name(),
                            },
                            span,
                        );
                    }
                }
            }
        }
    }

    // --- functions ---

    /// Analyze a function literal: declare parameters, walk the body,
    /// settle the return type, and record its [`FunctionInfo`]. Returns the
    /// function's symbol type.
    fn analyze_function(
        &mut self,
        func: &mut FunctionExpr,
        is_method: bool,
        class_ty: Option<SymbolTypeRef>,
    ) -> SymbolTypeRef {
        if func.is_generator {
            self.desugar_generator(func);
        }

        let param_tys: Vec<SymbolTypeRef> = func
            .params
            .iter()
            .map(|p| match &p.ty {
                Some(t) => self.resolve_type(t),
                None => SymbolType::any(),
            })
            .collect();
        let declared_ret = func.return_ty.as_ref().map(|t| self.resolve_type(t));

        self.fn_stack.push(FnCtx {
            declared_ret,
            inferred_ret: None,
            ret_conflict: false,
            next_local: 0,
            is_method,
            class_ty: class_ty.clone(),
        });
        self.scopes.push(ScopeKind::Function);

        for (i, param) in func.params.iter().enumerate() {
            let declared = self.scopes.declare(Ident {
                name: param.name.clone(),
                ty: param_tys[i].clone(),
                binding: Binding::Param { index: i as u16 },
                is_const: false,
                use_count: 0,
            });
            if !declared {
                self.unit.errors.add_fatal(
                    ErrorMessage::AlreadyDeclared {
                        name: param.name.clone(),
                    },
                    param.span,
                );
            }
        }
        if is_method {
            if let Some(ct) = &class_ty {
                self.scopes.declare(Ident {
                    name: "self".to_string(),
                    ty: ct.clone(),
                    binding: Binding::Param {
                        index: func.params.len() as u16,
                    },
                    is_const: true,
                    use_count: 0,
                });
            }
        }

        for stmt in &mut func.body.statements {
            self.analyze_stmt(stmt);
        }

        let scope = self.scopes.pop();
        let ctx = self.fn_stack.pop().expect("function context");

        let captures = scope.captures;
        let is_closure = !is_method && !captures.is_empty();
        let nargs = func.params.len() + usize::from(is_method || is_closure);
        let return_ty = ctx
            .declared_ret
            .or(ctx.inferred_ret)
            .unwrap_or_else(SymbolType::void);

        self.analysis.functions.insert(
            func.id,
            FunctionInfo {
                nargs: nargs as u8,
                locals: ctx.next_local,
                is_closure,
                is_method,
                captures,
                return_ty: return_ty.clone(),
            },
        );

        let ty: SymbolTypeRef = Arc::new(SymbolType::Function {
            return_ty,
            params: param_tys,
        });
        self.record(func.id, ty)
    }

    /// Rewrite a generator body into a closure-returning driver:
    ///
    /// ```text
    /// function range(n) { ...yield v;... }
    ///   =>
    /// function range(n) { return function($yield) { ...$yield(v);... }; }
    /// ```
    ///
    /// The inner function picks up the outer parameters and locals through
    /// ordinary closure capture.
    fn desugar_generator(&mut self, func: &mut FunctionExpr) {
        func.is_generator = false;
        func.return_ty = None;
        let span = func.span;

        let mut inner_body = Block {
            id: self.unit.fresh_node_id(),
            statements: Vec::new(),
            span: func.body.span,
        };
        std::mem::swap(&mut inner_body, &mut func.body);
        self.rewrite_yields(&mut inner_body);

        let inner = FunctionExpr {
            id: self.unit.fresh_node_id(),
            params: vec![Param {
                id: self.unit.fresh_node_id(),
                name: GENERATOR_CALLBACK.to_string(),
                ty: None,
                span,
            }],
            return_ty: None,
            body: inner_body,
            is_generator: false,
            span,
        };
        func.body.statements.push(Stmt::Return(ReturnStmt {
            id: self.unit.fresh_node_id(),
            value: Some(Expr::Function(inner)),
            span,
        }));
    }

    fn rewrite_yields(&mut self, block: &mut Block) {
        for stmt in &mut block.statements {
            self.rewrite_yield_stmt(stmt);
        }
    }

    /// Replace `yield v;` with `$yield(v);`. Recurses through control flow
    /// but not into nested function literals, whose yields belong to their
    /// own generator.
    fn rewrite_yield_stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::Yield(y) => {
                let callee = Expr::Ident(IdentExpr {
                    id: self.unit.fresh_node_id(),
                    name: GENERATOR_CALLBACK.to_string(),
                    span: y.span,
                });
                let call = Expr::Call(CallExpr {
                    id: self.unit.fresh_node_id(),
                    callee: Box::new(callee),
                    args: vec![y.value.clone()],
                    span: y.span,
                });
                *stmt = Stmt::Expr(ExprStmt {
                    id: y.id,
                    expr: call,
                    span: y.span,
                });
            }
            Stmt::If(s) => {
                self.rewrite_yields(&mut s.then_block);
                if let Some(branch) = &mut s.else_branch {
                    self.rewrite_yield_stmt(branch);
                }
            }
            Stmt::While(s) => self.rewrite_yields(&mut s.body),
            Stmt::For(s) => {
                if let Some(init) = &mut s.init {
                    self.rewrite_yield_stmt(init);
                }
                self.rewrite_yields(&mut s.body);
            }
            Stmt::Try(s) => {
                self.rewrite_yields(&mut s.body);
                self.rewrite_yields(&mut s.catch_block);
            }
            Stmt::Block(b) => self.rewrite_yields(b),
            _ => {}
        }
    }

    fn record_return(&mut self, ty: SymbolTypeRef, span: Span) {
        let ctx = self.fn_stack.last_mut().expect("function context");
        if let Some(declared) = &ctx.declared_ret {
            if !declared.type_compatible(&ty, false) {
                let expected = declared.name();
                self.unit.errors.add_fatal(
                    ErrorMessage::MismatchedReturnType {
                        expected,
                        got: ty.name(),
                    },
                    span,
                );
            }
            return;
        }

        match ctx.inferred_ret.take() {
            None => ctx.inferred_ret = Some(ty),
            Some(prev) => match SymbolType::promote(&prev, &ty) {
                Some(merged) => ctx.inferred_ret = Some(merged),
                None => {
                    let report = !ctx.ret_conflict;
                    ctx.ret_conflict = true;
                    ctx.inferred_ret = Some(prev.clone());
                    if report {
                        self.unit.errors.add_fatal(
                            ErrorMessage::MultipleReturnTypes {
                                first: prev.name(),
                                second: ty.name(),
                            },
                            span,
                        );
                    }
                }
            },
        }
    }

    // --- expressions ---

    fn analyze_expr(&mut self, expr: &mut Expr) -> SymbolTypeRef {
        match expr {
            Expr::IntLiteral { id, .. } => self.record(*id, SymbolType::int()),
            Expr::FloatLiteral { id, .. } => self.record(*id, SymbolType::float()),
            Expr::StringLiteral { id, .. } => self.record(*id, SymbolType::string()),
            Expr::BoolLiteral { id, .. } => self.record(*id, SymbolType::bool()),
            Expr::NullLiteral { id, .. } => self.record(*id, SymbolType::null()),
            Expr::Ident(e) => {
                let (id, name, span) = (e.id, e.name.clone(), e.span);
                match self.lookup_ident(&name, span) {
                    Some(ident) => {
                        self.analysis.bindings.insert(id, ident.binding);
                        self.record(id, ident.ty)
                    }
                    None => {
                        self.unit
                            .errors
                            .add_fatal(ErrorMessage::UndeclaredIdentifier { name }, span);
                        self.record(id, SymbolType::undefined())
                    }
                }
            }
            Expr::Unary(e) => {
                let operand = self.analyze_expr(&mut e.operand);
                let ty = match e.op {
                    UnaryOp::Neg => {
                        if operand.is_numeric() || operand.is_any() || operand.is_undefined() {
                            operand
                        } else {
                            self.unit.errors.add_fatal(
                                ErrorMessage::MismatchedTypes {
                                    expected: "int or float".to_string(),
                                    got: operand.name(),
                                },
                                e.span,
                            );
                            SymbolType::undefined()
                        }
                    }
                    UnaryOp::Not => SymbolType::bool(),
                };
                self.record(e.id, ty)
            }
            Expr::Binary(e) => self.analyze_binary(e),
            Expr::Assign(e) => self.analyze_assign(e),
            Expr::Call(e) => self.analyze_call(e),
            Expr::Member(e) => self.analyze_member(e),
            Expr::Index(e) => self.analyze_index(e),
            Expr::Function(f) => self.analyze_function(f, false, None),
            Expr::New(e) => self.analyze_new(e),
            Expr::Cast(e) => self.analyze_cast(e),
            Expr::ArrayLiteral(e) => {
                let mut element: Option<SymbolTypeRef> = None;
                for item in &mut e.elements {
                    let ty = self.analyze_expr(item);
                    element = Some(match element {
                        None => ty,
                        // Mixed element types widen to Array<any>.
                        Some(prev) => {
                            SymbolType::promote(&prev, &ty).unwrap_or_else(SymbolType::any)
                        }
                    });
                }
                let element = element.unwrap_or_else(SymbolType::any);
                self.record(e.id, array_of(element))
            }
        }
    }

    /// Resolve a name to its declaration.
    ///
    /// A hit across a function boundary on a parameter or local turns into
    /// a closure capture; the ident comes back rebound through `self`.
    /// Inside a method body a bare name that is not in scope falls back to
    /// the class's members.
    fn lookup_ident(&mut self, name: &str, span: Span) -> Option<Ident> {
        match self.scopes.lookup(name) {
            Some(hit) => {
                let capturable = matches!(
                    hit.ident.binding,
                    Binding::Param { .. } | Binding::Local { .. }
                );
                if hit.crossed_function && capturable {
                    let (ident, crossed) = self.scopes.capture(name)?;
                    // Methods have no closure environment; the implicit
                    // self is the instance, so module locals cannot be
                    // reached from inside one.
                    let through_method = self
                        .fn_stack
                        .iter()
                        .rev()
                        .take(crossed)
                        .any(|c| c.is_method);
                    if through_method {
                        self.unit.errors.add_fatal(
                            ErrorMessage::UndeclaredIdentifier {
                                name: name.to_string(),
                            },
                            span,
                        );
                    }
                    Some(ident)
                } else {
                    Some(hit.ident)
                }
            }
            None => {
                let class_ty = self.fn_stack.last().and_then(|c| c.class_ty.clone());
                class_ty.and_then(|ct| {
                    ct.find_member(name).map(|(_, _, m)| Ident {
                        name: name.to_string(),
                        ty: m.ty.clone(),
                        binding: Binding::SelfMember {
                            name: name.to_string(),
                        },
                        is_const: false,
                        use_count: 1,
                    })
                })
            }
        }
    }

    fn analyze_binary(&mut self, e: &mut BinaryExpr) -> SymbolTypeRef {
        let lhs = self.analyze_expr(&mut e.lhs);
        let rhs = self.analyze_expr(&mut e.rhs);
        let lu = SymbolType::unalias(&lhs);
        let ru = SymbolType::unalias(&rhs);

        let ty = if e.op.is_logical() {
            // Operands go through runtime truthiness; any type is legal.
            SymbolType::bool()
        } else if e.op.is_comparison() {
            let equality = matches!(e.op, BinaryOp::Equal | BinaryOp::NotEqual);
            let ok = lu.is_any()
                || ru.is_any()
                || lu.is_undefined()
                || ru.is_undefined()
                || SymbolType::promote(&lu, &ru).is_some()
                || both_strings(&lu, &ru)
                || (equality
                    && (lu.type_compatible(&ru, true) || ru.type_compatible(&lu, true)));
            if !ok {
                self.unit.errors.add_fatal(
                    ErrorMessage::MismatchedTypes {
                        expected: lu.name(),
                        got: ru.name(),
                    },
                    e.span,
                );
            }
            SymbolType::bool()
        } else if e.op == BinaryOp::Add && both_strings(&lu, &ru) {
            SymbolType::string()
        } else if lu.is_any() || ru.is_any() || lu.is_undefined() || ru.is_undefined() {
            SymbolType::any()
        } else if lu.is_numeric() && ru.is_numeric() {
            SymbolType::promote(&lu, &ru).unwrap_or_else(SymbolType::undefined)
        } else {
            self.unit.errors.add_fatal(
                ErrorMessage::MismatchedTypes {
                    expected: lu.name(),
                    got: ru.name(),
                },
                e.span,
            );
            SymbolType::undefined()
        };

        self.record(e.id, ty)
    }

    fn analyze_assign(&mut self, e: &mut AssignExpr) -> SymbolTypeRef {
        let value_ty = self.analyze_expr(&mut e.value);

        let target_ty = match e.target.as_mut() {
            Expr::Ident(t) => {
                let (id, name, span) = (t.id, t.name.clone(), t.span);
                match self.lookup_ident(&name, span) {
                    Some(ident) => {
                        if ident.is_const {
                            self.unit
                                .errors
                                .add_fatal(ErrorMessage::CannotAssignConst { name }, span);
                        }
                        self.analysis.bindings.insert(id, ident.binding.clone());
                        self.analysis.expr_types.insert(id, ident.ty.clone());
                        ident.ty
                    }
                    None => {
                        self.unit
                            .errors
                            .add_fatal(ErrorMessage::UndeclaredIdentifier { name }, span);
                        self.record(id, SymbolType::undefined())
                    }
                }
            }
            Expr::Member(m) => self.analyze_member(m),
            Expr::Index(ix) => self.analyze_index(ix),
            other => {
                // The parser flags these; keep analyzing for diagnostics.
                self.analyze_expr(other);
                self.unit
                    .errors
                    .add_fatal(ErrorMessage::InvalidAssignTarget, e.span);
                SymbolType::undefined()
            }
        };

        if !target_ty.type_compatible(&value_ty, false) {
            self.unit.errors.add_fatal(
                ErrorMessage::MismatchedTypes {
                    expected: target_ty.name(),
                    got: value_ty.name(),
                },
                e.span,
            );
        }
        self.record(e.id, target_ty)
    }

    fn analyze_call(&mut self, e: &mut CallExpr) -> SymbolTypeRef {
        let callee_ty = self.analyze_expr(&mut e.callee);
        let arg_tys: Vec<SymbolTypeRef> =
            e.args.iter_mut().map(|a| self.analyze_expr(a)).collect();

        let u = SymbolType::unalias(&callee_ty);
        let ty = match u.as_ref() {
            SymbolType::Function { return_ty, params } => {
                if params.len() != arg_tys.len() {
                    self.unit.errors.add_fatal(
                        ErrorMessage::InvalidArgsCount {
                            expected: params.len(),
                            got: arg_tys.len(),
                        },
                        e.span,
                    );
                } else {
                    for (i, (param, arg)) in params.iter().zip(&arg_tys).enumerate() {
                        if !param.type_compatible(arg, false) {
                            self.unit.errors.add_fatal(
                                ErrorMessage::MismatchedTypes {
                                    expected: param.name(),
                                    got: arg.name(),
                                },
                                e.args[i].span(),
                            );
                        }
                    }
                }
                return_ty.clone()
            }
            SymbolType::Any | SymbolType::Undefined => SymbolType::any(),
            other => {
                self.unit.errors.add_fatal(
                    ErrorMessage::NotCallable { ty: other.name() },
                    e.span,
                );
                SymbolType::undefined()
            }
        };
        self.record(e.id, ty)
    }

    fn analyze_member(&mut self, e: &mut MemberExpr) -> SymbolTypeRef {
        let obj_ty = self.analyze_expr(&mut e.object);
        let u = SymbolType::unalias(&obj_ty);

        let hashed = MemberStrategy::Hashed {
            hash: name_hash(&e.member),
        };
        let (ty, strategy) = match u.as_ref() {
            SymbolType::Any | SymbolType::Undefined => (SymbolType::any(), hashed),
            SymbolType::Object { name, .. } => {
                // Native class members may have been registered against a
                // forward stub; the map always holds the finished type.
                let effective = self.types.get(name).cloned().unwrap_or_else(|| u.clone());
                match effective.find_member(&e.member) {
                    Some((depth, index, member)) => {
                        let strategy = if depth == 0 && index <= u8::MAX as usize {
                            MemberStrategy::Direct { index: index as u8 }
                        } else {
                            hashed
                        };
                        (member.ty.clone(), strategy)
                    }
                    None => {
                        self.unit.errors.add_fatal(
                            ErrorMessage::NotADataMember {
                                name: e.member.clone(),
                                ty: u.name(),
                            },
                            e.span,
                        );
                        (SymbolType::undefined(), hashed)
                    }
                }
            }
            _ if array_element(&u).is_some() || map_key_value(&u).is_some() || is_string(&u) => {
                if e.member == "length" {
                    (SymbolType::int(), hashed)
                } else {
                    self.unit.errors.add_fatal(
                        ErrorMessage::NotADataMember {
                            name: e.member.clone(),
                            ty: u.name(),
                        },
                        e.span,
                    );
                    (SymbolType::undefined(), hashed)
                }
            }
            _ => {
                self.unit.errors.add_fatal(
                    ErrorMessage::NotADataMember {
                        name: e.member.clone(),
                        ty: u.name(),
                    },
                    e.span,
                );
                (SymbolType::undefined(), hashed)
            }
        };

        self.analysis.member_access.insert(e.id, strategy);
        self.record(e.id, ty)
    }

    fn analyze_index(&mut self, e: &mut IndexExpr) -> SymbolTypeRef {
        let obj_ty = self.analyze_expr(&mut e.object);
        let index_ty = self.analyze_expr(&mut e.index);
        let u = SymbolType::unalias(&obj_ty);

        // Maps are keyed by their declared key type, not by an integer.
        if let Some((key, value)) = map_key_value(&u) {
            let iu = SymbolType::unalias(&index_ty);
            if !key.type_compatible(&iu, false) && !iu.is_any() && !iu.is_undefined() {
                self.unit.errors.add_fatal(
                    ErrorMessage::MismatchedTypes {
                        expected: key.name(),
                        got: iu.name(),
                    },
                    e.index.span(),
                );
            }
            return self.record(e.id, value);
        }

        let element = if let Some(element) = array_element(&u) {
            element
        } else if u.is_any() || u.is_undefined() {
            SymbolType::any()
        } else {
            self.unit.errors.add_fatal(
                ErrorMessage::MismatchedTypes {
                    expected: "an array".to_string(),
                    got: u.name(),
                },
                e.span,
            );
            SymbolType::undefined()
        };

        let iu = SymbolType::unalias(&index_ty);
        let index_ok = matches!(
            iu.as_ref(),
            SymbolType::Primitive(Primitive::Int) | SymbolType::Primitive(Primitive::UInt)
        ) || iu.is_any()
            || iu.is_undefined();
        if !index_ok {
            self.unit.errors.add_fatal(
                ErrorMessage::MismatchedTypes {
                    expected: "int".to_string(),
                    got: iu.name(),
                },
                e.index.span(),
            );
        }

        self.record(e.id, element)
    }

    fn analyze_new(&mut self, e: &mut NewExpr) -> SymbolTypeRef {
        let ty = self.resolve_type(&e.ty);
        let arg_tys: Vec<SymbolTypeRef> =
            e.args.iter_mut().map(|a| self.analyze_expr(a)).collect();
        let u = SymbolType::unalias(&ty);

        match u.as_ref() {
            SymbolType::GenericInstance { base, .. } if base.name() == "Array" => {
                match e.args.len() {
                    0 => {}
                    1 => {
                        // The backing store is sized at compile time.
                        let constant =
                            matches!(&e.args[0], Expr::IntLiteral { value, .. } if *value >= 0);
                        if !constant {
                            self.unit
                                .errors
                                .add_fatal(ErrorMessage::ArraySizeNotConstant, e.args[0].span());
                        }
                    }
                    got => {
                        self.unit.errors.add_fatal(
                            ErrorMessage::InvalidArgsCount { expected: 1, got },
                            e.span,
                        );
                    }
                }
            }
            SymbolType::Object { name, .. } => {
                let effective = self.types.get(name).cloned().unwrap_or_else(|| u.clone());
                let init_ty = effective
                    .find_member("init")
                    .map(|(_, _, m)| SymbolType::unalias(&m.ty));
                match init_ty {
                    Some(init) => {
                        if let SymbolType::Function { params, .. } = init.as_ref() {
                            if params.len() != arg_tys.len() {
                                self.unit.errors.add_fatal(
                                    ErrorMessage::InvalidArgsCount {
                                        expected: params.len(),
                                        got: arg_tys.len(),
                                    },
                                    e.span,
                                );
                            } else {
                                for (i, (param, arg)) in
                                    params.iter().zip(&arg_tys).enumerate()
                                {
                                    if !param.type_compatible(arg, false) {
                                        self.unit.errors.add_fatal(
                                            ErrorMessage::MismatchedTypes {
                                                expected: param.name(),
                                                got: arg.name(),
                                            },
                                            e.args[i].span(),
                                        );
                                    }
                                }
                            }
                        }
                    }
                    None => {
                        if !e.args.is_empty() {
                            self.unit.errors.add_fatal(
                                ErrorMessage::InvalidArgsCount {
                                    expected: 0,
                                    got: e.args.len(),
                                },
                                e.span,
                            );
                        }
                    }
                }
            }
            SymbolType::Any | SymbolType::Undefined => {}
            other => {
                self.unit.errors.add_fatal(
                    ErrorMessage::NotInstantiable { name: other.name() },
                    e.span,
                );
            }
        }

        self.record(e.id, ty)
    }

    fn analyze_cast(&mut self, e: &mut CastExpr) -> SymbolTypeRef {
        let src = self.analyze_expr(&mut e.expr);
        let target = self.resolve_type(&e.ty);
        if !cast_allowed(&src, &target) {
            self.unit.errors.add_fatal(
                ErrorMessage::InvalidCast {
                    from: src.name(),
                    to: target.name(),
                },
                e.span,
            );
        }
        self.record(e.id, target)
    }

    // --- types and helpers ---

    fn resolve_type(&mut self, ty: &TypeExpr) -> SymbolTypeRef {
        if let Some(builtin) = SymbolType::builtin(&ty.name) {
            if !ty.args.is_empty() {
                self.unit.errors.add_fatal(
                    ErrorMessage::GenericArgCount {
                        name: ty.name.clone(),
                        expected: 0,
                        got: ty.args.len(),
                    },
                    ty.span,
                );
            }
            return builtin;
        }

        match ty.name.as_str() {
            "Array" => {
                if ty.args.len() != 1 {
                    self.unit.errors.add_fatal(
                        ErrorMessage::GenericArgCount {
                            name: "Array".to_string(),
                            expected: 1,
                            got: ty.args.len(),
                        },
                        ty.span,
                    );
                    return SymbolType::undefined();
                }
                array_of(self.resolve_type(&ty.args[0]))
            }
            "Map" => {
                if ty.args.len() != 2 {
                    self.unit.errors.add_fatal(
                        ErrorMessage::GenericArgCount {
                            name: "Map".to_string(),
                            expected: 2,
                            got: ty.args.len(),
                        },
                        ty.span,
                    );
                    return SymbolType::undefined();
                }
                let key = self.resolve_type(&ty.args[0]);
                let value = self.resolve_type(&ty.args[1]);
                map_of(key, value)
            }
            "Function" => {
                if ty.args.is_empty() {
                    self.unit.errors.add_fatal(
                        ErrorMessage::GenericArgCount {
                            name: "Function".to_string(),
                            expected: 1,
                            got: 0,
                        },
                        ty.span,
                    );
                    return SymbolType::undefined();
                }
                let return_ty = self.resolve_type(&ty.args[0]);
                let params = ty.args[1..].iter().map(|a| self.resolve_type(a)).collect();
                Arc::new(SymbolType::Function { return_ty, params })
            }
            name => match self.types.get(name).cloned() {
                Some(found) => {
                    if !ty.args.is_empty() {
                        self.unit.errors.add_fatal(
                            ErrorMessage::GenericArgCount {
                                name: name.to_string(),
                                expected: 0,
                                got: ty.args.len(),
                            },
                            ty.span,
                        );
                    }
                    found
                }
                None => {
                    self.unit.errors.add_fatal(
                        ErrorMessage::NotAType {
                            name: name.to_string(),
                        },
                        ty.span,
                    );
                    SymbolType::undefined()
                }
            },
        }
    }

    fn record(&mut self, id: NodeId, ty: SymbolTypeRef) -> SymbolTypeRef {
        self.analysis.expr_types.insert(id, ty.clone());
        ty
    }

    fn alloc_local(&mut self) -> u16 {
        let ctx = self.fn_stack.last_mut().expect("function context");
        let index = ctx.next_local;
        ctx.next_local += 1;
        index
    }
}

fn array_of(element: SymbolTypeRef) -> SymbolTypeRef {
    Arc::new(SymbolType::GenericInstance {
        base: Arc::new(SymbolType::Generic {
            name: "Array".to_string(),
            params: vec!["T".to_string()],
        }),
        args: vec![element],
    })
}

fn map_of(key: SymbolTypeRef, value: SymbolTypeRef) -> SymbolTypeRef {
    Arc::new(SymbolType::GenericInstance {
        base: Arc::new(SymbolType::Generic {
            name: "Map".to_string(),
            params: vec!["K".to_string(), "V".to_string()],
        }),
        args: vec![key, value],
    })
}

fn map_key_value(ty: &SymbolTypeRef) -> Option<(SymbolTypeRef, SymbolTypeRef)> {
    if let SymbolType::GenericInstance { base, args } = ty.as_ref() {
        if base.name() == "Map" && args.len() == 2 {
            return Some((args[0].clone(), args[1].clone()));
        }
    }
    None
}

fn array_element(ty: &SymbolTypeRef) -> Option<SymbolTypeRef> {
    if let SymbolType::GenericInstance { base, args } = ty.as_ref() {
        if base.name() == "Array" {
            return args.first().cloned();
        }
    }
    None
}

fn is_string(ty: &SymbolTypeRef) -> bool {
    matches!(ty.as_ref(), SymbolType::Primitive(Primitive::String))
}

fn both_strings(a: &SymbolTypeRef, b: &SymbolTypeRef) -> bool {
    is_string(a) && is_string(b)
}

fn cast_allowed(src: &SymbolTypeRef, target: &SymbolTypeRef) -> bool {
    let s = SymbolType::unalias(src);
    let t = SymbolType::unalias(target);

    if s.is_any() || t.is_any() || s.is_undefined() || t.is_undefined() {
        return true;
    }
    if s.is_numeric() && t.is_numeric() {
        return true;
    }
    // Anything can be rendered as a string or collapsed to a truth value.
    if matches!(t.as_ref(), SymbolType::Primitive(Primitive::String))
        || matches!(t.as_ref(), SymbolType::Primitive(Primitive::Bool))
    {
        return true;
    }
    if matches!(s.as_ref(), SymbolType::Primitive(Primitive::Bool)) && t.is_numeric() {
        return true;
    }
    if s.is_null() && t.is_reference() {
        return true;
    }
    // Up and down casts within a class hierarchy.
    let reference_pair = matches!(
        s.as_ref(),
        SymbolType::Object { .. } | SymbolType::GenericInstance { .. }
    ) && matches!(
        t.as_ref(),
        SymbolType::Object { .. } | SymbolType::GenericInstance { .. }
    );
    if reference_pair {
        return s.type_compatible(&t, true) || t.type_compatible(&s, true);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_type_expression, Lexer, Parser};

    fn run(source: &str) -> (Module, Analysis, CompilationUnit) {
        run_with(source, &NativeDecls::default())
    }

    fn run_with(source: &str, natives: &NativeDecls) -> (Module, Analysis, CompilationUnit) {
        let mut unit = CompilationUnit::new("test", source);
        let tokens = Lexer::new(source).tokenize(&mut unit);
        let mut module = Parser::new(tokens, &mut unit).parse_module();
        assert!(!unit.errors.has_fatal_errors(), "parse: {:?}", unit.errors);
        let analysis = Analyzer::new(&mut unit).analyze(&mut module, natives);
        (module, analysis, unit)
    }

    fn inner_function(module: &Module) -> &FunctionExpr {
        let Stmt::Function(outer) = &module.statements[0] else {
            panic!("expected function decl")
        };
        let Some(Stmt::Return(ret)) = outer.func.body.statements.last() else {
            panic!("expected trailing return")
        };
        let Some(Expr::Function(inner)) = &ret.value else {
            panic!("expected function literal return")
        };
        inner
    }

    #[test]
    fn test_closure_capture_of_outer_param() {
        let source = r#"
            function make_adder(n: int): Function<int, int> {
                return function(x: int): int { return x + n; };
            }
        "#;
        let (module, analysis, unit) = run(source);
        assert!(!unit.errors.has_fatal_errors(), "{:?}", unit.errors);

        let inner = inner_function(&module);
        let info = &analysis.functions[&inner.id];
        assert!(info.is_closure);
        assert_eq!(info.nargs, 2);
        assert_eq!(info.captures.len(), 1);
        assert_eq!(info.captures[0].name, "n");
        assert_eq!(info.captures[0].source, Binding::Param { index: 0 });

        // Inside the closure the captured name reads through self.
        let Some(Stmt::Return(ret)) = inner.body.statements.last() else {
            panic!()
        };
        let Some(Expr::Binary(add)) = &ret.value else {
            panic!()
        };
        let Expr::Ident(n_ref) = add.rhs.as_ref() else {
            panic!()
        };
        assert_eq!(
            analysis.bindings[&n_ref.id],
            Binding::SelfMember { name: "n".into() }
        );

        let Stmt::Function(outer) = &module.statements[0] else {
            panic!()
        };
        let outer_info = &analysis.functions[&outer.func.id];
        assert!(!outer_info.is_closure);
        assert_eq!(outer_info.nargs, 1);
    }

    #[test]
    fn test_non_capturing_literal_is_plain_function() {
        let source = r#"
            function twice(): Function<int, int> {
                return function(x: int): int { return x * 2; };
            }
        "#;
        let (module, analysis, unit) = run(source);
        assert!(!unit.errors.has_fatal_errors(), "{:?}", unit.errors);
        let inner = inner_function(&module);
        let info = &analysis.functions[&inner.id];
        assert!(!info.is_closure);
        assert_eq!(info.nargs, 1);
    }

    #[test]
    fn test_return_type_inference_promotes() {
        let source = "function f(c: bool) { if (c) { return 1; } return 2.5; }";
        let (module, analysis, unit) = run(source);
        assert!(!unit.errors.has_fatal_errors(), "{:?}", unit.errors);
        let Stmt::Function(decl) = &module.statements[0] else {
            panic!()
        };
        assert_eq!(analysis.functions[&decl.func.id].return_ty.name(), "float");
    }

    #[test]
    fn test_conflicting_returns_reported() {
        let source = r#"function f(c: bool) { if (c) { return 1; } return "s"; }"#;
        let (_, _, unit) = run(source);
        assert!(unit
            .errors
            .iter()
            .any(|e| matches!(e.message, ErrorMessage::MultipleReturnTypes { .. })));
    }

    #[test]
    fn test_declared_return_type_enforced() {
        let source = r#"function f(): int { return "s"; }"#;
        let (_, _, unit) = run(source);
        assert!(unit
            .errors
            .iter()
            .any(|e| matches!(e.message, ErrorMessage::MismatchedReturnType { .. })));
    }

    #[test]
    fn test_undeclared_identifier() {
        let (_, _, unit) = run("let x = missing;");
        assert!(unit
            .errors
            .iter()
            .any(|e| matches!(e.message, ErrorMessage::UndeclaredIdentifier { .. })));
    }

    #[test]
    fn test_const_assignment_rejected() {
        let (_, _, unit) = run("const x = 1; x = 2;");
        assert!(unit
            .errors
            .iter()
            .any(|e| matches!(e.message, ErrorMessage::CannotAssignConst { .. })));
    }

    #[test]
    fn test_duplicate_declaration_rejected() {
        let (_, _, unit) = run("let x = 1; let x = 2;");
        assert!(unit
            .errors
            .iter()
            .any(|e| matches!(e.message, ErrorMessage::AlreadyDeclared { .. })));
    }

    #[test]
    fn test_member_strategy_direct_vs_hashed() {
        let source = r#"
            class Entity { id: int; }
            class Point extends Entity {
                x: float;
                y: float;
            }
            function gety(p: Point): float { return p.y; }
            function getid(p: Point): int { return p.id; }
        "#;
        let (_, analysis, unit) = run(source);
        assert!(!unit.errors.has_fatal_errors(), "{:?}", unit.errors);
        assert!(analysis
            .member_access
            .values()
            .any(|s| *s == MemberStrategy::Direct { index: 1 }));
        assert!(analysis.member_access.values().any(|s| {
            *s == MemberStrategy::Hashed {
                hash: name_hash("id"),
            }
        }));
    }

    #[test]
    fn test_method_reads_fields_through_self() {
        let source = r#"
            class Counter {
                count: int = 0;
                bump(): int { count = count + 1; return count; }
            }
        "#;
        let (_, analysis, unit) = run(source);
        assert!(!unit.errors.has_fatal_errors(), "{:?}", unit.errors);
        let method = analysis
            .functions
            .values()
            .find(|f| f.is_method)
            .expect("method info");
        assert_eq!(method.nargs, 1);
        assert!(analysis
            .bindings
            .values()
            .any(|b| *b == Binding::SelfMember { name: "count".into() }));
    }

    #[test]
    fn test_module_locals_counted() {
        let (_, analysis, unit) = run("let a = 1; let b = 2;");
        assert!(!unit.errors.has_fatal_errors());
        assert_eq!(analysis.module_locals, 2);
        assert!(analysis.bindings.values().any(|b| *b == Binding::Local { index: 0 }));
        assert!(analysis.bindings.values().any(|b| *b == Binding::Local { index: 1 }));
    }

    #[test]
    fn test_generator_desugars_to_closure_factory() {
        let source = "function range(n: int) { yield n; }";
        let (module, analysis, unit) = run(source);
        assert!(!unit.errors.has_fatal_errors(), "{:?}", unit.errors);

        let Stmt::Function(decl) = &module.statements[0] else {
            panic!()
        };
        assert!(!decl.func.is_generator);
        assert_eq!(decl.func.body.statements.len(), 1);
        assert!(matches!(decl.func.body.statements[0], Stmt::Return(_)));

        // Outer driver plus the synthesized inner closure.
        assert_eq!(analysis.functions.len(), 2);
        assert!(analysis.functions.values().any(|f| f.is_closure));
    }

    #[test]
    fn test_wrong_argument_count() {
        let source = "function add(a: int, b: int): int { return a + b; } let x = add(1);";
        let (_, _, unit) = run(source);
        assert!(unit.errors.iter().any(
            |e| matches!(e.message, ErrorMessage::InvalidArgsCount { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_native_global_visible_as_static() {
        let mut decl_unit = CompilationUnit::new("natives", "");
        let natives = NativeDecls {
            classes: Vec::new(),
            globals: vec![NativeGlobal {
                name: "PI".to_string(),
                ty: parse_type_expression("float", &mut decl_unit).expect("type"),
            }],
        };
        let (_, analysis, unit) = run_with("let tau = PI * 2.0;", &natives);
        assert!(!unit.errors.has_fatal_errors(), "{:?}", unit.errors);
        assert_eq!(unit.static_bindings["PI"], 0);
        assert!(analysis.bindings.values().any(|b| *b == Binding::Static { id: 0 }));
    }

    #[test]
    fn test_method_cannot_capture_module_local() {
        let source = "let g = 1; class C { m(): int { return g; } }";
        let (_, _, unit) = run(source);
        assert!(unit
            .errors
            .iter()
            .any(|e| matches!(e.message, ErrorMessage::UndeclaredIdentifier { .. })));
    }

    #[test]
    fn test_type_expression_names_round_trip() {
        // Parsing a type string and rendering the resolved type must give
        // the text back, nested generics included.
        let cases = [
            "Array<int>",
            "Array<Array<string>>",
            "Function<void, int, int>",
            "Function<int, Array<float>>",
            "Map<string, Array<int>>",
        ];
        let mut unit = CompilationUnit::new("types", "");
        for case in cases {
            let ty = parse_type_expression(case, &mut unit).expect(case);
            let mut check_unit = CompilationUnit::new("types", "");
            let resolved = Analyzer::new(&mut check_unit).resolve_type(&ty);
            assert!(!check_unit.errors.has_fatal_errors(), "{:?}", check_unit.errors);
            assert_eq!(resolved.name(), case);
        }
    }

    #[test]
    fn test_map_index_takes_the_key_type() {
        let mut decl_unit = CompilationUnit::new("natives", "");
        let natives = NativeDecls {
            classes: Vec::new(),
            globals: vec![NativeGlobal {
                name: "config".to_string(),
                ty: parse_type_expression("Map<string, int>", &mut decl_unit).expect("type"),
            }],
        };
        let (module, analysis, unit) = run_with(r#"let v = config["speed"];"#, &natives);
        assert!(!unit.errors.has_fatal_errors(), "{:?}", unit.errors);
        let Stmt::Let(decl) = &module.statements[0] else {
            panic!("expected let")
        };
        let Some(Expr::Index(index)) = &decl.value else {
            panic!("expected index expression")
        };
        assert_eq!(analysis.expr_types[&index.id].name(), "int");
    }

    #[test]
    fn test_map_index_with_wrong_key_type_rejected() {
        let mut decl_unit = CompilationUnit::new("natives", "");
        let natives = NativeDecls {
            classes: Vec::new(),
            globals: vec![NativeGlobal {
                name: "config".to_string(),
                ty: parse_type_expression("Map<string, int>", &mut decl_unit).expect("type"),
            }],
        };
        let (_, _, unit) = run_with("let v = config[true];", &natives);
        assert!(unit
            .errors
            .iter()
            .any(|e| matches!(e.message, ErrorMessage::MismatchedTypes { .. })));
    }
}
