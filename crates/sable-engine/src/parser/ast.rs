//! Abstract Syntax Tree (AST) for the Sable scripting language.
//!
//! Every node carries a `NodeId` and a `Span`. The id is how later passes
//! attach information to nodes: semantic analysis records expression types,
//! bindings, and member-access strategies in side tables keyed by `NodeId`,
//! and lowering reads them back. Nodes are plain owned values; cloning a
//! subtree (for templates or synthesized wrappers) keeps the original ids so
//! recorded analysis stays valid for unchanged nodes.

use crate::parser::token::Span;

/// Unique id for an AST node within one compilation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// Root node: a Sable source file (module).
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    /// Top-level statements
    pub statements: Vec<Stmt>,
    /// Span covering the entire module
    pub span: Span,
}

impl Module {
    pub fn new(statements: Vec<Stmt>, span: Span) -> Self {
        Self { statements, span }
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// A block of statements with its own lexical scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: NodeId,
    pub statements: Vec<Stmt>,
    pub span: Span,
}

/// Statements
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let(LetStmt),
    Function(FunctionDecl),
    Class(ClassDecl),
    Return(ReturnStmt),
    If(IfStmt),
    While(WhileStmt),
    For(ForStmt),
    Break { id: NodeId, span: Span },
    Continue { id: NodeId, span: Span },
    Try(TryStmt),
    Throw(ThrowStmt),
    Yield(YieldStmt),
    Expr(ExprStmt),
    Block(Block),
}

/// `let name[: type] = value;` (or `const`)
#[derive(Debug, Clone, PartialEq)]
pub struct LetStmt {
    pub id: NodeId,
    pub name: String,
    pub ty: Option<TypeExpr>,
    pub value: Option<Expr>,
    pub is_const: bool,
    pub span: Span,
}

/// `function name(params) [: type] { ... }`
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub id: NodeId,
    pub name: String,
    pub func: FunctionExpr,
    pub span: Span,
}

/// `class Name [extends Base] { members }`
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub id: NodeId,
    pub name: String,
    pub base: Option<TypeExpr>,
    pub members: Vec<ClassMember>,
    pub span: Span,
}

/// A field or method inside a class body.
///
/// Fields carry a type annotation and an optional default expression;
/// methods carry a function expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassMember {
    pub id: NodeId,
    pub name: String,
    pub ty: Option<TypeExpr>,
    pub default: Option<Expr>,
    pub method: Option<FunctionExpr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnStmt {
    pub id: NodeId,
    pub value: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfStmt {
    pub id: NodeId,
    pub cond: Expr,
    pub then_block: Block,
    /// Either a `Block` or another `If` (for `else if` chains).
    pub else_branch: Option<Box<Stmt>>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhileStmt {
    pub id: NodeId,
    pub cond: Expr,
    pub body: Block,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForStmt {
    pub id: NodeId,
    pub init: Option<Box<Stmt>>,
    pub cond: Option<Expr>,
    pub step: Option<Expr>,
    pub body: Block,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TryStmt {
    pub id: NodeId,
    pub body: Block,
    pub catch_name: String,
    /// NodeId of the catch binding, for location assignment.
    pub catch_id: NodeId,
    pub catch_block: Block,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThrowStmt {
    pub id: NodeId,
    pub value: Expr,
    pub span: Span,
}

/// `yield expr;` — only valid inside a generator function body. Semantic
/// analysis rewrites these into calls of the synthesized generator callback.
#[derive(Debug, Clone, PartialEq)]
pub struct YieldStmt {
    pub id: NodeId,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExprStmt {
    pub id: NodeId,
    pub expr: Expr,
    pub span: Span,
}

/// Expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    IntLiteral { id: NodeId, value: i64, span: Span },
    FloatLiteral { id: NodeId, value: f64, span: Span },
    StringLiteral { id: NodeId, value: String, span: Span },
    BoolLiteral { id: NodeId, value: bool, span: Span },
    NullLiteral { id: NodeId, span: Span },
    Ident(IdentExpr),
    Unary(UnaryExpr),
    Binary(BinaryExpr),
    Assign(AssignExpr),
    Call(CallExpr),
    Member(MemberExpr),
    Index(IndexExpr),
    Function(FunctionExpr),
    New(NewExpr),
    Cast(CastExpr),
    ArrayLiteral(ArrayLiteralExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentExpr {
    pub id: NodeId,
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnaryExpr {
    pub id: NodeId,
    pub op: UnaryOp,
    pub operand: Box<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
}

impl BinaryOp {
    /// Comparison operators produce `bool` regardless of operand types.
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::Less
                | BinaryOp::LessEqual
                | BinaryOp::Greater
                | BinaryOp::GreaterEqual
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub id: NodeId,
    pub op: BinaryOp,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignExpr {
    pub id: NodeId,
    pub target: Box<Expr>,
    pub value: Box<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    pub id: NodeId,
    pub callee: Box<Expr>,
    pub args: Vec<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberExpr {
    pub id: NodeId,
    pub object: Box<Expr>,
    pub member: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexExpr {
    pub id: NodeId,
    pub object: Box<Expr>,
    pub index: Box<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub id: NodeId,
    pub name: String,
    pub ty: Option<TypeExpr>,
    pub span: Span,
}

/// A function literal. Named declarations and class methods wrap one of
/// these; anonymous literals evaluate to closures when they capture.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionExpr {
    pub id: NodeId,
    pub params: Vec<Param>,
    pub return_ty: Option<TypeExpr>,
    pub body: Block,
    /// Set by the parser when the body contains a `yield` statement.
    pub is_generator: bool,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewExpr {
    pub id: NodeId,
    pub ty: TypeExpr,
    pub args: Vec<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CastExpr {
    pub id: NodeId,
    pub expr: Box<Expr>,
    pub ty: TypeExpr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayLiteralExpr {
    pub id: NodeId,
    pub elements: Vec<Expr>,
    pub span: Span,
}

/// A type expression: a named type with optional generic arguments,
/// e.g. `int`, `Array<int>`, `Function<void, int>`.
///
/// This is also the grammar of the native type-string mini-language used by
/// `api::Context` registration.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeExpr {
    pub id: NodeId,
    pub name: String,
    pub args: Vec<TypeExpr>,
    pub span: Span,
}

impl Expr {
    pub fn id(&self) -> NodeId {
        match self {
            Expr::IntLiteral { id, .. }
            | Expr::FloatLiteral { id, .. }
            | Expr::StringLiteral { id, .. }
            | Expr::BoolLiteral { id, .. }
            | Expr::NullLiteral { id, .. } => *id,
            Expr::Ident(e) => e.id,
            Expr::Unary(e) => e.id,
            Expr::Binary(e) => e.id,
            Expr::Assign(e) => e.id,
            Expr::Call(e) => e.id,
            Expr::Member(e) => e.id,
            Expr::Index(e) => e.id,
            Expr::Function(e) => e.id,
            Expr::New(e) => e.id,
            Expr::Cast(e) => e.id,
            Expr::ArrayLiteral(e) => e.id,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Expr::IntLiteral { span, .. }
            | Expr::FloatLiteral { span, .. }
            | Expr::StringLiteral { span, .. }
            | Expr::BoolLiteral { span, .. }
            | Expr::NullLiteral { span, .. } => *span,
            Expr::Ident(e) => e.span,
            Expr::Unary(e) => e.span,
            Expr::Binary(e) => e.span,
            Expr::Assign(e) => e.span,
            Expr::Call(e) => e.span,
            Expr::Member(e) => e.span,
            Expr::Index(e) => e.span,
            Expr::Function(e) => e.span,
            Expr::New(e) => e.span,
            Expr::Cast(e) => e.span,
            Expr::ArrayLiteral(e) => e.span,
        }
    }
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Let(s) => s.span,
            Stmt::Function(s) => s.span,
            Stmt::Class(s) => s.span,
            Stmt::Return(s) => s.span,
            Stmt::If(s) => s.span,
            Stmt::While(s) => s.span,
            Stmt::For(s) => s.span,
            Stmt::Break { span, .. } | Stmt::Continue { span, .. } => *span,
            Stmt::Try(s) => s.span,
            Stmt::Throw(s) => s.span,
            Stmt::Yield(s) => s.span,
            Stmt::Expr(s) => s.span,
            Stmt::Block(b) => b.span,
        }
    }

    /// True for statements that unconditionally transfer control.
    pub fn is_return(&self) -> bool {
        matches!(self, Stmt::Return(_))
    }
}
