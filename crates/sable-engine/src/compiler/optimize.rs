//! AST-level optimizer.
//!
//! Runs after analysis and rewrites the tree in place: constant expressions
//! fold to literals and branches with constant conditions collapse. Every
//! folded node keeps the NodeId of the expression it replaces, so the type
//! and binding side tables recorded by analysis stay valid. Folding never
//! changes a result type (int stays int, comparisons become bools), and
//! anything that could fail at runtime, like division by zero, is left for
//! the VM to throw.

use crate::parser::ast::*;

pub fn optimize(module: &mut Module) {
    for stmt in &mut module.statements {
        optimize_stmt(stmt);
    }
}

fn optimize_block(block: &mut Block) {
    for stmt in &mut block.statements {
        optimize_stmt(stmt);
    }
}

fn optimize_stmt(stmt: &mut Stmt) {
    match stmt {
        Stmt::Let(s) => {
            if let Some(value) = &mut s.value {
                optimize_expr(value);
            }
        }
        Stmt::Function(s) => optimize_block(&mut s.func.body),
        Stmt::Class(s) => {
            for member in &mut s.members {
                if let Some(default) = &mut member.default {
                    optimize_expr(default);
                }
                if let Some(method) = &mut member.method {
                    optimize_block(&mut method.body);
                }
            }
        }
        Stmt::Return(s) => {
            if let Some(value) = &mut s.value {
                optimize_expr(value);
            }
        }
        Stmt::If(s) => {
            optimize_expr(&mut s.cond);
            optimize_block(&mut s.then_block);
            if let Some(else_branch) = &mut s.else_branch {
                optimize_stmt(else_branch);
            }

            if let Expr::BoolLiteral { value, .. } = s.cond {
                let replacement = if value {
                    Stmt::Block(s.then_block.clone())
                } else {
                    match s.else_branch.take() {
                        Some(branch) => *branch,
                        None => Stmt::Block(Block {
                            id: s.then_block.id,
                            statements: Vec::new(),
                            span: s.span,
                        }),
                    }
                };
                *stmt = replacement;
            }
        }
        Stmt::While(s) => {
            optimize_expr(&mut s.cond);
            optimize_block(&mut s.body);

            if let Expr::BoolLiteral { value: false, .. } = s.cond {
                *stmt = Stmt::Block(Block {
                    id: s.body.id,
                    statements: Vec::new(),
                    span: s.span,
                });
            }
        }
        Stmt::For(s) => {
            if let Some(init) = &mut s.init {
                optimize_stmt(init);
            }
            if let Some(cond) = &mut s.cond {
                optimize_expr(cond);
            }
            if let Some(step) = &mut s.step {
                optimize_expr(step);
            }
            optimize_block(&mut s.body);
        }
        Stmt::Try(s) => {
            optimize_block(&mut s.body);
            optimize_block(&mut s.catch_block);
        }
        Stmt::Throw(s) => optimize_expr(&mut s.value),
        Stmt::Yield(s) => optimize_expr(&mut s.value),
        Stmt::Expr(s) => optimize_expr(&mut s.expr),
        Stmt::Block(b) => optimize_block(b),
        Stmt::Break { .. } | Stmt::Continue { .. } => {}
    }
}

fn optimize_expr(expr: &mut Expr) {
    match expr {
        Expr::Unary(e) => {
            optimize_expr(&mut e.operand);
            if let Some(folded) = fold_unary(e) {
                *expr = folded;
            }
        }
        Expr::Binary(e) => {
            optimize_expr(&mut e.lhs);
            optimize_expr(&mut e.rhs);
            if let Some(folded) = fold_binary(e) {
                *expr = folded;
            }
        }
        Expr::Assign(e) => {
            optimize_expr(&mut e.value);
        }
        Expr::Call(e) => {
            optimize_expr(&mut e.callee);
            for arg in &mut e.args {
                optimize_expr(arg);
            }
        }
        Expr::Member(e) => optimize_expr(&mut e.object),
        Expr::Index(e) => {
            optimize_expr(&mut e.object);
            optimize_expr(&mut e.index);
        }
        Expr::Function(e) => optimize_block(&mut e.body),
        Expr::New(e) => {
            for arg in &mut e.args {
                optimize_expr(arg);
            }
        }
        Expr::Cast(e) => optimize_expr(&mut e.expr),
        Expr::ArrayLiteral(e) => {
            for element in &mut e.elements {
                optimize_expr(element);
            }
        }
        _ => {}
    }
}

fn fold_unary(e: &UnaryExpr) -> Option<Expr> {
    Some(match (e.op, e.operand.as_ref()) {
        (UnaryOp::Neg, Expr::IntLiteral { value, .. }) => Expr::IntLiteral {
            id: e.id,
            value: value.wrapping_neg(),
            span: e.span,
        },
        (UnaryOp::Neg, Expr::FloatLiteral { value, .. }) => Expr::FloatLiteral {
            id: e.id,
            value: -value,
            span: e.span,
        },
        (UnaryOp::Not, Expr::BoolLiteral { value, .. }) => Expr::BoolLiteral {
            id: e.id,
            value: !value,
            span: e.span,
        },
        _ => return None,
    })
}

fn fold_binary(e: &BinaryExpr) -> Option<Expr> {
    use BinaryOp::*;

    if let (Expr::IntLiteral { value: a, .. }, Expr::IntLiteral { value: b, .. }) =
        (e.lhs.as_ref(), e.rhs.as_ref())
    {
        let (a, b) = (*a, *b);
        let int = |value: i64| Expr::IntLiteral {
            id: e.id,
            value,
            span: e.span,
        };
        let boolean = |value: bool| Expr::BoolLiteral {
            id: e.id,
            value,
            span: e.span,
        };
        return Some(match e.op {
            Add => int(a.wrapping_add(b)),
            Sub => int(a.wrapping_sub(b)),
            Mul => int(a.wrapping_mul(b)),
            // Folding a zero divisor would hide the runtime throw.
            Div if b != 0 => int(a.wrapping_div(b)),
            Mod if b != 0 => int(a.wrapping_rem(b)),
            Equal => boolean(a == b),
            NotEqual => boolean(a != b),
            Less => boolean(a < b),
            LessEqual => boolean(a <= b),
            Greater => boolean(a > b),
            GreaterEqual => boolean(a >= b),
            _ => return None,
        });
    }

    if let (Expr::FloatLiteral { value: a, .. }, Expr::FloatLiteral { value: b, .. }) =
        (e.lhs.as_ref(), e.rhs.as_ref())
    {
        let (a, b) = (*a, *b);
        let float = |value: f64| Expr::FloatLiteral {
            id: e.id,
            value,
            span: e.span,
        };
        return Some(match e.op {
            Add => float(a + b),
            Sub => float(a - b),
            Mul => float(a * b),
            Div => float(a / b),
            _ => return None,
        });
    }

    if let (Expr::BoolLiteral { value: a, .. }, Expr::BoolLiteral { value: b, .. }) =
        (e.lhs.as_ref(), e.rhs.as_ref())
    {
        let (a, b) = (*a, *b);
        let boolean = |value: bool| Expr::BoolLiteral {
            id: e.id,
            value,
            span: e.span,
        };
        return Some(match e.op {
            And => boolean(a && b),
            Or => boolean(a || b),
            Equal => boolean(a == b),
            NotEqual => boolean(a != b),
            _ => return None,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::CompilationUnit;
    use crate::parser::{Lexer, Parser};

    fn optimized(source: &str) -> Module {
        let mut unit = CompilationUnit::new("test", source);
        let tokens = Lexer::new(source).tokenize(&mut unit);
        let mut module = Parser::new(tokens, &mut unit).parse_module();
        assert!(unit.errors.is_empty(), "{:?}", unit.errors);
        optimize(&mut module);
        module
    }

    #[test]
    fn test_constant_arithmetic_folds() {
        let module = optimized("let x = 2 + 3 * 4;");
        let Stmt::Let(stmt) = &module.statements[0] else {
            panic!()
        };
        assert!(matches!(stmt.value, Some(Expr::IntLiteral { value: 14, .. })));
    }

    #[test]
    fn test_folded_literal_keeps_node_id() {
        let source = "let x = 1 + 2;";
        let mut unit = CompilationUnit::new("test", source);
        let tokens = Lexer::new(source).tokenize(&mut unit);
        let mut module = Parser::new(tokens, &mut unit).parse_module();

        let Stmt::Let(stmt) = &module.statements[0] else {
            panic!()
        };
        let original_id = stmt.value.as_ref().unwrap().id();

        optimize(&mut module);
        let Stmt::Let(stmt) = &module.statements[0] else {
            panic!()
        };
        assert_eq!(stmt.value.as_ref().unwrap().id(), original_id);
    }

    #[test]
    fn test_division_by_zero_not_folded() {
        let module = optimized("let x = 1 / 0;");
        let Stmt::Let(stmt) = &module.statements[0] else {
            panic!()
        };
        assert!(matches!(stmt.value, Some(Expr::Binary(_))));
    }

    #[test]
    fn test_constant_if_collapses() {
        let module = optimized("if (1 < 2) { let a = 1; } else { let b = 2; }");
        let Stmt::Block(block) = &module.statements[0] else {
            panic!("expected collapsed block, got {:?}", module.statements[0])
        };
        assert!(matches!(&block.statements[0], Stmt::Let(l) if l.name == "a"));
    }

    #[test]
    fn test_while_false_removed() {
        let module = optimized("while (false) { let a = 1; }");
        let Stmt::Block(block) = &module.statements[0] else {
            panic!()
        };
        assert!(block.statements.is_empty());
    }

    #[test]
    fn test_non_constant_expressions_untouched() {
        let module = optimized("let x = y + 1;");
        let Stmt::Let(stmt) = &module.statements[0] else {
            panic!()
        };
        assert!(matches!(stmt.value, Some(Expr::Binary(_))));
    }
}
