//! Recursive-descent parser for the Sable scripting language.
//!
//! The parser consumes the token stream produced by the lexer and builds the
//! AST, allocating node ids from the compilation unit as it goes. Syntax
//! errors are appended to the unit's error list and the parser synchronizes
//! to the next statement boundary, so one parse reports as many problems as
//! it can instead of stopping at the first.

use crate::compiler::unit::CompilationUnit;
use crate::compiler::ErrorMessage;
use crate::parser::ast::*;
use crate::parser::lexer::Lexer;
use crate::parser::token::{Span, Token};

pub struct Parser<'a> {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    unit: &'a mut CompilationUnit,
    /// One entry per function literal currently being parsed; set to true
    /// when a `yield` statement is seen in its immediate body.
    yield_stack: Vec<bool>,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: Vec<(Token, Span)>, unit: &'a mut CompilationUnit) -> Self {
        debug_assert!(matches!(tokens.last(), Some((Token::Eof, _))));
        Self {
            tokens,
            pos: 0,
            unit,
            yield_stack: Vec::new(),
        }
    }

    /// Parse the whole token stream as a module.
    pub fn parse_module(&mut self) -> Module {
        let start = self.peek_span();
        let mut statements = Vec::new();

        while !self.check(&Token::Eof) {
            let before = self.pos;
            if let Some(stmt) = self.parse_statement() {
                statements.push(stmt);
            }
            // A statement that failed without consuming anything would loop
            // forever; force progress.
            if self.pos == before {
                self.advance();
            }
        }

        let span = start.merge(&self.peek_span());
        Module::new(statements, span)
    }

    // --- token stream helpers ---

    fn peek(&self) -> &Token {
        &self.tokens[self.pos].0
    }

    fn peek_span(&self) -> Span {
        self.tokens[self.pos].1
    }

    fn peek_ahead(&self, n: usize) -> &Token {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[idx].0
    }

    fn advance(&mut self) -> (Token, Span) {
        let current = self.tokens[self.pos].clone();
        if !matches!(current.0, Token::Eof) {
            self.pos += 1;
        }
        current
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn matches(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Consume `token` or report a syntax error. Returns the span of the
    /// consumed token; on failure returns the current span without
    /// consuming, so the caller can synchronize.
    fn expect(&mut self, token: &Token, expected: &str) -> Option<Span> {
        if self.check(token) {
            Some(self.advance().1)
        } else {
            self.error_here(ErrorMessage::UnexpectedToken {
                expected: expected.to_string(),
                found: self.peek().to_string(),
            });
            None
        }
    }

    fn expect_identifier(&mut self, expected: &str) -> Option<(String, Span)> {
        if let Token::Identifier(_) = self.peek() {
            let (token, span) = self.advance();
            if let Token::Identifier(name) = token {
                return Some((name, span));
            }
            unreachable!();
        }
        self.error_here(ErrorMessage::UnexpectedToken {
            expected: expected.to_string(),
            found: self.peek().to_string(),
        });
        None
    }

    fn error_here(&mut self, message: ErrorMessage) {
        let span = self.peek_span();
        self.unit.errors.add_fatal(message, span);
    }

    /// Skip tokens until a likely statement boundary.
    fn synchronize(&mut self) {
        while !self.check(&Token::Eof) {
            if self.matches(&Token::Semicolon) {
                return;
            }
            match self.peek() {
                Token::RightBrace
                | Token::Function
                | Token::Class
                | Token::Let
                | Token::Const
                | Token::If
                | Token::While
                | Token::For
                | Token::Return
                | Token::Try
                | Token::Throw => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    // --- statements ---

    fn parse_statement(&mut self) -> Option<Stmt> {
        let result = match self.peek() {
            Token::Let => self.parse_let(false),
            Token::Const => self.parse_let(true),
            Token::Function => self.parse_function_decl(),
            Token::Class => self.parse_class_decl(),
            Token::Return => self.parse_return(),
            Token::If => self.parse_if().map(Stmt::If),
            Token::While => self.parse_while(),
            Token::For => self.parse_for(),
            Token::Break => {
                let (_, span) = self.advance();
                let id = self.unit.fresh_node_id();
                self.expect(&Token::Semicolon, "';'")?;
                Some(Stmt::Break { id, span })
            }
            Token::Continue => {
                let (_, span) = self.advance();
                let id = self.unit.fresh_node_id();
                self.expect(&Token::Semicolon, "';'")?;
                Some(Stmt::Continue { id, span })
            }
            Token::Try => self.parse_try(),
            Token::Throw => self.parse_throw(),
            Token::Yield => self.parse_yield(),
            Token::LeftBrace => self.parse_block().map(Stmt::Block),
            _ => self.parse_expr_stmt(),
        };

        if result.is_none() {
            self.synchronize();
        }
        result
    }

    fn parse_let(&mut self, is_const: bool) -> Option<Stmt> {
        let (_, start) = self.advance();
        let id = self.unit.fresh_node_id();
        let (name, _) = self.expect_identifier("a variable name")?;

        let ty = if self.matches(&Token::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };

        let value = if self.matches(&Token::Equal) {
            Some(self.parse_expression()?)
        } else {
            None
        };

        let end = self.expect(&Token::Semicolon, "';'")?;
        Some(Stmt::Let(LetStmt {
            id,
            name,
            ty,
            value,
            is_const,
            span: start.merge(&end),
        }))
    }

    fn parse_function_decl(&mut self) -> Option<Stmt> {
        let (_, start) = self.advance();
        let id = self.unit.fresh_node_id();
        let (name, _) = self.expect_identifier("a function name")?;
        let func = self.parse_function_tail(start)?;
        let span = start.merge(&func.span);
        Some(Stmt::Function(FunctionDecl {
            id,
            name,
            func,
            span,
        }))
    }

    /// Parse `(params) [: type] { body }` after the `function` keyword (and
    /// optional name) have been consumed.
    fn parse_function_tail(&mut self, start: Span) -> Option<FunctionExpr> {
        let id = self.unit.fresh_node_id();
        self.expect(&Token::LeftParen, "'('")?;

        let mut params = Vec::new();
        if !self.check(&Token::RightParen) {
            loop {
                let param_id = self.unit.fresh_node_id();
                let (name, name_span) = self.expect_identifier("a parameter name")?;
                let ty = if self.matches(&Token::Colon) {
                    Some(self.parse_type()?)
                } else {
                    None
                };
                params.push(Param {
                    id: param_id,
                    name,
                    ty,
                    span: name_span,
                });
                if !self.matches(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RightParen, "')'")?;

        let return_ty = if self.matches(&Token::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };

        self.yield_stack.push(false);
        let body = self.parse_block();
        let is_generator = self.yield_stack.pop().unwrap_or(false);
        let body = body?;

        let span = start.merge(&body.span);
        Some(FunctionExpr {
            id,
            params,
            return_ty,
            body,
            is_generator,
            span,
        })
    }

    fn parse_class_decl(&mut self) -> Option<Stmt> {
        let (_, start) = self.advance();
        let id = self.unit.fresh_node_id();
        let (name, _) = self.expect_identifier("a class name")?;

        let base = if self.matches(&Token::Extends) {
            Some(self.parse_type()?)
        } else {
            None
        };

        self.expect(&Token::LeftBrace, "'{'")?;
        let mut members = Vec::new();
        while !self.check(&Token::RightBrace) && !self.check(&Token::Eof) {
            let before = self.pos;
            if let Some(member) = self.parse_class_member() {
                members.push(member);
            } else {
                self.synchronize();
            }
            if self.pos == before {
                self.advance();
            }
        }
        let end = self.expect(&Token::RightBrace, "'}'")?;

        Some(Stmt::Class(ClassDecl {
            id,
            name,
            base,
            members,
            span: start.merge(&end),
        }))
    }

    fn parse_class_member(&mut self) -> Option<ClassMember> {
        let id = self.unit.fresh_node_id();
        let (name, name_span) = self.expect_identifier("a member name")?;

        // `name(...)` is a method, anything else is a field.
        if self.check(&Token::LeftParen) {
            let method = self.parse_function_tail(name_span)?;
            let span = name_span.merge(&method.span);
            return Some(ClassMember {
                id,
                name,
                ty: None,
                default: None,
                method: Some(method),
                span,
            });
        }

        let ty = if self.matches(&Token::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };
        let default = if self.matches(&Token::Equal) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        let end = self.expect(&Token::Semicolon, "';'")?;

        Some(ClassMember {
            id,
            name,
            ty,
            default,
            method: None,
            span: name_span.merge(&end),
        })
    }

    fn parse_return(&mut self) -> Option<Stmt> {
        let (_, start) = self.advance();
        let id = self.unit.fresh_node_id();
        let value = if self.check(&Token::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        let end = self.expect(&Token::Semicolon, "';'")?;
        Some(Stmt::Return(ReturnStmt {
            id,
            value,
            span: start.merge(&end),
        }))
    }

    fn parse_if(&mut self) -> Option<IfStmt> {
        let (_, start) = self.advance();
        let id = self.unit.fresh_node_id();
        self.expect(&Token::LeftParen, "'('")?;
        let cond = self.parse_expression()?;
        self.expect(&Token::RightParen, "')'")?;
        let then_block = self.parse_block()?;

        let mut span = start.merge(&then_block.span);
        let else_branch = if self.matches(&Token::Else) {
            let branch = if self.check(&Token::If) {
                Stmt::If(self.parse_if()?)
            } else {
                Stmt::Block(self.parse_block()?)
            };
            span = span.merge(&branch.span());
            Some(Box::new(branch))
        } else {
            None
        };

        Some(IfStmt {
            id,
            cond,
            then_block,
            else_branch,
            span,
        })
    }

    fn parse_while(&mut self) -> Option<Stmt> {
        let (_, start) = self.advance();
        let id = self.unit.fresh_node_id();
        self.expect(&Token::LeftParen, "'('")?;
        let cond = self.parse_expression()?;
        self.expect(&Token::RightParen, "')'")?;
        let body = self.parse_block()?;
        let span = start.merge(&body.span);
        Some(Stmt::While(WhileStmt {
            id,
            cond,
            body,
            span,
        }))
    }

    fn parse_for(&mut self) -> Option<Stmt> {
        let (_, start) = self.advance();
        let id = self.unit.fresh_node_id();
        self.expect(&Token::LeftParen, "'('")?;

        let init = if self.matches(&Token::Semicolon) {
            None
        } else if self.check(&Token::Let) || self.check(&Token::Const) {
            let is_const = self.check(&Token::Const);
            Some(Box::new(self.parse_let(is_const)?))
        } else {
            let stmt = self.parse_expr_stmt()?;
            Some(Box::new(stmt))
        };

        let cond = if self.check(&Token::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(&Token::Semicolon, "';'")?;

        let step = if self.check(&Token::RightParen) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(&Token::RightParen, "')'")?;

        let body = self.parse_block()?;
        let span = start.merge(&body.span);
        Some(Stmt::For(ForStmt {
            id,
            init,
            cond,
            step,
            body,
            span,
        }))
    }

    fn parse_try(&mut self) -> Option<Stmt> {
        let (_, start) = self.advance();
        let id = self.unit.fresh_node_id();
        let body = self.parse_block()?;
        self.expect(&Token::Catch, "'catch'")?;
        self.expect(&Token::LeftParen, "'('")?;
        let catch_id = self.unit.fresh_node_id();
        let (catch_name, _) = self.expect_identifier("an exception binding name")?;
        self.expect(&Token::RightParen, "')'")?;
        let catch_block = self.parse_block()?;
        let span = start.merge(&catch_block.span);
        Some(Stmt::Try(TryStmt {
            id,
            body,
            catch_name,
            catch_id,
            catch_block,
            span,
        }))
    }

    fn parse_throw(&mut self) -> Option<Stmt> {
        let (_, start) = self.advance();
        let id = self.unit.fresh_node_id();
        let value = self.parse_expression()?;
        let end = self.expect(&Token::Semicolon, "';'")?;
        Some(Stmt::Throw(ThrowStmt {
            id,
            value,
            span: start.merge(&end),
        }))
    }

    fn parse_yield(&mut self) -> Option<Stmt> {
        let (_, start) = self.advance();
        let id = self.unit.fresh_node_id();
        if let Some(flag) = self.yield_stack.last_mut() {
            *flag = true;
        } else {
            self.unit.errors.add_fatal(ErrorMessage::IllegalYield, start);
        }
        let value = self.parse_expression()?;
        let end = self.expect(&Token::Semicolon, "';'")?;
        Some(Stmt::Yield(YieldStmt {
            id,
            value,
            span: start.merge(&end),
        }))
    }

    fn parse_expr_stmt(&mut self) -> Option<Stmt> {
        let id = self.unit.fresh_node_id();
        let expr = self.parse_expression()?;
        let end = self.expect(&Token::Semicolon, "';'")?;
        let span = expr.span().merge(&end);
        Some(Stmt::Expr(ExprStmt { id, expr, span }))
    }

    fn parse_block(&mut self) -> Option<Block> {
        let start = self.expect(&Token::LeftBrace, "'{'")?;
        let id = self.unit.fresh_node_id();
        let mut statements = Vec::new();

        while !self.check(&Token::RightBrace) && !self.check(&Token::Eof) {
            let before = self.pos;
            if let Some(stmt) = self.parse_statement() {
                statements.push(stmt);
            }
            if self.pos == before {
                self.advance();
            }
        }

        let end = self.expect(&Token::RightBrace, "'}'")?;
        Some(Block {
            id,
            statements,
            span: start.merge(&end),
        })
    }

    // --- expressions, by descending precedence ---

    pub fn parse_expression(&mut self) -> Option<Expr> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Option<Expr> {
        let target = self.parse_or()?;

        if self.check(&Token::Equal) {
            let eq_span = self.peek_span();
            self.advance();
            match target {
                Expr::Ident(_) | Expr::Member(_) | Expr::Index(_) => {}
                _ => {
                    self.unit
                        .errors
                        .add_fatal(ErrorMessage::InvalidAssignTarget, eq_span);
                }
            }
            let id = self.unit.fresh_node_id();
            let value = self.parse_assignment()?;
            let span = target.span().merge(&value.span());
            return Some(Expr::Assign(AssignExpr {
                id,
                target: Box::new(target),
                value: Box::new(value),
                span,
            }));
        }

        Some(target)
    }

    fn parse_or(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_and()?;
        while self.matches(&Token::PipePipe) {
            let id = self.unit.fresh_node_id();
            let rhs = self.parse_and()?;
            let span = lhs.span().merge(&rhs.span());
            lhs = Expr::Binary(BinaryExpr {
                id,
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            });
        }
        Some(lhs)
    }

    fn parse_and(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_equality()?;
        while self.matches(&Token::AmpAmp) {
            let id = self.unit.fresh_node_id();
            let rhs = self.parse_equality()?;
            let span = lhs.span().merge(&rhs.span());
            lhs = Expr::Binary(BinaryExpr {
                id,
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            });
        }
        Some(lhs)
    }

    fn parse_equality(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Token::EqualEqual => BinaryOp::Equal,
                Token::BangEqual => BinaryOp::NotEqual,
                _ => break,
            };
            self.advance();
            let id = self.unit.fresh_node_id();
            let rhs = self.parse_comparison()?;
            let span = lhs.span().merge(&rhs.span());
            lhs = Expr::Binary(BinaryExpr {
                id,
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            });
        }
        Some(lhs)
    }

    fn parse_comparison(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_cast()?;
        loop {
            let op = match self.peek() {
                Token::Less => BinaryOp::Less,
                Token::LessEqual => BinaryOp::LessEqual,
                Token::Greater => BinaryOp::Greater,
                Token::GreaterEqual => BinaryOp::GreaterEqual,
                _ => break,
            };
            self.advance();
            let id = self.unit.fresh_node_id();
            let rhs = self.parse_cast()?;
            let span = lhs.span().merge(&rhs.span());
            lhs = Expr::Binary(BinaryExpr {
                id,
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            });
        }
        Some(lhs)
    }

    fn parse_cast(&mut self) -> Option<Expr> {
        let mut expr = self.parse_additive()?;
        while self.matches(&Token::As) {
            let id = self.unit.fresh_node_id();
            let ty = self.parse_type()?;
            let span = expr.span().merge(&ty.span);
            expr = Expr::Cast(CastExpr {
                id,
                expr: Box::new(expr),
                ty,
                span,
            });
        }
        Some(expr)
    }

    fn parse_additive(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let id = self.unit.fresh_node_id();
            let rhs = self.parse_multiplicative()?;
            let span = lhs.span().merge(&rhs.span());
            lhs = Expr::Binary(BinaryExpr {
                id,
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            });
        }
        Some(lhs)
    }

    fn parse_multiplicative(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let id = self.unit.fresh_node_id();
            let rhs = self.parse_unary()?;
            let span = lhs.span().merge(&rhs.span());
            lhs = Expr::Binary(BinaryExpr {
                id,
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            });
        }
        Some(lhs)
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        let op = match self.peek() {
            Token::Minus => Some(UnaryOp::Neg),
            Token::Bang => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            let (_, start) = self.advance();
            let id = self.unit.fresh_node_id();
            let operand = self.parse_unary()?;
            let span = start.merge(&operand.span());
            return Some(Expr::Unary(UnaryExpr {
                id,
                op,
                operand: Box::new(operand),
                span,
            }));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Option<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::LeftParen => {
                    self.advance();
                    let id = self.unit.fresh_node_id();
                    let mut args = Vec::new();
                    if !self.check(&Token::RightParen) {
                        loop {
                            args.push(self.parse_expression()?);
                            if !self.matches(&Token::Comma) {
                                break;
                            }
                        }
                    }
                    let end = self.expect(&Token::RightParen, "')'")?;
                    let span = expr.span().merge(&end);
                    expr = Expr::Call(CallExpr {
                        id,
                        callee: Box::new(expr),
                        args,
                        span,
                    });
                }
                Token::Dot => {
                    self.advance();
                    let id = self.unit.fresh_node_id();
                    let (member, member_span) = self.expect_identifier("a member name")?;
                    let span = expr.span().merge(&member_span);
                    expr = Expr::Member(MemberExpr {
                        id,
                        object: Box::new(expr),
                        member,
                        span,
                    });
                }
                Token::LeftBracket => {
                    self.advance();
                    let id = self.unit.fresh_node_id();
                    let index = self.parse_expression()?;
                    let end = self.expect(&Token::RightBracket, "']'")?;
                    let span = expr.span().merge(&end);
                    expr = Expr::Index(IndexExpr {
                        id,
                        object: Box::new(expr),
                        index: Box::new(index),
                        span,
                    });
                }
                _ => break,
            }
        }
        Some(expr)
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        match self.peek().clone() {
            Token::IntLiteral(value) => {
                let (_, span) = self.advance();
                let id = self.unit.fresh_node_id();
                Some(Expr::IntLiteral { id, value, span })
            }
            Token::FloatLiteral(value) => {
                let (_, span) = self.advance();
                let id = self.unit.fresh_node_id();
                Some(Expr::FloatLiteral { id, value, span })
            }
            Token::StringLiteral(value) => {
                let (_, span) = self.advance();
                let id = self.unit.fresh_node_id();
                Some(Expr::StringLiteral { id, value, span })
            }
            Token::True | Token::False => {
                let (token, span) = self.advance();
                let id = self.unit.fresh_node_id();
                Some(Expr::BoolLiteral {
                    id,
                    value: token == Token::True,
                    span,
                })
            }
            Token::Null => {
                let (_, span) = self.advance();
                let id = self.unit.fresh_node_id();
                Some(Expr::NullLiteral { id, span })
            }
            Token::Identifier(name) => {
                let (_, span) = self.advance();
                let id = self.unit.fresh_node_id();
                Some(Expr::Ident(IdentExpr { id, name, span }))
            }
            Token::LeftParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(&Token::RightParen, "')'")?;
                Some(expr)
            }
            Token::Function => {
                let (_, start) = self.advance();
                // Anonymous function literal; a name here would be a decl.
                self.parse_function_tail(start).map(Expr::Function)
            }
            Token::New => {
                let (_, start) = self.advance();
                let id = self.unit.fresh_node_id();
                let ty = self.parse_type()?;
                self.expect(&Token::LeftParen, "'('")?;
                let mut args = Vec::new();
                if !self.check(&Token::RightParen) {
                    loop {
                        args.push(self.parse_expression()?);
                        if !self.matches(&Token::Comma) {
                            break;
                        }
                    }
                }
                let end = self.expect(&Token::RightParen, "')'")?;
                Some(Expr::New(NewExpr {
                    id,
                    ty,
                    args,
                    span: start.merge(&end),
                }))
            }
            Token::LeftBracket => {
                let (_, start) = self.advance();
                let id = self.unit.fresh_node_id();
                let mut elements = Vec::new();
                if !self.check(&Token::RightBracket) {
                    loop {
                        elements.push(self.parse_expression()?);
                        if !self.matches(&Token::Comma) {
                            break;
                        }
                    }
                }
                let end = self.expect(&Token::RightBracket, "']'")?;
                Some(Expr::ArrayLiteral(ArrayLiteralExpr {
                    id,
                    elements,
                    span: start.merge(&end),
                }))
            }
            other => {
                self.error_here(ErrorMessage::ExpectedExpression {
                    found: other.to_string(),
                });
                None
            }
        }
    }

    // --- types ---

    /// Parse a type expression: a name with optional generic arguments,
    /// e.g. `int`, `Array<int>`, `Function<void, int, int>`.
    pub fn parse_type(&mut self) -> Option<TypeExpr> {
        let id = self.unit.fresh_node_id();
        let (name, name_span) = match self.peek().clone() {
            Token::Identifier(name) => {
                let (_, span) = self.advance();
                (name, span)
            }
            // `null` and `function` are valid type heads too.
            Token::Null => {
                let (_, span) = self.advance();
                ("null".to_string(), span)
            }
            other => {
                self.error_here(ErrorMessage::UnexpectedToken {
                    expected: "a type name".to_string(),
                    found: other.to_string(),
                });
                return None;
            }
        };

        let mut span = name_span;
        let mut args = Vec::new();
        if self.check(&Token::Less) && self.type_args_follow() {
            self.advance();
            loop {
                args.push(self.parse_type()?);
                if !self.matches(&Token::Comma) {
                    break;
                }
            }
            let end = self.expect(&Token::Greater, "'>'")?;
            span = span.merge(&end);
        }

        Some(TypeExpr {
            id,
            name,
            args,
            span,
        })
    }

    /// Disambiguate `Array<int>` from a comparison like `x < y` when a type
    /// is parsed in expression context (`new`, `as`). Inside a generic list
    /// only type names, commas, nested angles, and `>` can appear.
    fn type_args_follow(&self) -> bool {
        let mut depth = 0usize;
        let mut i = 0usize;
        loop {
            match self.peek_ahead(i) {
                Token::Less => depth += 1,
                Token::Greater => {
                    depth -= 1;
                    if depth == 0 {
                        return true;
                    }
                }
                Token::Identifier(_) | Token::Comma | Token::Null => {}
                _ => return false,
            }
            i += 1;
        }
    }
}

/// Parse a standalone type expression, e.g. `"Array<float>"`.
///
/// This is the entry point for the native registration type-string
/// mini-language; it runs the same lexer and type grammar as source code.
pub fn parse_type_expression(source: &str, unit: &mut CompilationUnit) -> Option<TypeExpr> {
    let tokens = Lexer::new(source).tokenize(unit);
    let mut parser = Parser::new(tokens, unit);
    let ty = parser.parse_type()?;
    if !parser.check(&Token::Eof) {
        parser.error_here(ErrorMessage::UnexpectedToken {
            expected: "end of type".to_string(),
            found: parser.peek().to_string(),
        });
        return None;
    }
    Some(ty)
}

/// Parse a comma-separated generic parameter list, e.g. `"int, Array<float>"`.
pub fn parse_generic_params(source: &str, unit: &mut CompilationUnit) -> Vec<TypeExpr> {
    let tokens = Lexer::new(source).tokenize(unit);
    let mut parser = Parser::new(tokens, unit);
    let mut params = Vec::new();
    if parser.check(&Token::Eof) {
        return params;
    }
    loop {
        match parser.parse_type() {
            Some(ty) => params.push(ty),
            None => break,
        }
        if !parser.matches(&Token::Comma) {
            break;
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> (Module, CompilationUnit) {
        let mut unit = CompilationUnit::new("test", source);
        let tokens = Lexer::new(source).tokenize(&mut unit);
        let module = Parser::new(tokens, &mut unit).parse_module();
        (module, unit)
    }

    #[test]
    fn test_function_declaration() {
        let (module, unit) = parse("function add(a: int, b: int): int { return a + b; }");
        assert!(unit.errors.is_empty(), "{:?}", unit.errors);
        assert_eq!(module.statements.len(), 1);
        match &module.statements[0] {
            Stmt::Function(decl) => {
                assert_eq!(decl.name, "add");
                assert_eq!(decl.func.params.len(), 2);
                assert_eq!(decl.func.params[1].name, "b");
                assert_eq!(decl.func.return_ty.as_ref().unwrap().name, "int");
                assert!(!decl.func.is_generator);
            }
            other => panic!("expected function decl, got {:?}", other),
        }
    }

    #[test]
    fn test_operator_precedence() {
        let (module, unit) = parse("let x = 1 + 2 * 3;");
        assert!(unit.errors.is_empty());
        let Stmt::Let(stmt) = &module.statements[0] else {
            panic!()
        };
        let Some(Expr::Binary(add)) = &stmt.value else {
            panic!()
        };
        assert_eq!(add.op, BinaryOp::Add);
        let Expr::Binary(mul) = add.rhs.as_ref() else {
            panic!()
        };
        assert_eq!(mul.op, BinaryOp::Mul);
    }

    #[test]
    fn test_comparison_binds_looser_than_arithmetic() {
        let (module, unit) = parse("let x = a + 1 < b * 2;");
        assert!(unit.errors.is_empty());
        let Stmt::Let(stmt) = &module.statements[0] else {
            panic!()
        };
        let Some(Expr::Binary(cmp)) = &stmt.value else {
            panic!()
        };
        assert_eq!(cmp.op, BinaryOp::Less);
    }

    #[test]
    fn test_class_with_fields_and_methods() {
        let source = r#"
            class Point extends Entity {
                x: float = 0.0;
                y: float = 0.0;
                length(): float { return self.x; }
            }
        "#;
        let (module, unit) = parse(source);
        assert!(unit.errors.is_empty(), "{:?}", unit.errors);
        let Stmt::Class(class) = &module.statements[0] else {
            panic!()
        };
        assert_eq!(class.name, "Point");
        assert_eq!(class.base.as_ref().unwrap().name, "Entity");
        assert_eq!(class.members.len(), 3);
        assert!(class.members[0].method.is_none());
        assert!(class.members[2].method.is_some());
    }

    #[test]
    fn test_generator_flag() {
        let source = r#"
            function range(n: int) {
                let i = 0;
                while (i < n) { yield i; i = i + 1; }
            }
            function plain() { return 1; }
        "#;
        let (module, unit) = parse(source);
        assert!(unit.errors.is_empty(), "{:?}", unit.errors);
        let Stmt::Function(range) = &module.statements[0] else {
            panic!()
        };
        assert!(range.func.is_generator);
        let Stmt::Function(plain) = &module.statements[1] else {
            panic!()
        };
        assert!(!plain.func.is_generator);
    }

    #[test]
    fn test_yield_outside_function_is_an_error() {
        let (_, unit) = parse("yield 1;");
        assert!(unit.errors.has_fatal_errors());
    }

    #[test]
    fn test_new_with_generic_type() {
        let (module, unit) = parse("let xs = new Array<int>();");
        assert!(unit.errors.is_empty(), "{:?}", unit.errors);
        let Stmt::Let(stmt) = &module.statements[0] else {
            panic!()
        };
        let Some(Expr::New(new)) = &stmt.value else {
            panic!()
        };
        assert_eq!(new.ty.name, "Array");
        assert_eq!(new.ty.args.len(), 1);
        assert_eq!(new.ty.args[0].name, "int");
    }

    #[test]
    fn test_cast_expression() {
        let (module, unit) = parse("let x = 1 + y as int;");
        assert!(unit.errors.is_empty(), "{:?}", unit.errors);
        let Stmt::Let(stmt) = &module.statements[0] else {
            panic!()
        };
        // `as` binds looser than `+`.
        assert!(matches!(stmt.value, Some(Expr::Cast(_))));
    }

    #[test]
    fn test_error_recovery_reports_multiple() {
        let source = "let = 1;\nlet y = ;\nlet z = 3;";
        let (module, unit) = parse(source);
        assert!(unit.errors.len() >= 2);
        // The last statement still parsed.
        assert!(module
            .statements
            .iter()
            .any(|s| matches!(s, Stmt::Let(l) if l.name == "z")));
    }

    #[test]
    fn test_invalid_assign_target() {
        let (_, unit) = parse("1 = 2;");
        assert!(unit
            .errors
            .iter()
            .any(|e| e.message == ErrorMessage::InvalidAssignTarget));
    }

    #[test]
    fn test_parse_type_expression_helper() {
        let mut unit = CompilationUnit::new("types", "");
        let ty = parse_type_expression("Map<string, Array<int>>", &mut unit).unwrap();
        assert!(unit.errors.is_empty());
        assert_eq!(ty.name, "Map");
        assert_eq!(ty.args.len(), 2);
        assert_eq!(ty.args[1].name, "Array");
        assert_eq!(ty.args[1].args[0].name, "int");
    }

    #[test]
    fn test_parse_generic_params_helper() {
        let mut unit = CompilationUnit::new("types", "");
        let params = parse_generic_params("int, Array<float>", &mut unit);
        assert!(unit.errors.is_empty());
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].name, "int");
        assert_eq!(params[1].name, "Array");
    }
}
