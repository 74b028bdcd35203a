//! Parser module: tokens, lexer, AST, and recursive-descent parser.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;

pub use lexer::Lexer;
pub use parser::{parse_generic_params, parse_type_expression, Parser};
pub use token::{Span, Token};
