//! The Sable compiler: semantic analysis, optimization, IR lowering, and
//! bytecode generation.
//!
//! `Compiler` drives the whole pipeline for one source unit:
//!
//! ```text
//! source -> tokens -> AST -> analysis -> optimize -> IR -> bytecode
//! ```
//!
//! Each pass accumulates diagnostics in the unit's `ErrorList` and the
//! driver stops at the first pass boundary where a fatal error exists, so
//! later passes can assume their inputs are well formed.

pub mod analyzer;
pub mod bytecode;
pub mod codegen;
pub mod error;
pub mod ir;
pub mod lower;
pub mod optimize;
pub mod scope;
pub mod symbol;
pub mod unit;

pub use analyzer::{Analysis, Analyzer, MemberStrategy, NativeDecls};
pub use error::{CompilerError, ErrorLevel, ErrorList, ErrorMessage};
pub use symbol::{Member, Primitive, SymbolType, SymbolTypeRef};
pub use unit::CompilationUnit;

use rustc_hash::FxHashMap;

use crate::api::Context;
use crate::parser::{Lexer, Parser};

/// A compiled program, ready to run or serialize.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    /// Flat bytecode; execution starts at offset 0.
    pub bytecode: Vec<u8>,
    /// Number of static-memory slots the VM must provide.
    pub statics_count: u16,
    /// Static slots reserved for natively registered names, to be filled
    /// by the host before the program runs.
    pub bindings: FxHashMap<String, u16>,
}

/// Pipeline driver.
pub struct Compiler<'a> {
    name: String,
    source: String,
    context: Option<&'a Context>,
}

impl<'a> Compiler<'a> {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            context: None,
        }
    }

    /// Attach a native registration context whose globals and classes are
    /// visible to the compiled code.
    pub fn with_context(mut self, context: &'a Context) -> Self {
        self.context = Some(context);
        self
    }

    pub fn compile(self) -> Result<Program, ErrorList> {
        let mut unit = CompilationUnit::new(self.name, self.source.clone());

        let tokens = Lexer::new(&self.source).tokenize(&mut unit);
        if unit.errors.has_fatal_errors() {
            return Err(finish(unit.errors));
        }

        let mut module = Parser::new(tokens, &mut unit).parse_module();
        if unit.errors.has_fatal_errors() {
            return Err(finish(unit.errors));
        }

        let natives = match self.context {
            Some(context) => context.native_decls(&mut unit),
            None => NativeDecls::default(),
        };
        if unit.errors.has_fatal_errors() {
            return Err(finish(unit.errors));
        }

        let analysis = Analyzer::new(&mut unit).analyze(&mut module, &natives);
        if unit.errors.has_fatal_errors() {
            return Err(finish(unit.errors));
        }

        optimize::optimize(&mut module);

        let chunk = lower::lower(&module, &analysis, &mut unit);
        if unit.errors.has_fatal_errors() {
            return Err(finish(unit.errors));
        }

        let bytecode = codegen::CodeGenerator::new().generate(&chunk);
        Ok(Program {
            bytecode,
            statics_count: unit.statics_count(),
            bindings: unit.static_bindings.clone(),
        })
    }
}

fn finish(mut errors: ErrorList) -> ErrorList {
    errors.sort();
    errors
}
