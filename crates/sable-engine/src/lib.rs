//! Sable Language Engine
//!
//! This crate provides the complete Sable language implementation:
//! - **Parser**: Lexer and parser (`parser` module)
//! - **Compiler**: Semantic analysis, IR, and bytecode generation (`compiler` module)
//! - **VM**: Register interpreter, heap, and GC (`vm` module)
//! - **Api**: Native registration context for host programs (`api` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use sable_engine::{compiler::Compiler, vm::Vm};
//!
//! let source = r#"
//!     function add(a: int, b: int): int {
//!         return a + b;
//!     }
//!     add(2, 3);
//! "#;
//!
//! let program = Compiler::new("main", source).compile().unwrap();
//! let mut vm = Vm::new(&program);
//! let result = vm.run().unwrap();
//! ```

#![warn(rust_2018_idioms)]

/// Parser module: lexer, AST, and recursive-descent parser
pub mod parser;

/// Compiler module: semantic analysis, optimization, IR, and bytecode generation
pub mod compiler;

/// VM module: value model, heap, GC, and interpreter
pub mod vm;

/// Api module: native registration context for host programs
pub mod api;

pub use parser::{Lexer, Parser, Span, Token};

pub use compiler::{
    Analysis, CompilationUnit, Compiler, CompilerError, ErrorLevel, ErrorList, ErrorMessage,
    Program, SymbolType, SymbolTypeRef,
};

pub use vm::{HeapHandle, HeapObject, Value, Vm, VmError};

pub use api::{ClassBuilder, Context};

/// Stable 32-bit hash used for member-name addressing.
///
/// The compiler bakes member hashes into bytecode and the VM looks them up
/// again at runtime, so the function must be deterministic across processes.
pub fn name_hash(name: &str) -> u32 {
    crc32fast::hash(name.as_bytes())
}
