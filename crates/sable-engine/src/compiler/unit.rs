//! Per-compile shared state.
//!
//! A `CompilationUnit` is threaded through every pass of one compile: the
//! lexer, parser, native-declaration injection, semantic analysis, and
//! lowering all read and write it. It owns the diagnostic list, hands out
//! AST node ids, and tracks the static-memory slots that native registration
//! binds after compilation.

use rustc_hash::FxHashMap;

use crate::compiler::error::ErrorList;
use crate::parser::ast::NodeId;

/// Shared state for one compilation.
#[derive(Debug)]
pub struct CompilationUnit {
    /// Unit name, used for diagnostics (usually the file name).
    pub name: String,
    /// Full source text.
    pub source: String,
    /// Accumulated diagnostics from every pass.
    pub errors: ErrorList,
    /// Name-to-static-slot mapping for natively registered globals and
    /// classes, produced by the analyzer and consumed when native values
    /// are bound into the VM after compilation.
    pub static_bindings: FxHashMap<String, u16>,
    next_node_id: u32,
    next_static_id: u16,
}

impl CompilationUnit {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            errors: ErrorList::new(),
            static_bindings: FxHashMap::default(),
            next_node_id: 0,
            next_static_id: 0,
        }
    }

    /// Allocate a fresh node id, unique within this unit.
    pub fn fresh_node_id(&mut self) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        id
    }

    /// Allocate a fresh static-memory slot.
    pub fn fresh_static_id(&mut self) -> u16 {
        let id = self.next_static_id;
        self.next_static_id += 1;
        id
    }

    /// Number of static slots allocated so far.
    pub fn statics_count(&self) -> u16 {
        self.next_static_id
    }
}
