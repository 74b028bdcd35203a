//! Lexical scope tracking for semantic analysis.
//!
//! The analyzer pushes a `Scope` for every block it enters and records each
//! declaration in it. Name resolution walks the stack innermost-out; a hit
//! that crosses a `Function` scope boundary is a capture and is recorded on
//! the function scope so closure conversion can materialize it later.

use crate::compiler::symbol::SymbolTypeRef;

/// What kind of region a scope covers. `Function` scopes are the capture
/// boundary; `Loop` scopes legalize `break`/`continue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Normal,
    Function,
    Loop,
    /// A class body; member names resolve through `self`, not the stack.
    TypeBody,
}

/// Where a resolved name lives at runtime.
///
/// Parameters and locals are kept apart because their frame offsets differ:
/// parameter `i` sits at offset `i`, while local `k` sits past the frame
/// marker at `nargs + 1 + k`, and `nargs` is only final once the enclosing
/// function is fully analyzed (a closure gains a trailing self argument).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Declared parameter `index` of the enclosing function.
    Param { index: u16 },
    /// Function-level local slot `index`, counted from zero.
    Local { index: u16 },
    /// Static-memory slot (module-level declarations and native bindings).
    Static { id: u16 },
    /// A captured variable or class field, reached through the implicit
    /// `self` argument by name hash.
    SelfMember { name: String },
}

/// A declared identifier.
#[derive(Debug, Clone)]
pub struct Ident {
    pub name: String,
    pub ty: SymbolTypeRef,
    pub binding: Binding,
    pub is_const: bool,
    pub use_count: u32,
}

/// A variable captured by a closure.
#[derive(Debug, Clone)]
pub struct Capture {
    pub name: String,
    pub ty: SymbolTypeRef,
    /// Binding of the variable in the scope it was captured from.
    pub source: Binding,
}

#[derive(Debug)]
pub struct Scope {
    pub kind: ScopeKind,
    idents: Vec<Ident>,
    /// Captures recorded on `Function` scopes only.
    pub captures: Vec<Capture>,
    /// Set when the function body references `self` explicitly.
    pub uses_self: bool,
}

impl Scope {
    pub fn new(kind: ScopeKind) -> Self {
        Self {
            kind,
            idents: Vec::new(),
            captures: Vec::new(),
            uses_self: false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Ident> {
        self.idents.iter().find(|i| i.name == name)
    }

    pub fn idents(&self) -> &[Ident] {
        &self.idents
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Ident> {
        self.idents.iter_mut().find(|i| i.name == name)
    }

    pub fn add_capture(&mut self, capture: Capture) {
        if !self.captures.iter().any(|c| c.name == capture.name) {
            self.captures.push(capture);
        }
    }
}

/// Result of a name lookup.
#[derive(Debug, Clone)]
pub struct LookupHit {
    pub ident: Ident,
    /// True when the hit is on the far side of at least one `Function`
    /// scope, i.e. the reference is a closure capture candidate.
    pub crossed_function: bool,
}

/// The scope stack for one analysis pass.
#[derive(Debug, Default)]
pub struct ScopeStack {
    scopes: Vec<Scope>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: ScopeKind) {
        self.scopes.push(Scope::new(kind));
    }

    pub fn pop(&mut self) -> Scope {
        self.scopes.pop().expect("scope stack underflow")
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Declare a name in the innermost scope. Returns `false` when the name
    /// is already declared in that same scope.
    pub fn declare(&mut self, ident: Ident) -> bool {
        let scope = self.scopes.last_mut().expect("scope stack underflow");
        if scope.get(&ident.name).is_some() {
            return false;
        }
        scope.idents.push(ident);
        true
    }

    /// Resolve a name, bumping its use count.
    pub fn lookup(&mut self, name: &str) -> Option<LookupHit> {
        let mut crossed_function = false;
        for scope in self.scopes.iter_mut().rev() {
            if let Some(ident) = scope.get_mut(name) {
                ident.use_count += 1;
                return Some(LookupHit {
                    ident: ident.clone(),
                    crossed_function,
                });
            }
            if scope.kind == ScopeKind::Function {
                crossed_function = true;
            }
        }
        None
    }

    /// True when the innermost enclosing function contains a loop scope
    /// around the current position.
    pub fn in_loop(&self) -> bool {
        for scope in self.scopes.iter().rev() {
            match scope.kind {
                ScopeKind::Loop => return true,
                ScopeKind::Function => return false,
                _ => {}
            }
        }
        false
    }

    /// The innermost `Function` scope, if any.
    pub fn current_function_mut(&mut self) -> Option<&mut Scope> {
        self.scopes
            .iter_mut()
            .rev()
            .find(|s| s.kind == ScopeKind::Function)
    }

    /// Resolve `name` as a closure capture.
    ///
    /// Records the capture on every `Function` scope crossed between the
    /// reference and the declaration, and redeclares the name in each of
    /// those scopes as a self member so later references resolve without
    /// crossing again. Intermediate functions capture transitively: each
    /// level's capture source is the binding one frame out. Returns the
    /// rebound ident and the number of function boundaries crossed.
    pub fn capture(&mut self, name: &str) -> Option<(Ident, usize)> {
        let decl_idx = self.scopes.iter().rposition(|s| s.get(name).is_some())?;
        let declared = self.scopes[decl_idx].get(name)?.clone();

        let crossed: Vec<usize> = (decl_idx + 1..self.scopes.len())
            .filter(|&i| self.scopes[i].kind == ScopeKind::Function)
            .collect();
        if crossed.is_empty() {
            return Some((declared, 0));
        }

        let count = crossed.len();
        let mut source = declared.binding.clone();
        for idx in crossed {
            self.scopes[idx].add_capture(Capture {
                name: name.to_string(),
                ty: declared.ty.clone(),
                source,
            });
            let rebound = Ident {
                name: name.to_string(),
                ty: declared.ty.clone(),
                binding: Binding::SelfMember {
                    name: name.to_string(),
                },
                is_const: declared.is_const,
                use_count: 1,
            };
            if self.scopes[idx].get(name).is_none() {
                self.scopes[idx].idents.push(rebound);
            }
            source = Binding::SelfMember {
                name: name.to_string(),
            };
        }

        Some((
            Ident {
                name: name.to_string(),
                ty: declared.ty,
                binding: Binding::SelfMember {
                    name: name.to_string(),
                },
                is_const: declared.is_const,
                use_count: 1,
            },
            count,
        ))
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::symbol::SymbolType;

    fn local(name: &str, index: u16) -> Ident {
        Ident {
            name: name.to_string(),
            ty: SymbolType::int(),
            binding: Binding::Local { index },
            is_const: false,
            use_count: 0,
        }
    }

    #[test]
    fn test_shadowing_resolves_innermost() {
        let mut stack = ScopeStack::new();
        stack.push(ScopeKind::Function);
        assert!(stack.declare(local("x", 1)));
        stack.push(ScopeKind::Normal);
        assert!(stack.declare(local("x", 2)));

        let hit = stack.lookup("x").unwrap();
        assert_eq!(hit.ident.binding, Binding::Local { index: 2 });
        assert!(!hit.crossed_function);

        stack.pop();
        let hit = stack.lookup("x").unwrap();
        assert_eq!(hit.ident.binding, Binding::Local { index: 1 });
    }

    #[test]
    fn test_duplicate_in_same_scope_rejected() {
        let mut stack = ScopeStack::new();
        stack.push(ScopeKind::Function);
        assert!(stack.declare(local("x", 1)));
        assert!(!stack.declare(local("x", 2)));
    }

    #[test]
    fn test_capture_detection_across_function_boundary() {
        let mut stack = ScopeStack::new();
        stack.push(ScopeKind::Function);
        stack.declare(local("outer", 1));
        stack.push(ScopeKind::Function);
        stack.declare(local("inner", 1));

        assert!(!stack.lookup("inner").unwrap().crossed_function);
        assert!(stack.lookup("outer").unwrap().crossed_function);
    }

    #[test]
    fn test_in_loop_stops_at_function() {
        let mut stack = ScopeStack::new();
        stack.push(ScopeKind::Function);
        stack.push(ScopeKind::Loop);
        assert!(stack.in_loop());
        stack.push(ScopeKind::Function);
        assert!(!stack.in_loop());
    }

    #[test]
    fn test_capture_records_on_every_crossed_function() {
        let mut stack = ScopeStack::new();
        stack.push(ScopeKind::Function);
        stack.declare(local("n", 0));
        stack.push(ScopeKind::Function);
        stack.push(ScopeKind::Function);

        let (ident, crossed) = stack.capture("n").unwrap();
        assert_eq!(crossed, 2);
        assert_eq!(ident.binding, Binding::SelfMember { name: "n".into() });

        // A later lookup in the innermost function resolves the rebound
        // ident without crossing again.
        let hit = stack.lookup("n").unwrap();
        assert_eq!(hit.ident.binding, Binding::SelfMember { name: "n".into() });
        assert!(!hit.crossed_function);

        // Innermost function captures through the intermediate one.
        let inner = stack.pop();
        assert_eq!(inner.captures.len(), 1);
        assert_eq!(
            inner.captures[0].source,
            Binding::SelfMember { name: "n".into() }
        );
        let middle = stack.pop();
        assert_eq!(middle.captures.len(), 1);
        assert_eq!(middle.captures[0].source, Binding::Local { index: 0 });
    }

    #[test]
    fn test_use_count_increments() {
        let mut stack = ScopeStack::new();
        stack.push(ScopeKind::Function);
        stack.declare(local("x", 1));
        stack.lookup("x");
        stack.lookup("x");
        let scope = stack.pop();
        assert_eq!(scope.get("x").unwrap().use_count, 2);
    }
}
