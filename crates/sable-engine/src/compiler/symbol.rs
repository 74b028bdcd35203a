//! Semantic type model.
//!
//! `SymbolType` is the analyzer's view of a value's type. Types are built
//! once and shared by reference (`SymbolTypeRef` is an `Arc`); equality and
//! compatibility checks are structural. Object types carry their data
//! members in declaration order, which is what gives field access its
//! direct-index fast path: a member found at depth 0 is addressed by index,
//! a member found further up the base chain is addressed by name hash.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::parser::ast::Expr;

pub type SymbolTypeRef = Arc<SymbolType>;

/// Built-in scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Int,
    UInt,
    Float,
    Bool,
    String,
    Void,
    Null,
}

impl Primitive {
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Int => "int",
            Primitive::UInt => "uint",
            Primitive::Float => "float",
            Primitive::Bool => "bool",
            Primitive::String => "string",
            Primitive::Void => "void",
            Primitive::Null => "null",
        }
    }
}

/// A data member of an object type.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub ty: SymbolTypeRef,
    /// Default value expression from the class declaration, if any.
    pub default: Option<Expr>,
}

/// The analyzer's type representation.
#[derive(Debug, Clone)]
pub enum SymbolType {
    Primitive(Primitive),
    /// Compatible with everything in both directions.
    Any,
    /// Placeholder produced when analysis already failed for a node; it
    /// suppresses cascading diagnostics downstream.
    Undefined,
    /// A named alias for another type.
    Alias {
        name: String,
        target: SymbolTypeRef,
    },
    /// An uninstantiated generic type, e.g. `Array` before `<int>`.
    Generic {
        name: String,
        params: Vec<String>,
    },
    /// A generic type applied to arguments, e.g. `Array<int>`.
    GenericInstance {
        base: SymbolTypeRef,
        args: Vec<SymbolTypeRef>,
    },
    /// A class or native object type with ordered data members.
    Object {
        name: String,
        members: Vec<Member>,
        base: Option<SymbolTypeRef>,
    },
    /// A callable. `params` excludes the implicit self argument.
    Function {
        return_ty: SymbolTypeRef,
        params: Vec<SymbolTypeRef>,
    },
}

// Shared instances for the common types; cloning an Arc is cheap and keeps
// structural comparison fast for the hot paths.
static INT: Lazy<SymbolTypeRef> = Lazy::new(|| Arc::new(SymbolType::Primitive(Primitive::Int)));
static UINT: Lazy<SymbolTypeRef> = Lazy::new(|| Arc::new(SymbolType::Primitive(Primitive::UInt)));
static FLOAT: Lazy<SymbolTypeRef> =
    Lazy::new(|| Arc::new(SymbolType::Primitive(Primitive::Float)));
static BOOL: Lazy<SymbolTypeRef> = Lazy::new(|| Arc::new(SymbolType::Primitive(Primitive::Bool)));
static STRING: Lazy<SymbolTypeRef> =
    Lazy::new(|| Arc::new(SymbolType::Primitive(Primitive::String)));
static VOID: Lazy<SymbolTypeRef> = Lazy::new(|| Arc::new(SymbolType::Primitive(Primitive::Void)));
static NULL: Lazy<SymbolTypeRef> = Lazy::new(|| Arc::new(SymbolType::Primitive(Primitive::Null)));
static ANY: Lazy<SymbolTypeRef> = Lazy::new(|| Arc::new(SymbolType::Any));
static UNDEFINED: Lazy<SymbolTypeRef> = Lazy::new(|| Arc::new(SymbolType::Undefined));

impl SymbolType {
    pub fn int() -> SymbolTypeRef {
        INT.clone()
    }
    pub fn uint() -> SymbolTypeRef {
        UINT.clone()
    }
    pub fn float() -> SymbolTypeRef {
        FLOAT.clone()
    }
    pub fn bool() -> SymbolTypeRef {
        BOOL.clone()
    }
    pub fn string() -> SymbolTypeRef {
        STRING.clone()
    }
    pub fn void() -> SymbolTypeRef {
        VOID.clone()
    }
    pub fn null() -> SymbolTypeRef {
        NULL.clone()
    }
    pub fn any() -> SymbolTypeRef {
        ANY.clone()
    }
    pub fn undefined() -> SymbolTypeRef {
        UNDEFINED.clone()
    }

    /// Look up a built-in type by source name.
    pub fn builtin(name: &str) -> Option<SymbolTypeRef> {
        Some(match name {
            "int" => Self::int(),
            "uint" => Self::uint(),
            "float" => Self::float(),
            "bool" => Self::bool(),
            "string" => Self::string(),
            "void" => Self::void(),
            "null" => Self::null(),
            "any" => Self::any(),
            _ => return None,
        })
    }

    /// Strip aliases down to the underlying type.
    pub fn unalias(this: &SymbolTypeRef) -> SymbolTypeRef {
        let mut current = this.clone();
        // Alias chains are short; the bound guards against accidental cycles.
        for _ in 0..32 {
            match current.as_ref() {
                SymbolType::Alias { target, .. } => current = target.clone(),
                _ => break,
            }
        }
        current
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            SymbolType::Primitive(Primitive::Int)
                | SymbolType::Primitive(Primitive::UInt)
                | SymbolType::Primitive(Primitive::Float)
        )
    }

    pub fn is_void(&self) -> bool {
        matches!(self, SymbolType::Primitive(Primitive::Void))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SymbolType::Primitive(Primitive::Null))
    }

    pub fn is_any(&self) -> bool {
        matches!(self, SymbolType::Any)
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, SymbolType::Undefined)
    }

    /// True for types whose values live on the heap.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            SymbolType::Object { .. }
                | SymbolType::GenericInstance { .. }
                | SymbolType::Primitive(Primitive::String)
        )
    }

    /// Display name, e.g. `Array<int>` or `Function<void, int>`.
    pub fn name(&self) -> String {
        match self {
            SymbolType::Primitive(p) => p.name().to_string(),
            SymbolType::Any => "any".to_string(),
            SymbolType::Undefined => "<error>".to_string(),
            SymbolType::Alias { name, .. } => name.clone(),
            SymbolType::Generic { name, .. } => name.clone(),
            SymbolType::GenericInstance { base, args } => {
                let args: Vec<String> = args.iter().map(|a| a.name()).collect();
                format!("{}<{}>", base.name(), args.join(", "))
            }
            SymbolType::Object { name, .. } => name.clone(),
            SymbolType::Function { return_ty, params } => {
                let mut parts = vec![return_ty.name()];
                parts.extend(params.iter().map(|p| p.name()));
                format!("Function<{}>", parts.join(", "))
            }
        }
    }

    /// Whether a value of `other` can be used where `self` is expected.
    ///
    /// In strict mode only structural equality (plus `any` and null-to-
    /// reference) is allowed; in relaxed mode numeric widening to float is
    /// also accepted.
    pub fn type_compatible(&self, other: &SymbolType, strict: bool) -> bool {
        // Errors were already reported where Undefined was produced.
        if self.is_undefined() || other.is_undefined() {
            return true;
        }
        if self.is_any() || other.is_any() {
            return true;
        }
        if other.is_null() && (self.is_reference() || self.is_null()) {
            return true;
        }

        match (self, other) {
            (SymbolType::Primitive(a), SymbolType::Primitive(b)) => {
                if a == b {
                    return true;
                }
                if strict {
                    return false;
                }
                matches!(
                    (a, b),
                    (Primitive::Float, Primitive::Int) | (Primitive::Float, Primitive::UInt)
                )
            }
            (SymbolType::Object { name: a, .. }, SymbolType::Object { name: b, .. }) => {
                if a == b {
                    return true;
                }
                // Accept a derived object where its base is expected.
                let mut current = match other {
                    SymbolType::Object { base, .. } => base.clone(),
                    _ => None,
                };
                for _ in 0..32 {
                    match current {
                        Some(ref ty) => {
                            if let SymbolType::Object { name, base, .. } = ty.as_ref() {
                                if name == a {
                                    return true;
                                }
                                current = base.clone();
                            } else {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                false
            }
            (
                SymbolType::GenericInstance { base: a, args: xs },
                SymbolType::GenericInstance { base: b, args: ys },
            ) => {
                a.name() == b.name()
                    && xs.len() == ys.len()
                    && xs
                        .iter()
                        .zip(ys)
                        .all(|(x, y)| x.type_compatible(y, true))
            }
            (
                SymbolType::Function {
                    return_ty: ra,
                    params: pa,
                },
                SymbolType::Function {
                    return_ty: rb,
                    params: pb,
                },
            ) => {
                ra.type_compatible(rb, strict)
                    && pa.len() == pb.len()
                    && pa.iter().zip(pb).all(|(a, b)| a.type_compatible(b, true))
            }
            (SymbolType::Alias { target, .. }, _) => target.type_compatible(other, strict),
            (_, SymbolType::Alias { target, .. }) => self.type_compatible(target, strict),
            _ => false,
        }
    }

    /// Result type of combining two operand types, e.g. in arithmetic or
    /// across multiple `return` statements. Returns `None` when the types
    /// cannot be reconciled.
    pub fn promote(a: &SymbolTypeRef, b: &SymbolTypeRef) -> Option<SymbolTypeRef> {
        let a = SymbolType::unalias(a);
        let b = SymbolType::unalias(b);

        if a.is_any() || b.is_any() {
            return Some(SymbolType::any());
        }
        if a.is_undefined() {
            return Some(b);
        }
        if b.is_undefined() {
            return Some(a);
        }
        if a.is_null() && b.is_reference() {
            return Some(b);
        }
        if b.is_null() && a.is_reference() {
            return Some(a);
        }
        if a.type_compatible(&b, true) && b.type_compatible(&a, true) {
            return Some(a);
        }

        match (a.as_ref(), b.as_ref()) {
            (SymbolType::Primitive(x), SymbolType::Primitive(y)) => {
                let pair = (*x, *y);
                let widened = matches!(
                    pair,
                    (Primitive::Int, Primitive::Float)
                        | (Primitive::Float, Primitive::Int)
                        | (Primitive::UInt, Primitive::Float)
                        | (Primitive::Float, Primitive::UInt)
                );
                if widened {
                    return Some(SymbolType::float());
                }
                if matches!(pair, (Primitive::Int, Primitive::UInt))
                    || matches!(pair, (Primitive::UInt, Primitive::Int))
                {
                    return Some(SymbolType::int());
                }
                None
            }
            _ => {
                // A derived object and its base promote to the base.
                if a.type_compatible(&b, true) {
                    return Some(a);
                }
                if b.type_compatible(&a, true) {
                    return Some(b);
                }
                None
            }
        }
    }

    /// Find a data member by name, walking the base chain.
    ///
    /// Returns `(depth, index, member)`: `depth` 0 means the member belongs
    /// to this type directly and can be addressed by `index`; any greater
    /// depth means the access must go through the name-hash path at runtime.
    pub fn find_member(&self, name: &str) -> Option<(usize, usize, &Member)> {
        let mut current = self;
        let mut depth = 0usize;
        loop {
            if let SymbolType::Object { members, base, .. } = current {
                if let Some((index, member)) =
                    members.iter().enumerate().find(|(_, m)| m.name == name)
                {
                    return Some((depth, index, member));
                }
                match base {
                    Some(b) if depth < 32 => {
                        current = b.as_ref();
                        depth += 1;
                    }
                    _ => return None,
                }
            } else {
                return None;
            }
        }
    }
}

impl fmt::Display for SymbolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl PartialEq for SymbolType {
    fn eq(&self, other: &Self) -> bool {
        self.type_compatible(other, true) && other.type_compatible(self, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(name: &str, members: Vec<(&str, SymbolTypeRef)>, base: Option<SymbolTypeRef>) -> SymbolTypeRef {
        Arc::new(SymbolType::Object {
            name: name.to_string(),
            members: members
                .into_iter()
                .map(|(n, ty)| Member {
                    name: n.to_string(),
                    ty,
                    default: None,
                })
                .collect(),
            base,
        })
    }

    #[test]
    fn test_display_names() {
        assert_eq!(SymbolType::int().name(), "int");
        let array = Arc::new(SymbolType::GenericInstance {
            base: Arc::new(SymbolType::Generic {
                name: "Array".into(),
                params: vec!["T".into()],
            }),
            args: vec![SymbolType::int()],
        });
        assert_eq!(array.name(), "Array<int>");

        let func = SymbolType::Function {
            return_ty: SymbolType::void(),
            params: vec![SymbolType::int(), SymbolType::int()],
        };
        assert_eq!(func.name(), "Function<void, int, int>");
    }

    #[test]
    fn test_numeric_promotion() {
        let t = SymbolType::promote(&SymbolType::int(), &SymbolType::float()).unwrap();
        assert_eq!(t.name(), "float");
        let t = SymbolType::promote(&SymbolType::int(), &SymbolType::int()).unwrap();
        assert_eq!(t.name(), "int");
        assert!(SymbolType::promote(&SymbolType::int(), &SymbolType::string()).is_none());
    }

    #[test]
    fn test_any_absorbs() {
        let t = SymbolType::promote(&SymbolType::any(), &SymbolType::string()).unwrap();
        assert!(t.is_any());
        assert!(SymbolType::any().type_compatible(&SymbolType::int(), true));
    }

    #[test]
    fn test_null_promotes_to_reference() {
        let point = object("Point", vec![("x", SymbolType::float())], None);
        let t = SymbolType::promote(&SymbolType::null(), &point).unwrap();
        assert_eq!(t.name(), "Point");
        assert!(point.type_compatible(&SymbolType::null(), true));
    }

    #[test]
    fn test_member_lookup_depth() {
        let base = object("Entity", vec![("id", SymbolType::int())], None);
        let derived = object(
            "Point",
            vec![("x", SymbolType::float()), ("y", SymbolType::float())],
            Some(base),
        );

        let (depth, index, member) = derived.find_member("y").unwrap();
        assert_eq!((depth, index), (0, 1));
        assert_eq!(member.ty.name(), "float");

        let (depth, index, _) = derived.find_member("id").unwrap();
        assert_eq!((depth, index), (1, 0));

        assert!(derived.find_member("missing").is_none());
    }

    #[test]
    fn test_derived_compatible_with_base() {
        let base = object("Entity", vec![], None);
        let derived = object("Point", vec![], Some(base.clone()));
        assert!(base.type_compatible(&derived, true));
        assert!(!derived.type_compatible(&base, true));
    }

    #[test]
    fn test_strict_rejects_widening() {
        assert!(SymbolType::float().type_compatible(&SymbolType::int(), false));
        assert!(!SymbolType::float().type_compatible(&SymbolType::int(), true));
    }
}
