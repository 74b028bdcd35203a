//! Native registration for host programs.
//!
//! A host builds a [`Context`], registers its globals, functions, and
//! classes on it, and uses it twice: once at compile time, where the
//! registered names become typed static declarations visible to scripts,
//! and once after a VM is created, where [`Context::bind`] fills the
//! reserved static slots with the actual values. The same context can be
//! shared across many compiles and VMs.
//!
//! Registered types are written as Sable type strings ("float",
//! "Function<int, int>", "Array<string>") and parsed with the ordinary type
//! grammar, so the analyzer checks script code against native signatures
//! exactly as it checks script-declared ones.

use parking_lot::Mutex;

use crate::compiler::analyzer::{NativeClass, NativeDecls, NativeGlobal, NativeMember};
use crate::compiler::{CompilationUnit, Program};
use crate::name_hash;
use crate::parser::parse_type_expression;
use crate::vm::heap::{HeapObject, ObjectMember};
use crate::vm::value::NativeFn;
use crate::vm::{Value, Vm};

/// A registered value, held until a VM exists to receive it. Strings stay
/// as Rust strings because heap handles only mean something inside one VM.
enum NativeValue {
    Scalar(Value),
    Str(String),
    Func(NativeFn),
}

struct GlobalEntry {
    name: String,
    type_str: String,
    value: NativeValue,
}

struct MemberEntry {
    name: String,
    type_str: String,
    func: Option<NativeFn>,
    is_method: bool,
}

struct ClassEntry {
    name: String,
    members: Vec<MemberEntry>,
}

#[derive(Default)]
struct Registry {
    globals: Vec<GlobalEntry>,
    classes: Vec<ClassEntry>,
}

/// Host registration context.
///
/// Interior mutability lets registration happen through a shared reference,
/// so a context can live in host-side state that is already behind `Arc`.
#[derive(Default)]
pub struct Context {
    inner: Mutex<Registry>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scalar global. The value must be self-contained; strings
    /// go through [`Context::global_string`].
    pub fn global(&self, name: impl Into<String>, type_str: impl Into<String>, value: Value) {
        self.inner.lock().globals.push(GlobalEntry {
            name: name.into(),
            type_str: type_str.into(),
            value: NativeValue::Scalar(value),
        });
    }

    /// Register a string global, allocated on each VM's heap at bind time.
    pub fn global_string(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.lock().globals.push(GlobalEntry {
            name: name.into(),
            type_str: "string".to_string(),
            value: NativeValue::Str(value.into()),
        });
    }

    /// Register a host function callable from scripts. `type_str` is its
    /// full signature, e.g. `"Function<int, int>"`.
    pub fn function(&self, name: impl Into<String>, type_str: impl Into<String>, func: NativeFn) {
        self.inner.lock().globals.push(GlobalEntry {
            name: name.into(),
            type_str: type_str.into(),
            value: NativeValue::Func(func),
        });
    }

    /// Start registering a class. Fields and methods are added through the
    /// returned builder; their registration order fixes the member slot
    /// order scripts compile against.
    pub fn class(&self, name: impl Into<String>) -> ClassBuilder<'_> {
        let mut registry = self.inner.lock();
        registry.classes.push(ClassEntry {
            name: name.into(),
            members: Vec::new(),
        });
        let index = registry.classes.len() - 1;
        drop(registry);
        ClassBuilder {
            context: self,
            index,
        }
    }

    /// Produce the typed declarations the analyzer injects into module
    /// scope. Type strings that fail to parse leave their diagnostics in
    /// the unit and drop the declaration.
    pub fn native_decls(&self, unit: &mut CompilationUnit) -> NativeDecls {
        let registry = self.inner.lock();
        let mut decls = NativeDecls::default();

        for class in &registry.classes {
            let mut members = Vec::new();
            for member in &class.members {
                if let Some(ty) = parse_type_expression(&member.type_str, unit) {
                    members.push(NativeMember {
                        name: member.name.clone(),
                        ty,
                        is_method: member.is_method,
                    });
                }
            }
            decls.classes.push(NativeClass {
                name: class.name.clone(),
                members,
            });
        }

        for global in &registry.globals {
            if let Some(ty) = parse_type_expression(&global.type_str, unit) {
                decls.globals.push(NativeGlobal {
                    name: global.name.clone(),
                    ty,
                });
            }
        }

        decls
    }

    /// Fill the static slots a program reserved for this context's names.
    /// Classes become heap type objects, with their member slots in
    /// registration order so compiled index access stays valid. Must run
    /// before [`Vm::run`]; names the program never compiled in are skipped.
    pub fn bind(&self, program: &Program, vm: &mut Vm) {
        let registry = self.inner.lock();

        for class in &registry.classes {
            let Some(&slot) = program.bindings.get(&class.name) else {
                continue;
            };
            let members = class
                .members
                .iter()
                .map(|m| ObjectMember {
                    hash: name_hash(&m.name),
                    name: m.name.clone(),
                    value: match m.func {
                        Some(f) => Value::NativeFunc(f),
                        None => Value::None,
                    },
                })
                .collect();
            let handle = vm.heap.alloc(HeapObject::Object {
                type_name: class.name.clone(),
                members,
                proto: None,
            });
            vm.statics[slot as usize] = Value::HeapPtr(handle);
        }

        for global in &registry.globals {
            let Some(&slot) = program.bindings.get(&global.name) else {
                continue;
            };
            vm.statics[slot as usize] = match &global.value {
                NativeValue::Scalar(v) => *v,
                NativeValue::Str(s) => Value::HeapPtr(vm.heap.alloc_str(s.clone())),
                NativeValue::Func(f) => Value::NativeFunc(*f),
            };
        }
    }
}

/// Fluent member registration for one native class.
///
/// Methods receive the receiver object as the trailing element of their
/// argument slice, after the declared parameters.
pub struct ClassBuilder<'a> {
    context: &'a Context,
    index: usize,
}

impl<'a> ClassBuilder<'a> {
    /// Add a data field. Scripts read and write it per instance; it starts
    /// out null unless a script assigns it.
    pub fn field(self, name: impl Into<String>, type_str: impl Into<String>) -> Self {
        self.push(MemberEntry {
            name: name.into(),
            type_str: type_str.into(),
            func: None,
            is_method: false,
        });
        self
    }

    /// Add a host-implemented method.
    pub fn method(
        self,
        name: impl Into<String>,
        type_str: impl Into<String>,
        func: NativeFn,
    ) -> Self {
        self.push(MemberEntry {
            name: name.into(),
            type_str: type_str.into(),
            func: Some(func),
            is_method: true,
        });
        self
    }

    fn push(&self, member: MemberEntry) {
        self.context.inner.lock().classes[self.index]
            .members
            .push(member);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;

    fn run_with(context: &Context, source: &str) -> (Vm, Value) {
        let program = Compiler::new("test", source)
            .with_context(context)
            .compile()
            .unwrap_or_else(|errors| panic!("{:?}", errors));
        let mut vm = Vm::new(&program);
        context.bind(&program, &mut vm);
        let result = vm.run().unwrap();
        (vm, result)
    }

    #[test]
    fn test_scalar_global() {
        let context = Context::new();
        context.global("PI", "float", Value::F64(3.5));
        let (_, result) = run_with(&context, "PI * 2.0;");
        assert_eq!(result, Value::F64(7.0));
    }

    #[test]
    fn test_string_global() {
        let context = Context::new();
        context.global_string("GREETING", "hi");
        let (vm, result) = run_with(&context, r#"GREETING + "!";"#);
        assert_eq!(vm.display_value(result), "hi!");
    }

    #[test]
    fn test_native_function() {
        fn double(_vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
            match args[0].as_i64() {
                Some(v) => Ok(Value::I64(v * 2)),
                None => Err(Value::None),
            }
        }

        let context = Context::new();
        context.function("double", "Function<int, int>", double);
        let (_, result) = run_with(&context, "double(21);");
        assert_eq!(result, Value::I64(42));
    }

    #[test]
    fn test_native_class_method_receives_self() {
        fn scaled(vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
            // Trailing argument is the receiver.
            let this = args.last().and_then(|v| v.as_heap());
            let factor = this
                .and_then(|h| vm.heap.member_named(h, "factor"))
                .and_then(|v| v.as_i64());
            match (args[0].as_i64(), factor) {
                (Some(v), Some(f)) => Ok(Value::I64(v * f)),
                _ => Err(Value::None),
            }
        }

        let context = Context::new();
        context
            .class("Scaler")
            .field("factor", "int")
            .method("scaled", "Function<int, int>", scaled);

        let source = r#"
            let s = new Scaler();
            s.factor = 3;
            s.scaled(7);
        "#;
        let (_, result) = run_with(&context, source);
        assert_eq!(result, Value::I64(21));
    }

    #[test]
    fn test_native_error_is_catchable() {
        fn fail(vm: &mut Vm, _args: &[Value]) -> Result<Value, Value> {
            Err(Value::HeapPtr(vm.heap.alloc_str("native failure")))
        }

        let context = Context::new();
        context.function("fail", "Function<any>", fail);
        let source = r#"
            let r = 0;
            try {
                fail();
                r = 1;
            } catch (e) {
                r = 2;
            }
            r;
        "#;
        let (_, result) = run_with(&context, source);
        assert_eq!(result, Value::I32(2));
    }

    #[test]
    fn test_unknown_type_string_is_a_compile_error() {
        let context = Context::new();
        context.global("broken", "Function<", Value::None);
        let result = Compiler::new("test", "1;").with_context(&context).compile();
        assert!(result.is_err());
    }
}
