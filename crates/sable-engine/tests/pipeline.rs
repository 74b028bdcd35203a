//! End-to-end tests through the public crate surface: compile source with
//! the pipeline driver, bind native registrations, run the VM, and check
//! observable results.

use sable_engine::compiler::bytecode::{decode_program, encode_program};
use sable_engine::vm::VmError;
use sable_engine::{Compiler, Context, Value, Vm};

fn run(source: &str) -> Value {
    let program = Compiler::new("test", source)
        .compile()
        .unwrap_or_else(|errors| panic!("{:?}", errors));
    Vm::new(&program).run().unwrap()
}

#[test]
fn function_declaration_and_call() {
    let source = r#"
        function add(a: int, b: int): int {
            return a + b;
        }
        add(2, 3);
    "#;
    assert_eq!(run(source), Value::I32(5));
}

#[test]
fn closures_capture_enclosing_values() {
    let source = r#"
        function make_adder(n: int) {
            return function(x: int) { return n + x; };
        }
        let add10 = make_adder(10);
        let add1 = make_adder(1);
        add10(5) + add1(5);
    "#;
    assert_eq!(run(source), Value::I32(21));
}

#[test]
fn classes_inheritance_and_constructors() {
    let source = r#"
        class Shape {
            name: string = "shape";
            sides: int = 0;
        }
        class Square extends Shape {
            size: int = 0;
            init(size: int) {
                self.size = size;
                self.sides = 4;
            }
            area(): int { return self.size * self.size; }
        }
        let sq = new Square(5);
        sq.area() + sq.sides;
    "#;
    assert_eq!(run(source), Value::I32(29));
}

#[test]
fn native_global_binds_into_statics() {
    let context = Context::new();
    context.global("PI", "float", Value::F64(3.14159));

    let program = Compiler::new("test", "PI * 2.0;")
        .with_context(&context)
        .compile()
        .unwrap();
    let mut vm = Vm::new(&program);
    context.bind(&program, &mut vm);
    assert_eq!(vm.run().unwrap(), Value::F64(6.28318));
}

#[test]
fn native_class_usable_from_script() {
    fn magnitude(vm: &mut Vm, args: &[Value]) -> Result<Value, Value> {
        let this = args.last().and_then(|v| v.as_heap());
        let get = |name| {
            this.and_then(|h| vm.heap.member_named(h, name))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0)
        };
        let (x, y) = (get("x"), get("y"));
        Ok(Value::F64((x * x + y * y).sqrt()))
    }

    let context = Context::new();
    context
        .class("Vec2")
        .field("x", "float")
        .field("y", "float")
        .method("magnitude", "Function<float>", magnitude);

    let source = r#"
        let v = new Vec2();
        v.x = 3.0;
        v.y = 4.0;
        v.magnitude();
    "#;
    let program = Compiler::new("test", source)
        .with_context(&context)
        .compile()
        .unwrap_or_else(|errors| panic!("{:?}", errors));
    let mut vm = Vm::new(&program);
    context.bind(&program, &mut vm);
    assert_eq!(vm.run().unwrap(), Value::F64(5.0));
}

#[test]
fn top_level_functions_are_exported_to_the_host() {
    let source = r#"
        function greet(): int { return 1; }
        class Config { debug: bool = false; }
        greet();
    "#;
    let program = Compiler::new("test", source).compile().unwrap();
    let mut vm = Vm::new(&program);
    vm.run().unwrap();
    assert!(matches!(vm.export_named("greet"), Some(Value::FuncAddr(_))));
    assert!(matches!(vm.export_named("Config"), Some(Value::HeapPtr(_))));
    assert_eq!(vm.export_named("missing"), None);
}

#[test]
fn compile_errors_are_returned_not_panicked() {
    let result = Compiler::new("test", "undeclared(1);").compile();
    let errors = result.unwrap_err();
    assert!(errors.has_fatal_errors());

    let result = Compiler::new("test", "let x: int = \"oops\";").compile();
    assert!(result.unwrap_err().has_fatal_errors());
}

#[test]
fn uncaught_exception_surfaces_as_error() {
    let source = r#"throw "boom";"#;
    let program = Compiler::new("test", source).compile().unwrap();
    let err = Vm::new(&program).run().unwrap_err();
    match err {
        VmError::UncaughtException(message) => assert_eq!(message, "boom"),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn encoded_program_runs_after_decode() {
    let source = r#"
        function triple(n: int): int { return n * 3; }
        triple(14);
    "#;
    let program = Compiler::new("test", source).compile().unwrap();
    let bytes = encode_program(&program);
    let decoded = decode_program(&bytes).unwrap();
    assert_eq!(Vm::new(&decoded).run().unwrap(), Value::I32(42));
}

#[test]
fn native_bindings_survive_the_program_file() {
    let context = Context::new();
    context.global("GRAVITY", "float", Value::F64(9.8));

    let program = Compiler::new("test", "GRAVITY;")
        .with_context(&context)
        .compile()
        .unwrap();
    let decoded = decode_program(&encode_program(&program)).unwrap();

    // Binding by name works on the decoded program as well.
    let mut vm = Vm::new(&decoded);
    context.bind(&decoded, &mut vm);
    assert_eq!(vm.run().unwrap(), Value::F64(9.8));
}

#[test]
fn heavy_allocation_completes_under_gc() {
    // Enough string churn to force several collection cycles.
    let source = r#"
        let out = "";
        for (let i = 0; i < 2000; i = i + 1) {
            out = "x" + "y";
        }
        out;
    "#;
    let program = Compiler::new("test", source).compile().unwrap();
    let mut vm = Vm::new(&program);
    let result = vm.run().unwrap();
    assert_eq!(vm.display_value(result), "xy");
}
