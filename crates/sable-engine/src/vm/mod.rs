//! The Sable virtual machine: tagged values, heap, garbage collector, and
//! the register interpreter.

pub mod gc;
pub mod heap;
pub mod interpreter;
pub mod value;

pub use heap::{Heap, HeapHandle, HeapObject};
pub use interpreter::{Vm, VmError};
pub use value::{FunctionValue, NativeFn, Value};
