//! # Tael Virtual Machine
//!
//! The complete execution engine for the Tael scripting language: a
//! single-pass compiler that lowers source text into compact bytecode, and
//! a stack-based virtual machine that runs it with a stop-the-world
//! mark/sweep garbage collector, closures with upvalues, metatable-driven
//! polymorphism, coroutine threads and generators, `try`/`except`/`finally`
//! exception handling, and a module loader.
//!
//! ## Architecture
//!
//! - **Lexer**: indentation-sensitive tokenizer with string interpolation
//! - **Compiler**: Pratt parser fused with the emitter; no AST
//! - **Optimizer**: peephole pass over finished chunks
//! - **Heap**: typed GC arenas addressed by index handles
//! - **Vm**: dispatch loop, call frames, coroutine switching, unwinding
//! - **Modules**: lazy native registry plus compile-once source modules
//!
//! ## Example
//!
//! ```rust
//! use tael_vm::{InterpretResult, Vm};
//!
//! let mut vm = Vm::new();
//! vm.capture_output();
//! let result = vm.interpret("print(1 + 2)");
//! assert_eq!(result, InterpretResult::Ok);
//! assert_eq!(vm.take_output(), "3\n");
//! ```

/// Compiled bytecode chunks and inline-cache slots.
pub mod chunk;
/// The single-pass compiler.
pub mod compiler;
/// Chunk disassembly.
pub mod debug;
/// Error types and interpreter status codes.
pub mod error;
/// The garbage-collected heap and object handles.
pub mod heap;
/// The lexer.
pub mod lexer;
/// The module loader and native registration contract.
pub mod modules;
/// Built-in native modules.
pub mod natives;
/// Heap object definitions.
pub mod object;
/// Bytecode instruction set.
pub mod op_code;
/// The peephole optimizer.
pub mod optimizer;
/// The hash + array runtime table.
pub mod table;
/// The tagged value representation.
pub mod value;
/// The dispatch core.
pub mod vm;

pub use error::{InterpretResult, VmError, VmResult};
pub use heap::{
    BoundMethodId, ClosureId, FunctionId, GcRef, Heap, NativeId, StringId, TableId, ThreadId,
    UserdataId,
};
pub use object::{NativeFastKind, NativeFn, TypeHint};
pub use op_code::OpCode;
pub use value::Value;
pub use vm::{MetaMethod, MetaNames, Vm, VmOptions};
