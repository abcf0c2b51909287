//! VM-level tests driving hand-assembled chunks, covering instructions
//! the compiler reaches only indirectly and the structural invariants of
//! frames, handlers, and upvalues.

use std::rc::Rc;

use tael_vm::chunk::Chunk;
use tael_vm::object::FunctionObject;
use tael_vm::{InterpretResult, OpCode, Value, Vm};

/// Wraps a chunk into a runnable top-level function.
fn install(vm: &mut Vm, mut chunk: Chunk) -> tael_vm::FunctionId {
    chunk.rebuild_caches();
    vm.heap_mut().alloc_function(FunctionObject {
        arity: 0,
        upvalue_count: 0,
        chunk: Rc::new(chunk),
        name: None,
        doc: None,
        defaults: Vec::new(),
        is_variadic: false,
        is_self: false,
        is_generator: false,
        param_names: Vec::new(),
        param_types: Vec::new(),
    })
}

#[test]
fn delete_global_removes_the_binding() {
    let mut vm = Vm::new();
    let name = vm.heap_mut().alloc_str("victim");
    vm.set_global(name, Value::Number(1.0));

    let mut chunk = Chunk::new();
    let constant = chunk.add_constant(Value::Str(name)).unwrap();
    chunk.write_op(OpCode::DeleteGlobal, 1);
    chunk.write(constant, 1);
    chunk.write_op(OpCode::Nil, 1);
    chunk.write_op(OpCode::Return, 1);

    let function = install(&mut vm, chunk);
    assert_eq!(vm.interpret_function(function), InterpretResult::Ok);
    assert_eq!(vm.get_global(name), None);
}

#[test]
fn delete_global_on_missing_name_errors() {
    let mut vm = Vm::new();
    let name = vm.heap_mut().alloc_str("ghost");

    let mut chunk = Chunk::new();
    let constant = chunk.add_constant(Value::Str(name)).unwrap();
    chunk.write_op(OpCode::DeleteGlobal, 1);
    chunk.write(constant, 1);
    chunk.write_op(OpCode::Nil, 1);
    chunk.write_op(OpCode::Return, 1);

    let function = install(&mut vm, chunk);
    assert_eq!(vm.interpret_function(function), InterpretResult::RuntimeError);
}

#[test]
fn delete_table_drops_hash_keys() {
    let mut vm = Vm::new();
    let table = vm.heap_mut().new_table();
    let key = vm.heap_mut().alloc_str("k");
    vm.heap_mut().table_set(table, key, Value::Number(5.0));

    let mut chunk = Chunk::new();
    let t = chunk.add_constant(Value::Table(table)).unwrap();
    let k = chunk.add_constant(Value::Str(key)).unwrap();
    chunk.write_op(OpCode::Constant, 1);
    chunk.write(t, 1);
    chunk.write_op(OpCode::Constant, 1);
    chunk.write(k, 1);
    chunk.write_op(OpCode::DeleteTable, 1);
    chunk.write_op(OpCode::Nil, 1);
    chunk.write_op(OpCode::Return, 1);

    let function = install(&mut vm, chunk);
    assert_eq!(vm.interpret_function(function), InterpretResult::Ok);
    assert_eq!(vm.heap().table_get(table, key), None);
}

#[test]
fn get_meta_table_pushes_the_metatable() {
    let mut vm = Vm::new();
    let table = vm.heap_mut().new_table();
    let meta = vm.heap_mut().new_table();
    vm.heap_mut().table_mut(table).metatable = Some(meta);
    let result_name = vm.heap_mut().alloc_str("result");

    let mut chunk = Chunk::new();
    let t = chunk.add_constant(Value::Table(table)).unwrap();
    let name = chunk.add_constant(Value::Str(result_name)).unwrap();
    chunk.write_op(OpCode::Constant, 1);
    chunk.write(t, 1);
    chunk.write_op(OpCode::GetMetaTable, 1);
    chunk.write_op(OpCode::DefineGlobal, 1);
    chunk.write(name, 1);
    chunk.write_op(OpCode::Nil, 1);
    chunk.write_op(OpCode::Return, 1);

    let function = install(&mut vm, chunk);
    assert_eq!(vm.interpret_function(function), InterpretResult::Ok);
    assert_eq!(vm.get_global(result_name), Some(Value::Table(meta)));
}

#[test]
fn collect_garbage_opcode_runs_a_cycle() {
    let mut vm = Vm::new();
    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::CollectGarbage, 1);
    chunk.write_op(OpCode::Nil, 1);
    chunk.write_op(OpCode::Return, 1);

    let function = install(&mut vm, chunk);
    assert_eq!(vm.interpret_function(function), InterpretResult::Ok);
    // Interned names and core natives survive the cycle.
    assert!(vm.get_global(vm.names().range_fn).is_some());
}

#[test]
fn dup_duplicates_the_top_value() {
    let mut vm = Vm::new();
    let result_name = vm.heap_mut().alloc_str("result");

    let mut chunk = Chunk::new();
    let two = chunk.add_constant(Value::Number(2.0)).unwrap();
    let name = chunk.add_constant(Value::Str(result_name)).unwrap();
    chunk.write_op(OpCode::Constant, 1);
    chunk.write(two, 1);
    chunk.write_op(OpCode::Dup, 1);
    chunk.write_op(OpCode::Multiply, 1);
    chunk.write_op(OpCode::DefineGlobal, 1);
    chunk.write(name, 1);
    chunk.write_op(OpCode::Nil, 1);
    chunk.write_op(OpCode::Return, 1);

    let function = install(&mut vm, chunk);
    assert_eq!(vm.interpret_function(function), InterpretResult::Ok);
    assert_eq!(vm.get_global(result_name), Some(Value::Number(4.0)));
}

#[test]
fn frames_and_handlers_are_clean_after_a_script() {
    let mut vm = Vm::new();
    vm.capture_output();
    let result = vm.interpret(
        "fn f() try: throw 1; except as e: return e; end; end\nprint(f())\n",
    );
    assert_eq!(result, InterpretResult::Ok);
    let main = vm.main_thread();
    let thread = vm.heap().thread(main);
    assert!(thread.frames.is_empty());
    assert!(thread.handlers.is_empty());
    assert!(thread.open_upvalues.is_none());
    assert!(thread.exception.is_none());
}

#[test]
fn closure_upvalue_counts_match_their_functions() {
    let mut vm = Vm::new();
    vm.capture_output();
    let result = vm.interpret(
        "fn outer() local a = 1; local b = 2; return fn() return a + b; end; end\n\
         g = outer()\nprint(g())\n",
    );
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(vm.take_output(), "3\n");

    let name = vm.heap_mut().alloc_str("g");
    let Some(Value::Closure(closure)) = vm.get_global(name) else {
        panic!("g is not a closure");
    };
    let function = vm.heap().closure(closure).function;
    assert_eq!(
        vm.heap().closure(closure).upvalues.len(),
        vm.heap().function(function).upvalue_count
    );
    assert_eq!(vm.heap().function(function).upvalue_count, 2);
}

#[test]
fn gc_preserves_reachable_script_state() {
    let mut vm = Vm::new();
    vm.capture_output();
    let result = vm.interpret(
        "keep = {}\nfor i = 1, 100: keep[i] = \"item \" + str(i)\n",
    );
    assert_eq!(result, InterpretResult::Ok);
    vm.collect_garbage();
    vm.collect_garbage();
    let before = vm.heap().bytes_allocated();
    vm.collect_garbage();
    // No allocations between cycles: heap size is stable.
    assert_eq!(vm.heap().bytes_allocated(), before);

    vm.capture_output();
    assert_eq!(vm.interpret("print(keep[42])"), InterpretResult::Ok);
    assert_eq!(vm.take_output(), "item 42\n");
}

#[test]
fn garbage_tables_are_reclaimed() {
    let mut vm = Vm::new();
    vm.capture_output();
    assert_eq!(
        vm.interpret("for i = 1, 50: local t = {1, 2, 3}"),
        InterpretResult::Ok
    );
    let live_before = vm.heap().live_objects();
    vm.collect_garbage();
    assert!(vm.heap().live_objects() < live_before);
}

#[test]
fn generator_calls_return_suspended_threads() {
    let mut vm = Vm::new();
    vm.capture_output();
    assert_eq!(
        vm.interpret("fn g() yield 1; yield 2; end\nco = g()\n"),
        InterpretResult::Ok
    );
    let name = vm.heap_mut().alloc_str("co");
    let Some(Value::Thread(thread)) = vm.get_global(name) else {
        panic!("co is not a thread");
    };
    assert!(!vm.heap().thread(thread).is_dead());
}
