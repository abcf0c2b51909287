//! The coroutine module: first-class threads created, resumed, and
//! yielded cooperatively.

use super::{check_argc, check_argc_at_least, number_arg, push_string, thread_arg};
use crate::error::{VmError, VmResult};
use crate::heap::TableId;
use crate::modules::NativeDef;
use crate::object::{CallFrame, ThreadObject};
use crate::value::Value;
use crate::vm::Vm;

const COROUTINE: &[NativeDef] = &[
    NativeDef::new("create", co_create),
    NativeDef::new("resume", co_resume),
    NativeDef::new("yield", co_yield),
    NativeDef::new("sleep", co_sleep),
    NativeDef::new("status", co_status),
];

pub fn load(vm: &mut Vm) -> VmResult<TableId> {
    Ok(vm.build_module(COROUTINE))
}

fn co_create(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 1)?;
    let Value::Closure(closure) = args[0] else {
        vm.push(Value::Nil);
        return Ok(());
    };

    let options = vm.options().clone();
    let thread_id = vm.heap_mut().alloc_thread(ThreadObject::with_limits(
        options.stack_capacity,
        options.frame_capacity,
        options.handler_capacity,
    ));
    let chunk = {
        let function = vm.heap().closure(closure).function;
        vm.heap().function(function).chunk.clone()
    };
    let thread = vm.heap_mut().thread_mut(thread_id);
    thread.push(args[0]);
    thread.frames.push(CallFrame {
        closure,
        chunk,
        ip: 0,
        slots: 0,
        module: None,
    });

    vm.push(Value::Thread(thread_id));
    Ok(())
}

fn co_resume(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc_at_least(args, 1)?;
    let thread_id = thread_arg(args, 0)?;

    if vm.heap().thread(thread_id).is_dead() {
        vm.push(Value::Bool(false));
        push_string(vm, "cannot resume dead coroutine");
        return Ok(());
    }

    let caller = vm.current_thread();
    let thread = vm.heap_mut().thread_mut(thread_id);
    thread.caller = Some(caller);
    if thread.is_generator {
        thread.generator_mode = false;
    }
    for value in &args[1..] {
        thread.push(*value);
    }
    vm.set_current_thread(thread_id);
    Ok(())
}

/// Suspends the current coroutine, handing `(true, values…)` — or
/// `(index, value)` when a for loop is driving a generator — back to the
/// resuming thread.
pub fn co_yield(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    let current = vm.current_thread();
    let Some(caller) = vm.heap().thread(current).caller else {
        vm.push(Value::Bool(false));
        push_string(vm, "attempt to yield from outside a coroutine");
        return Ok(());
    };

    let generator_step = {
        let thread = vm.heap().thread(current);
        thread.is_generator && thread.generator_mode
    };
    if generator_step {
        let index = {
            let thread = vm.heap_mut().thread_mut(current);
            thread.generator_mode = false;
            thread.generator_index += 1;
            thread.generator_index
        };
        let value = args.first().copied().unwrap_or(Value::Nil);
        let caller_thread = vm.heap_mut().thread_mut(caller);
        caller_thread.push(Value::Number(index as f64));
        caller_thread.push(value);
    } else {
        let caller_thread = vm.heap_mut().thread_mut(caller);
        caller_thread.push(Value::Bool(true));
        for value in args {
            caller_thread.push(*value);
        }
    }

    vm.heap_mut().thread_mut(current).caller = None;
    vm.set_current_thread(caller);
    Ok(())
}

fn co_sleep(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 1)?;
    let duration = number_arg(args, 0)?;
    let tag = vm.heap_mut().alloc_str("sleep");
    co_yield(vm, &[Value::Str(tag), Value::Number(duration)])
}

fn co_status(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 1)?;
    let thread = thread_arg(args, 0)?;
    let status = if vm.heap().thread(thread).is_dead() {
        "dead"
    } else if vm.heap().thread(thread).caller.is_some() {
        "normal"
    } else if thread == vm.current_thread() {
        "running"
    } else {
        "suspended"
    };
    push_string(vm, status);
    Ok(())
}
