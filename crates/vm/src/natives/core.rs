//! Core builtins registered as globals at VM init: conversions, the
//! iterator protocol functions, ranges, slices, metatable access, and the
//! exception helpers.

use super::{check_argc, check_argc_at_least, number_arg, push_string, table_arg, thread_arg};
use crate::error::{VmError, VmResult};
use crate::modules::NativeDef;
use crate::value::{to_int64, Value};
use crate::vm::Vm;

const CORE: &[NativeDef] = &[
    NativeDef::new("str", core_tostring),
    NativeDef::new("tostring", core_tostring),
    NativeDef::new("number", number_native),
    NativeDef::new("int", int_native),
    NativeDef::new("float", float_native),
    NativeDef::new("bool", bool_native),
    NativeDef::new("type", type_native),
    NativeDef::new("mem", mem_native),
    NativeDef::new("next", next_native),
    NativeDef::new("inext", inext_native),
    NativeDef::new("gen_next", gen_next_native),
    NativeDef::new("range_iter", range_iter),
    NativeDef::new("range", range_native),
    NativeDef::new("slice", slice_native),
    NativeDef::new("min", min_native),
    NativeDef::new("max", max_native),
    NativeDef::new("sum", sum_native),
    NativeDef::new("divmod", divmod_native),
    NativeDef::new("setmetatable", setmetatable_native),
    NativeDef::new("getmetatable", getmetatable_native),
    NativeDef::new("error", error_native),
    NativeDef::new("exc_matches", exc_matches_native),
    NativeDef::new("yield", crate::natives::coroutine::co_yield),
];

pub fn register_core(vm: &mut Vm) {
    vm.register_globals(CORE);
}

fn core_tostring(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 1)?;
    if let Value::Str(_) = args[0] {
        vm.push(args[0]);
        return Ok(());
    }
    let text = vm.stringify(args[0])?;
    push_string(vm, text);
    Ok(())
}

fn number_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 1)?;
    let result = match args[0] {
        Value::Number(n) => Value::Number(n),
        Value::Str(id) => match vm.heap().string(id).chars.trim().parse::<f64>() {
            Ok(n) => Value::Number(n),
            Err(_) => Value::Nil,
        },
        _ => Value::Nil,
    };
    vm.push(result);
    Ok(())
}

fn int_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 1)?;
    let result = match args[0] {
        Value::Number(n) => Value::Number(n.trunc()),
        Value::Str(id) => match vm.heap().string(id).chars.trim().parse::<f64>() {
            Ok(n) => Value::Number(n.trunc()),
            Err(_) => Value::Nil,
        },
        _ => return Err(VmError::runtime("Argument 1 must be a number or string.")),
    };
    vm.push(result);
    Ok(())
}

fn float_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 1)?;
    let result = match args[0] {
        Value::Number(n) => Value::Number(n),
        Value::Str(id) => match vm.heap().string(id).chars.trim().parse::<f64>() {
            Ok(n) => Value::Number(n),
            Err(_) => Value::Nil,
        },
        _ => return Err(VmError::runtime("Argument 1 must be a number or string.")),
    };
    vm.push(result);
    Ok(())
}

fn bool_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 1)?;
    let falsey = vm.heap().is_falsey(args[0]);
    vm.push(Value::Bool(!falsey));
    Ok(())
}

fn type_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 1)?;
    push_string(vm, args[0].type_name());
    Ok(())
}

fn mem_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 0)?;
    let bytes = vm.heap().bytes_allocated();
    vm.push(Value::Number(bytes as f64));
    Ok(())
}

/// Generic table/string iteration step: `(state, control) -> (key, value)`.
/// The dense array part comes first, then the hash part in slot order.
fn next_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 2)?;
    let state = args[0];
    let control = args[1];

    if let Value::Table(table) = state {
        let mut scan_hash_from_start = control.is_nil();
        if control.is_nil() || matches!(control, Value::Number(_)) {
            let start = match control {
                Value::Number(n) => match to_int64(n) {
                    Some(i) if i >= 1 => i + 1,
                    _ => 1,
                },
                _ => 1,
            };
            let capacity = vm.heap().table(table).data.array_slots().len() as i64;
            for i in start..=capacity {
                if let Some(value) = vm.heap().table_get_array(table, i) {
                    vm.push(Value::Number(i as f64));
                    vm.push(value);
                    return Ok(());
                }
            }
            // A numeric control that finished the array moves into the
            // hash part from its canonical key, or from the top when it
            // was never a hash key.
            scan_hash_from_start = true;
            if let Value::Number(n) = control {
                let key = vm.heap_mut().number_key(n);
                if let Some(slot) = vm.heap().table(table).data.slot_of(vm.heap().strings(), key) {
                    match vm.heap().table(table).data.entry_at_or_after(slot + 1) {
                        Some((next_key, value)) => {
                            vm.push(Value::Str(next_key));
                            vm.push(value);
                        }
                        None => {
                            vm.push(Value::Nil);
                            vm.push(Value::Nil);
                        }
                    }
                    return Ok(());
                }
            }
        }

        if let Value::Str(key) = control {
            let slot = vm.heap().table(table).data.slot_of(vm.heap().strings(), key);
            match slot.and_then(|s| vm.heap().table(table).data.entry_at_or_after(s + 1)) {
                Some((next_key, value)) => {
                    vm.push(Value::Str(next_key));
                    vm.push(value);
                }
                None => {
                    vm.push(Value::Nil);
                    vm.push(Value::Nil);
                }
            }
            return Ok(());
        }

        if scan_hash_from_start {
            match vm.heap().table(table).data.entry_at_or_after(0) {
                Some((key, value)) => {
                    vm.push(Value::Str(key));
                    vm.push(value);
                }
                None => {
                    vm.push(Value::Nil);
                    vm.push(Value::Nil);
                }
            }
            return Ok(());
        }

        vm.push(Value::Nil);
        vm.push(Value::Nil);
        return Ok(());
    }

    if let Value::Str(string) = state {
        let index = match control {
            Value::Nil => 1,
            Value::Number(n) => match to_int64(n) {
                Some(i) if i >= 1 => i + 1,
                _ => 1,
            },
            _ => {
                return Err(VmError::runtime("next() string control must be number or nil."));
            }
        };
        let len = vm.heap().string(string).len() as i64;
        if index < 1 || index > len {
            vm.push(Value::Nil);
            vm.push(Value::Nil);
            return Ok(());
        }
        let byte = vm.heap().string(string).chars.as_bytes()[(index - 1) as usize];
        vm.push(Value::Number(index as f64));
        push_string(vm, (byte as char).to_string());
        return Ok(());
    }

    Err(VmError::runtime("next expects table or string as first argument."))
}

/// Array-only iteration step: `(table, i) -> (i+1, value)`.
fn inext_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 2)?;
    let table = table_arg(args, 0)?;
    let index = number_arg(args, 1)?;
    let next_index = index + 1.0;

    let mut found = None;
    if let Some(i) = to_int64(next_index) {
        if i >= 1 {
            found = vm.heap().table_get_array(table, i);
        }
    }
    if found.is_none() {
        let key = vm.heap_mut().number_key(next_index);
        found = vm.heap().table_get(table, key).filter(|v| !v.is_nil());
    }

    match found {
        Some(value) => {
            vm.push(Value::Number(next_index));
            vm.push(value);
        }
        None => {
            vm.push(Value::Nil);
            vm.push(Value::Nil);
        }
    }
    Ok(())
}

/// Steps a generator thread: resumes it in generator mode so its next
/// yield surfaces as an `(index, value)` pair on this thread.
fn gen_next_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 2)?;
    let thread = thread_arg(args, 0)?;
    if !vm.heap().thread(thread).is_generator {
        return Err(VmError::runtime("gen_next expects a generator thread."));
    }
    if vm.heap().thread(thread).is_dead() {
        vm.push(Value::Nil);
        vm.push(Value::Nil);
        return Ok(());
    }
    let caller = vm.current_thread();
    let generator = vm.heap_mut().thread_mut(thread);
    generator.caller = Some(caller);
    generator.generator_mode = true;
    vm.set_current_thread(thread);
    Ok(())
}

/// Range iteration step over a `{stop, step}` state table.
fn range_iter(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 2)?;
    let current = number_arg(args, 1)?;
    let (stop, step) = match args[0] {
        Value::Table(state) => {
            let stop = vm
                .heap()
                .table_get_array(state, 1)
                .and_then(|v| v.as_number())
                .unwrap_or(0.0);
            let step = vm
                .heap()
                .table_get_array(state, 2)
                .and_then(|v| v.as_number())
                .unwrap_or(1.0);
            (stop, step)
        }
        Value::Number(stop) => (stop, 1.0),
        _ => return Err(VmError::runtime("range state must be a table or number.")),
    };

    let next = current + step;
    if (step > 0.0 && next > stop) || (step < 0.0 && next < stop) {
        vm.push(Value::Nil);
        vm.push(Value::Nil);
        return Ok(());
    }
    vm.push(Value::Number(next));
    vm.push(Value::Number(next));
    Ok(())
}

/// `range(stop)`, `range(start, stop)`, `range(start, stop, step)` —
/// leaves the `(range_iter, state, control)` triple behind.
fn range_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    let (start, stop, step) = match args.len() {
        1 => (1.0, number_arg(args, 0)?, 1.0),
        2 => (number_arg(args, 0)?, number_arg(args, 1)?, 1.0),
        n if n >= 3 => (
            number_arg(args, 0)?,
            number_arg(args, 1)?,
            number_arg(args, 2)?,
        ),
        _ => return Err(VmError::runtime("range() expects 1-3 arguments")),
    };

    let iter_name = vm.names().range_iter_fn;
    let iter_fn = vm
        .get_global(iter_name)
        .ok_or_else(|| VmError::runtime("range_iter not found"))?;

    let state = vm.heap_mut().new_table();
    vm.push(Value::Table(state));
    vm.heap_mut()
        .table_set_array(state, 1, Value::Number(stop));
    vm.heap_mut()
        .table_set_array(state, 2, Value::Number(step));
    vm.pop();

    vm.push(iter_fn);
    vm.push(Value::Table(state));
    vm.push(Value::Number(start - step));
    Ok(())
}

/// `slice(obj, start, end, step?)` over tables and strings, clamping to
/// length, descending with a negative step.
fn slice_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc_at_least(args, 3)?;
    if !matches!(args[0], Value::Table(_) | Value::Str(_)) {
        return Err(VmError::runtime("slice() expects table or string"));
    }
    let start_d = number_arg(args, 1)?;
    let end_d = number_arg(args, 2)?;
    let step_d = if args.len() >= 4 { number_arg(args, 3)? } else { 1.0 };

    if step_d == 0.0 {
        return Err(VmError::runtime("slice() step cannot be 0"));
    }
    let (Some(start), Some(end), Some(step)) = (to_int64(start_d), to_int64(end_d), to_int64(step_d))
    else {
        return Err(VmError::runtime("slice() expects integer start/end/step"));
    };

    if let Value::Str(string) = args[0] {
        let text = vm.heap().string(string).chars.clone();
        let len = text.len() as i64;
        let bytes = text.as_bytes();
        let mut out = String::new();
        let clamped_start = start.max(1);
        let clamped_end = end.min(len);
        if step > 0 {
            let mut i = clamped_start;
            while i <= clamped_end {
                out.push(bytes[(i - 1) as usize] as char);
                i += step;
            }
        } else {
            let mut i = start.min(len);
            while i >= end.max(1) {
                out.push(bytes[(i - 1) as usize] as char);
                i += step;
            }
        }
        push_string(vm, out);
        return Ok(());
    }

    let source = table_arg(args, 0)?;
    let result = vm.heap_mut().new_table();
    vm.push(Value::Table(result));

    let mut read = |vm: &mut Vm, i: i64| -> Option<Value> {
        if i >= 1 {
            if let Some(value) = vm.heap().table_get_array(source, i) {
                return Some(value);
            }
        }
        let key = vm.heap_mut().number_key(i as f64);
        vm.heap().table_get(source, key).filter(|v| !v.is_nil())
    };

    let mut out_index = 1i64;
    if step > 0 {
        let mut i = start;
        while i <= end {
            if let Some(value) = read(vm, i) {
                vm.heap_mut().table_set_array(result, out_index, value);
            }
            out_index += 1;
            i += step;
        }
    } else {
        let mut i = start;
        while i >= end {
            if let Some(value) = read(vm, i) {
                vm.heap_mut().table_set_array(result, out_index, value);
            }
            out_index += 1;
            i += step;
        }
    }
    // The result table stays on the stack as the return value.
    Ok(())
}

fn numeric_spread(vm: &Vm, args: &[Value]) -> VmResult<Vec<f64>> {
    if args.len() == 1 {
        if let Value::Table(table) = args[0] {
            let len = vm.heap().table(table).data.sequence_len();
            let mut out = Vec::with_capacity(len);
            for i in 1..=len {
                match vm.heap().table_get_array(table, i as i64) {
                    Some(Value::Number(n)) => out.push(n),
                    _ => return Err(VmError::runtime("Expected a table of numbers.")),
                }
            }
            return Ok(out);
        }
    }
    let mut out = Vec::with_capacity(args.len());
    for (i, value) in args.iter().enumerate() {
        match value {
            Value::Number(n) => out.push(*n),
            _ => {
                return Err(VmError::runtime(format!(
                    "Argument {} must be a number.",
                    i + 1
                )))
            }
        }
    }
    Ok(out)
}

fn min_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc_at_least(args, 1)?;
    let numbers = numeric_spread(vm, args)?;
    match numbers.iter().copied().reduce(f64::min) {
        Some(n) => vm.push(Value::Number(n)),
        None => vm.push(Value::Nil),
    }
    Ok(())
}

fn max_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc_at_least(args, 1)?;
    let numbers = numeric_spread(vm, args)?;
    match numbers.iter().copied().reduce(f64::max) {
        Some(n) => vm.push(Value::Number(n)),
        None => vm.push(Value::Nil),
    }
    Ok(())
}

fn sum_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc_at_least(args, 1)?;
    let numbers = numeric_spread(vm, args)?;
    vm.push(Value::Number(numbers.iter().sum()));
    Ok(())
}

fn divmod_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 2)?;
    let a = number_arg(args, 0)?;
    let b = number_arg(args, 1)?;
    vm.push(Value::Number((a / b).floor()));
    let remainder = match (to_int64(a), to_int64(b)) {
        (Some(ia), Some(ib)) if ib != 0 => (ia % ib) as f64,
        _ => a % b,
    };
    vm.push(Value::Number(remainder));
    Ok(())
}

fn setmetatable_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 2)?;
    let table = table_arg(args, 0)?;
    let metatable = match args[1] {
        Value::Table(id) => Some(id),
        Value::Nil => None,
        _ => {
            vm.push(Value::Nil);
            return Ok(());
        }
    };
    let entry = vm.heap_mut().table_mut(table);
    entry.metatable = metatable;
    entry.version = entry.version.wrapping_add(1);
    vm.push(args[0]);
    Ok(())
}

fn getmetatable_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 1)?;
    let table = table_arg(args, 0)?;
    match vm.heap().table(table).metatable {
        Some(meta) => vm.push(Value::Table(meta)),
        None => vm.push(Value::Nil),
    }
    Ok(())
}

/// `error(payload)` — throws the payload as an exception.
fn error_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 1)?;
    vm.throw_value(args[0]);
    Err(VmError::Exception)
}

/// Handler matcher for `except <pattern> as e`: a nil pattern matches
/// everything, plain equality matches, a table exception matches its
/// `type` field or its metatable.
fn exc_matches_native(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 2)?;
    let exception = args[0];
    let pattern = args[1];
    let matched = if pattern.is_nil() {
        true
    } else if vm.heap().values_equal_simple(exception, pattern) {
        true
    } else if let Value::Table(table) = exception {
        let type_key = vm.names().type_key;
        let by_type = match vm.heap().table_get(table, type_key) {
            Some(type_value) => vm.heap().values_equal_simple(type_value, pattern),
            None => false,
        };
        by_type
            || matches!(
                (vm.heap().table(table).metatable, pattern),
                (Some(meta), Value::Table(p)) if meta == p
            )
    } else {
        false
    };
    vm.push(Value::Bool(matched));
    Ok(())
}
