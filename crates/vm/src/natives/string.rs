//! The string module. Its entries are self-methods: indexing a string
//! resolves against this table and binds the receiver, so
//! `"abc".upper()` calls `upper("abc")`.

use super::{check_argc, check_argc_at_least, number_arg, push_string, string_arg};
use crate::error::{VmError, VmResult};
use crate::heap::TableId;
use crate::modules::NativeDef;
use crate::value::{to_int64, Value};
use crate::vm::Vm;

const STRING: &[NativeDef] = &[
    NativeDef::method("upper", str_upper),
    NativeDef::method("lower", str_lower),
    NativeDef::method("len", str_len),
    NativeDef::method("sub", str_sub),
    NativeDef::method("find", str_find),
    NativeDef::method("split", str_split),
    NativeDef::method("trim", str_trim),
    NativeDef::method("rep", str_rep),
    NativeDef::method("byte", str_byte),
    NativeDef::method("starts_with", str_starts_with),
    NativeDef::method("ends_with", str_ends_with),
    NativeDef::new("char", str_char),
];

pub fn load(vm: &mut Vm) -> VmResult<TableId> {
    Ok(vm.build_module(STRING))
}

fn str_upper(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 1)?;
    let id = string_arg(args, 0)?;
    let text = vm.heap().string(id).chars.to_uppercase();
    push_string(vm, text);
    Ok(())
}

fn str_lower(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 1)?;
    let id = string_arg(args, 0)?;
    let text = vm.heap().string(id).chars.to_lowercase();
    push_string(vm, text);
    Ok(())
}

fn str_len(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 1)?;
    let id = string_arg(args, 0)?;
    let len = vm.heap().string(id).len();
    vm.push(Value::Number(len as f64));
    Ok(())
}

/// `sub(s, i, j?)` — 1-based inclusive, negatives from the end.
fn str_sub(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc_at_least(args, 2)?;
    let id = string_arg(args, 0)?;
    let text = vm.heap().string(id).chars.clone();
    let len = text.len() as i64;
    let mut start = number_arg(args, 1)? as i64;
    let mut end = if args.len() >= 3 {
        number_arg(args, 2)? as i64
    } else {
        len
    };
    if start < 0 {
        start = len + start + 1;
    }
    if end < 0 {
        end = len + end + 1;
    }
    start = start.max(1);
    end = end.min(len);
    if start > end {
        push_string(vm, "");
        return Ok(());
    }
    let slice = &text.as_bytes()[(start - 1) as usize..end as usize];
    push_string(vm, String::from_utf8_lossy(slice).into_owned());
    Ok(())
}

/// `find(s, needle)` — 1-based index of the first occurrence, or nil.
fn str_find(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 2)?;
    let haystack = string_arg(args, 0)?;
    let needle = string_arg(args, 1)?;
    let haystack = &vm.heap().string(haystack).chars;
    let needle = &vm.heap().string(needle).chars;
    let result = haystack
        .find(needle.as_str())
        .map(|at| Value::Number(at as f64 + 1.0))
        .unwrap_or(Value::Nil);
    vm.push(result);
    Ok(())
}

fn str_split(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 2)?;
    let id = string_arg(args, 0)?;
    let sep = string_arg(args, 1)?;
    let text = vm.heap().string(id).chars.clone();
    let sep = vm.heap().string(sep).chars.clone();

    let result = vm.heap_mut().new_table();
    vm.push(Value::Table(result));
    let parts: Vec<&str> = if sep.is_empty() {
        text.split("").filter(|p| !p.is_empty()).collect()
    } else {
        text.split(sep.as_str()).collect()
    };
    for (i, part) in parts.iter().enumerate() {
        let piece = vm.heap_mut().alloc_str(part);
        vm.heap_mut()
            .table_set_array(result, i as i64 + 1, Value::Str(piece));
    }
    Ok(())
}

fn str_trim(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 1)?;
    let id = string_arg(args, 0)?;
    let text = vm.heap().string(id).chars.trim().to_string();
    push_string(vm, text);
    Ok(())
}

fn str_rep(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 2)?;
    let id = string_arg(args, 0)?;
    let count = number_arg(args, 1)?;
    let Some(count) = to_int64(count).filter(|&n| n >= 0) else {
        return Err(VmError::runtime("Argument 2 must be a non-negative integer."));
    };
    let text = vm.heap().string(id).chars.repeat(count as usize);
    push_string(vm, text);
    Ok(())
}

fn str_byte(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc_at_least(args, 1)?;
    let id = string_arg(args, 0)?;
    let index = if args.len() >= 2 {
        number_arg(args, 1)? as i64
    } else {
        1
    };
    let bytes = vm.heap().string(id).as_bytes();
    if index < 1 || index > bytes.len() as i64 {
        vm.push(Value::Nil);
        return Ok(());
    }
    vm.push(Value::Number(bytes[(index - 1) as usize] as f64));
    Ok(())
}

fn str_starts_with(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 2)?;
    let id = string_arg(args, 0)?;
    let prefix = string_arg(args, 1)?;
    let result = vm
        .heap()
        .string(id)
        .chars
        .starts_with(vm.heap().string(prefix).chars.as_str());
    vm.push(Value::Bool(result));
    Ok(())
}

fn str_ends_with(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 2)?;
    let id = string_arg(args, 0)?;
    let suffix = string_arg(args, 1)?;
    let result = vm
        .heap()
        .string(id)
        .chars
        .ends_with(vm.heap().string(suffix).chars.as_str());
    vm.push(Value::Bool(result));
    Ok(())
}

/// `char(b, …)` — builds a string from byte values.
fn str_char(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc_at_least(args, 1)?;
    let mut out = String::with_capacity(args.len());
    for i in 0..args.len() {
        let byte = number_arg(args, i)?;
        let Some(byte) = to_int64(byte).filter(|&b| (0..=255).contains(&b)) else {
            return Err(VmError::runtime(format!(
                "Argument {} must be a byte value.",
                i + 1
            )));
        };
        out.push(byte as u8 as char);
    }
    push_string(vm, out);
    Ok(())
}
