//! Built-in native modules.
//!
//! Each module is a definition list wired through the registration
//! contract in [`crate::modules`]. `core` registers straight into globals;
//! the rest are loaded lazily on first import.

pub mod core;
pub mod coroutine;
pub mod math;
pub mod os;
pub mod string;

use crate::error::{VmError, VmResult};
use crate::heap::{StringId, TableId, ThreadId};
use crate::value::Value;
use crate::vm::Vm;

pub(crate) fn check_argc(args: &[Value], expected: usize) -> VmResult<()> {
    if args.len() != expected {
        return Err(VmError::runtime(format!(
            "Expected {expected} arguments but got {}.",
            args.len()
        )));
    }
    Ok(())
}

pub(crate) fn check_argc_at_least(args: &[Value], expected: usize) -> VmResult<()> {
    if args.len() < expected {
        return Err(VmError::runtime(format!(
            "Expected at least {expected} arguments but got {}.",
            args.len()
        )));
    }
    Ok(())
}

pub(crate) fn number_arg(args: &[Value], index: usize) -> VmResult<f64> {
    match args.get(index) {
        Some(Value::Number(n)) => Ok(*n),
        _ => Err(VmError::runtime(format!(
            "Argument {} must be a number.",
            index + 1
        ))),
    }
}

pub(crate) fn string_arg(args: &[Value], index: usize) -> VmResult<StringId> {
    match args.get(index) {
        Some(Value::Str(id)) => Ok(*id),
        _ => Err(VmError::runtime(format!(
            "Argument {} must be a string.",
            index + 1
        ))),
    }
}

pub(crate) fn table_arg(args: &[Value], index: usize) -> VmResult<TableId> {
    match args.get(index) {
        Some(Value::Table(id)) => Ok(*id),
        _ => Err(VmError::runtime(format!(
            "Argument {} must be a table.",
            index + 1
        ))),
    }
}

pub(crate) fn thread_arg(args: &[Value], index: usize) -> VmResult<ThreadId> {
    match args.get(index) {
        Some(Value::Thread(id)) => Ok(*id),
        _ => Err(VmError::runtime(format!(
            "Argument {} must be a thread.",
            index + 1
        ))),
    }
}

pub(crate) fn push_string(vm: &mut Vm, text: impl Into<String>) {
    let id = vm.heap_mut().alloc_string(text.into());
    vm.push(Value::Str(id));
}
