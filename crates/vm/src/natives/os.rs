//! The os module: process arguments, wall clock, environment.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

use super::{check_argc, push_string, string_arg};
use crate::error::VmResult;
use crate::heap::TableId;
use crate::modules::NativeDef;
use crate::value::Value;
use crate::vm::Vm;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

const OS: &[NativeDef] = &[
    NativeDef::new("argv", os_argv),
    NativeDef::new("argc", os_argc),
    NativeDef::new("clock", os_clock),
    NativeDef::new("time", os_time),
    NativeDef::new("getenv", os_getenv),
];

pub fn load(vm: &mut Vm) -> VmResult<TableId> {
    // Touch the start instant so clock() measures from module load at the
    // latest.
    Lazy::force(&PROCESS_START);
    Ok(vm.build_module(OS))
}

fn os_argv(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 0)?;
    let argv: Vec<String> = vm.cli_args().to_vec();
    let table = vm.heap_mut().new_table();
    vm.push(Value::Table(table));
    for (i, arg) in argv.iter().enumerate() {
        let value = vm.heap_mut().alloc_str(arg);
        vm.heap_mut()
            .table_set_array(table, i as i64 + 1, Value::Str(value));
    }
    Ok(())
}

fn os_argc(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 0)?;
    let count = vm.cli_args().len();
    vm.push(Value::Number(count as f64));
    Ok(())
}

fn os_clock(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 0)?;
    vm.push(Value::Number(PROCESS_START.elapsed().as_secs_f64()));
    Ok(())
}

fn os_time(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 0)?;
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    vm.push(Value::Number(seconds));
    Ok(())
}

fn os_getenv(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 1)?;
    let name = string_arg(args, 0)?;
    let name = vm.heap().string(name).chars.clone();
    match std::env::var(&name) {
        Ok(value) => push_string(vm, value),
        Err(_) => vm.push(Value::Nil),
    }
    Ok(())
}
