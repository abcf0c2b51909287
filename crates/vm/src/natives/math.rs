//! The math module. Every function carries a fast-path kind so the call
//! machinery can dispatch pure numeric cases without building a frame;
//! the bodies here remain the source of truth for argument errors.

use super::{check_argc, check_argc_at_least, number_arg};
use crate::error::{VmError, VmResult};
use crate::heap::TableId;
use crate::modules::NativeDef;
use crate::object::NativeFastKind;
use crate::value::Value;
use crate::vm::Vm;

const MATH: &[NativeDef] = &[
    NativeDef::fast("sin", math_sin, NativeFastKind::Sin),
    NativeDef::fast("cos", math_cos, NativeFastKind::Cos),
    NativeDef::fast("tan", math_tan, NativeFastKind::Tan),
    NativeDef::fast("asin", math_asin, NativeFastKind::Asin),
    NativeDef::fast("acos", math_acos, NativeFastKind::Acos),
    NativeDef::fast("atan", math_atan, NativeFastKind::Atan),
    NativeDef::fast("sqrt", math_sqrt, NativeFastKind::Sqrt),
    NativeDef::fast("floor", math_floor, NativeFastKind::Floor),
    NativeDef::fast("ceil", math_ceil, NativeFastKind::Ceil),
    NativeDef::fast("abs", math_abs, NativeFastKind::Abs),
    NativeDef::fast("exp", math_exp, NativeFastKind::Exp),
    NativeDef::fast("log", math_log, NativeFastKind::Log),
    NativeDef::fast("pow", math_pow, NativeFastKind::Pow),
    NativeDef::fast("fmod", math_fmod, NativeFastKind::Fmod),
    NativeDef::fast("deg", math_deg, NativeFastKind::Deg),
    NativeDef::fast("rad", math_rad, NativeFastKind::Rad),
];

pub fn load(vm: &mut Vm) -> VmResult<TableId> {
    let module = vm.build_module(MATH);
    let pi = vm.heap_mut().alloc_str("pi");
    vm.heap_mut()
        .table_set(module, pi, Value::Number(std::f64::consts::PI));
    let huge = vm.heap_mut().alloc_str("huge");
    vm.heap_mut()
        .table_set(module, huge, Value::Number(f64::INFINITY));
    Ok(module)
}

fn unary(vm: &mut Vm, args: &[Value], f: fn(f64) -> f64) -> VmResult<()> {
    check_argc(args, 1)?;
    let n = number_arg(args, 0)?;
    vm.push(Value::Number(f(n)));
    Ok(())
}

fn math_sin(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    unary(vm, args, f64::sin)
}

fn math_cos(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    unary(vm, args, f64::cos)
}

fn math_tan(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    unary(vm, args, f64::tan)
}

fn math_asin(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    unary(vm, args, f64::asin)
}

fn math_acos(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    unary(vm, args, f64::acos)
}

fn math_atan(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc_at_least(args, 1)?;
    let a = number_arg(args, 0)?;
    if args.len() >= 2 {
        let b = number_arg(args, 1)?;
        vm.push(Value::Number(a.atan2(b)));
    } else {
        vm.push(Value::Number(a.atan()));
    }
    Ok(())
}

fn math_sqrt(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    unary(vm, args, f64::sqrt)
}

fn math_floor(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    unary(vm, args, f64::floor)
}

fn math_ceil(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    unary(vm, args, f64::ceil)
}

fn math_abs(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    unary(vm, args, f64::abs)
}

fn math_exp(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    unary(vm, args, f64::exp)
}

fn math_log(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc_at_least(args, 1)?;
    let a = number_arg(args, 0)?;
    if args.len() >= 2 {
        let base = number_arg(args, 1)?;
        vm.push(Value::Number(a.ln() / base.ln()));
    } else {
        vm.push(Value::Number(a.ln()));
    }
    Ok(())
}

fn math_pow(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 2)?;
    let a = number_arg(args, 0)?;
    let b = number_arg(args, 1)?;
    vm.push(Value::Number(a.powf(b)));
    Ok(())
}

fn math_fmod(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    check_argc(args, 2)?;
    let a = number_arg(args, 0)?;
    let b = number_arg(args, 1)?;
    vm.push(Value::Number(a % b));
    Ok(())
}

fn math_deg(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    unary(vm, args, f64::to_degrees)
}

fn math_rad(vm: &mut Vm, args: &[Value]) -> VmResult<()> {
    unary(vm, args, f64::to_radians)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_kinds_cover_every_entry() {
        for def in MATH {
            assert_ne!(
                def.fast_kind,
                NativeFastKind::None,
                "{} is missing a fast kind",
                def.name
            );
        }
    }
}
