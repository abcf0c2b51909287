//! Arithmetic opcodes, their constant-fused variants, and the binary
//! metamethod fallback.

use super::{Cursor, MetaMethod, Vm};
use crate::error::{VmError, VmResult};
use crate::heap::TableId;
use crate::value::{to_int64, Value};

impl Vm {
    /// Pushes `method(a, b)` as a call frame; the loop runs it and its
    /// return value replaces the operands.
    pub(crate) fn call_binary_metamethod(
        &mut self,
        cur: &mut Cursor,
        method: Value,
        a: Value,
        b: Value,
    ) -> VmResult<()> {
        self.push(method);
        self.push(a);
        self.push(b);
        self.call_value_cursor(cur, method, 2)
    }

    fn binary_metamethod_or(
        &mut self,
        cur: &mut Cursor,
        kind: MetaMethod,
        a: Value,
        b: Value,
        message: &str,
    ) -> VmResult<()> {
        let mut method = self.metamethod(a, kind);
        if method.is_nil() {
            method = self.metamethod(b, kind);
        }
        if method.is_nil() {
            return Err(VmError::runtime(message));
        }
        self.call_binary_metamethod(cur, method, a, b)
    }

    /// Merges two tables: array parts concatenated, hash parts unioned
    /// with the right side winning.
    pub(super) fn table_add(&mut self, a: TableId, b: TableId, result: TableId) {
        let len_a = self.heap.table(a).data.sequence_len();
        let len_b = self.heap.table(b).data.sequence_len();
        for i in 1..=len_a {
            let value = self.heap.table_get_array(a, i as i64).unwrap_or(Value::Nil);
            self.heap.table_set_array(result, i as i64, value);
        }
        for i in 1..=len_b {
            let value = self.heap.table_get_array(b, i as i64).unwrap_or(Value::Nil);
            self.heap
                .table_set_array(result, (len_a + i) as i64, value);
        }
        let entries_a: Vec<_> = self.heap.table(a).data.iter_hash().collect();
        let entries_b: Vec<_> = self.heap.table(b).data.iter_hash().collect();
        for (key, value) in entries_a.into_iter().chain(entries_b) {
            self.heap.table_set(result, key, value);
        }
    }

    pub(crate) fn op_add(&mut self, cur: &mut Cursor) -> VmResult<()> {
        if let (Value::Str(_), Value::Str(_)) = (self.peek(0), self.peek(1)) {
            let (Value::Str(b), Value::Str(a)) = (self.pop(), self.pop()) else {
                return Err(VmError::runtime("Internal error: string pair vanished."));
            };
            let joined = self.heap.concat_strings(a, b);
            self.push(Value::Str(joined));
            return Ok(());
        }
        if let (Value::Number(b), Value::Number(a)) = (self.peek(0), self.peek(1)) {
            self.pop();
            self.pop();
            self.push(Value::Number(a + b));
            return Ok(());
        }
        if let (Value::Table(b), Value::Table(a)) = (self.peek(0), self.peek(1)) {
            self.pop();
            self.pop();
            let result = self.heap.new_table();
            self.push(Value::Table(result));
            self.table_add(a, b, result);
            return Ok(());
        }
        let b = self.pop();
        let a = self.pop();
        self.binary_metamethod_or(
            cur,
            MetaMethod::Add,
            a,
            b,
            "Operands must be two numbers or two strings.",
        )
    }

    pub(crate) fn op_add_const(&mut self, cur: &mut Cursor, b: Value) -> VmResult<()> {
        let a = self.peek(0);
        match (a, b) {
            (Value::Str(sa), Value::Str(sb)) => {
                self.pop();
                let joined = self.heap.concat_strings(sa, sb);
                self.push(Value::Str(joined));
                Ok(())
            }
            (Value::Number(na), Value::Number(nb)) => {
                self.pop();
                self.push(Value::Number(na + nb));
                Ok(())
            }
            (Value::Table(ta), Value::Table(tb)) => {
                self.pop();
                let result = self.heap.new_table();
                self.push(Value::Table(result));
                self.table_add(ta, tb, result);
                Ok(())
            }
            _ => {
                self.pop();
                self.binary_metamethod_or(
                    cur,
                    MetaMethod::Add,
                    a,
                    b,
                    "Operands must be two numbers or two strings.",
                )
            }
        }
    }

    /// Shared path for `SubConst`/`MulConst`/`DivConst`/`ModConst`.
    pub(crate) fn op_binary_const(
        &mut self,
        cur: &mut Cursor,
        b: Value,
        kind: MetaMethod,
    ) -> VmResult<()> {
        let a = self.pop();
        if let (Value::Number(na), Value::Number(nb)) = (a, b) {
            self.push(Value::Number(numeric_binary(kind, na, nb)));
            return Ok(());
        }
        self.binary_metamethod_or(cur, kind, a, b, "Operands must be numbers.")
    }

    pub(crate) fn op_subtract(&mut self, cur: &mut Cursor) -> VmResult<()> {
        self.simple_binary(cur, MetaMethod::Sub)
    }

    pub(crate) fn op_multiply(&mut self, cur: &mut Cursor) -> VmResult<()> {
        self.simple_binary(cur, MetaMethod::Mul)
    }

    pub(crate) fn op_divide(&mut self, cur: &mut Cursor) -> VmResult<()> {
        self.simple_binary(cur, MetaMethod::Div)
    }

    pub(crate) fn op_modulo(&mut self, cur: &mut Cursor) -> VmResult<()> {
        self.simple_binary(cur, MetaMethod::Mod)
    }

    pub(crate) fn op_power(&mut self, cur: &mut Cursor) -> VmResult<()> {
        self.simple_binary(cur, MetaMethod::Pow)
    }

    pub(crate) fn op_int_div(&mut self, cur: &mut Cursor) -> VmResult<()> {
        self.simple_binary(cur, MetaMethod::IntDiv)
    }

    fn simple_binary(&mut self, cur: &mut Cursor, kind: MetaMethod) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        if let (Value::Number(na), Value::Number(nb)) = (a, b) {
            self.push(Value::Number(numeric_binary(kind, na, nb)));
            return Ok(());
        }
        self.binary_metamethod_or(cur, kind, a, b, "Operands must be numbers.")
    }

    pub(crate) fn op_negate(&mut self) -> VmResult<()> {
        match self.pop() {
            Value::Number(n) => {
                self.push(Value::Number(-n));
                Ok(())
            }
            _ => Err(VmError::runtime("Operand must be a number.")),
        }
    }

    pub(crate) fn op_not(&mut self) {
        let value = self.pop();
        let falsey = self.heap.is_falsey(value);
        self.push(Value::Bool(falsey));
    }

    pub(crate) fn op_length(&mut self) -> VmResult<()> {
        match self.pop() {
            Value::Str(id) => {
                self.push(Value::Number(self.heap.string(id).len() as f64));
                Ok(())
            }
            Value::Table(id) => {
                let table = &self.heap.table(id).data;
                let count = table.live_entries() + table.array_len();
                self.push(Value::Number(count as f64));
                Ok(())
            }
            _ => Err(VmError::runtime("Length operator (#) requires string or table.")),
        }
    }
}

/// Numeric core for the fused binary kinds. Integer modulo follows the C99
/// `%` convention when both operands are exact integers with a nonzero
/// divisor, else falls back to fmod.
pub(crate) fn numeric_binary(kind: MetaMethod, a: f64, b: f64) -> f64 {
    match kind {
        MetaMethod::Add => a + b,
        MetaMethod::Sub => a - b,
        MetaMethod::Mul => a * b,
        MetaMethod::Div => a / b,
        MetaMethod::Pow => a.powf(b),
        MetaMethod::IntDiv => (a / b).floor(),
        MetaMethod::Mod => match (to_int64(a), to_int64(b)) {
            (Some(ia), Some(ib)) if ib != 0 => (ia % ib) as f64,
            _ => a % b,
        },
        _ => f64::NAN,
    }
}
