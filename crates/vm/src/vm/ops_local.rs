//! Local-slot superinstructions produced by the peephole optimizer.
//!
//! When a metamethod has to stand in for the fused numeric path, the
//! result cannot be stored into the local until the metamethod returns;
//! the pending set-local side stack defers that store to the frame return.

use super::ops_arith::numeric_binary;
use super::{Cursor, MetaMethod, Vm};
use crate::error::{VmError, VmResult};
use crate::value::Value;

impl Vm {
    pub(crate) fn op_inc_local(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let slot = cur.read_byte() as usize;
        let constant = cur.read_constant();
        let value = self.heap.thread(self.current).stack[cur.slots + slot];
        let (Value::Number(a), Value::Number(b)) = (value, constant) else {
            return Err(VmError::runtime("Operands must be two numbers."));
        };
        let out = Value::Number(a + b);
        self.heap.thread_mut(self.current).stack[cur.slots + slot] = out;
        self.push(out);
        Ok(())
    }

    /// `SubLocalConst` and friends: `local OP constant`, stored back.
    pub(crate) fn op_local_const(&mut self, cur: &mut Cursor, kind: MetaMethod) -> VmResult<()> {
        let slot = cur.read_byte() as usize;
        let constant = cur.read_constant();
        let a = self.heap.thread(self.current).stack[cur.slots + slot];
        if let (Value::Number(na), Value::Number(nb)) = (a, constant) {
            let out = Value::Number(numeric_binary(kind, na, nb));
            self.heap.thread_mut(self.current).stack[cur.slots + slot] = out;
            self.push(out);
            return Ok(());
        }
        self.metamethod_set_local(cur, kind, a, constant, slot)
    }

    pub(crate) fn op_add_set_local(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let slot = cur.read_byte() as usize;
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Str(sa), Value::Str(sb)) => {
                let joined = self.heap.concat_strings(sa, sb);
                self.push(Value::Str(joined));
                let value = self.peek(0);
                self.heap.thread_mut(self.current).stack[cur.slots + slot] = value;
                Ok(())
            }
            (Value::Number(na), Value::Number(nb)) => {
                let out = Value::Number(na + nb);
                self.heap.thread_mut(self.current).stack[cur.slots + slot] = out;
                self.push(out);
                Ok(())
            }
            (Value::Table(ta), Value::Table(tb)) => {
                let result = self.heap.new_table();
                self.push(Value::Table(result));
                self.table_add(ta, tb, result);
                let value = self.peek(0);
                self.heap.thread_mut(self.current).stack[cur.slots + slot] = value;
                Ok(())
            }
            _ => self.metamethod_set_local_message(
                cur,
                MetaMethod::Add,
                a,
                b,
                slot,
                "Operands must be two numbers or two strings.",
            ),
        }
    }

    pub(crate) fn op_binary_set_local(&mut self, cur: &mut Cursor, kind: MetaMethod) -> VmResult<()> {
        let slot = cur.read_byte() as usize;
        let b = self.pop();
        let a = self.pop();
        if let (Value::Number(na), Value::Number(nb)) = (a, b) {
            let out = Value::Number(numeric_binary(kind, na, nb));
            self.heap.thread_mut(self.current).stack[cur.slots + slot] = out;
            self.push(out);
            return Ok(());
        }
        self.metamethod_set_local(cur, kind, a, b, slot)
    }

    fn metamethod_set_local(
        &mut self,
        cur: &mut Cursor,
        kind: MetaMethod,
        a: Value,
        b: Value,
        slot: usize,
    ) -> VmResult<()> {
        self.metamethod_set_local_message(cur, kind, a, b, slot, "Operands must be numbers.")
    }

    fn metamethod_set_local_message(
        &mut self,
        cur: &mut Cursor,
        kind: MetaMethod,
        a: Value,
        b: Value,
        slot: usize,
        message: &str,
    ) -> VmResult<()> {
        let mut method = self.metamethod(a, kind);
        if method.is_nil() {
            method = self.metamethod(b, kind);
        }
        if method.is_nil() {
            return Err(VmError::runtime(message));
        }
        self.push(method);
        self.push(a);
        self.push(b);
        self.push_pending_set_local(slot)?;
        self.call_value_cursor(cur, method, 2)
    }
}
