//! Comparison and membership opcodes.

use super::{Cursor, MetaMethod, Vm};
use crate::error::{VmError, VmResult};
use crate::heap::{StringId, TableId};
use crate::value::Value;

impl Vm {
    pub(crate) fn op_equal(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        if self.heap.values_equal_simple(a, b) {
            self.push(Value::Bool(true));
            return Ok(());
        }
        let mut method = self.metamethod(a, MetaMethod::Eq);
        if method.is_nil() {
            method = self.metamethod(b, MetaMethod::Eq);
        }
        if !method.is_nil() {
            return self.call_binary_metamethod(cur, method, a, b);
        }
        self.push(Value::Bool(false));
        Ok(())
    }

    pub(crate) fn op_greater(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        if let (Value::Number(na), Value::Number(nb)) = (a, b) {
            self.push(Value::Bool(na > nb));
            return Ok(());
        }
        // `a > b` is `__lt(b, a)`.
        let mut method = self.metamethod(a, MetaMethod::Lt);
        if method.is_nil() {
            method = self.metamethod(b, MetaMethod::Lt);
        }
        if !method.is_nil() {
            return self.call_binary_metamethod(cur, method, b, a);
        }
        self.push(Value::Bool(false));
        Ok(())
    }

    pub(crate) fn op_less(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        if let (Value::Number(na), Value::Number(nb)) = (a, b) {
            self.push(Value::Bool(na < nb));
            return Ok(());
        }
        let mut method = self.metamethod(a, MetaMethod::Lt);
        if method.is_nil() {
            method = self.metamethod(b, MetaMethod::Lt);
        }
        if !method.is_nil() {
            return self.call_binary_metamethod(cur, method, a, b);
        }
        self.push(Value::Bool(false));
        Ok(())
    }

    fn string_contains(&self, haystack: StringId, needle: StringId) -> bool {
        let needle = &self.heap.string(needle).chars;
        if needle.is_empty() {
            return true;
        }
        self.heap.string(haystack).chars.contains(needle.as_str())
    }

    fn table_contains(&self, table: TableId, needle: Value) -> bool {
        let table = &self.heap.table(table).data;
        for &value in table.array_slots() {
            if !value.is_nil() && self.heap.values_equal_simple(value, needle) {
                return true;
            }
        }
        table
            .iter_hash()
            .any(|(_, value)| self.heap.values_equal_simple(value, needle))
    }

    /// `a has b`: containment on the left operand.
    pub(crate) fn op_has(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        self.contains_check(cur, a, b, "has")
    }

    /// `a in b`: containment on the right operand.
    pub(crate) fn op_in(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();
        self.contains_check(cur, b, a, "in")
    }

    fn contains_check(
        &mut self,
        cur: &mut Cursor,
        container: Value,
        needle: Value,
        operator: &str,
    ) -> VmResult<()> {
        let mut method = self.metamethod(container, MetaMethod::Has);
        if method.is_nil() {
            method = self.metamethod(needle, MetaMethod::Has);
        }
        if !method.is_nil() {
            return self.call_binary_metamethod(cur, method, container, needle);
        }
        match container {
            Value::Str(haystack) => {
                let Value::Str(sub) = needle else {
                    return Err(VmError::runtime(format!(
                        "String '{operator}' requires a string operand."
                    )));
                };
                let found = self.string_contains(haystack, sub);
                self.push(Value::Bool(found));
                Ok(())
            }
            Value::Table(table) => {
                let found = self.table_contains(table, needle);
                self.push(Value::Bool(found));
                Ok(())
            }
            _ => Err(VmError::runtime(format!(
                "Operand of '{operator}' must be a string or table."
            ))),
        }
    }
}
