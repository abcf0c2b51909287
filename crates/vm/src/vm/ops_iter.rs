//! Iteration preludes, ranges, and slicing.
//!
//! `for … in` loops drive a `(next, state, control)` triple left on the
//! stack by one of the prelude opcodes; each step calls
//! `next(state, control)` and stops on a nil control value.

use super::{Cursor, MetaMethod, Vm};
use crate::error::{VmError, VmResult};
use crate::value::{to_int64, Value};

impl Vm {
    fn iterator_next_function(&mut self, iterable: Value) -> Value {
        if let Value::Thread(_) = iterable {
            // Generators are stepped through the gen_next global.
            let next = self
                .get_global(self.names.gen_next_fn)
                .unwrap_or(Value::Nil);
            if next.is_callable() {
                return next;
            }
            return Value::Nil;
        }
        if let Value::Table(table) = iterable {
            // A `__next` key directly on the table wins over the metatable.
            if let Some(next) = self.heap.table_get(table, self.names.next) {
                if next.is_callable() {
                    return next;
                }
            }
        }
        let next = self.metamethod(iterable, MetaMethod::Next);
        if next.is_callable() {
            next
        } else {
            Value::Nil
        }
    }

    pub(crate) fn op_iter_prep(&mut self) -> VmResult<()> {
        let value = self.peek(0);
        let next_method = self.iterator_next_function(value);
        if next_method.is_callable() {
            self.pop();
            self.push(next_method);
            self.push(value);
            self.push(Value::Nil);
            return Ok(());
        }

        if matches!(value, Value::Table(_) | Value::Str(_)) {
            let next = self
                .get_global(self.names.next_fn)
                .ok_or_else(|| VmError::runtime("Global 'next' not found for implicit iteration."))?;
            if !next.is_callable() {
                return Err(VmError::runtime("Global 'next' is not a function."));
            }
            self.pop();
            self.push(next);
            self.push(value);
            self.push(Value::Nil);
            return Ok(());
        }

        Err(VmError::runtime("Value is not iterable."))
    }

    pub(crate) fn op_iter_prep_ipairs(&mut self) -> VmResult<()> {
        let value = self.peek(0);
        let Value::Table(_) = value else {
            return Err(VmError::runtime("Value is not iterable."));
        };
        let inext = self
            .get_global(self.names.inext_fn)
            .ok_or_else(|| VmError::runtime("Global 'inext' not found for implicit iteration."))?;
        if !inext.is_callable() {
            return Err(VmError::runtime("Global 'inext' is not a function."));
        }
        self.pop();
        self.push(inext);
        self.push(value);
        self.push(Value::Number(0.0));
        Ok(())
    }

    /// `a..b` — delegates to the global `range`, which leaves an iterator
    /// triple behind.
    pub(crate) fn op_range(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let end = self.pop();
        let start = self.pop();
        let range = self
            .get_global(self.names.range_fn)
            .ok_or_else(|| VmError::runtime("range not found."))?;
        self.push(range);
        self.push(start);
        self.push(end);
        if !range.is_callable() {
            return Err(VmError::runtime("Can only call functions."));
        }
        self.call_value_cursor(cur, range, 2)
    }

    pub(crate) fn op_slice(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let mut step = self.pop();
        let mut end = self.pop();
        let mut start = self.pop();
        let receiver = self.pop();

        if step.is_nil() {
            step = Value::Number(1.0);
        }
        let Value::Number(step_num) = step else {
            return Err(VmError::runtime("slice step must be a number."));
        };
        if step_num == 0.0 {
            return Err(VmError::runtime("slice step cannot be 0."));
        }

        let handler = self.metamethod(receiver, MetaMethod::Slice);
        if !handler.is_nil() {
            if !handler.is_callable() {
                return Err(VmError::runtime("__slice must be a function."));
            }
            self.push(handler);
            self.push(receiver);
            self.push(start);
            self.push(end);
            self.push(step);
            return self.call_value_cursor(cur, handler, 4);
        }

        let len = match receiver {
            Value::Table(table) => self.heap.table(table).data.sequence_len() as i64,
            Value::Str(string) => self.heap.string(string).len() as i64,
            _ => return Err(VmError::runtime("slice expects table or string.")),
        };

        if start.is_nil() {
            start = Value::Number(if step_num < 0.0 { len as f64 } else { 1.0 });
        }
        if end.is_nil() {
            end = Value::Number(if step_num < 0.0 { 1.0 } else { len as f64 });
        }
        let (Value::Number(raw_start), Value::Number(raw_end)) = (start, end) else {
            return Err(VmError::runtime("slice start/end must be numbers."));
        };
        let (Some(mut start_int), Some(mut end_int)) = (to_int64(raw_start), to_int64(raw_end))
        else {
            return Err(VmError::runtime("slice start/end must be integer for '..' syntax."));
        };
        if start_int < 0 {
            start_int = len + start_int + 1;
        }
        if end_int < 0 {
            end_int = len + end_int;
        }

        let slice = self
            .get_global(self.names.slice_fn)
            .ok_or_else(|| VmError::runtime("slice not found."))?;
        if !slice.is_callable() {
            return Err(VmError::runtime("Can only call functions."));
        }
        self.push(slice);
        self.push(receiver);
        self.push(Value::Number(start_int as f64));
        self.push(Value::Number(end_int as f64));
        self.push(step);
        self.call_value_cursor(cur, slice, 4)
    }
}
