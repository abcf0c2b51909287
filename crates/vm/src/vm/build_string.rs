//! The `BuildString` opcode: interpolation parts concatenated into one
//! string, with non-primitive parts routed through `str()` semantics.

use super::{Cursor, Vm};
use crate::error::VmResult;
use crate::value::{number_to_string, Value};

impl Vm {
    pub(crate) fn op_build_string(&mut self, cur: &mut Cursor, parts: usize) -> VmResult<()> {
        if parts == 0 {
            let empty = self.heap.alloc_str("");
            self.push(Value::Str(empty));
            return Ok(());
        }

        self.flush(cur);
        let base = self.thread().top - parts;
        let mut buffer = String::new();
        for i in 0..parts {
            // Parts stay on the stack so a __str reentry cannot free them.
            let part = self.heap.thread(self.current).stack[base + i];
            match part {
                Value::Str(id) => buffer.push_str(&self.heap.string(id).chars),
                Value::Number(n) => buffer.push_str(&number_to_string(n)),
                Value::Bool(b) => buffer.push_str(if b { "true" } else { "false" }),
                Value::Nil => buffer.push_str("nil"),
                other => {
                    let text = self.stringify(other)?;
                    buffer.push_str(&text);
                }
            }
        }
        self.thread_mut().set_top(base);
        self.reload_into(cur)?;

        let result = self.heap.alloc_string(buffer);
        self.push(Value::Str(result));
        self.maybe_collect();
        Ok(())
    }
}
