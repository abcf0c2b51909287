//! The `Print` opcode and value rendering.
//!
//! `print` writes the canonical form of §-style value printing: numbers
//! with trailing zeros trimmed, top-level strings raw, tables as
//! `{v, k: v}` with the array part first. A `__str` metamethod is driven
//! through a bounded reentrant run.

use super::{Cursor, MetaMethod, Vm};
use crate::error::{VmError, VmResult};
use crate::value::{format_number, number_to_string, Value};

/// Which number style a rendering uses: `print` trims fixed-point,
/// `str()` keeps full round-trip precision.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum NumberStyle {
    Print,
    Str,
}

impl Vm {
    pub(crate) fn op_print(&mut self, cur: &mut Cursor, count: usize) -> VmResult<()> {
        if count == 0 {
            self.write_output("\n");
            return Ok(());
        }
        self.flush(cur);
        let base = self.thread().top - count;
        for i in 0..count {
            let value = self.heap.thread(self.current).stack[base + i];
            let text = self.printable_text(value)?;
            self.write_output(&text);
            if i + 1 < count {
                self.write_output(" ");
            }
        }
        self.write_output("\n");
        self.thread_mut().set_top(base);
        self.reload_into(cur)?;
        Ok(())
    }

    /// Renders one value for `print`, consulting `__str`.
    fn printable_text(&mut self, value: Value) -> VmResult<String> {
        let method = self.metamethod(value, MetaMethod::Str);
        if method.is_callable() {
            self.push(method);
            self.push(value);
            self.call_function(method, 1)?;
            let result = self.pop();
            return Ok(match result {
                Value::Str(id) => self.heap.string(id).chars.clone(),
                other => self.render_value(other, 0, NumberStyle::Print),
            });
        }
        Ok(match value {
            Value::Str(id) => self.heap.string(id).chars.clone(),
            other => self.render_value(other, 0, NumberStyle::Print),
        })
    }

    /// Converts a value to its `str()` form, consulting `__str`.
    pub(crate) fn stringify(&mut self, value: Value) -> VmResult<String> {
        let method = self.metamethod(value, MetaMethod::Str);
        if method.is_callable() {
            self.push(method);
            self.push(value);
            self.call_function(method, 1)?;
            let result = self.pop();
            return match result {
                Value::Str(id) => Ok(self.heap.string(id).chars.clone()),
                _ => Err(VmError::runtime("str() must return a string.")),
            };
        }
        Ok(match value {
            Value::Str(id) => self.heap.string(id).chars.clone(),
            other => self.render_value(other, 0, NumberStyle::Str),
        })
    }

    /// Pure rendering, no metamethods. Nested strings are quoted; tables
    /// print their array part first, then `key: value` pairs.
    pub(crate) fn render_value(&self, value: Value, depth: usize, style: NumberStyle) -> String {
        if depth > 5 {
            return "...".to_string();
        }
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => match style {
                NumberStyle::Print => format_number(n),
                NumberStyle::Str => number_to_string(n),
            },
            Value::Str(id) => format!("\"{}\"", self.heap.string(id).chars),
            Value::Table(id) => {
                let table = &self.heap.table(id).data;
                let mut out = String::from("{");
                let mut count = 0usize;
                let slots = table.array_slots();
                let last_non_nil = slots.iter().rposition(|v| !v.is_nil());
                if let Some(last) = last_non_nil {
                    for &element in &slots[..=last] {
                        if count > 0 {
                            out.push_str(", ");
                        }
                        out.push_str(&self.render_value(element, depth + 1, style));
                        count += 1;
                    }
                }
                for (key, entry) in table.iter_hash() {
                    if entry.is_nil() {
                        continue;
                    }
                    if count > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&self.heap.string(key).chars);
                    out.push_str(": ");
                    out.push_str(&self.render_value(entry, depth + 1, style));
                    count += 1;
                }
                out.push('}');
                out
            }
            Value::Function(id) => self.function_text(id),
            Value::Closure(id) => self.function_text(self.heap.closure(id).function),
            Value::Native(id) => {
                let name = self.heap.native(id).name;
                format!("<native fn {}>", self.heap.string(name).chars)
            }
            Value::Thread(_) => "thread".to_string(),
            Value::BoundMethod(_) => "<bound method>".to_string(),
            Value::Userdata(id) => {
                let userdata = self.heap.userdata(id);
                let type_name = userdata.metatable.and_then(|meta| {
                    match self.heap.table_get(meta, self.names.meta_name_key) {
                        Some(Value::Str(name)) => Some(self.heap.string(name).chars.clone()),
                        _ => None,
                    }
                });
                let name = type_name.unwrap_or_else(|| "userdata".to_string());
                if userdata.data.is_some() {
                    format!("<{name} 0x{:x}>", id.0)
                } else {
                    format!("<{name} closed>")
                }
            }
        }
    }

    fn function_text(&self, id: crate::heap::FunctionId) -> String {
        match self.heap.function(id).name {
            Some(name) => format!("<fn {}>", self.heap.string(name).chars),
            None => "<script>".to_string(),
        }
    }
}
