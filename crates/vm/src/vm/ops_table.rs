//! Table opcodes and the `__index`/`__newindex` metamethod chains.

use super::{Cursor, MetaMethod, Vm};
use crate::chunk::TableCache;
use crate::error::{VmError, VmResult};
use crate::heap::TableId;
use crate::value::{to_int64, Value};

impl Vm {
    /// Resolves `__index` on a receiver's metatable. Callable handlers run
    /// to completion; table handlers are walked as a bounded chain.
    fn index_metamethod(
        &mut self,
        cur: &mut Cursor,
        receiver: Value,
        key: Value,
    ) -> VmResult<Option<Value>> {
        let handler = self.metamethod(receiver, MetaMethod::Index);
        if handler.is_callable() {
            self.flush(cur);
            self.push(handler);
            self.push(receiver);
            self.push(key);
            self.call_function(handler, 2)?;
            self.reload_into(cur)?;
            return Ok(Some(self.pop()));
        }
        if let Value::Table(start) = handler {
            let mut table = start;
            // The chain is bounded to keep pathological metatables finite.
            for _ in 0..10 {
                let found = match key {
                    Value::Str(id) => self.heap.table_get(table, id),
                    Value::Number(n) => {
                        let direct = to_int64(n)
                            .filter(|&i| i >= 1)
                            .and_then(|i| self.heap.table_get_array(table, i));
                        match direct {
                            Some(value) => Some(value),
                            None => {
                                let n_key = self.heap.number_key(n);
                                self.heap.table_get(table, n_key)
                            }
                        }
                    }
                    _ => None,
                };
                if let Some(value) = found {
                    return Ok(Some(value));
                }
                match self.metamethod(Value::Table(table), MetaMethod::Index) {
                    Value::Table(next) => table = next,
                    _ => break,
                }
            }
            return Ok(Some(Value::Nil));
        }
        Ok(None)
    }

    /// Resolves `__newindex`; returns false when the write should fall
    /// through to a direct insert.
    fn newindex_metamethod(
        &mut self,
        cur: &mut Cursor,
        receiver: Value,
        key: Value,
        value: Value,
    ) -> VmResult<bool> {
        let handler = self.metamethod(receiver, MetaMethod::NewIndex);
        if handler.is_callable() {
            self.flush(cur);
            self.push(handler);
            self.push(receiver);
            self.push(key);
            self.push(value);
            self.call_function(handler, 3)?;
            self.reload_into(cur)?;
            self.pop();
            return Ok(true);
        }
        if let Value::Table(target) = handler {
            match key {
                Value::Str(id) => {
                    self.heap.table_set(target, id, value);
                }
                Value::Number(n) => {
                    let n_key = self.heap.number_key(n);
                    self.heap.table_set(target, n_key, value);
                }
                _ => return Ok(false),
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Resolves a negative 1-based index against the sequence length.
    fn adjust_negative_index(&self, table: TableId, index: i64) -> i64 {
        if index >= 0 {
            return index;
        }
        let len = self.heap.table(table).data.sequence_len() as i64;
        len + index + 1
    }

    pub(crate) fn op_get_table(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let op_offset = cur.ip - 1;
        let key = self.pop();
        let receiver = self.pop();

        match receiver {
            Value::Table(table) => match key {
                Value::Str(key_id) => {
                    let version = self.heap.table(table).version;
                    if let Some(slot) = cur.chunk.table_cache.get(op_offset) {
                        let cache = slot.get();
                        if cache.table == Some(table)
                            && cache.version == version
                            && cache.key == Some(key_id)
                        {
                            let bound = self.maybe_bind_self(receiver, cache.value);
                            self.push(bound);
                            self.maybe_collect();
                            return Ok(());
                        }
                    }
                    let result = if let Some(value) = self.heap.table_get(table, key_id) {
                        if let Some(slot) = cur.chunk.table_cache.get(op_offset) {
                            slot.set(TableCache {
                                version,
                                table: Some(table),
                                key: Some(key_id),
                                value,
                            });
                        }
                        value
                    } else if self.heap.table(table).metatable.is_some() {
                        self.index_metamethod(cur, receiver, key)?.unwrap_or(Value::Nil)
                    } else {
                        Value::Nil
                    };
                    let bound = self.maybe_bind_self(receiver, result);
                    self.push(bound);
                }
                Value::Number(n) => {
                    if let Some(index) = to_int64(n) {
                        let index = self.adjust_negative_index(table, index);
                        if let Some(value) = self.heap.table_get_array(table, index) {
                            let bound = self.maybe_bind_self(receiver, value);
                            self.push(bound);
                            self.maybe_collect();
                            return Ok(());
                        }
                    }
                    let n_key = self.heap.number_key(n);
                    let result = if let Some(value) = self.heap.table_get(table, n_key) {
                        value
                    } else if self.heap.table(table).metatable.is_some() {
                        self.index_metamethod(cur, receiver, key)?.unwrap_or(Value::Nil)
                    } else {
                        Value::Nil
                    };
                    let bound = self.maybe_bind_self(receiver, result);
                    self.push(bound);
                }
                _ => self.push(Value::Nil),
            },
            Value::Userdata(_) => {
                let result = self.index_metamethod(cur, receiver, key)?.unwrap_or(Value::Nil);
                let bound = self.maybe_bind_self(receiver, result);
                self.push(bound);
            }
            Value::Str(string) => match key {
                Value::Str(key_id) => {
                    // String methods live in the `string` module, loaded
                    // lazily through the native registry.
                    let module = self.string_module()?;
                    let result = self
                        .heap
                        .table_get(module, key_id)
                        .unwrap_or(Value::Nil);
                    let bound = self.maybe_bind_self(receiver, result);
                    self.push(bound);
                }
                Value::Number(n) => {
                    let result = match to_int64(n) {
                        Some(mut index) => {
                            let len = self.heap.string(string).len() as i64;
                            if index < 0 {
                                index = len + index + 1;
                            }
                            if index >= 1 && index <= len {
                                let ch = self.heap.string(string).chars.as_bytes()
                                    [(index - 1) as usize];
                                let id = self.heap.alloc_string((ch as char).to_string());
                                Value::Str(id)
                            } else {
                                Value::Nil
                            }
                        }
                        None => Value::Nil,
                    };
                    self.push(result);
                }
                _ => self.push(Value::Nil),
            },
            _ => return Err(VmError::runtime("Attempt to index non-table.")),
        }
        self.maybe_collect();
        Ok(())
    }

    pub(crate) fn op_set_table(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let value = self.pop();
        let key = self.pop();
        let receiver = self.pop();

        let Value::Table(table) = receiver else {
            return Err(VmError::runtime("Attempt to index non-table."));
        };

        match key {
            Value::Str(key_id) => {
                if self.heap.table_get(table, key_id).is_some() {
                    self.heap.table_set(table, key_id, value);
                } else if self.heap.table(table).metatable.is_some() {
                    if !self.newindex_metamethod(cur, receiver, key, value)? {
                        self.heap.table_set(table, key_id, value);
                    }
                } else {
                    self.heap.table_set(table, key_id, value);
                }
            }
            Value::Number(n) => {
                let mut handled = false;
                if let Some(index) = to_int64(n) {
                    let index = self.adjust_negative_index(table, index);
                    if self.heap.table_set_array(table, index, value) {
                        handled = true;
                    }
                }
                if !handled {
                    let n_key = self.heap.number_key(n);
                    if self.heap.table_get(table, n_key).is_some() {
                        self.heap.table_set(table, n_key, value);
                    } else if self.heap.table(table).metatable.is_some() {
                        if !self.newindex_metamethod(cur, receiver, key, value)? {
                            self.heap.table_set(table, n_key, value);
                        }
                    } else {
                        self.heap.table_set(table, n_key, value);
                    }
                }
            }
            _ => return Err(VmError::runtime("Invalid table key type.")),
        }

        self.push(value);
        self.maybe_collect();
        Ok(())
    }

    pub(crate) fn op_delete_table(&mut self) -> VmResult<()> {
        let key = self.pop();
        let receiver = self.pop();
        let Value::Table(table) = receiver else {
            return Err(VmError::runtime("Attempt to index non-table."));
        };
        match key {
            Value::Str(key_id) => {
                if !self.heap.table_delete(table, key_id) {
                    return Err(VmError::runtime("Key not found."));
                }
                Ok(())
            }
            Value::Number(n) => {
                if let Some(index) = to_int64(n) {
                    let index = self.adjust_negative_index(table, index);
                    if self.heap.table_get_array(table, index).is_some() {
                        self.heap.table_set_array(table, index, Value::Nil);
                        return Ok(());
                    }
                }
                let n_key = self.heap.number_key(n);
                if !self.heap.table_delete(table, n_key) {
                    return Err(VmError::runtime("Key not found."));
                }
                Ok(())
            }
            _ => Err(VmError::runtime("Invalid key type for deletion.")),
        }
    }

    pub(crate) fn op_append(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let b = self.pop();
        let a = self.pop();

        let method = self.metamethod(a, MetaMethod::Append);
        if !method.is_nil() {
            return self.call_binary_metamethod(cur, method, a, b);
        }

        if let Value::Table(table) = a {
            let index = self.heap.table(table).data.array_max() as i64 + 1;
            if !self.heap.table_set_array(table, index, b) {
                let key = self.heap.number_key(index as f64);
                self.heap.table_set(table, key, b);
            }
            self.push(Value::Number(index as f64));
            return Ok(());
        }

        let method = self.metamethod(b, MetaMethod::Append);
        if !method.is_nil() {
            return self.call_binary_metamethod(cur, method, a, b);
        }

        Err(VmError::runtime("Left operand must be a table or define __append."))
    }

    pub(crate) fn op_get_meta_table(&mut self) -> VmResult<()> {
        let value = self.pop();
        let metatable = match value {
            Value::Table(id) => self.heap.table(id).metatable,
            Value::Userdata(id) => self.heap.userdata(id).metatable,
            _ => None,
        };
        self.push(match metatable {
            Some(id) => Value::Table(id),
            None => Value::Nil,
        });
        Ok(())
    }

    /// `SetMetatable` attaches `peek(1)` as the metatable of `peek(0)` and
    /// runs a `__new` constructor when the chain provides one.
    pub(crate) fn op_set_metatable(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let table_val = self.peek(0);
        let meta_val = self.peek(1);
        let Value::Table(table) = table_val else {
            return Err(VmError::runtime("Invalid arguments to setmetatable."));
        };
        let metatable = match meta_val {
            Value::Table(id) => Some(id),
            Value::Nil => None,
            _ => return Err(VmError::runtime("Invalid arguments to setmetatable.")),
        };
        let entry = self.heap.table_mut(table);
        entry.metatable = metatable;
        entry.version = entry.version.wrapping_add(1);

        if let Some(meta) = metatable {
            let mut init = self.find_property(table, self.names.new);
            if init.is_nil() {
                init = self.heap.table_get(meta, self.names.new).unwrap_or(Value::Nil);
            }
            if init.is_callable() {
                self.pop();
                self.pop();
                self.push(init);
                self.push(meta_val);
                self.push(table_val);
                return self.call_value_cursor(cur, init, 2);
            }
        }

        self.pop();
        self.pop();
        self.push(table_val);
        Ok(())
    }

    /// Property lookup through the `__index` table chain, bounded.
    fn find_property(&self, table: TableId, key: crate::heap::StringId) -> Value {
        if let Some(value) = self.heap.table_get(table, key) {
            return value;
        }
        let mut current = table;
        for _ in 0..10 {
            let Some(meta) = self.heap.table(current).metatable else {
                break;
            };
            match self.heap.table_get(meta, self.names.index) {
                Some(Value::Table(next)) => {
                    if let Some(value) = self.heap.table_get(next, key) {
                        return value;
                    }
                    current = next;
                }
                _ => break,
            }
        }
        Value::Nil
    }
}
