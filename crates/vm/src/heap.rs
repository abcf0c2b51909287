//! The garbage-collected heap.
//!
//! Objects live in typed arenas addressed by index handles; cross-object
//! edges are handles, never Rust references, so reference cycles (threads
//! holding closures holding upvalues into thread stacks) are collected by
//! the stop-the-world mark/sweep pass below. The collector is triggered by
//! allocation pressure: once `bytes_allocated` crosses `next_gc`, the VM
//! assembles its root set and calls [`Heap::collect`].

use log::debug;

use crate::object::{
    BoundMethodObject, ClosureObject, FunctionObject, NativeObject, StrObject, TableObject,
    ThreadObject, UpvalueObject, UpvalueState, UserdataObject,
};
use crate::table::{hash_bytes, number_key_text};
use crate::value::Value;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) u32);
    };
}

define_id!(
    /// Handle to an immutable string.
    StringId
);
define_id!(
    /// Handle to a table.
    TableId
);
define_id!(
    /// Handle to a compiled function.
    FunctionId
);
define_id!(
    /// Handle to a native function.
    NativeId
);
define_id!(
    /// Handle to a closure.
    ClosureId
);
define_id!(
    /// Handle to an upvalue.
    UpvalueId
);
define_id!(
    /// Handle to a thread.
    ThreadId
);
define_id!(
    /// Handle to a userdata.
    UserdataId
);
define_id!(
    /// Handle to a bound method.
    BoundMethodId
);

/// A heap edge, used as a GC root or worklist entry.
#[derive(Debug, Clone, Copy)]
pub enum GcRef {
    Str(StringId),
    Table(TableId),
    Function(FunctionId),
    Native(NativeId),
    Closure(ClosureId),
    Upvalue(UpvalueId),
    Thread(ThreadId),
    Userdata(UserdataId),
    BoundMethod(BoundMethodId),
}

impl GcRef {
    /// The edge a value contributes, if any.
    pub fn of(value: Value) -> Option<GcRef> {
        match value {
            Value::Nil | Value::Bool(_) | Value::Number(_) => None,
            Value::Str(id) => Some(GcRef::Str(id)),
            Value::Table(id) => Some(GcRef::Table(id)),
            Value::Function(id) => Some(GcRef::Function(id)),
            Value::Native(id) => Some(GcRef::Native(id)),
            Value::Closure(id) => Some(GcRef::Closure(id)),
            Value::Thread(id) => Some(GcRef::Thread(id)),
            Value::Userdata(id) => Some(GcRef::Userdata(id)),
            Value::BoundMethod(id) => Some(GcRef::BoundMethod(id)),
        }
    }
}

struct Entry<T> {
    value: T,
    marked: bool,
    charge: usize,
}

/// One typed object pool.
pub struct Arena<T> {
    slots: Vec<Option<Entry<T>>>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> Arena<T> {
    fn insert(&mut self, value: T, charge: usize) -> u32 {
        let entry = Entry {
            value,
            marked: false,
            charge,
        };
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(entry);
            index
        } else {
            self.slots.push(Some(entry));
            (self.slots.len() - 1) as u32
        }
    }

    pub(crate) fn get(&self, index: u32) -> &T {
        match self.slots[index as usize].as_ref() {
            Some(entry) => &entry.value,
            None => panic!("use of reclaimed heap slot {index}"),
        }
    }

    fn get_mut(&mut self, index: u32) -> &mut T {
        match self.slots[index as usize].as_mut() {
            Some(entry) => &mut entry.value,
            None => panic!("use of reclaimed heap slot {index}"),
        }
    }

    /// Sets the mark bit; returns true when the object was unmarked.
    fn mark(&mut self, index: u32) -> bool {
        match self.slots[index as usize].as_mut() {
            Some(entry) if !entry.marked => {
                entry.marked = true;
                true
            }
            _ => false,
        }
    }

    /// Frees unmarked entries, clears surviving marks, returns freed bytes.
    fn sweep(&mut self, mut on_free: impl FnMut(&mut T)) -> usize {
        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(entry) if entry.marked => entry.marked = false,
                Some(entry) => {
                    on_free(&mut entry.value);
                    freed += entry.charge;
                    *slot = None;
                    self.free.push(index as u32);
                }
                None => {}
            }
        }
        freed
    }

    fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;

/// The object heap.
pub struct Heap {
    strings: Arena<StrObject>,
    tables: Arena<TableObject>,
    functions: Arena<FunctionObject>,
    natives: Arena<NativeObject>,
    closures: Arena<ClosureObject>,
    upvalues: Arena<UpvalueObject>,
    threads: Arena<ThreadObject>,
    userdata: Arena<UserdataObject>,
    bound_methods: Arena<BoundMethodObject>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Suspends collection across critical native regions.
    pub disable_gc: bool,
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            strings: Arena::default(),
            tables: Arena::default(),
            functions: Arena::default(),
            natives: Arena::default(),
            closures: Arena::default(),
            upvalues: Arena::default(),
            threads: Arena::default(),
            userdata: Arena::default(),
            bound_methods: Arena::default(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            disable_gc: false,
        }
    }

    fn charge(&mut self, bytes: usize) -> usize {
        self.bytes_allocated += bytes;
        bytes
    }

    // === Allocation ===

    pub fn alloc_string(&mut self, chars: String) -> StringId {
        let hash = hash_bytes(chars.as_bytes());
        let charge = self.charge(std::mem::size_of::<StrObject>() + chars.len() + 1);
        StringId(self.strings.insert(StrObject { chars, hash }, charge))
    }

    pub fn alloc_str(&mut self, chars: &str) -> StringId {
        self.alloc_string(chars.to_string())
    }

    pub fn new_table(&mut self) -> TableId {
        let charge = self.charge(std::mem::size_of::<TableObject>());
        TableId(self.tables.insert(TableObject::default(), charge))
    }

    pub fn alloc_function(&mut self, function: FunctionObject) -> FunctionId {
        let extra = function.chunk.code.len() + function.chunk.constants.len() * 16;
        let charge = self.charge(std::mem::size_of::<FunctionObject>() + extra);
        FunctionId(self.functions.insert(function, charge))
    }

    pub fn alloc_native(&mut self, native: NativeObject) -> NativeId {
        let charge = self.charge(std::mem::size_of::<NativeObject>());
        NativeId(self.natives.insert(native, charge))
    }

    pub fn alloc_closure(&mut self, closure: ClosureObject) -> ClosureId {
        let extra = closure.upvalues.capacity() * 4;
        let charge = self.charge(std::mem::size_of::<ClosureObject>() + extra);
        ClosureId(self.closures.insert(closure, charge))
    }

    pub fn alloc_upvalue(&mut self, upvalue: UpvalueObject) -> UpvalueId {
        let charge = self.charge(std::mem::size_of::<UpvalueObject>());
        UpvalueId(self.upvalues.insert(upvalue, charge))
    }

    pub fn alloc_thread(&mut self, thread: ThreadObject) -> ThreadId {
        let extra = thread.stack_limit * 16 + thread.frame_limit * 64 + thread.handler_limit * 48;
        let charge = self.charge(std::mem::size_of::<ThreadObject>() + extra);
        ThreadId(self.threads.insert(thread, charge))
    }

    pub fn alloc_userdata(&mut self, userdata: UserdataObject) -> UserdataId {
        let charge = self.charge(std::mem::size_of::<UserdataObject>());
        UserdataId(self.userdata.insert(userdata, charge))
    }

    pub fn alloc_bound_method(&mut self, bound: BoundMethodObject) -> BoundMethodId {
        let charge = self.charge(std::mem::size_of::<BoundMethodObject>());
        BoundMethodId(self.bound_methods.insert(bound, charge))
    }

    // === Accessors ===

    pub fn string(&self, id: StringId) -> &StrObject {
        self.strings.get(id.0)
    }

    pub(crate) fn strings(&self) -> &Arena<StrObject> {
        &self.strings
    }

    pub fn table(&self, id: TableId) -> &TableObject {
        self.tables.get(id.0)
    }

    pub fn table_mut(&mut self, id: TableId) -> &mut TableObject {
        self.tables.get_mut(id.0)
    }

    pub fn function(&self, id: FunctionId) -> &FunctionObject {
        self.functions.get(id.0)
    }

    pub fn native(&self, id: NativeId) -> &NativeObject {
        self.natives.get(id.0)
    }

    pub fn closure(&self, id: ClosureId) -> &ClosureObject {
        self.closures.get(id.0)
    }

    pub fn closure_mut(&mut self, id: ClosureId) -> &mut ClosureObject {
        self.closures.get_mut(id.0)
    }

    pub fn upvalue(&self, id: UpvalueId) -> &UpvalueObject {
        self.upvalues.get(id.0)
    }

    pub fn upvalue_mut(&mut self, id: UpvalueId) -> &mut UpvalueObject {
        self.upvalues.get_mut(id.0)
    }

    pub fn thread(&self, id: ThreadId) -> &ThreadObject {
        self.threads.get(id.0)
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> &mut ThreadObject {
        self.threads.get_mut(id.0)
    }

    pub fn userdata(&self, id: UserdataId) -> &UserdataObject {
        self.userdata.get(id.0)
    }

    pub fn userdata_mut(&mut self, id: UserdataId) -> &mut UserdataObject {
        self.userdata.get_mut(id.0)
    }

    pub fn bound_method(&self, id: BoundMethodId) -> &BoundMethodObject {
        self.bound_methods.get(id.0)
    }

    // === Table operations (split borrows over strings) ===

    pub fn table_get(&self, table: TableId, key: StringId) -> Option<Value> {
        self.tables.get(table.0).data.get(&self.strings, key)
    }

    pub fn table_set(&mut self, table: TableId, key: StringId, value: Value) -> bool {
        let entry = self.tables.get_mut(table.0);
        entry.version = entry.version.wrapping_add(1);
        entry.data.set(&self.strings, key, value)
    }

    pub fn table_delete(&mut self, table: TableId, key: StringId) -> bool {
        let entry = self.tables.get_mut(table.0);
        entry.version = entry.version.wrapping_add(1);
        entry.data.delete(&self.strings, key)
    }

    pub fn table_get_array(&self, table: TableId, index: i64) -> Option<Value> {
        self.tables.get(table.0).data.get_array(index)
    }

    pub fn table_set_array(&mut self, table: TableId, index: i64, value: Value) -> bool {
        let entry = self.tables.get_mut(table.0);
        entry.version = entry.version.wrapping_add(1);
        entry.data.set_array(index, value)
    }

    /// The canonical sigil string key for a numeric hash-part key.
    pub fn number_key(&mut self, n: f64) -> StringId {
        self.alloc_string(number_key_text(n))
    }

    // === String helpers ===

    pub fn strings_equal(&self, a: StringId, b: StringId) -> bool {
        if a == b {
            return true;
        }
        let (sa, sb) = (self.strings.get(a.0), self.strings.get(b.0));
        sa.hash == sb.hash && sa.chars == sb.chars
    }

    pub fn concat_strings(&mut self, a: StringId, b: StringId) -> StringId {
        let mut chars = String::with_capacity(self.string(a).len() + self.string(b).len());
        chars.push_str(&self.string(a).chars);
        chars.push_str(&self.string(b).chars);
        self.alloc_string(chars)
    }

    /// Equality without metamethods: immediates by value, strings by
    /// content, other objects by identity.
    pub fn values_equal_simple(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Str(sa), Value::Str(sb)) => self.strings_equal(sa, sb),
            _ => a == b,
        }
    }

    /// Truthiness: nil, false, zero, the empty string, and the empty table
    /// are falsey.
    pub fn is_falsey(&self, value: Value) -> bool {
        match value {
            Value::Nil => true,
            Value::Bool(b) => !b,
            Value::Number(n) => n == 0.0,
            Value::Str(id) => self.string(id).is_empty(),
            Value::Table(id) => {
                let table = &self.table(id).data;
                table.live_entries() == 0 && table.array_len() == 0
            }
            _ => false,
        }
    }

    // === Garbage collection ===

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// True once allocation has crossed the trigger threshold.
    pub fn should_collect(&self) -> bool {
        !self.disable_gc && self.bytes_allocated > self.next_gc
    }

    fn mark_ref(&mut self, r: GcRef) -> bool {
        match r {
            GcRef::Str(id) => self.strings.mark(id.0),
            GcRef::Table(id) => self.tables.mark(id.0),
            GcRef::Function(id) => self.functions.mark(id.0),
            GcRef::Native(id) => self.natives.mark(id.0),
            GcRef::Closure(id) => self.closures.mark(id.0),
            GcRef::Upvalue(id) => self.upvalues.mark(id.0),
            GcRef::Thread(id) => self.threads.mark(id.0),
            GcRef::Userdata(id) => self.userdata.mark(id.0),
            GcRef::BoundMethod(id) => self.bound_methods.mark(id.0),
        }
    }

    fn trace(&self, r: GcRef, out: &mut Vec<GcRef>) {
        let mut push_value = |out: &mut Vec<GcRef>, v: Value| {
            if let Some(child) = GcRef::of(v) {
                out.push(child);
            }
        };
        match r {
            GcRef::Str(_) => {}
            GcRef::Table(id) => {
                let table = self.tables.get(id.0);
                for (key, value) in table.data.iter_hash() {
                    out.push(GcRef::Str(key));
                    push_value(out, value);
                }
                for &value in table.data.array_slots() {
                    push_value(out, value);
                }
                if let Some(meta) = table.metatable {
                    out.push(GcRef::Table(meta));
                }
            }
            GcRef::Function(id) => {
                let function = self.functions.get(id.0);
                if let Some(name) = function.name {
                    out.push(GcRef::Str(name));
                }
                if let Some(doc) = function.doc {
                    out.push(GcRef::Str(doc));
                }
                for &value in &function.chunk.constants {
                    push_value(out, value);
                }
                for &value in &function.defaults {
                    push_value(out, value);
                }
                for &name in &function.param_names {
                    out.push(GcRef::Str(name));
                }
            }
            GcRef::Native(id) => {
                out.push(GcRef::Str(self.natives.get(id.0).name));
            }
            GcRef::Closure(id) => {
                let closure = self.closures.get(id.0);
                out.push(GcRef::Function(closure.function));
                for &upvalue in &closure.upvalues {
                    out.push(GcRef::Upvalue(upvalue));
                }
            }
            GcRef::Upvalue(id) => {
                if let UpvalueState::Closed(value) = self.upvalues.get(id.0).state {
                    push_value(out, value);
                }
            }
            GcRef::Thread(id) => {
                let thread = self.threads.get(id.0);
                for &value in &thread.stack[..thread.top] {
                    push_value(out, value);
                }
                for frame in &thread.frames {
                    out.push(GcRef::Closure(frame.closure));
                    if let Some(module) = &frame.module {
                        if let Some(name) = module.cache_name {
                            out.push(GcRef::Str(name));
                        }
                        for prev in [module.prev_name, module.prev_file, module.prev_main]
                            .into_iter()
                            .flatten()
                        {
                            push_value(out, prev);
                        }
                    }
                }
                let mut open = thread.open_upvalues;
                while let Some(upvalue) = open {
                    out.push(GcRef::Upvalue(upvalue));
                    open = self.upvalues.get(upvalue.0).next;
                }
                if let Some(caller) = thread.caller {
                    out.push(GcRef::Thread(caller));
                }
                if let Some(exception) = thread.exception {
                    push_value(out, exception);
                }
                push_value(out, thread.last_error);
            }
            GcRef::Userdata(id) => {
                let userdata = self.userdata.get(id.0);
                if let Some(meta) = userdata.metatable {
                    out.push(GcRef::Table(meta));
                }
                if let (Some(mark), Some(data)) = (userdata.mark, userdata.data.as_ref()) {
                    mark(data.as_ref(), out);
                }
            }
            GcRef::BoundMethod(id) => {
                let bound = self.bound_methods.get(id.0);
                push_value(out, bound.receiver);
                push_value(out, bound.method);
            }
        }
    }

    /// Runs a full mark/sweep cycle from the given roots.
    pub fn collect(&mut self, roots: &[GcRef]) {
        let before = self.bytes_allocated;

        let mut worklist: Vec<GcRef> = roots.to_vec();
        let mut children = Vec::new();
        while let Some(r) = worklist.pop() {
            if !self.mark_ref(r) {
                continue;
            }
            children.clear();
            self.trace(r, &mut children);
            worklist.extend_from_slice(&children);
        }

        let mut freed = 0;
        freed += self.strings.sweep(|_| {});
        freed += self.tables.sweep(|_| {});
        freed += self.functions.sweep(|_| {});
        freed += self.natives.sweep(|_| {});
        freed += self.closures.sweep(|_| {});
        freed += self.upvalues.sweep(|_| {});
        freed += self.threads.sweep(|_| {});
        freed += self.userdata.sweep(|userdata| {
            if let (Some(finalize), Some(data)) = (userdata.finalize, userdata.data.as_mut()) {
                finalize(data.as_mut());
            }
            userdata.data = None;
        });
        freed += self.bound_methods.sweep(|_| {});

        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
        self.next_gc = (self.bytes_allocated * 2).max(INITIAL_GC_THRESHOLD);

        debug!(
            "gc: {} -> {} bytes, next at {}, {} objects live",
            before,
            self.bytes_allocated,
            self.next_gc,
            self.live_objects()
        );
    }

    /// Total live object count across every arena.
    pub fn live_objects(&self) -> usize {
        self.strings.len()
            + self.tables.len()
            + self.functions.len()
            + self.natives.len()
            + self.closures.len()
            + self.upvalues.len()
            + self.threads.len()
            + self.userdata.len()
            + self.bound_methods.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrooted_objects_are_swept() {
        let mut heap = Heap::new();
        let keep = heap.alloc_str("keep");
        let _drop = heap.alloc_str("drop");
        let before = heap.bytes_allocated();
        heap.collect(&[GcRef::Str(keep)]);
        assert!(heap.bytes_allocated() < before);
        assert_eq!(heap.live_objects(), 1);
        assert_eq!(heap.string(keep).chars, "keep");
    }

    #[test]
    fn table_roots_keep_contents_alive() {
        let mut heap = Heap::new();
        let table = heap.new_table();
        let key = heap.alloc_str("k");
        let value = heap.alloc_str("v");
        heap.table_set(table, key, Value::Str(value));
        heap.collect(&[GcRef::Table(table)]);
        assert_eq!(heap.live_objects(), 3);
        assert_eq!(heap.table_get(table, key), Some(Value::Str(value)));
    }

    #[test]
    fn cycles_are_collected() {
        let mut heap = Heap::new();
        let a = heap.new_table();
        let b = heap.new_table();
        heap.table_mut(a).metatable = Some(b);
        heap.table_mut(b).metatable = Some(a);
        heap.collect(&[]);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn collection_is_idempotent_without_allocations() {
        let mut heap = Heap::new();
        let root = heap.new_table();
        let key = heap.alloc_str("x");
        heap.table_set(root, key, Value::Number(1.0));
        heap.collect(&[GcRef::Table(root)]);
        let after_first = heap.bytes_allocated();
        heap.collect(&[GcRef::Table(root)]);
        assert_eq!(heap.bytes_allocated(), after_first);
    }

    #[test]
    fn userdata_finalizer_runs_on_sweep() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static FINALIZED: AtomicUsize = AtomicUsize::new(0);

        fn finalize(_: &mut dyn std::any::Any) {
            FINALIZED.fetch_add(1, Ordering::SeqCst);
        }

        let mut heap = Heap::new();
        heap.alloc_userdata(UserdataObject {
            data: Some(Box::new(17u32)),
            finalize: Some(finalize),
            mark: None,
            metatable: None,
        });
        heap.collect(&[]);
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
    }
}
