//! The virtual machine core.
//!
//! One `Vm` owns the heap, the globals and module tables, and every
//! thread. At any instant exactly one thread drives the dispatch loop;
//! coroutine resume/yield and generator stepping switch the current-thread
//! handle and the loop carries on in the other context. Native code can
//! reenter the loop with [`Vm::run`] bounded by a frame count, which is how
//! metamethods are driven from inside host functions.

mod build_string;
mod ops_arith;
mod ops_compare;
mod ops_exception;
mod ops_iter;
mod ops_local;
mod ops_print;
mod ops_table;

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::chunk::Chunk;
use crate::compiler;
use crate::error::{InterpretResult, VmError, VmResult};
use crate::heap::{ClosureId, FunctionId, GcRef, Heap, NativeId, StringId, ThreadId, UpvalueId};
use crate::modules::ModuleRegistry;
use crate::object::{
    BoundMethodObject, CallFrame, ClosureObject, NativeFastKind, NativeFn, NativeObject,
    ThreadObject, TypeHint, UpvalueObject, UpvalueState, FRAMES_MAX, GEN_FRAMES_MAX,
    GEN_HANDLERS_MAX, GEN_STACK_MAX, HANDLERS_MAX, STACK_MAX,
};
use crate::table::Table;
use crate::value::{to_int64, Value};

/// Metamethod kinds, resolved to canonical names interned at VM init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaMethod {
    Index,
    NewIndex,
    Str,
    Call,
    New,
    Append,
    Next,
    Slice,
    Eq,
    Lt,
    Has,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    IntDiv,
}

/// Interned well-known strings: metamethod names, module context keys, and
/// the handful of globals the dispatch loop reaches for.
pub struct MetaNames {
    pub index: StringId,
    pub newindex: StringId,
    pub str_: StringId,
    pub call: StringId,
    pub new: StringId,
    pub append: StringId,
    pub next: StringId,
    pub slice: StringId,
    pub eq: StringId,
    pub lt: StringId,
    pub has: StringId,
    pub add: StringId,
    pub sub: StringId,
    pub mul: StringId,
    pub div: StringId,
    pub modulo: StringId,
    pub pow: StringId,
    pub int_div: StringId,
    pub module_name_key: StringId,
    pub module_file_key: StringId,
    pub module_main_key: StringId,
    pub string_module: StringId,
    pub slice_fn: StringId,
    pub next_fn: StringId,
    pub inext_fn: StringId,
    pub gen_next_fn: StringId,
    pub range_fn: StringId,
    pub range_iter_fn: StringId,
    pub type_key: StringId,
    pub msg_key: StringId,
    pub meta_name_key: StringId,
}

impl MetaNames {
    fn intern(heap: &mut Heap) -> Self {
        MetaNames {
            index: heap.alloc_str("__index"),
            newindex: heap.alloc_str("__newindex"),
            str_: heap.alloc_str("__str"),
            call: heap.alloc_str("__call"),
            new: heap.alloc_str("__new"),
            append: heap.alloc_str("__append"),
            next: heap.alloc_str("__next"),
            slice: heap.alloc_str("__slice"),
            eq: heap.alloc_str("__eq"),
            lt: heap.alloc_str("__lt"),
            has: heap.alloc_str("__has"),
            add: heap.alloc_str("__add"),
            sub: heap.alloc_str("__sub"),
            mul: heap.alloc_str("__mul"),
            div: heap.alloc_str("__div"),
            modulo: heap.alloc_str("__mod"),
            pow: heap.alloc_str("__pow"),
            int_div: heap.alloc_str("__int_div"),
            module_name_key: heap.alloc_str("__name"),
            module_file_key: heap.alloc_str("__file"),
            module_main_key: heap.alloc_str("__main"),
            string_module: heap.alloc_str("string"),
            slice_fn: heap.alloc_str("slice"),
            next_fn: heap.alloc_str("next"),
            inext_fn: heap.alloc_str("inext"),
            gen_next_fn: heap.alloc_str("gen_next"),
            range_fn: heap.alloc_str("range"),
            range_iter_fn: heap.alloc_str("range_iter"),
            type_key: heap.alloc_str("type"),
            msg_key: heap.alloc_str("msg"),
            meta_name_key: heap.alloc_str("__name"),
        }
    }

    /// Canonical name string for a metamethod kind.
    pub fn of(&self, method: MetaMethod) -> StringId {
        match method {
            MetaMethod::Index => self.index,
            MetaMethod::NewIndex => self.newindex,
            MetaMethod::Str => self.str_,
            MetaMethod::Call => self.call,
            MetaMethod::New => self.new,
            MetaMethod::Append => self.append,
            MetaMethod::Next => self.next,
            MetaMethod::Slice => self.slice,
            MetaMethod::Eq => self.eq,
            MetaMethod::Lt => self.lt,
            MetaMethod::Has => self.has,
            MetaMethod::Add => self.add,
            MetaMethod::Sub => self.sub,
            MetaMethod::Mul => self.mul,
            MetaMethod::Div => self.div,
            MetaMethod::Mod => self.modulo,
            MetaMethod::Pow => self.pow,
            MetaMethod::IntDiv => self.int_div,
        }
    }

    fn collect_roots(&self, roots: &mut Vec<GcRef>) {
        for id in [
            self.index,
            self.newindex,
            self.str_,
            self.call,
            self.new,
            self.append,
            self.next,
            self.slice,
            self.eq,
            self.lt,
            self.has,
            self.add,
            self.sub,
            self.mul,
            self.div,
            self.modulo,
            self.pow,
            self.int_div,
            self.module_name_key,
            self.module_file_key,
            self.module_main_key,
            self.string_module,
            self.slice_fn,
            self.next_fn,
            self.inext_fn,
            self.gen_next_fn,
            self.range_fn,
            self.range_iter_fn,
            self.type_key,
            self.msg_key,
            self.meta_name_key,
        ] {
            roots.push(GcRef::Str(id));
        }
    }
}

/// Tunable VM capacities and behavior.
#[derive(Debug, Clone)]
pub struct VmOptions {
    pub stack_capacity: usize,
    pub frame_capacity: usize,
    pub handler_capacity: usize,
    pub gen_stack_capacity: usize,
    pub gen_frame_capacity: usize,
    pub gen_handler_capacity: usize,
    /// Directories searched for `<name>.tl` source modules.
    pub search_paths: Vec<PathBuf>,
    /// Leave the last expression result on the stack after a script.
    pub is_repl: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            stack_capacity: STACK_MAX,
            frame_capacity: FRAMES_MAX,
            handler_capacity: HANDLERS_MAX,
            gen_stack_capacity: GEN_STACK_MAX,
            gen_frame_capacity: GEN_FRAMES_MAX,
            gen_handler_capacity: GEN_HANDLERS_MAX,
            search_paths: vec![PathBuf::from(".")],
            is_repl: false,
        }
    }
}

/// Where `print` output goes.
enum OutputSink {
    Stdout,
    Buffer(Vec<u8>),
}

/// Dispatch loop outcome of one instruction.
pub(crate) enum Flow {
    Continue,
    Exit(InterpretResult),
}

/// Cached view of the current frame for the dispatch loop. Rebuilt from
/// the current thread after anything that can change frames or threads.
pub(crate) struct Cursor {
    pub(crate) frame_index: usize,
    pub(crate) closure: ClosureId,
    pub(crate) chunk: Rc<Chunk>,
    pub(crate) ip: usize,
    pub(crate) slots: usize,
}

impl Cursor {
    pub(crate) fn read_byte(&mut self) -> u8 {
        let byte = self.chunk.code[self.ip];
        self.ip += 1;
        byte
    }

    pub(crate) fn read_short(&mut self) -> u16 {
        let hi = self.chunk.code[self.ip] as u16;
        let lo = self.chunk.code[self.ip + 1] as u16;
        self.ip += 2;
        (hi << 8) | lo
    }

    pub(crate) fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.chunk.constants[index]
    }
}

use crate::op_code::OpCode;

/// The virtual machine.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) globals: Table,
    pub(crate) globals_version: u32,
    pub(crate) modules: Table,
    pub(crate) current: ThreadId,
    main_thread: ThreadId,
    parked: Vec<ThreadId>,
    pub(crate) names: MetaNames,
    pub(crate) options: VmOptions,
    output: OutputSink,
    interrupt: Arc<AtomicBool>,
    stop_thread: Option<ThreadId>,
    pub(crate) registry: ModuleRegistry,
    pub(crate) cli_args: Vec<String>,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // Final collection with an empty root set runs userdata finalizers.
        self.heap.collect(&[]);
    }
}

impl Vm {
    pub fn new() -> Self {
        Vm::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Self {
        let mut heap = Heap::new();
        let main = heap.alloc_thread(ThreadObject::with_limits(
            options.stack_capacity,
            options.frame_capacity,
            options.handler_capacity,
        ));
        let names = MetaNames::intern(&mut heap);
        let mut vm = Vm {
            heap,
            globals: Table::new(),
            globals_version: 0,
            modules: Table::new(),
            current: main,
            main_thread: main,
            parked: Vec::new(),
            names,
            options,
            output: OutputSink::Stdout,
            interrupt: Arc::new(AtomicBool::new(false)),
            stop_thread: None,
            registry: ModuleRegistry::new(),
            cli_args: Vec::new(),
        };
        crate::natives::core::register_core(&mut vm);
        vm
    }

    // === Embedding API: stack primitives ===

    pub fn push(&mut self, value: Value) {
        self.heap.thread_mut(self.current).push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.heap.thread_mut(self.current).pop()
    }

    pub fn peek(&self, distance: usize) -> Value {
        self.heap.thread(self.current).peek(distance)
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn names(&self) -> &MetaNames {
        &self.names
    }

    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    pub fn current_thread(&self) -> ThreadId {
        self.current
    }

    pub fn main_thread(&self) -> ThreadId {
        self.main_thread
    }

    pub(crate) fn thread(&self) -> &ThreadObject {
        self.heap.thread(self.current)
    }

    pub(crate) fn thread_mut(&mut self) -> &mut ThreadObject {
        self.heap.thread_mut(self.current)
    }

    /// Switches the current thread handle. The dispatch loop picks the new
    /// context up at its next reload.
    pub fn set_current_thread(&mut self, thread: ThreadId) {
        self.current = thread;
    }

    pub fn set_cli_args(&mut self, args: Vec<String>) {
        self.cli_args = args;
    }

    pub fn cli_args(&self) -> &[String] {
        &self.cli_args
    }

    /// Routes `print` output into an internal buffer.
    pub fn capture_output(&mut self) {
        self.output = OutputSink::Buffer(Vec::new());
    }

    /// Drains captured output.
    pub fn take_output(&mut self) -> String {
        match &mut self.output {
            OutputSink::Buffer(buffer) => String::from_utf8_lossy(&std::mem::take(buffer)).into_owned(),
            OutputSink::Stdout => String::new(),
        }
    }

    pub(crate) fn write_output(&mut self, text: &str) {
        match &mut self.output {
            OutputSink::Stdout => {
                use std::io::Write;
                let _ = std::io::stdout().write_all(text.as_bytes());
            }
            OutputSink::Buffer(buffer) => buffer.extend_from_slice(text.as_bytes()),
        }
    }

    // === Globals ===

    pub fn get_global(&self, name: StringId) -> Option<Value> {
        self.globals.get(self.heap.strings(), name)
    }

    pub fn set_global(&mut self, name: StringId, value: Value) {
        self.globals.set(self.heap.strings(), name, value);
        self.globals_version = self.globals_version.wrapping_add(1);
    }

    pub fn delete_global(&mut self, name: StringId) -> bool {
        self.globals_version = self.globals_version.wrapping_add(1);
        self.globals.delete(self.heap.strings(), name)
    }

    /// Registers a native module loader invoked lazily on first import.
    pub fn register_native_module(&mut self, name: &'static str, loader: crate::modules::ModuleLoader) {
        self.registry.register(name, loader);
    }

    /// Installs a host function as a global.
    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let name_id = self.heap.alloc_str(name);
        let native = self.heap.alloc_native(NativeObject {
            function,
            name: name_id,
            is_self: false,
            fast_kind: NativeFastKind::None,
        });
        self.set_global(name_id, Value::Native(native));
    }

    // === Metamethods ===

    pub fn metamethod(&self, value: Value, method: MetaMethod) -> Value {
        self.get_metamethod_id(value, self.names.of(method))
    }

    pub fn get_metamethod_id(&self, value: Value, name: StringId) -> Value {
        let metatable = match value {
            Value::Table(id) => self.heap.table(id).metatable,
            Value::Userdata(id) => self.heap.userdata(id).metatable,
            _ => None,
        };
        match metatable {
            Some(meta) => self.heap.table_get(meta, name).unwrap_or(Value::Nil),
            None => Value::Nil,
        }
    }

    /// Embedding-API metamethod lookup by name.
    pub fn get_metamethod(&mut self, value: Value, name: &str) -> Value {
        let id = self.heap.alloc_str(name);
        self.get_metamethod_id(value, id)
    }

    pub(crate) fn maybe_bind_self(&mut self, receiver: Value, result: Value) -> Value {
        if matches!(result, Value::BoundMethod(_)) {
            return result;
        }
        if let Value::Table(id) = receiver {
            if self.heap.table(id).is_module {
                return result;
            }
        }
        let is_self = match result {
            Value::Closure(id) => self.heap.function(self.heap.closure(id).function).is_self,
            Value::Native(id) => self.heap.native(id).is_self,
            _ => false,
        };
        if is_self {
            let bound = self.heap.alloc_bound_method(BoundMethodObject {
                receiver,
                method: result,
            });
            Value::BoundMethod(bound)
        } else {
            result
        }
    }

    // === Errors and interrupts ===

    /// Raises an error as a script exception on the current thread.
    pub(crate) fn raise(&mut self, err: VmError) {
        if matches!(err, VmError::Exception) {
            return;
        }
        let message = err.to_string();
        let id = self.heap.alloc_string(message);
        let thread = self.heap.thread_mut(self.current);
        if thread.exception.is_none() {
            thread.exception = Some(Value::Str(id));
        }
        thread.last_error = thread.exception.unwrap_or(Value::Nil);
    }

    /// Sets an exception from native code; the caller must return a
    /// failure status afterwards.
    pub fn runtime_error(&mut self, message: impl Into<String>) -> VmError {
        VmError::runtime(message)
    }

    /// Installs an arbitrary value as the pending exception. The caller
    /// follows up with `Err(VmError::Exception)`.
    pub fn throw_value(&mut self, value: Value) {
        let thread = self.heap.thread_mut(self.current);
        thread.exception = Some(value);
        thread.last_error = value;
    }

    /// Asks the loop to raise "Interrupted." at its next dispatch step.
    /// Safe to call from a signal handler through [`Vm::interrupt_flag`].
    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    /// Shared flag for installing in signal handlers.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    // === GC ===

    /// Parks a thread so its stack stays rooted while a native blocks.
    pub fn park_thread(&mut self, thread: ThreadId) {
        if !self.parked.contains(&thread) {
            self.parked.push(thread);
        }
    }

    pub fn unpark_thread(&mut self, thread: ThreadId) {
        self.parked.retain(|&t| t != thread);
    }

    /// Runs a full collection cycle right now.
    pub fn collect_garbage(&mut self) {
        let mut roots: Vec<GcRef> = Vec::new();
        roots.push(GcRef::Thread(self.current));
        roots.push(GcRef::Thread(self.main_thread));
        for &thread in &self.parked {
            roots.push(GcRef::Thread(thread));
        }
        self.names.collect_roots(&mut roots);
        for (key, value) in self.globals.iter_hash() {
            roots.push(GcRef::Str(key));
            if let Some(r) = GcRef::of(value) {
                roots.push(r);
            }
        }
        for (key, value) in self.modules.iter_hash() {
            roots.push(GcRef::Str(key));
            if let Some(r) = GcRef::of(value) {
                roots.push(r);
            }
        }
        self.heap.collect(&roots);
    }

    /// Allocation-driven trigger, consulted at object-creating opcodes.
    pub(crate) fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    // === Upvalues ===

    pub(crate) fn capture_upvalue(&mut self, abs_slot: usize) -> UpvalueId {
        let thread_id = self.current;
        let mut prev: Option<UpvalueId> = None;
        let mut walk = self.heap.thread(thread_id).open_upvalues;
        while let Some(id) = walk {
            let upvalue = self.heap.upvalue(id);
            match upvalue.state {
                UpvalueState::Open { slot, .. } if slot > abs_slot => {
                    prev = Some(id);
                    walk = upvalue.next;
                }
                UpvalueState::Open { slot, .. } if slot == abs_slot => return id,
                _ => break,
            }
        }
        let created = self.heap.alloc_upvalue(UpvalueObject {
            state: UpvalueState::Open {
                thread: thread_id,
                slot: abs_slot,
            },
            next: walk,
        });
        match prev {
            None => self.heap.thread_mut(thread_id).open_upvalues = Some(created),
            Some(prev) => self.heap.upvalue_mut(prev).next = Some(created),
        }
        created
    }

    /// Closes every open upvalue at or above `from_slot`.
    pub(crate) fn close_upvalues(&mut self, from_slot: usize) {
        loop {
            let Some(id) = self.heap.thread(self.current).open_upvalues else {
                return;
            };
            let (slot, next) = match self.heap.upvalue(id).state {
                UpvalueState::Open { slot, .. } => (slot, self.heap.upvalue(id).next),
                UpvalueState::Closed(_) => return,
            };
            if slot < from_slot {
                return;
            }
            let value = self.heap.thread(self.current).stack[slot];
            let upvalue = self.heap.upvalue_mut(id);
            upvalue.state = UpvalueState::Closed(value);
            upvalue.next = None;
            self.heap.thread_mut(self.current).open_upvalues = next;
        }
    }

    pub(crate) fn read_upvalue(&self, id: UpvalueId) -> Value {
        match self.heap.upvalue(id).state {
            UpvalueState::Open { thread, slot } => self.heap.thread(thread).stack[slot],
            UpvalueState::Closed(value) => value,
        }
    }

    pub(crate) fn write_upvalue(&mut self, id: UpvalueId, value: Value) {
        match self.heap.upvalue(id).state {
            UpvalueState::Open { thread, slot } => {
                self.heap.thread_mut(thread).stack[slot] = value;
            }
            UpvalueState::Closed(_) => {
                self.heap.upvalue_mut(id).state = UpvalueState::Closed(value);
            }
        }
    }

    // === Cursor plumbing ===

    pub(crate) fn reload(&self) -> Option<Cursor> {
        let thread = self.heap.thread(self.current);
        let frame = thread.frames.last()?;
        Some(Cursor {
            frame_index: thread.frames.len() - 1,
            closure: frame.closure,
            chunk: frame.chunk.clone(),
            ip: frame.ip,
            slots: frame.slots,
        })
    }

    pub(crate) fn flush(&mut self, cur: &Cursor) {
        let thread = self.heap.thread_mut(self.current);
        if let Some(frame) = thread.frames.get_mut(cur.frame_index) {
            frame.ip = cur.ip;
        }
    }

    pub(crate) fn reload_into(&self, cur: &mut Cursor) -> VmResult<()> {
        match self.reload() {
            Some(next) => {
                *cur = next;
                Ok(())
            }
            None => Err(VmError::runtime("Internal error: no active frame.")),
        }
    }

    fn read_string(&self, value: Value) -> VmResult<StringId> {
        match value {
            Value::Str(id) => Ok(id),
            _ => Err(VmError::runtime("Internal error: expected string constant.")),
        }
    }

    // === Calls ===

    /// Shifts the arguments up one slot and slides `method`/`receiver`
    /// underneath, turning `[callee, args…]` into `[method, receiver, args…]`.
    fn splice_receiver(&mut self, argc: usize, receiver: Value, method: Value) {
        let thread = self.thread_mut();
        let top = thread.top;
        thread.set_top(top + 1);
        for i in 0..argc {
            let from = top - 1 - i;
            let value = thread.stack[from];
            thread.stack[from + 1] = value;
        }
        thread.stack[top - argc] = receiver;
        thread.stack[top - argc - 1] = method;
    }

    pub(crate) fn invoke_call(&mut self, cur: &mut Cursor, mut argc: usize) -> VmResult<()> {
        let mut callee = self.peek(argc);
        if let Value::BoundMethod(id) = callee {
            let bound = self.heap.bound_method(id);
            let (receiver, method) = (bound.receiver, bound.method);
            self.splice_receiver(argc, receiver, method);
            argc += 1;
            callee = method;
        }

        if let Value::Closure(id) = callee {
            if self.heap.function(self.heap.closure(id).function).is_generator {
                return self.create_generator(id, argc, false);
            }
        }

        match callee {
            Value::Native(_) | Value::Closure(_) => self.call_value_cursor(cur, callee, argc),
            Value::Table(_) => {
                let method = self.metamethod(callee, MetaMethod::Call);
                if method.is_callable() {
                    self.splice_receiver(argc, callee, method);
                    argc += 1;
                    self.call_value_cursor(cur, method, argc)
                } else {
                    Err(VmError::runtime("Can only call functions."))
                }
            }
            _ => Err(VmError::runtime("Can only call functions.")),
        }
    }

    pub(crate) fn invoke_call_named(&mut self, cur: &mut Cursor, mut argc: usize) -> VmResult<()> {
        let mut callee = self.peek(argc);
        if let Value::BoundMethod(id) = callee {
            let bound = self.heap.bound_method(id);
            let (receiver, method) = (bound.receiver, bound.method);
            self.splice_receiver(argc, receiver, method);
            argc += 1;
            callee = method;
        }

        match callee {
            Value::Native(_) => self.call_value_cursor(cur, callee, argc),
            Value::Closure(id) => {
                if self.heap.function(self.heap.closure(id).function).is_generator {
                    return self.create_generator(id, argc, true);
                }
                self.flush(cur);
                self.call_named(id, argc)?;
                self.reload_into(cur)
            }
            Value::Table(_) => {
                let method = self.metamethod(callee, MetaMethod::Call);
                if method.is_callable() {
                    self.splice_receiver(argc, callee, method);
                    argc += 1;
                    match method {
                        Value::Closure(id) => {
                            self.flush(cur);
                            self.call_named(id, argc)?;
                            self.reload_into(cur)
                        }
                        _ => self.call_value_cursor(cur, method, argc),
                    }
                } else {
                    Err(VmError::runtime("Can only call functions."))
                }
            }
            _ => Err(VmError::runtime("Can only call functions.")),
        }
    }

    /// Calls a closure or native with the stack already holding
    /// `[callee, args…]`, keeping the cursor current.
    pub(crate) fn call_value_cursor(
        &mut self,
        cur: &mut Cursor,
        callee: Value,
        argc: usize,
    ) -> VmResult<()> {
        self.flush(cur);
        match callee {
            Value::Native(id) => {
                self.call_native(id, argc)?;
                self.reload_into(cur)
            }
            Value::Closure(id) => {
                self.call(id, argc)?;
                self.reload_into(cur)
            }
            _ => Err(VmError::runtime("Can only call functions.")),
        }
    }

    fn call_native(&mut self, id: NativeId, argc: usize) -> VmResult<()> {
        let thread = self.thread_mut();
        let base = thread.top - argc;
        let args: Vec<Value> = thread.stack[base..thread.top].to_vec();
        thread.set_top(base - 1);

        let native = self.heap.native(id);
        let fast_kind = native.fast_kind;
        let function = native.function;
        if self.try_fast_native(fast_kind, &args) {
            return Ok(());
        }
        function(self, &args)
    }

    /// Fast path for pure numeric builtins; returns true when handled.
    /// Argument mismatches fall through so the full native produces its
    /// exact error.
    fn try_fast_native(&mut self, kind: NativeFastKind, args: &[Value]) -> bool {
        use NativeFastKind::*;
        if kind == None {
            return false;
        }
        let one = || match args {
            [Value::Number(a)] => Some(*a),
            _ => Option::None,
        };
        let two = || match args {
            [Value::Number(a), Value::Number(b)] => Some((*a, *b)),
            _ => Option::None,
        };
        let result = match kind {
            Sin => one().map(f64::sin),
            Cos => one().map(f64::cos),
            Tan => one().map(f64::tan),
            Asin => one().map(f64::asin),
            Acos => one().map(f64::acos),
            Atan => match args {
                [Value::Number(a)] => Some(a.atan()),
                [Value::Number(a), Value::Number(b)] => Some(a.atan2(*b)),
                _ => Option::None,
            },
            Sqrt => one().map(f64::sqrt),
            Floor => one().map(f64::floor),
            Ceil => one().map(f64::ceil),
            Abs => one().map(f64::abs),
            Exp => one().map(f64::exp),
            Log => match args {
                [Value::Number(a)] => Some(a.ln()),
                [Value::Number(a), Value::Number(b)] => Some(a.ln() / b.ln()),
                _ => Option::None,
            },
            Pow => two().map(|(a, b)| a.powf(b)),
            Fmod => two().map(|(a, b)| a % b),
            Deg => one().map(f64::to_degrees),
            Rad => one().map(f64::to_radians),
            None => Option::None,
        };
        match result {
            Some(n) => {
                self.push(Value::Number(n));
                true
            }
            Option::None => false,
        }
    }

    fn value_matches_type(&self, value: Value, hint: TypeHint) -> bool {
        match hint {
            TypeHint::Any => true,
            TypeHint::Int => value.as_number().and_then(to_int64).is_some(),
            TypeHint::Float => matches!(value, Value::Number(_)),
            TypeHint::Bool => matches!(value, Value::Bool(_)),
            TypeHint::Str => matches!(value, Value::Str(_)),
            TypeHint::Table => matches!(value, Value::Table(_)),
        }
    }

    fn finish_call(&mut self, closure: ClosureId, argc: usize) -> VmResult<()> {
        let function_id = self.heap.closure(closure).function;
        let function = self.heap.function(function_id);
        let arity = function.arity;
        let check_count = function.param_types.len().min(arity);
        if check_count > 0 {
            let hints: Vec<TypeHint> = function.param_types[..check_count].to_vec();
            let thread = self.thread();
            let base = thread.top - argc;
            for (i, hint) in hints.iter().enumerate() {
                if *hint == TypeHint::Any {
                    continue;
                }
                let value = self.heap.thread(self.current).stack[base + i];
                if !self.value_matches_type(value, *hint) {
                    return Err(VmError::runtime(format!(
                        "Type mismatch for parameter {}.",
                        i + 1
                    )));
                }
            }
        }

        let chunk = self.heap.function(function_id).chunk.clone();
        let thread = self.thread_mut();
        if thread.frames.len() >= thread.frame_limit {
            return Err(VmError::FrameOverflow);
        }
        let slots = thread.top - argc - 1;
        thread.frames.push(CallFrame {
            closure,
            chunk,
            ip: 0,
            slots,
            module: None,
        });
        Ok(())
    }

    /// Positional call into a closure: variadic packing, defaults, type
    /// hints, frame push.
    pub fn call(&mut self, closure: ClosureId, mut argc: usize) -> VmResult<()> {
        let function_id = self.heap.closure(closure).function;
        let function = self.heap.function(function_id);
        let arity = function.arity;
        let is_variadic = function.is_variadic;
        let defaults_count = function.defaults.len();

        if is_variadic {
            let required = arity.saturating_sub(1);
            if argc < required {
                return Err(VmError::runtime(format!(
                    "Expected at least {required} arguments but got {argc}."
                )));
            }
            let extra = argc - required;
            let varargs = self.heap.new_table();
            let base = self.thread().top - extra;
            for i in 0..extra {
                let value = self.heap.thread(self.current).stack[base + i];
                self.heap.table_set_array(varargs, i as i64 + 1, value);
            }
            let thread = self.thread_mut();
            thread.set_top(base);
            thread.push(Value::Table(varargs));
            argc = arity;
        } else {
            if argc > arity {
                return Err(VmError::runtime(format!(
                    "Expected {arity} arguments but got {argc}."
                )));
            }
            if argc < arity {
                if defaults_count == 0 {
                    return Err(VmError::runtime(format!(
                        "Expected {arity} arguments but got {argc}."
                    )));
                }
                let default_start = arity - defaults_count;
                if argc < default_start {
                    return Err(VmError::runtime(format!(
                        "Expected at least {default_start} arguments (non-default parameters) but got {argc}."
                    )));
                }
                for i in argc..arity {
                    let value = self.heap.function(function_id).defaults[i - default_start];
                    self.push(value);
                }
                argc = arity;
            }
        }

        self.finish_call(closure, argc)
    }

    fn is_options_param(&self, name: StringId) -> bool {
        matches!(self.heap.string(name).chars.as_str(), "opts" | "options" | "kwargs")
    }

    fn find_named_param(&self, function: FunctionId, key: StringId, limit: usize) -> Option<usize> {
        let function = self.heap.function(function);
        let count = function.param_names.len().min(limit);
        function.param_names[..count]
            .iter()
            .position(|&name| self.heap.strings_equal(name, key))
    }

    /// Named-argument call: `[callee, positionals…, named-table]` on the
    /// stack, with `argc` counting the table.
    pub fn call_named(&mut self, closure: ClosureId, argc: usize) -> VmResult<()> {
        if argc < 1 {
            return Err(VmError::runtime("Named call requires a named-arguments table."));
        }
        let named_value = self.peek(0);
        let Value::Table(named) = named_value else {
            return Err(VmError::runtime("Named call requires a table as final argument."));
        };

        let function_id = self.heap.closure(closure).function;
        let function = self.heap.function(function_id);
        let arity = function.arity;
        let is_variadic = function.is_variadic;
        let defaults_count = function.defaults.len();
        let positional_count = argc - 1;
        let non_variadic_arity = if is_variadic { arity.saturating_sub(1) } else { arity };

        let incoming_base = self.thread().top - argc;
        let mut bound: Vec<Value> = vec![Value::Nil; arity.max(1)];
        let mut assigned = vec![false; arity.max(1)];

        let varargs = if is_variadic { Some(self.heap.new_table()) } else { None };
        // Keep the varargs table rooted while binding proceeds.
        if let Some(table) = varargs {
            self.push(Value::Table(table));
        }
        let mut vararg_pos: i64 = 0;
        let mut legacy_options: Option<crate::heap::TableId> = None;
        let mut first_unexpected: Option<StringId> = None;

        let positional_to_bind = positional_count.min(non_variadic_arity);
        for i in 0..positional_to_bind {
            bound[i] = self.heap.thread(self.current).stack[incoming_base + i];
            assigned[i] = true;
        }

        if positional_count > non_variadic_arity {
            let Some(varargs) = varargs else {
                return Err(VmError::runtime(format!(
                    "Expected {arity} arguments but got {positional_count}."
                )));
            };
            for i in non_variadic_arity..positional_count {
                let value = self.heap.thread(self.current).stack[incoming_base + i];
                vararg_pos += 1;
                self.heap.table_set_array(varargs, vararg_pos, value);
            }
        }

        let entries: Vec<(StringId, Value)> = self.heap.table(named).data.iter_hash().collect();
        for (key, value) in entries {
            if let Some(index) = self.find_named_param(function_id, key, non_variadic_arity) {
                if assigned[index] {
                    let name = self.heap.string(key).chars.clone();
                    self.cleanup_named_scratch(varargs, legacy_options);
                    return Err(VmError::runtime(format!(
                        "Multiple values for argument '{name}'."
                    )));
                }
                bound[index] = value;
                assigned[index] = true;
                continue;
            }
            if let Some(varargs) = varargs {
                self.heap.table_set(varargs, key, value);
                continue;
            }
            let options = match legacy_options {
                Some(table) => table,
                None => {
                    let table = self.heap.new_table();
                    self.push(Value::Table(table));
                    legacy_options = Some(table);
                    first_unexpected = Some(key);
                    table
                }
            };
            self.heap.table_set(options, key, value);
        }

        if let Some(options) = legacy_options {
            let mut target = None;
            for i in 0..non_variadic_arity {
                if assigned[i] {
                    continue;
                }
                let names = &self.heap.function(function_id).param_names;
                if i < names.len() && self.is_options_param(names[i]) {
                    target = Some(i);
                    break;
                }
            }
            match target {
                Some(index) => {
                    bound[index] = Value::Table(options);
                    assigned[index] = true;
                }
                None => {
                    let name = first_unexpected
                        .map(|id| self.heap.string(id).chars.clone())
                        .unwrap_or_default();
                    self.cleanup_named_scratch(varargs, legacy_options);
                    return Err(VmError::runtime(format!(
                        "Unexpected named argument '{name}'."
                    )));
                }
            }
        }

        let default_start = non_variadic_arity.saturating_sub(defaults_count);
        for i in 0..non_variadic_arity {
            if assigned[i] {
                continue;
            }
            if i >= default_start && defaults_count > 0 {
                bound[i] = self.heap.function(function_id).defaults[i - default_start];
                assigned[i] = true;
                continue;
            }
            let names = &self.heap.function(function_id).param_names;
            let message = if i < names.len() {
                format!(
                    "Missing required argument '{}'.",
                    self.heap.string(names[i]).chars
                )
            } else {
                format!("Missing required argument {}.", i + 1)
            };
            self.cleanup_named_scratch(varargs, legacy_options);
            return Err(VmError::runtime(message));
        }

        if let Some(varargs) = varargs {
            bound[arity - 1] = Value::Table(varargs);
        }

        // Drop the scratch pushes, then replace the incoming args.
        self.cleanup_named_scratch(varargs, legacy_options);
        let thread = self.thread_mut();
        thread.set_top(incoming_base);
        for value in bound.iter().take(arity) {
            thread.push(*value);
        }
        self.finish_call(closure, arity)
    }

    fn cleanup_named_scratch(
        &mut self,
        varargs: Option<crate::heap::TableId>,
        options: Option<crate::heap::TableId>,
    ) {
        if options.is_some() {
            self.pop();
        }
        if varargs.is_some() {
            self.pop();
        }
    }

    /// Calling a generator builds a suspended thread primed with one frame
    /// and returns it without running any of its code.
    fn create_generator(&mut self, closure: ClosureId, argc: usize, named: bool) -> VmResult<()> {
        let caller = self.current;
        let caller_top = self.thread().top;
        let args_base = caller_top - argc;
        let args: Vec<Value> =
            self.heap.thread(caller).stack[args_base..caller_top].to_vec();

        let gen = self.heap.alloc_thread(ThreadObject::with_limits(
            self.options.gen_stack_capacity,
            self.options.gen_frame_capacity,
            self.options.gen_handler_capacity,
        ));
        self.heap.thread_mut(gen).is_generator = true;

        self.current = gen;
        self.push(Value::Closure(closure));
        for value in &args {
            self.push(*value);
        }
        let primed = if named {
            self.call_named(closure, argc)
        } else {
            self.call(closure, argc)
        };
        self.current = caller;
        primed?;

        let thread = self.thread_mut();
        thread.set_top(args_base - 1);
        thread.push(Value::Thread(gen));
        Ok(())
    }

    /// Embedding-API call: `[callee, args…]` already pushed; drives closures
    /// to completion with a bounded reentrant run.
    pub fn call_function(&mut self, callee: Value, argc: usize) -> VmResult<()> {
        match callee {
            Value::Native(id) => self.call_native(id, argc),
            Value::Closure(id) => {
                let saved_frames = self.thread().frames.len();
                self.call(id, argc)?;
                match self.run(saved_frames) {
                    InterpretResult::Ok => Ok(()),
                    _ => Err(VmError::Exception),
                }
            }
            Value::BoundMethod(id) => {
                let bound = self.heap.bound_method(id);
                let (receiver, method) = (bound.receiver, bound.method);
                self.splice_receiver(argc, receiver, method);
                self.call_function(method, argc + 1)
            }
            _ => Err(VmError::runtime("Can only call functions.")),
        }
    }

    // === Pending compound-assignment stores ===

    pub(crate) fn push_pending_set_local(&mut self, slot: usize) -> VmResult<()> {
        let thread = self.thread_mut();
        if thread.pending_set_locals.len() >= 8 {
            return Err(VmError::runtime("Pending set-local stack overflow."));
        }
        let frame_index = thread.frames.len() - 1;
        thread.pending_set_locals.push((frame_index, slot));
        Ok(())
    }

    fn apply_pending_set_local(&mut self) {
        let thread = self.thread();
        let Some(&(frame_index, slot)) = thread.pending_set_locals.last() else {
            return;
        };
        if frame_index + 1 != thread.frames.len() {
            return;
        }
        let value = thread.peek(0);
        let slots = thread.frames[frame_index].slots;
        let thread = self.thread_mut();
        thread.stack[slots + slot] = value;
        thread.pending_set_locals.pop();
    }

    // === Module context restoration ===

    pub(crate) fn restore_module_context(&mut self, frame: &CallFrame) {
        let Some(module) = &frame.module else { return };
        let module = module.clone();
        let names = [
            (self.names.module_name_key, module.prev_name),
            (self.names.module_file_key, module.prev_file),
            (self.names.module_main_key, module.prev_main),
        ];
        for (key, prev) in names {
            match prev {
                Some(value) => self.set_global(key, value),
                None => {
                    self.delete_global(key);
                }
            }
        }
    }

    // === Entry points ===

    /// Compiles a source string; diagnostics go to stderr.
    pub fn compile(&mut self, source: &str) -> Option<FunctionId> {
        compiler::compile(source, &mut self.heap)
    }

    /// Compiles and runs a top-level source string.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let Some(function) = self.compile(source) else {
            return InterpretResult::CompileError;
        };
        self.interpret_function(function)
    }

    /// Runs an already-compiled top-level function.
    pub fn interpret_function(&mut self, function: FunctionId) -> InterpretResult {
        // The top-level script is the `__main` module.
        let main_key = self.names.module_main_key;
        if self.get_global(main_key).is_none() {
            self.set_global(main_key, Value::Bool(true));
        }
        let closure = self.heap.alloc_closure(ClosureObject {
            function,
            upvalues: Vec::new(),
        });
        self.push(Value::Closure(closure));
        if let Err(err) = self.call(closure, 0) {
            self.raise(err);
            self.report_exception();
            self.reset_current_thread();
            return InterpretResult::RuntimeError;
        }
        self.run(0)
    }

    /// Drives dispatch until the frame stack shrinks to `min_frames`, a
    /// coroutine hands control back to the embedder, or an error escapes.
    pub fn run(&mut self, min_frames: usize) -> InterpretResult {
        let mut cur = match self.reload() {
            Some(cur) => cur,
            None => return InterpretResult::Ok,
        };
        loop {
            if let Some(stop) = self.stop_thread {
                if self.current == stop {
                    self.flush(&cur);
                    return InterpretResult::Ok;
                }
            }
            if self.interrupt.swap(false, Ordering::Relaxed) {
                self.raise(VmError::runtime("Interrupted."));
                if self.handle_exception(&mut cur) {
                    continue;
                }
                return InterpretResult::RuntimeError;
            }

            let byte = cur.chunk.code[cur.ip];
            cur.ip += 1;
            let op = match OpCode::try_from(byte) {
                Ok(op) => op,
                Err(byte) => {
                    self.raise(VmError::runtime(format!("Unknown opcode {byte}.")));
                    if self.handle_exception(&mut cur) {
                        continue;
                    }
                    return InterpretResult::RuntimeError;
                }
            };

            match self.execute(op, &mut cur, min_frames) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit(result)) => return result,
                Err(err) => {
                    self.raise(err);
                    if self.handle_exception(&mut cur) {
                        continue;
                    }
                    return InterpretResult::RuntimeError;
                }
            }
        }
    }

    /// Like [`Vm::run`], but also returns once the current thread becomes
    /// `stop_thread` — used by embedders driving one coroutine while
    /// ignoring another.
    pub fn run_until_thread(&mut self, min_frames: usize, stop_thread: ThreadId) -> InterpretResult {
        let saved = self.stop_thread;
        self.stop_thread = Some(stop_thread);
        let result = self.run(min_frames);
        self.stop_thread = saved;
        result
    }

    fn execute(&mut self, op: OpCode, cur: &mut Cursor, min_frames: usize) -> VmResult<Flow> {
        use OpCode::*;
        match op {
            Constant => {
                let value = cur.read_constant();
                self.push(value);
                self.maybe_collect();
            }
            Nil => self.push(Value::Nil),
            True => self.push(Value::Bool(true)),
            False => self.push(Value::Bool(false)),
            Pop => {
                self.pop();
            }
            Dup => {
                let value = self.peek(0);
                self.push(value);
            }

            GetLocal => {
                let slot = cur.read_byte() as usize;
                let value = self.heap.thread(self.current).stack[cur.slots + slot];
                self.push(value);
            }
            SetLocal => {
                let slot = cur.read_byte() as usize;
                let value = self.peek(0);
                self.heap.thread_mut(self.current).stack[cur.slots + slot] = value;
            }
            GetUpvalue => {
                let slot = cur.read_byte() as usize;
                let id = self.heap.closure(cur.closure).upvalues[slot];
                let value = self.read_upvalue(id);
                self.push(value);
            }
            SetUpvalue => {
                let slot = cur.read_byte() as usize;
                let id = self.heap.closure(cur.closure).upvalues[slot];
                let value = self.peek(0);
                self.write_upvalue(id, value);
            }
            CloseUpvalue => {
                let top = self.thread().top;
                self.close_upvalues(top - 1);
                self.pop();
            }

            GetGlobal => self.op_get_global(cur)?,
            DefineGlobal => {
                let name = self.read_string(cur.read_constant())?;
                let value = self.peek(0);
                self.set_global(name, value);
                self.pop();
                self.maybe_collect();
            }
            SetGlobal => {
                let name = self.read_string(cur.read_constant())?;
                let value = self.peek(0);
                self.set_global(name, value);
                self.maybe_collect();
            }
            DeleteGlobal => {
                let name = self.read_string(cur.read_constant())?;
                if !self.delete_global(name) {
                    let text = self.heap.string(name).chars.clone();
                    return Err(VmError::runtime(format!("Undefined variable '{text}'.")));
                }
            }

            NewTable => {
                let table = self.heap.new_table();
                self.push(Value::Table(table));
                self.maybe_collect();
            }
            GetTable => self.op_get_table(cur)?,
            GetMetaTable => self.op_get_meta_table()?,
            SetTable => self.op_set_table(cur)?,
            DeleteTable => self.op_delete_table()?,
            SetMetatable => self.op_set_metatable(cur)?,
            Append => self.op_append(cur)?,

            Add => self.op_add(cur)?,
            Subtract => self.op_subtract(cur)?,
            Multiply => self.op_multiply(cur)?,
            Divide => self.op_divide(cur)?,
            Modulo => self.op_modulo(cur)?,
            Power => self.op_power(cur)?,
            IntDiv => self.op_int_div(cur)?,
            Negate => self.op_negate()?,
            Not => self.op_not(),
            Length => self.op_length()?,

            AddConst => {
                let b = cur.read_constant();
                self.op_add_const(cur, b)?;
            }
            SubConst => {
                let b = cur.read_constant();
                self.op_binary_const(cur, b, MetaMethod::Sub)?;
            }
            MulConst => {
                let b = cur.read_constant();
                self.op_binary_const(cur, b, MetaMethod::Mul)?;
            }
            DivConst => {
                let b = cur.read_constant();
                self.op_binary_const(cur, b, MetaMethod::Div)?;
            }
            ModConst => {
                let b = cur.read_constant();
                self.op_binary_const(cur, b, MetaMethod::Mod)?;
            }

            IncLocal => self.op_inc_local(cur)?,
            SubLocalConst => self.op_local_const(cur, MetaMethod::Sub)?,
            MulLocalConst => self.op_local_const(cur, MetaMethod::Mul)?,
            DivLocalConst => self.op_local_const(cur, MetaMethod::Div)?,
            ModLocalConst => self.op_local_const(cur, MetaMethod::Mod)?,
            AddSetLocal => self.op_add_set_local(cur)?,
            SubSetLocal => self.op_binary_set_local(cur, MetaMethod::Sub)?,
            MulSetLocal => self.op_binary_set_local(cur, MetaMethod::Mul)?,
            DivSetLocal => self.op_binary_set_local(cur, MetaMethod::Div)?,
            ModSetLocal => self.op_binary_set_local(cur, MetaMethod::Mod)?,

            Equal => self.op_equal(cur)?,
            Greater => self.op_greater(cur)?,
            Less => self.op_less(cur)?,
            Has => self.op_has(cur)?,
            In => self.op_in(cur)?,

            Jump => {
                let offset = cur.read_short() as usize;
                cur.ip += offset;
            }
            JumpIfFalse => {
                let offset = cur.read_short() as usize;
                if self.heap.is_falsey(self.peek(0)) {
                    cur.ip += offset;
                }
            }
            JumpIfTrue => {
                let offset = cur.read_short() as usize;
                if !self.heap.is_falsey(self.peek(0)) {
                    cur.ip += offset;
                }
            }
            Loop => {
                let offset = cur.read_short() as usize;
                cur.ip -= offset;
            }
            ForPrep => self.op_for_prep(cur)?,
            ForLoop => self.op_for_loop(cur)?,

            Call => {
                let argc = cur.read_byte() as usize;
                self.invoke_call(cur, argc)?;
            }
            Call0 => self.invoke_call(cur, 0)?,
            Call1 => self.invoke_call(cur, 1)?,
            Call2 => self.invoke_call(cur, 2)?,
            CallNamed => {
                let argc = cur.read_byte() as usize;
                self.invoke_call_named(cur, argc)?;
            }
            CallExpand => self.op_call_expand(cur)?,

            Return => return self.op_return(cur, min_frames),
            ReturnN => {
                let count = cur.read_byte() as usize;
                return self.op_return_n(cur, min_frames, count);
            }
            AdjustStack => {
                let depth = cur.read_byte() as usize;
                let target = cur.slots + depth;
                self.thread_mut().set_top(target);
            }
            Unpack => self.op_unpack(cur)?,
            Closure => self.op_closure(cur)?,
            BuildString => {
                let parts = cur.read_byte() as usize;
                self.op_build_string(cur, parts)?;
            }

            IterPrep => self.op_iter_prep()?,
            IterPrepIpairs => self.op_iter_prep_ipairs()?,
            Range => self.op_range(cur)?,
            Slice => self.op_slice(cur)?,

            Try => self.op_try(cur)?,
            EndTry => self.op_end_try(),
            EndFinally => self.op_end_finally()?,
            Throw => return self.op_throw(),

            Import => return self.op_import(cur),
            ImportStar => self.op_import_star()?,

            Print => {
                let count = cur.read_byte() as usize;
                self.op_print(cur, count)?;
            }
            CollectGarbage => self.collect_garbage(),
        }
        Ok(Flow::Continue)
    }

    fn op_get_global(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let op_offset = cur.ip - 1;
        let name = self.read_string(cur.read_constant())?;

        if let Some(slot) = cur.chunk.global_cache.get(op_offset) {
            let cache = slot.get();
            if cache.version == self.globals_version && cache.name == Some(name) {
                self.push(cache.value);
                return Ok(());
            }
        }
        match self.get_global(name) {
            Some(value) => {
                if let Some(slot) = cur.chunk.global_cache.get(op_offset) {
                    slot.set(crate::chunk::GlobalCache {
                        version: self.globals_version,
                        name: Some(name),
                        value,
                    });
                }
                self.push(value);
                Ok(())
            }
            None => {
                let text = self.heap.string(name).chars.clone();
                Err(VmError::runtime(format!("Undefined variable '{text}'.")))
            }
        }
    }

    fn op_for_prep(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let var_slot = cur.read_byte() as usize;
        let end_slot = cur.read_byte() as usize;
        let offset = cur.read_short() as usize;
        let stack = &self.heap.thread(self.current).stack;
        let (value, end) = (stack[cur.slots + var_slot], stack[cur.slots + end_slot]);
        let (Value::Number(value), Value::Number(end)) = (value, end) else {
            return Err(VmError::runtime("for range requires numeric bounds."));
        };
        if value > end {
            cur.ip += offset;
        }
        Ok(())
    }

    fn op_for_loop(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let var_slot = cur.read_byte() as usize;
        let end_slot = cur.read_byte() as usize;
        let offset = cur.read_short() as usize;
        let stack = &self.heap.thread(self.current).stack;
        let (value, end) = (stack[cur.slots + var_slot], stack[cur.slots + end_slot]);
        let (Value::Number(value), Value::Number(end)) = (value, end) else {
            return Err(VmError::runtime("for range requires numeric bounds."));
        };
        let next = value + 1.0;
        self.heap.thread_mut(self.current).stack[cur.slots + var_slot] = Value::Number(next);
        if next <= end {
            cur.ip -= offset;
        }
        Ok(())
    }

    fn op_call_expand(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let fixed = cur.read_byte() as usize;
        let spread = self.peek(0);
        let Value::Table(spread_table) = spread else {
            return Err(VmError::runtime("Spread argument must be a table."));
        };

        let mut spread_count = 0usize;
        loop {
            match self.heap.table_get_array(spread_table, spread_count as i64 + 1) {
                Some(_) => spread_count += 1,
                None => break,
            }
            if fixed + spread_count > 255 {
                return Err(VmError::runtime("Can't have more than 255 arguments."));
            }
        }
        let has_named = self.heap.table(spread_table).data.live_entries() > 0;

        self.pop();
        for i in 1..=spread_count {
            let value = self
                .heap
                .table_get_array(spread_table, i as i64)
                .unwrap_or(Value::Nil);
            self.push(value);
        }

        let argc = fixed + spread_count;
        if has_named {
            let named = self.heap.new_table();
            self.push(Value::Table(named));
            let entries: Vec<(StringId, Value)> =
                self.heap.table(spread_table).data.iter_hash().collect();
            for (key, value) in entries {
                self.heap.table_set(named, key, value);
            }
            if argc + 1 > 255 {
                return Err(VmError::runtime("Can't have more than 255 arguments."));
            }
            self.invoke_call_named(cur, argc + 1)
        } else {
            self.invoke_call(cur, argc)
        }
    }

    fn op_unpack(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let base_depth = cur.read_byte() as usize;
        let target_count = cur.read_byte() as usize;
        let base = cur.slots + base_depth;
        let top = self.thread().top;
        if top < base {
            return Err(VmError::runtime("Internal error: invalid stack state in unpack."));
        }
        let available = top - base;

        if available == 1 {
            if let Value::Table(values) = self.heap.thread(self.current).stack[base] {
                // Grow first so the writes below stay in bounds.
                self.thread_mut().set_top(base + target_count);
                for i in 0..target_count {
                    let element = self
                        .heap
                        .table_get_array(values, i as i64 + 1)
                        .unwrap_or(Value::Nil);
                    self.heap.thread_mut(self.current).stack[base + i] = element;
                }
                return Ok(());
            }
        }

        if available < target_count {
            self.thread_mut().set_top(base + target_count);
            for i in available..target_count {
                self.heap.thread_mut(self.current).stack[base + i] = Value::Nil;
            }
        } else {
            self.thread_mut().set_top(base + available.max(target_count));
        }
        Ok(())
    }

    fn op_closure(&mut self, cur: &mut Cursor) -> VmResult<()> {
        let Value::Function(function) = cur.read_constant() else {
            return Err(VmError::runtime("Internal error: closure over non-function."));
        };
        let upvalue_count = self.heap.function(function).upvalue_count;
        let closure = self.heap.alloc_closure(ClosureObject {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        });
        self.push(Value::Closure(closure));
        for _ in 0..upvalue_count {
            let is_local = cur.read_byte() == 1;
            let index = cur.read_byte() as usize;
            let upvalue = if is_local {
                self.capture_upvalue(cur.slots + index)
            } else {
                self.heap.closure(cur.closure).upvalues[index]
            };
            self.heap.closure_mut(closure).upvalues.push(upvalue);
        }
        Ok(())
    }

    fn op_return(&mut self, cur: &mut Cursor, min_frames: usize) -> VmResult<Flow> {
        let result = self.pop();
        self.finish_return(cur, min_frames, result, None)
    }

    fn op_return_n(&mut self, cur: &mut Cursor, min_frames: usize, count: usize) -> VmResult<Flow> {
        let top = self.thread().top;
        let results: Vec<Value> = self.heap.thread(self.current).stack[top - count..top].to_vec();
        let first = results.first().copied().unwrap_or(Value::Nil);
        self.thread_mut().set_top(top - count);
        self.finish_return(cur, min_frames, first, Some(results))
    }

    /// Shared frame-return path. `extra` carries the full multi-return set
    /// when present; otherwise `result` is the single return value.
    fn finish_return(
        &mut self,
        cur: &mut Cursor,
        min_frames: usize,
        result: Value,
        extra: Option<Vec<Value>>,
    ) -> VmResult<Flow> {
        let frame = match self.thread().frames.last() {
            Some(frame) => frame.clone(),
            None => return Err(VmError::runtime("Internal error: return without a frame.")),
        };

        if let Some(module) = &frame.module {
            if let Some(cache_name) = module.cache_name {
                let cached = extra
                    .as_ref()
                    .and_then(|values| values.first().copied())
                    .unwrap_or(result);
                self.modules.set(self.heap.strings(), cache_name, cached);
            }
        }

        self.close_upvalues(frame.slots);
        // Handlers registered by the returning frame die with it.
        let frame_count = self.thread().frames.len();
        self.thread_mut()
            .handlers
            .retain(|handler| handler.frame_count < frame_count);
        self.restore_module_context(&frame);
        self.thread_mut().frames.pop();

        let thread = self.thread_mut();
        thread.set_top(frame.slots);
        match &extra {
            Some(values) => {
                for value in values {
                    thread.push(*value);
                }
            }
            None => thread.push(result),
        }
        self.apply_pending_set_local();

        let result_count = extra.as_ref().map(|v| v.len()).unwrap_or(1);
        if self.thread().frames.len() <= min_frames {
            if let Some(caller) = self.thread().caller {
                self.thread_mut().caller = None;

                if !self.heap.thread(caller).has_room_for(result_count + 1) {
                    return Err(VmError::runtime("Stack overflow in caller."));
                }

                let finishing = self.current;
                let is_generator_step = {
                    let thread = self.heap.thread(finishing);
                    thread.is_generator && thread.generator_mode
                };
                if is_generator_step {
                    // The generator ran dry under a for loop.
                    self.heap.thread_mut(finishing).generator_mode = false;
                    let caller_thread = self.heap.thread_mut(caller);
                    caller_thread.push(Value::Nil);
                    caller_thread.push(Value::Nil);
                } else {
                    let top = self.thread().top;
                    let values: Vec<Value> =
                        self.heap.thread(finishing).stack[top - result_count..top].to_vec();
                    let caller_thread = self.heap.thread_mut(caller);
                    caller_thread.push(Value::Bool(true));
                    for value in values {
                        caller_thread.push(value);
                    }
                }

                self.current = caller;
                self.reload_into(cur)?;
                return Ok(Flow::Continue);
            }

            if min_frames == 0 && !self.options.is_repl {
                let count = result_count;
                let thread = self.thread_mut();
                thread.set_top(thread.top.saturating_sub(count));
            }
            return Ok(Flow::Exit(InterpretResult::Ok));
        }

        self.reload_into(cur)?;
        Ok(Flow::Continue)
    }

    // === Exception plumbing (unwinder lives in ops_exception.rs) ===

    pub(crate) fn reset_current_thread(&mut self) {
        let thread = self.thread_mut();
        thread.set_top(0);
        thread.frames.clear();
        thread.handlers.clear();
        thread.open_upvalues = None;
        thread.exception = None;
        thread.pending_set_locals.clear();
    }
}
