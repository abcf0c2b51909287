//! Heap object definitions.
//!
//! Every object lives in a typed arena inside [`crate::heap::Heap`] and is
//! addressed by an index handle. Objects reference each other through
//! handles only, so ownership cycles (upvalues into thread stacks, tables
//! through metatables) never translate into Rust ownership cycles.

use std::any::Any;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::error::VmResult;
use crate::heap::{ClosureId, FunctionId, GcRef, StringId, TableId, ThreadId, UpvalueId};
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

/// Signature of a host-native function. Arguments are passed by value; the
/// native pushes its results onto the current thread's stack.
pub type NativeFn = fn(&mut Vm, &[Value]) -> VmResult<()>;

/// Finalizer run when a userdata is swept.
pub type UserdataFinalizer = fn(&mut dyn Any);

/// Marker hook letting a userdata report extra GC edges.
pub type UserdataMarker = fn(&dyn Any, &mut Vec<GcRef>);

/// Fast-path tags for pure numeric natives dispatched without a call frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NativeFastKind {
    #[default]
    None,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sqrt,
    Floor,
    Ceil,
    Abs,
    Exp,
    Log,
    Pow,
    Fmod,
    Deg,
    Rad,
}

/// Dynamic type hints attachable to function parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeHint {
    #[default]
    Any,
    Int,
    Float,
    Bool,
    Str,
    Table,
}

/// An immutable string with its precomputed FNV-1a hash.
#[derive(Debug)]
pub struct StrObject {
    pub chars: String,
    pub hash: u32,
}

impl StrObject {
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.chars.as_bytes()
    }
}

/// A table object: the hash+array container plus its metatable link.
#[derive(Debug, Default)]
pub struct TableObject {
    pub data: Table,
    pub metatable: Option<TableId>,
    pub is_module: bool,
    /// Bumped on every mutation; consulted by `GetTable` inline caches.
    pub version: u32,
}

/// A compiled function.
#[derive(Debug)]
pub struct FunctionObject {
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Rc<Chunk>,
    pub name: Option<StringId>,
    pub doc: Option<StringId>,
    /// Default values for the trailing `defaults.len()` parameters.
    pub defaults: Vec<Value>,
    pub is_variadic: bool,
    pub is_self: bool,
    pub is_generator: bool,
    pub param_names: Vec<StringId>,
    pub param_types: Vec<TypeHint>,
}

/// A host function exposed to scripts.
pub struct NativeObject {
    pub function: NativeFn,
    pub name: StringId,
    pub is_self: bool,
    pub fast_kind: NativeFastKind,
}

impl std::fmt::Debug for NativeObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeObject")
            .field("name", &self.name)
            .field("is_self", &self.is_self)
            .field("fast_kind", &self.fast_kind)
            .finish()
    }
}

/// Where an upvalue's value currently lives.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Still on a thread's operand stack.
    Open { thread: ThreadId, slot: usize },
    /// Hoisted into the upvalue itself.
    Closed(Value),
}

/// A captured variable.
#[derive(Debug)]
pub struct UpvalueObject {
    pub state: UpvalueState,
    /// Next open upvalue in the owning thread's list (descending slots).
    pub next: Option<UpvalueId>,
}

/// A function plus its captured upvalues.
#[derive(Debug)]
pub struct ClosureObject {
    pub function: FunctionId,
    pub upvalues: Vec<UpvalueId>,
}

/// A receiver paired with a self-style method, created transparently by
/// `GetTable` so `t.m(x)` behaves as `m(t, x)`.
#[derive(Debug)]
pub struct BoundMethodObject {
    pub receiver: Value,
    /// A closure or native value.
    pub method: Value,
}

/// Opaque host data with optional finalizer, mark hook, and metatable.
pub struct UserdataObject {
    pub data: Option<Box<dyn Any>>,
    pub finalize: Option<UserdataFinalizer>,
    pub mark: Option<UserdataMarker>,
    pub metatable: Option<TableId>,
}

impl std::fmt::Debug for UserdataObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserdataObject")
            .field("closed", &self.data.is_none())
            .field("metatable", &self.metatable)
            .finish()
    }
}

/// Module bookkeeping attached to a frame compiled as a module top level.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    /// Cache the frame's return value under this module name.
    pub cache_name: Option<StringId>,
    /// Previous `__name`/`__file`/`__main` globals; `None` means the key
    /// was absent before this module frame was entered.
    pub prev_name: Option<Value>,
    pub prev_file: Option<Value>,
    pub prev_main: Option<Value>,
}

/// One activation of a closure.
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub closure: ClosureId,
    /// Cached from the closure's function so dispatch avoids heap hops.
    pub chunk: Rc<Chunk>,
    pub ip: usize,
    /// Base index of this frame's slots in the thread stack.
    pub slots: usize,
    pub module: Option<ModuleContext>,
}

/// A registered exception handler.
#[derive(Debug, Clone)]
pub struct ExceptionHandler {
    /// Frame count at registration; unwinding pops back to this depth.
    pub frame_count: usize,
    /// Absolute stack index restored before entering a handler block.
    pub stack_top: usize,
    /// Code offset of the except block within the registering frame.
    pub except_ip: Option<usize>,
    /// Code offset of the finally block within the registering frame.
    pub finally_ip: Option<usize>,
    /// Set once the except block has been entered so a rethrow skips it.
    pub in_except: bool,
}

/// Default operand stack capacity of the main thread.
pub const STACK_MAX: usize = 256;
/// Default call frame capacity of the main thread.
pub const FRAMES_MAX: usize = 64;
/// Default handler capacity of the main thread.
pub const HANDLERS_MAX: usize = 64;
/// Generator thread stack capacity.
pub const GEN_STACK_MAX: usize = 96;
/// Generator thread frame capacity.
pub const GEN_FRAMES_MAX: usize = 24;
/// Generator thread handler capacity.
pub const GEN_HANDLERS_MAX: usize = 16;

/// An execution context: operand stack, frames, handlers, upvalues.
///
/// The stack is an explicit top index over non-shrinking storage:
/// `AdjustStack` may legally move the top back up over a just-popped
/// region, re-exposing the values that were there.
#[derive(Debug)]
pub struct ThreadObject {
    pub stack: Vec<Value>,
    /// Live stack length; `stack[..top]` is the visible region.
    pub top: usize,
    pub stack_limit: usize,
    pub frames: Vec<CallFrame>,
    pub frame_limit: usize,
    pub handlers: Vec<ExceptionHandler>,
    pub handler_limit: usize,
    /// Head of the open-upvalue list, sorted by descending stack slot.
    pub open_upvalues: Option<UpvalueId>,
    /// Thread to hand control back to on yield/return; set during resume.
    pub caller: Option<ThreadId>,
    pub is_generator: bool,
    /// Set while a for-loop drives the generator; yields then surface
    /// `(index, value)` pairs instead of `(true, value)`.
    pub generator_mode: bool,
    pub generator_index: u32,
    /// Pending exception payload.
    pub exception: Option<Value>,
    pub last_error: Value,
    /// Deferred `(frame_index, slot)` stores applied when a metamethod
    /// simulating compound assignment returns.
    pub pending_set_locals: Vec<(usize, usize)>,
}

impl ThreadObject {
    /// Creates a thread with explicit capacity limits.
    pub fn with_limits(stack: usize, frames: usize, handlers: usize) -> Self {
        ThreadObject {
            stack: Vec::with_capacity(stack.min(64)),
            top: 0,
            stack_limit: stack.max(8),
            frames: Vec::new(),
            frame_limit: frames.max(4),
            handlers: Vec::new(),
            handler_limit: handlers.max(4),
            open_upvalues: None,
            caller: None,
            is_generator: false,
            generator_mode: false,
            generator_index: 0,
            exception: None,
            last_error: Value::Nil,
            pending_set_locals: Vec::new(),
        }
    }

    /// A thread sized for the main program.
    pub fn main() -> Self {
        ThreadObject::with_limits(STACK_MAX, FRAMES_MAX, HANDLERS_MAX)
    }

    /// A thread sized for a generator.
    pub fn generator() -> Self {
        let mut thread = ThreadObject::with_limits(GEN_STACK_MAX, GEN_FRAMES_MAX, GEN_HANDLERS_MAX);
        thread.is_generator = true;
        thread
    }

    /// True once every frame has returned.
    pub fn is_dead(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn push(&mut self, value: Value) {
        if self.top < self.stack.len() {
            self.stack[self.top] = value;
        } else {
            self.stack.push(value);
        }
        self.top += 1;
    }

    pub fn pop(&mut self) -> Value {
        self.top -= 1;
        self.stack[self.top]
    }

    pub fn peek(&self, distance: usize) -> Value {
        self.stack[self.top - 1 - distance]
    }

    /// Moves the top; growth re-exposes whatever storage already held,
    /// padding genuinely new slots with nil.
    pub fn set_top(&mut self, top: usize) {
        while self.stack.len() < top {
            self.stack.push(Value::Nil);
        }
        self.top = top;
    }

    /// Remaining headroom before the configured stack limit.
    pub fn has_room_for(&self, extra: usize) -> bool {
        self.top + extra <= self.stack_limit
    }
}
