//! The module loader.
//!
//! Native modules are registered at VM init as `(name, loader)` pairs and
//! built lazily on first import. Source modules are located on the search
//! path as `<name>.tl`, compiled once, and invoked with `__name`, `__file`
//! and `__main` transiently bound; the value their top level returns is
//! cached in the module table when the frame returns.

use log::trace;

use crate::compiler;
use crate::error::{InterpretResult, VmError, VmResult};
use crate::heap::TableId;
use crate::object::{ClosureObject, ModuleContext, NativeFastKind, NativeFn, NativeObject};
use crate::value::Value;
use crate::vm::{Cursor, Flow, Vm};

/// Builds a native module's table.
pub type ModuleLoader = fn(&mut Vm) -> VmResult<TableId>;

/// Registry of native modules available for import.
pub struct ModuleRegistry {
    entries: hashbrown::HashMap<&'static str, ModuleLoader>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        ModuleRegistry::new()
    }
}

impl ModuleRegistry {
    /// A registry preloaded with the built-in native modules.
    pub fn new() -> Self {
        let mut registry = ModuleRegistry {
            entries: hashbrown::HashMap::new(),
        };
        registry.register("string", crate::natives::string::load);
        registry.register("math", crate::natives::math::load);
        registry.register("coroutine", crate::natives::coroutine::load);
        registry.register("os", crate::natives::os::load);
        registry
    }

    pub fn register(&mut self, name: &'static str, loader: ModuleLoader) {
        self.entries.insert(name, loader);
    }

    pub fn get(&self, name: &str) -> Option<ModuleLoader> {
        self.entries.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

/// A `(name, function)` table plus helpers for wiring native modules, the
/// registration surface host code builds modules with.
pub struct NativeDef {
    pub name: &'static str,
    pub function: NativeFn,
    pub is_self: bool,
    pub fast_kind: NativeFastKind,
}

impl NativeDef {
    pub const fn new(name: &'static str, function: NativeFn) -> Self {
        NativeDef {
            name,
            function,
            is_self: false,
            fast_kind: NativeFastKind::None,
        }
    }

    pub const fn method(name: &'static str, function: NativeFn) -> Self {
        NativeDef {
            name,
            function,
            is_self: true,
            fast_kind: NativeFastKind::None,
        }
    }

    pub const fn fast(name: &'static str, function: NativeFn, kind: NativeFastKind) -> Self {
        NativeDef {
            name,
            function,
            is_self: false,
            fast_kind: kind,
        }
    }
}

impl Vm {
    /// Builds a module table from a native definition list.
    pub fn build_module(&mut self, defs: &[NativeDef]) -> TableId {
        let module = self.heap.new_table();
        self.heap.table_mut(module).is_module = true;
        for def in defs {
            let name = self.heap.alloc_str(def.name);
            let native = self.heap.alloc_native(NativeObject {
                function: def.function,
                name,
                is_self: def.is_self,
                fast_kind: def.fast_kind,
            });
            self.heap.table_set(module, name, Value::Native(native));
        }
        module
    }

    /// Registers a definition list straight into globals.
    pub fn register_globals(&mut self, defs: &[NativeDef]) {
        for def in defs {
            let name = self.heap.alloc_str(def.name);
            let native = self.heap.alloc_native(NativeObject {
                function: def.function,
                name,
                is_self: def.is_self,
                fast_kind: def.fast_kind,
            });
            self.set_global(name, Value::Native(native));
        }
    }

    /// Loads (or returns the cached) `string` module, which string
    /// indexing consults for method lookup.
    pub(crate) fn string_module(&mut self) -> VmResult<TableId> {
        let name = self.names.string_module;
        if let Some(Value::Table(table)) = self.modules.get(self.heap.strings(), name) {
            return Ok(table);
        }
        let Some(loader) = self.registry.get("string") else {
            return Err(VmError::runtime("Module 'string' not found."));
        };
        let table = loader(self)?;
        self.heap.table_mut(table).is_module = true;
        self.modules
            .set(self.heap.strings(), name, Value::Table(table));
        Ok(table)
    }

    /// `Import name` — pushes the module table, or for a source module
    /// pushes its top-level closure and enters its frame.
    pub(crate) fn op_import(&mut self, cur: &mut Cursor) -> VmResult<Flow> {
        let Value::Str(name) = cur.read_constant() else {
            return Err(VmError::runtime("Internal error: expected string constant."));
        };
        let text = self.heap.string(name).chars.clone();

        if let Some(cached) = self.modules.get(self.heap.strings(), name) {
            self.push(cached);
            return Ok(Flow::Continue);
        }

        if let Some(loader) = self.registry.get(&text) {
            trace!("loading native module '{text}'");
            let table = loader(self)?;
            self.heap.table_mut(table).is_module = true;
            self.modules
                .set(self.heap.strings(), name, Value::Table(table));
            self.push(Value::Table(table));
            return Ok(Flow::Continue);
        }

        for dir in self.options.search_paths.clone() {
            let path = dir.join(format!("{text}.tl"));
            if !path.is_file() {
                continue;
            }
            trace!("loading source module '{text}' from {}", path.display());
            let source = match std::fs::read_to_string(&path) {
                Ok(source) => source,
                Err(err) => {
                    return Err(VmError::runtime(format!(
                        "Could not read module '{text}': {err}."
                    )));
                }
            };
            let Some(function) = compiler::compile(&source, &mut self.heap) else {
                return Ok(Flow::Exit(InterpretResult::CompileError));
            };
            let closure = self.heap.alloc_closure(ClosureObject {
                function,
                upvalues: Vec::new(),
            });
            self.push(Value::Closure(closure));
            self.flush(cur);
            self.call(closure, 0)?;

            // Bind the module context and remember what it replaced.
            let name_key = self.names.module_name_key;
            let file_key = self.names.module_file_key;
            let main_key = self.names.module_main_key;
            let prev_name = self.get_global(name_key);
            let prev_file = self.get_global(file_key);
            let prev_main = self.get_global(main_key);
            let file = self.heap.alloc_string(path.display().to_string());
            self.set_global(name_key, Value::Str(name));
            self.set_global(file_key, Value::Str(file));
            self.set_global(main_key, Value::Bool(false));
            let context = ModuleContext {
                cache_name: Some(name),
                prev_name,
                prev_file,
                prev_main,
            };
            if let Some(frame) = self.thread_mut().frames.last_mut() {
                frame.module = Some(context);
            }
            self.reload_into(cur)?;
            return Ok(Flow::Continue);
        }

        Err(VmError::runtime(format!("Module '{text}' not found.")))
    }

    /// `ImportStar` — copies the module's public entries into globals.
    pub(crate) fn op_import_star(&mut self) -> VmResult<()> {
        let module = self.pop();
        let Value::Table(table) = module else {
            return Err(VmError::runtime("'import *' requires a module table."));
        };
        let entries: Vec<_> = self.heap.table(table).data.iter_hash().collect();
        for (key, value) in entries {
            if self.heap.string(key).chars.starts_with('_') {
                continue;
            }
            self.set_global(key, value);
        }
        Ok(())
    }
}
